//! CSI Identity Service Implementation
//!
//! Provides plugin identification and capability reporting to Kubernetes.

use tonic::{Request, Response, Status};

use crate::config::Role;
use crate::csi;

pub const DRIVER_NAME: &str = "iscsi-relay.csi.io";
pub const DRIVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// CSI Identity Service
///
/// Implements the CSI Identity service which provides:
/// - Plugin identification (name and version)
/// - Plugin capability reporting
/// - Readiness probing
pub struct IdentityService {
    role: Role,
}

impl IdentityService {
    pub fn new(role: Role) -> Self {
        Self { role }
    }
}

impl Default for IdentityService {
    fn default() -> Self {
        Self::new(Role::All)
    }
}

#[tonic::async_trait]
impl csi::identity_server::Identity for IdentityService {
    /// Returns the name and version of the CSI plugin.
    async fn get_plugin_info(
        &self,
        _request: Request<csi::GetPluginInfoRequest>,
    ) -> Result<Response<csi::GetPluginInfoResponse>, Status> {
        let mut manifest = std::collections::HashMap::new();
        manifest.insert("role".to_string(), format!("{:?}", self.role).to_lowercase());

        Ok(Response::new(csi::GetPluginInfoResponse {
            name: DRIVER_NAME.to_string(),
            vendor_version: DRIVER_VERSION.to_string(),
            manifest,
        }))
    }

    /// Returns the capabilities of the CSI plugin.
    ///
    /// The controller service is deployed separately, so nothing is
    /// advertised here.
    async fn get_plugin_capabilities(
        &self,
        _request: Request<csi::GetPluginCapabilitiesRequest>,
    ) -> Result<Response<csi::GetPluginCapabilitiesResponse>, Status> {
        Ok(Response::new(csi::GetPluginCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    /// Probes the plugin to check if it is ready.
    async fn probe(
        &self,
        _request: Request<csi::ProbeRequest>,
    ) -> Result<Response<csi::ProbeResponse>, Status> {
        // The plugin is ready when this service is running
        Ok(Response::new(csi::ProbeResponse { ready: Some(true) }))
    }
}
