//! CSI Node Service Implementation
//!
//! Handles volume staging and publishing on worker nodes. Session login and
//! logout go through the [`AttachmentManager`] and the relay; formatting and
//! mounts run locally through the `platform` module.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};

use crate::attach::AttachmentManager;
use crate::config::NodeConfig;
use crate::csi;
use crate::error::AttachError;
use crate::platform;
use crate::types::ConnectionDescriptor;

/// What stage learned about a volume, kept for unstage and block publish.
///
/// NodeUnstageVolume carries no volume context, so this record is the only
/// way to find the target again. `device` stays empty until stage completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingRecord {
    pub descriptor: ConnectionDescriptor,
    pub device: String,
    pub block: bool,
}

/// Requested access type, from the CSI volume capability.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Access {
    Block,
    Mount {
        fs_type: &'static str,
        flags: Vec<String>,
    },
}

impl Access {
    fn from_capability(capability: Option<&csi::VolumeCapability>) -> Result<Self, Status> {
        let capability =
            capability.ok_or_else(|| Status::invalid_argument("Volume capability is required"))?;

        match &capability.access_type {
            Some(csi::volume_capability::AccessType::Block(_)) => Ok(Access::Block),
            Some(csi::volume_capability::AccessType::Mount(mount)) => Ok(Access::Mount {
                fs_type: platform::validate_fs_type(&mount.fs_type)?,
                flags: mount.mount_flags.clone(),
            }),
            None => Err(Status::invalid_argument("Volume access type is required")),
        }
    }
}

/// CSI Node Service
///
/// Implements the CSI Node service which handles:
/// - Volume staging (attach through the relay, format if needed, mount to staging path)
/// - Volume unstaging (unmount from staging path, log out every session)
/// - Volume publishing (bind mount from staging, or of the raw device, to target path)
/// - Volume unpublishing (unmount from target path)
/// - Node capability reporting
pub struct NodeService {
    config: NodeConfig,
    attacher: Arc<AttachmentManager>,
}

impl NodeService {
    pub fn new(config: NodeConfig, attacher: Arc<AttachmentManager>) -> Self {
        Self { config, attacher }
    }

    /// Validate that a path is safe to hand to mount tools.
    /// Returns an error if the path contains dangerous characters.
    fn validate_path(path: &str) -> Result<(), Status> {
        if path.is_empty() {
            return Err(Status::invalid_argument("Path cannot be empty"));
        }

        if !path.starts_with('/') {
            return Err(Status::invalid_argument("Path must be absolute"));
        }

        let dangerous_chars = [
            ';', '|', '&', '$', '`', '(', ')', '{', '}', '<', '>', '\n', '\r',
        ];
        for c in dangerous_chars {
            if path.contains(c) {
                return Err(Status::invalid_argument(format!(
                    "Path contains dangerous character: '{}'",
                    c
                )));
            }
        }

        if path.contains("..") {
            return Err(Status::invalid_argument(
                "Path cannot contain '..' (path traversal)",
            ));
        }

        Ok(())
    }

    /// Volume IDs name files in the state directory.
    fn validate_volume_id(volume_id: &str) -> Result<(), Status> {
        if volume_id.is_empty() {
            return Err(Status::invalid_argument("Volume ID is required"));
        }
        if volume_id.contains('/') || volume_id.contains('\0') || volume_id.starts_with('.') {
            return Err(Status::invalid_argument(format!(
                "Volume ID '{}' contains invalid characters",
                volume_id
            )));
        }
        Ok(())
    }

    fn record_path(&self, volume_id: &str) -> PathBuf {
        self.config.state_dir.join(format!("{}.json", volume_id))
    }

    /// Persist the staging record atomically (write then rename).
    async fn write_record(&self, volume_id: &str, record: &StagingRecord) -> Result<(), Status> {
        let path = self.record_path(volume_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| Status::internal(format!("Failed to encode staging record: {}", e)))?;

        let io_err = |e: std::io::Error| {
            Status::internal(format!(
                "Failed to write staging record {}: {}",
                path.display(),
                e
            ))
        };
        tokio::fs::create_dir_all(&self.config.state_dir)
            .await
            .map_err(io_err)?;
        tokio::fs::write(&tmp, body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;
        Ok(())
    }

    async fn read_record(&self, volume_id: &str) -> Result<Option<StagingRecord>, Status> {
        let path = self.record_path(volume_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Status::internal(format!(
                    "Failed to read staging record {}: {}",
                    path.display(),
                    e
                )));
            }
        };

        serde_json::from_slice(&body).map(Some).map_err(|e| {
            Status::internal(format!(
                "Corrupt staging record {}: {}",
                path.display(),
                e
            ))
        })
    }

    async fn remove_record(&self, volume_id: &str) -> Result<(), Status> {
        match tokio::fs::remove_file(self.record_path(volume_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Status::internal(format!(
                "Failed to remove staging record: {}",
                e
            ))),
        }
    }
}

#[tonic::async_trait]
impl csi::node_server::Node for NodeService {
    /// Stage a volume to a staging path.
    /// This attaches the target, formats if needed, and mounts.
    async fn node_stage_volume(
        &self,
        request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        Self::validate_volume_id(volume_id)?;
        if staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(staging_target_path)?;

        let access = Access::from_capability(req.volume_capability.as_ref())?;
        let descriptor = ConnectionDescriptor::from_volume_context(&req.volume_context)
            .map_err(AttachError::from)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            target_iqn = %descriptor.target_iqn,
            portals = descriptor.portals.len(),
            "NodeStageVolume request"
        );

        if matches!(access, Access::Mount { .. }) && platform::is_mounted(staging_target_path)? {
            info!(staging_target_path = %staging_target_path, "Volume already staged");
            return Ok(Response::new(csi::NodeStageVolumeResponse {}));
        }

        // Recorded before login so that unstage can log out after a failed stage
        let mut record = StagingRecord {
            descriptor,
            device: String::new(),
            block: access == Access::Block,
        };
        self.write_record(volume_id, &record).await?;

        let device = self
            .attacher
            .attach(&record.descriptor, &self.config.hints)
            .await?;
        let device = device.as_str().to_string();

        if let Access::Mount { fs_type, flags } = &access {
            if platform::needs_formatting(&device)? {
                platform::format_device(&device, fs_type)?;
            }
            platform::mount_device(&device, staging_target_path, fs_type, flags)?;
        }

        record.device = device.clone();
        self.write_record(volume_id, &record).await?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            device = %device,
            "Volume staged successfully"
        );

        Ok(Response::new(csi::NodeStageVolumeResponse {}))
    }

    /// Unstage a volume: unmount, then log out every session for its target.
    async fn node_unstage_volume(
        &self,
        request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let staging_target_path = &req.staging_target_path;

        Self::validate_volume_id(volume_id)?;
        if staging_target_path.is_empty() {
            return Err(Status::invalid_argument("Staging target path is required"));
        }
        Self::validate_path(staging_target_path)?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            "NodeUnstageVolume request"
        );

        platform::unmount(staging_target_path)?;

        let Some(record) = self.read_record(volume_id).await? else {
            warn!(volume_id = %volume_id, "No staging record, nothing to detach");
            return Ok(Response::new(csi::NodeUnstageVolumeResponse {}));
        };

        let report = self.attacher.detach(&record.descriptor).await?;
        for warning in &report.warnings {
            warn!(volume_id = %volume_id, portal = %warning.portal, reason = %warning.reason, "Session left behind");
        }
        self.remove_record(volume_id).await?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            logged_out = report.logged_out.len(),
            "Volume unstaged successfully"
        );

        Ok(Response::new(csi::NodeUnstageVolumeResponse {}))
    }

    /// Publish a volume to a target path.
    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let target_path = &req.target_path;
        let staging_target_path = &req.staging_target_path;

        Self::validate_volume_id(volume_id)?;
        if target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(target_path)?;
        if staging_target_path.is_empty() {
            return Err(Status::invalid_argument(
                "Staging target path is required (STAGE_UNSTAGE_VOLUME capability is enabled)",
            ));
        }
        Self::validate_path(staging_target_path)?;

        let access = Access::from_capability(req.volume_capability.as_ref())?;

        info!(
            volume_id = %volume_id,
            staging_target_path = %staging_target_path,
            target_path = %target_path,
            readonly = %req.readonly,
            "NodePublishVolume request"
        );

        if platform::is_mounted(target_path)? {
            info!(target_path = %target_path, "Volume already published");
            return Ok(Response::new(csi::NodePublishVolumeResponse {}));
        }

        match access {
            Access::Block => {
                let record = self.read_record(volume_id).await?.ok_or_else(|| {
                    Status::failed_precondition(format!("Volume {} is not staged", volume_id))
                })?;
                // Device names can change across session re-logins
                let device = self
                    .attacher
                    .attach(&record.descriptor, &self.config.hints)
                    .await?;
                platform::bind_mount_device(device.as_str(), target_path)?;
            }
            Access::Mount { .. } => {
                if !platform::is_mounted(staging_target_path)? {
                    return Err(Status::failed_precondition(format!(
                        "Volume not staged at {}",
                        staging_target_path
                    )));
                }
                platform::bind_mount(staging_target_path, target_path)?;
            }
        }

        if req.readonly {
            platform::remount_readonly(target_path)?;
        }

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume published successfully"
        );

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    /// Unpublish a volume from the target path.
    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        let volume_id = &req.volume_id;
        let target_path = &req.target_path;

        Self::validate_volume_id(volume_id)?;
        if target_path.is_empty() {
            return Err(Status::invalid_argument("Target path is required"));
        }
        Self::validate_path(target_path)?;

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "NodeUnpublishVolume request"
        );

        platform::unmount(target_path)?;

        // Block publishes leave a file, filesystem publishes a directory
        let target = Path::new(target_path);
        let removed = if target.is_dir() {
            std::fs::remove_dir(target)
        } else if target.exists() {
            std::fs::remove_file(target)
        } else {
            Ok(())
        };
        if let Err(e) = removed {
            warn!(error = %e, target_path = %target_path, "Could not remove target path");
        }

        info!(
            volume_id = %volume_id,
            target_path = %target_path,
            "Volume unpublished successfully"
        );

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    /// Get information about this node.
    async fn node_get_info(
        &self,
        _request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        debug!(node_id = %self.config.node_id, "NodeGetInfo request");

        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.config.node_id.clone(),
            max_volumes_per_node: self.config.max_volumes_per_node,
            accessible_topology: None,
        }))
    }

    /// Report node capabilities.
    async fn node_get_capabilities(
        &self,
        _request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        let capabilities = vec![csi::NodeServiceCapability {
            r#type: Some(csi::node_service_capability::Type::Rpc(
                csi::node_service_capability::Rpc {
                    r#type: csi::node_service_capability::rpc::Type::StageUnstageVolume as i32,
                },
            )),
        }];

        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attach::AttachConfig;
    use crate::classifier::IscsiadmClassifier;
    use crate::device::SysfsDeviceResolver;
    use crate::relay_client::RelayClient;
    use crate::types::Portal;
    use csi::node_server::Node;
    use std::collections::HashMap;

    fn service(state_dir: &Path) -> NodeService {
        // Lazy client to a socket that never exists: no test here reaches the relay
        let relay = RelayClient::connect_lazy("unix:///nonexistent/iscsi.sock").unwrap();
        let attacher = AttachmentManager::new(
            Arc::new(relay),
            Arc::new(SysfsDeviceResolver::default()),
            Arc::new(IscsiadmClassifier),
            AttachConfig::default(),
        );

        let mut config = NodeConfig::new("test-node-1");
        config.state_dir = state_dir.to_path_buf();
        config.max_volumes_per_node = 64;
        NodeService::new(config, Arc::new(attacher))
    }

    fn mount_capability() -> csi::VolumeCapability {
        csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Mount(
                csi::volume_capability::MountVolume {
                    fs_type: "ext4".into(),
                    ..Default::default()
                },
            )),
            access_mode: None,
        }
    }

    #[test]
    fn test_validate_path_valid() {
        assert!(NodeService::validate_path("/var/lib/csi/staging").is_ok());
        assert!(NodeService::validate_path("/mnt/volume").is_ok());
    }

    #[test]
    fn test_validate_path_invalid() {
        assert!(NodeService::validate_path("").is_err());
        assert!(NodeService::validate_path("var/lib").is_err());
        assert!(NodeService::validate_path("/var/../etc").is_err());
        assert!(NodeService::validate_path("/var;ls").is_err());
        assert!(NodeService::validate_path("/var$HOME").is_err());
        assert!(NodeService::validate_path("/var`id`").is_err());
    }

    #[test]
    fn test_validate_volume_id() {
        assert!(NodeService::validate_volume_id("pvc-1234").is_ok());
        assert!(NodeService::validate_volume_id("").is_err());
        assert!(NodeService::validate_volume_id("../etc/passwd").is_err());
        assert!(NodeService::validate_volume_id("a/b").is_err());
    }

    #[test]
    fn test_access_from_capability() {
        assert!(Access::from_capability(None).is_err());

        let block = csi::VolumeCapability {
            access_type: Some(csi::volume_capability::AccessType::Block(
                csi::volume_capability::BlockVolume {},
            )),
            access_mode: None,
        };
        assert_eq!(Access::from_capability(Some(&block)).unwrap(), Access::Block);

        match Access::from_capability(Some(&mount_capability())).unwrap() {
            Access::Mount { fs_type, .. } => assert_eq!(fs_type, "ext4"),
            other => panic!("unexpected access: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_staging_record_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(dir.path());

        assert_eq!(node.read_record("pvc-1").await.unwrap(), None);

        let record = StagingRecord {
            descriptor: ConnectionDescriptor::new(
                "iqn.2013-01.com.example:test",
                vec![Portal::new("10.0.0.1", 3260)],
            ),
            device: "/dev/sdx".into(),
            block: false,
        };
        node.write_record("pvc-1", &record).await.unwrap();
        assert!(dir.path().join("pvc-1.json").exists());
        assert_eq!(node.read_record("pvc-1").await.unwrap(), Some(record));

        node.remove_record("pvc-1").await.unwrap();
        node.remove_record("pvc-1").await.unwrap();
        assert_eq!(node.read_record("pvc-1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stage_rejects_descriptor_without_portals() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(dir.path());

        let mut volume_context = HashMap::new();
        volume_context.insert("target_iqn".into(), "iqn.2013-01.com.example:test".into());
        volume_context.insert("portals".into(), " , ".into());

        let err = node
            .node_stage_volume(Request::new(csi::NodeStageVolumeRequest {
                volume_id: "pvc-1".into(),
                staging_target_path: "/var/lib/kubelet/staging/pvc-1".into(),
                volume_capability: Some(mount_capability()),
                volume_context,
                ..Default::default()
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_get_info_and_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let node = service(dir.path());

        let info = node
            .node_get_info(Request::new(csi::NodeGetInfoRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(info.node_id, "test-node-1");
        assert_eq!(info.max_volumes_per_node, 64);

        let caps = node
            .node_get_capabilities(Request::new(csi::NodeGetCapabilitiesRequest {}))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(caps.capabilities.len(), 1);
    }
}
