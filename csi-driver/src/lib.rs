//! iSCSI CSI Node Driver Library
//!
//! Kubernetes CSI node plugin that attaches iSCSI volumes from inside an
//! unprivileged container. Every host-level storage-admin command is
//! forwarded to the iscsi-relay over a Unix socket.
//!
//! This library provides:
//! - Relay client and one-time initiator identity bootstrap
//! - The attach/detach state machine (login, device discovery, multipath)
//! - CSI Identity and Node service implementations
//! - Platform mount/format helpers

/// CSI proto generated types
pub mod csi {
    tonic::include_proto!("csi.v1");
}

pub mod attach;
pub mod backoff;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod identity;
pub mod initiator;
pub mod iscsiadm;
pub mod metrics;
pub mod node;
pub mod platform;
pub mod relay_client;
pub mod types;

pub use attach::{AttachConfig, AttachmentManager, DetachReport};
pub use classifier::{IscsiadmClassifier, OutcomeClassifier};
pub use config::{NodeConfig, Role};
pub use device::{DeviceResolver, SysfsDeviceResolver};
pub use error::{AttachError, RelayError};
pub use identity::IdentityService;
pub use initiator::InitiatorFile;
pub use node::NodeService;
pub use relay_client::{CommandRelay, RelayClient};
pub use types::{AttachHints, ConnectionDescriptor, DevicePath, Portal};
