//! Runtime configuration shared by the CSI services.

use std::path::PathBuf;

use clap::ValueEnum;

use crate::types::AttachHints;

/// Default directory for staging records
pub const DEFAULT_STATE_DIR: &str = "/var/lib/iscsi-relay-csi";

/// Default cap reported through NodeGetInfo
pub const DEFAULT_VOLUMES_PER_NODE: i64 = 256;

/// Which CSI services this process serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Role {
    Identity,
    Node,
    All,
}

impl Role {
    pub fn serves_identity(self) -> bool {
        matches!(self, Role::Identity | Role::All)
    }

    pub fn serves_node(self) -> bool {
        matches!(self, Role::Node | Role::All)
    }
}

/// Node service settings.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    /// Where staging records are kept between stage and unstage
    pub state_dir: PathBuf,
    pub max_volumes_per_node: i64,
    /// Applied to every attach on this node
    pub hints: AttachHints,
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            max_volumes_per_node: DEFAULT_VOLUMES_PER_NODE,
            hints: AttachHints {
                multipath_enabled: true,
                ..Default::default()
            },
        }
    }
}
