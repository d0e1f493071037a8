//! Type-safe wrappers for attachment parameters.
//!
//! These types are parsed from the CSI volume context at the API boundary
//! and then flow unchanged through the attachment state machine.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Well-known iSCSI port.
pub const DEFAULT_ISCSI_PORT: u16 = 3260;

/// Error returned when a connection descriptor breaks the caller contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid connection descriptor: {0}")]
pub struct InvalidDescriptor(pub String);

// ============================================================================
// Portal
// ============================================================================

/// An iSCSI portal (address:port) at which a target accepts logins.
///
/// The address can be an IP literal (v4 or v6) or a hostname; no resolution
/// is attempted. `iscsiadm -m session` reports sessions by IP, so a portal
/// given as a hostname never matches an existing session: repeated attaches
/// through it fall back on iscsiadm's "already present" answer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Portal {
    pub address: String,
    pub port: u16,
}

impl Portal {
    pub fn new(address: impl Into<String>, port: u16) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }

    /// Parse a single `host`, `host:port` or `[v6]:port` string.
    pub fn parse(s: &str, default_port: u16) -> Result<Self, PortalParseError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PortalParseError(s.to_string()));
        }

        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| PortalParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            return match tail.strip_prefix(':') {
                None if tail.is_empty() => Ok(Portal::new(host, default_port)),
                Some(port) => port
                    .parse::<u16>()
                    .map(|port| Portal::new(host, port))
                    .map_err(|_| PortalParseError(s.to_string())),
                None => Err(PortalParseError(s.to_string())),
            };
        }

        // Bare IPv6 literals have more than one colon and carry no port
        if s.matches(':').count() == 1
            && let Some((host, port)) = s.split_once(':')
        {
            let port = port
                .parse::<u16>()
                .map_err(|_| PortalParseError(s.to_string()))?;
            if host.is_empty() {
                return Err(PortalParseError(s.to_string()));
            }
            return Ok(Portal::new(host, port));
        }

        Ok(Portal::new(s, default_port))
    }

    /// Parse a comma-separated portal list. Blank entries are skipped; a list
    /// with no portals at all is an error.
    pub fn parse_list(s: &str, default_port: u16) -> Result<Vec<Self>, PortalParseError> {
        let portals = s
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| Portal::parse(part, default_port))
            .collect::<Result<Vec<_>, _>>()?;

        if portals.is_empty() {
            return Err(PortalParseError(s.to_string()));
        }
        Ok(portals)
    }

    fn ip(&self) -> Option<IpAddr> {
        self.address.parse().ok()
    }

    /// Whether both portals name the same endpoint. IP literals compare by
    /// value (`fd00::1` equals `fd00:0::1`); hostnames compare verbatim.
    pub fn same_endpoint(&self, other: &Self) -> bool {
        self.port == other.port
            && match (self.ip(), other.ip()) {
                (Some(a), Some(b)) => a == b,
                _ => self.address == other.address,
            }
    }

    /// Ascending address order: IP literals numerically (and before
    /// hostnames), hostnames lexically, then by port.
    pub fn cmp_address(&self, other: &Self) -> Ordering {
        let by_address = match (self.ip(), other.ip()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.address.cmp(&other.address),
        };
        by_address.then(self.port.cmp(&other.port))
    }
}

impl Display for Portal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.address.contains(':') {
            write!(f, "[{}]:{}", self.address, self.port)
        } else {
            write!(f, "{}:{}", self.address, self.port)
        }
    }
}

/// Error returned when parsing an invalid portal.
#[derive(Debug, Clone)]
pub struct PortalParseError(String);

impl Display for PortalParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid portal '{}': expected 'host', 'host:port' or '[v6]:port'",
            self.0
        )
    }
}

impl std::error::Error for PortalParseError {}

// ============================================================================
// ConnectionDescriptor
// ============================================================================

/// Everything the node needs to reach a remote volume.
///
/// Supplied by the volume directory when the volume is provisioned and
/// immutable for the lifetime of an attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    pub target_iqn: String,
    pub portals: Vec<Portal>,
    #[serde(default)]
    pub size_bytes: u64,
    #[serde(default)]
    pub replica_count: u32,
}

impl ConnectionDescriptor {
    pub fn new(target_iqn: impl Into<String>, portals: Vec<Portal>) -> Self {
        Self {
            target_iqn: target_iqn.into(),
            portals,
            size_bytes: 0,
            replica_count: 1,
        }
    }

    pub fn with_replica_count(mut self, replica_count: u32) -> Self {
        self.replica_count = replica_count;
        self
    }

    pub fn with_size_bytes(mut self, size_bytes: u64) -> Self {
        self.size_bytes = size_bytes;
        self
    }

    /// Build a descriptor from a CSI volume context.
    ///
    /// Recognized keys (first match wins):
    /// - `target_iqn`, `targetIqn`, `iqn`
    /// - `portals`, `portal` (comma separated)
    /// - `size_bytes`, `size`
    /// - `replica_count`, `replicas`
    pub fn from_volume_context(
        context: &HashMap<String, String>,
    ) -> Result<Self, InvalidDescriptor> {
        let lookup = |keys: &[&str]| keys.iter().find_map(|k| context.get(*k));

        let target_iqn = lookup(&["target_iqn", "targetIqn", "iqn"])
            .ok_or_else(|| InvalidDescriptor("target_iqn is required in volume context".into()))?;

        let portals = lookup(&["portals", "portal"])
            .ok_or_else(|| InvalidDescriptor("portals are required in volume context".into()))?;
        let portals = Portal::parse_list(portals, DEFAULT_ISCSI_PORT)
            .map_err(|e| InvalidDescriptor(e.to_string()))?;

        let size_bytes = match lookup(&["size_bytes", "size"]) {
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| InvalidDescriptor(format!("invalid size '{}'", v)))?,
            None => 0,
        };

        let replica_count = match lookup(&["replica_count", "replicas"]) {
            Some(v) => v
                .parse::<u32>()
                .map_err(|_| InvalidDescriptor(format!("invalid replica count '{}'", v)))?,
            None => 1,
        };

        let descriptor = Self {
            target_iqn: target_iqn.clone(),
            portals,
            size_bytes,
            replica_count,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Check the caller contract: a well-formed target and at least one portal.
    pub fn validate(&self) -> Result<(), InvalidDescriptor> {
        if self.target_iqn.is_empty() {
            return Err(InvalidDescriptor("target IQN cannot be empty".into()));
        }

        // Qualified names only use alphanumerics, dots, colons, dashes and underscores
        let valid = self
            .target_iqn
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | ':' | '-' | '_'));
        if !valid {
            return Err(InvalidDescriptor(format!(
                "target IQN '{}' contains invalid characters",
                self.target_iqn
            )));
        }

        if self.portals.is_empty() {
            return Err(InvalidDescriptor(format!(
                "no portals for target {}",
                self.target_iqn
            )));
        }

        Ok(())
    }
}

// ============================================================================
// AttachHints
// ============================================================================

/// Node-side policy for a single attach call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AttachHints {
    /// Aggregate all paths through dm-multipath
    pub multipath_enabled: bool,
    /// Overrides the descriptor's replica count when set
    pub replica_override: Option<u32>,
    /// Portals in descending preference, as `address` or `address:port`
    pub preferred_portals: Vec<String>,
}

impl AttachHints {
    /// Position of `portal` in the preference list; unlisted portals rank last.
    ///
    /// An entry without a port matches the address on any port.
    pub fn preference_rank(&self, portal: &Portal) -> usize {
        self.preferred_portals
            .iter()
            .position(|p| {
                Portal::parse(p, portal.port).is_ok_and(|preferred| preferred.same_endpoint(portal))
            })
            .unwrap_or(self.preferred_portals.len())
    }
}

// ============================================================================
// DevicePath
// ============================================================================

/// A local block device backing an attached volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DevicePath(PathBuf);

impl DevicePath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self(path.into())
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        self.0.to_str().unwrap_or_default()
    }
}

impl Display for DevicePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

// ============================================================================
// AttachState
// ============================================================================

/// Per-volume attachment lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachState {
    Unattached,
    LoggingIn,
    LoggedIn,
    DeviceResolving,
    Attached(DevicePath),
    LoggingOut,
}

impl Display for AttachState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttachState::Unattached => write!(f, "unattached"),
            AttachState::LoggingIn => write!(f, "logging-in"),
            AttachState::LoggedIn => write!(f, "logged-in"),
            AttachState::DeviceResolving => write!(f, "device-resolving"),
            AttachState::Attached(device) => write!(f, "attached({})", device),
            AttachState::LoggingOut => write!(f, "logging-out"),
        }
    }
}
