//! iSCSI Relay Library
//!
//! Privileged half of the node attachment pipeline. The relay runs in the
//! host context and executes storage-admin commands (`iscsiadm` and friends)
//! on behalf of the constrained CSI node plugin, which reaches it over a
//! Unix domain socket.
//!
//! The library is split into several modules:
//! - `exec`: argument-vector execution with combined output capture
//! - `initiator`: host initiator name lookup
//! - `listener`: socket endpoint parsing and binding
//! - `service`: gRPC service implementation
//! - `metrics`: Prometheus metrics collection

pub mod error;
pub mod exec;
pub mod initiator;
pub mod listener;
pub mod metrics;
pub mod service;

pub use error::{RelayError, Result};
pub use service::{RelayService, proto};
