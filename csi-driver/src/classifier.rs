//! Classification of admin-tool results.
//!
//! `iscsiadm` reports several benign, already-satisfied preconditions with a
//! non-zero exit status (a session that already exists, a logout with no
//! matching session, a session listing with no sessions). The exit status
//! alone cannot tell those from real failures, so the reported condition is
//! inspected instead. The matching rule lives behind [`OutcomeClassifier`] so
//! deployments with a different tool or locale can swap it.

use crate::error::RelayError;

/// The admin operation whose result is being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    ListSessions,
    Discovery,
    Login,
    Logout,
}

/// What a relayed admin command actually achieved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The command did what was asked
    Succeeded,
    /// Nothing to do: the desired state was already in place
    AlreadySatisfied,
    /// The deadline passed; the host state must be re-queried
    Unknown,
    /// A genuine failure, with the tool's report
    Failed(String),
}

impl Outcome {
    /// True for outcomes that leave the desired state in place.
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Succeeded | Outcome::AlreadySatisfied)
    }
}

/// Decides what a relayed command's result means.
pub trait OutcomeClassifier: Send + Sync {
    fn classify(&self, op: AdminOp, result: &Result<String, RelayError>) -> Outcome;
}

/// Text-matching classifier for open-iscsi's `iscsiadm`.
#[derive(Debug, Clone, Default)]
pub struct IscsiadmClassifier;

impl IscsiadmClassifier {
    /// Phrases signalling the operation's goal already holds.
    fn satisfied_markers(op: AdminOp) -> &'static [&'static str] {
        match op {
            // exit 21 (ISCSI_ERR_NO_OBJS_FOUND)
            AdminOp::ListSessions => &["No active sessions"],
            AdminOp::Discovery => &[],
            // exit 15 (ISCSI_ERR_SESS_EXISTS)
            AdminOp::Login => &["already present", "session already exists"],
            AdminOp::Logout => &[
                "No matching sessions",
                "not logged in",
                "No active sessions",
            ],
        }
    }
}

impl OutcomeClassifier for IscsiadmClassifier {
    fn classify(&self, op: AdminOp, result: &Result<String, RelayError>) -> Outcome {
        match result {
            Ok(_) => Outcome::Succeeded,
            Err(RelayError::Timeout(_)) => Outcome::Unknown,
            Err(RelayError::Relay(status)) => {
                let message = status.message();
                if Self::satisfied_markers(op)
                    .iter()
                    .any(|marker| message.contains(marker))
                {
                    Outcome::AlreadySatisfied
                } else {
                    Outcome::Failed(message.trim().to_string())
                }
            }
            Err(other) => Outcome::Failed(other.to_string()),
        }
    }
}
