//! Attach/detach state machine.
//!
//! Drives iSCSI login, device discovery and multipath binding for one volume
//! per call, and the symmetric logout. Every privileged action goes through a
//! [`CommandRelay`]; every decision is re-derived from the host's session and
//! device state, so a call that follows a crash or a timed-out command picks
//! up wherever the host actually is.
//!
//! ```text
//! Unattached -> LoggingIn -> LoggedIn -> DeviceResolving -> Attached(dev)
//! Attached -> LoggingOut -> Unattached
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::backoff::{Decision, DevicePollPolicy, LoginRetryPolicy};
use crate::classifier::{AdminOp, Outcome, OutcomeClassifier};
use crate::device::DeviceResolver;
use crate::error::{AttachError, PortalFailure, RelayError, Result};
use crate::initiator::InitiatorFile;
use crate::iscsiadm::{self, Session};
use crate::metrics::{self, OperationTimer};
use crate::relay_client::CommandRelay;
use crate::types::{AttachHints, AttachState, ConnectionDescriptor, DevicePath, Portal};

/// Deadlines and schedules used by [`AttachmentManager`].
#[derive(Debug, Clone)]
pub struct AttachConfig {
    /// Deadline for session listings
    pub query_deadline: Duration,
    /// Deadline for sendtargets discovery
    pub discovery_deadline: Duration,
    /// Deadline for a single login attempt
    pub login_deadline: Duration,
    /// Deadline for a single logout
    pub logout_deadline: Duration,
    pub login_retry: LoginRetryPolicy,
    pub device_poll: DevicePollPolicy,
}

impl Default for AttachConfig {
    fn default() -> Self {
        Self {
            query_deadline: Duration::from_secs(10),
            discovery_deadline: Duration::from_secs(15),
            login_deadline: Duration::from_secs(30),
            logout_deadline: Duration::from_secs(30),
            login_retry: LoginRetryPolicy::default(),
            device_poll: DevicePollPolicy::default(),
        }
    }
}

/// Result of a detach that logged out at least one session (or found none).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetachReport {
    pub logged_out: Vec<Portal>,
    /// Portals whose logout failed; a later detach retries only these
    pub warnings: Vec<PortalFailure>,
}

/// Order portals for login: descending preference, then ascending address.
pub fn order_portals(portals: &[Portal], hints: &AttachHints) -> Vec<Portal> {
    let mut ordered = portals.to_vec();
    ordered.sort_by(|a, b| {
        hints
            .preference_rank(a)
            .cmp(&hints.preference_rank(b))
            .then_with(|| a.cmp_address(b))
    });
    ordered.dedup_by(|a, b| a.same_endpoint(b));
    ordered
}

/// Number of live sessions the attach needs.
///
/// A replica count of zero means any single path suffices; more replicas
/// than distinct portals cannot be satisfied and are capped.
pub fn required_sessions(descriptor: &ConnectionDescriptor, hints: &AttachHints) -> usize {
    let wanted = hints
        .replica_override
        .unwrap_or(descriptor.replica_count)
        .max(1) as usize;
    let distinct = order_portals(&descriptor.portals, hints).len();
    wanted.min(distinct.max(1))
}

/// Turn a result the classifier rejected into an error.
fn rejected(result: std::result::Result<String, RelayError>, op: AdminOp) -> AttachError {
    match result {
        Err(e) => e.into(),
        Ok(output) => RelayError::Relay(tonic::Status::unknown(format!(
            "{:?} rejected by classifier: {}",
            op,
            output.trim()
        )))
        .into(),
    }
}

fn transition(target_iqn: &str, state: &mut AttachState, next: AttachState) {
    debug!(target_iqn = %target_iqn, from = %state, to = %next, "Attach state transition");
    *state = next;
}

/// Node-side attachment driver.
///
/// Holds no per-volume state; concurrent calls for different volumes are
/// independent, and concurrent calls for the same volume converge through
/// the "already logged in" path.
pub struct AttachmentManager {
    relay: Arc<dyn CommandRelay>,
    resolver: Arc<dyn DeviceResolver>,
    classifier: Arc<dyn OutcomeClassifier>,
    config: AttachConfig,
    initiator: Option<Arc<InitiatorFile>>,
}

impl AttachmentManager {
    pub fn new(
        relay: Arc<dyn CommandRelay>,
        resolver: Arc<dyn DeviceResolver>,
        classifier: Arc<dyn OutcomeClassifier>,
        config: AttachConfig,
    ) -> Self {
        Self {
            relay,
            resolver,
            classifier,
            config,
            initiator: None,
        }
    }

    /// Make sure the initiator identity file exists before any login.
    pub fn with_initiator_file(mut self, initiator: Arc<InitiatorFile>) -> Self {
        self.initiator = Some(initiator);
        self
    }

    /// Sessions on this host for `target_iqn`, whoever created them.
    async fn target_sessions(&self, target_iqn: &str) -> Result<Vec<Session>> {
        let result = self
            .relay
            .send(&iscsiadm::list_sessions(), self.config.query_deadline)
            .await;

        let sessions = match self.classifier.classify(AdminOp::ListSessions, &result) {
            Outcome::Succeeded => iscsiadm::parse_sessions(&result.unwrap_or_default()),
            Outcome::AlreadySatisfied => Vec::new(),
            Outcome::Unknown | Outcome::Failed(_) => {
                return Err(rejected(result, AdminOp::ListSessions));
            }
        };

        Ok(sessions
            .into_iter()
            .filter(|s| s.target_iqn == target_iqn)
            .collect())
    }

    /// Populate the node database for `portal`. Failure is not fatal: the
    /// target may already be known from an earlier discovery.
    async fn discover(&self, portal: &Portal) {
        let result = self
            .relay
            .send(&iscsiadm::discover(portal), self.config.discovery_deadline)
            .await;

        match self.classifier.classify(AdminOp::Discovery, &result) {
            Outcome::Succeeded | Outcome::AlreadySatisfied => {
                debug!(portal = %portal, "iSCSI discovery successful");
            }
            Outcome::Unknown => {
                warn!(portal = %portal, "iSCSI discovery timed out (continuing with login)");
            }
            Outcome::Failed(reason) => {
                warn!(
                    portal = %portal,
                    reason = %reason,
                    "iSCSI discovery returned error (may be expected if target already known)"
                );
            }
        }
    }

    /// Log in through one portal, retrying per the login policy.
    async fn login(
        &self,
        target_iqn: &str,
        portal: &Portal,
    ) -> std::result::Result<(), PortalFailure> {
        let argv = iscsiadm::login(target_iqn, portal);
        let mut attempts = 0;

        loop {
            attempts += 1;
            let result = self.relay.send(&argv, self.config.login_deadline).await;

            let reason = match self.classifier.classify(AdminOp::Login, &result) {
                Outcome::Succeeded => {
                    info!(target_iqn = %target_iqn, portal = %portal, "iSCSI login successful");
                    return Ok(());
                }
                Outcome::AlreadySatisfied => {
                    info!(target_iqn = %target_iqn, portal = %portal, "iSCSI session already exists");
                    return Ok(());
                }
                Outcome::Unknown => {
                    // The login may still complete on the host: look before retrying
                    warn!(target_iqn = %target_iqn, portal = %portal, "iSCSI login timed out, re-querying sessions");
                    match self.target_sessions(target_iqn).await {
                        Ok(sessions) if sessions.iter().any(|s| s.portal.same_endpoint(portal)) => {
                            info!(target_iqn = %target_iqn, portal = %portal, "Session established by timed-out login");
                            return Ok(());
                        }
                        Ok(_) => "login timed out".to_string(),
                        Err(e) => format!("login timed out; session query failed: {}", e),
                    }
                }
                Outcome::Failed(reason) => reason,
            };

            match self.config.login_retry.next(attempts) {
                Decision::Retry(delay) => {
                    warn!(
                        target_iqn = %target_iqn,
                        portal = %portal,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        reason = %reason,
                        "iSCSI login failed, retrying"
                    );
                    metrics::record_retry("login");
                    tokio::time::sleep(delay).await;
                }
                Decision::GiveUp => {
                    warn!(
                        target_iqn = %target_iqn,
                        portal = %portal,
                        attempts,
                        reason = %reason,
                        "iSCSI login failed for portal"
                    );
                    return Err(PortalFailure {
                        portal: portal.clone(),
                        reason,
                    });
                }
            }
        }
    }

    /// One look at the device tree. `None` means "not yet".
    fn resolve_once(
        &self,
        target_iqn: &str,
        live: &[Portal],
        multipath: bool,
    ) -> Option<DevicePath> {
        let raw = match self.resolver.raw_devices(target_iqn, live) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(target_iqn = %target_iqn, error = %e, "Failed to scan for devices");
                return None;
            }
        };
        let first = raw.first()?;

        let holder = match self.resolver.multipath_holder(first) {
            Ok(holder) => holder,
            Err(e) => {
                warn!(device = %first, error = %e, "Failed to read multipath holders");
                return None;
            }
        };

        if multipath && live.len() > 1 {
            // Wait until every live path is aggregated under one holder
            return match holder {
                Some(holder) if holder.path_count >= live.len() => Some(holder.path),
                Some(holder) => {
                    debug!(
                        multipath = %holder.path,
                        paths = holder.path_count,
                        expected = live.len(),
                        "Multipath device still assembling"
                    );
                    None
                }
                None => None,
            };
        }

        // A raw disk claimed by dm-multipath cannot be mounted directly
        Some(holder.map_or_else(|| first.clone(), |h| h.path))
    }

    async fn wait_for_device(
        &self,
        target_iqn: &str,
        live: &[Portal],
        multipath: bool,
    ) -> Result<DevicePath> {
        let policy = self.config.device_poll;
        let started = Instant::now();
        let mut polls = 0;

        loop {
            polls += 1;
            let found = self.resolve_once(target_iqn, live, multipath);
            metrics::record_device_poll(found.is_some());
            if let Some(device) = found {
                debug!(target_iqn = %target_iqn, device = %device, polls, "Device resolved");
                return Ok(device);
            }

            match policy.next(polls, started.elapsed()) {
                Decision::Retry(delay) => tokio::time::sleep(delay).await,
                Decision::GiveUp => {
                    return Err(AttachError::DeviceNotFound {
                        target: target_iqn.to_string(),
                        polls,
                    });
                }
            }
        }
    }

    async fn attach_inner(
        &self,
        descriptor: &ConnectionDescriptor,
        hints: &AttachHints,
    ) -> Result<DevicePath> {
        descriptor.validate()?;
        let target_iqn = descriptor.target_iqn.as_str();
        let mut state = AttachState::Unattached;

        let ordered = order_portals(&descriptor.portals, hints);
        let existing = self.target_sessions(target_iqn).await?;
        let has_session = |p: &Portal| existing.iter().any(|s| s.portal.same_endpoint(p));

        let mut live: Vec<Portal> = Vec::with_capacity(ordered.len());
        let mut failures = Vec::new();

        if ordered.iter().all(has_session) {
            info!(target_iqn = %target_iqn, sessions = existing.len(), "All portals already logged in");
            live = ordered;
        } else {
            transition(target_iqn, &mut state, AttachState::LoggingIn);
            if let Some(initiator) = &self.initiator {
                initiator.ensure(self.relay.as_ref()).await?;
            }
            for portal in ordered {
                if has_session(&portal) {
                    debug!(portal = %portal, "Session already present");
                    live.push(portal);
                    continue;
                }

                self.discover(&portal).await;
                match self.login(target_iqn, &portal).await {
                    Ok(()) => live.push(portal),
                    Err(failure) => failures.push(failure),
                }
            }
        }

        let required = required_sessions(descriptor, hints);
        let needed = if hints.multipath_enabled { 1 } else { required };
        if live.len() < needed {
            return Err(AttachError::PartialLogin {
                target: target_iqn.to_string(),
                succeeded: live.len(),
                required: needed,
                failures,
            });
        }
        if !failures.is_empty() {
            warn!(
                target_iqn = %target_iqn,
                live = live.len(),
                failed = failures.len(),
                "Continuing with reduced path count"
            );
        }
        transition(target_iqn, &mut state, AttachState::LoggedIn);

        transition(target_iqn, &mut state, AttachState::DeviceResolving);
        let device = self
            .wait_for_device(target_iqn, &live, hints.multipath_enabled)
            .await?;

        info!(
            target_iqn = %target_iqn,
            device = %device,
            paths = live.len(),
            multipath = hints.multipath_enabled,
            "iSCSI target attached"
        );
        transition(target_iqn, &mut state, AttachState::Attached(device.clone()));
        Ok(device)
    }

    /// Attach the volume described by `descriptor` and return its block device.
    ///
    /// Safe to call repeatedly: portals that already have a session are not
    /// logged in again.
    #[instrument(skip(self, descriptor, hints), fields(target_iqn = %descriptor.target_iqn))]
    pub async fn attach(
        &self,
        descriptor: &ConnectionDescriptor,
        hints: &AttachHints,
    ) -> Result<DevicePath> {
        let timer = OperationTimer::new("attach");
        let result = self.attach_inner(descriptor, hints).await;
        match &result {
            Ok(_) => timer.success(),
            Err(e) => timer.failure(e.kind()),
        }
        result
    }

    async fn detach_inner(&self, descriptor: &ConnectionDescriptor) -> Result<DetachReport> {
        descriptor.validate()?;
        let target_iqn = descriptor.target_iqn.as_str();

        let mut portals: Vec<Portal> = self
            .target_sessions(target_iqn)
            .await?
            .into_iter()
            .map(|s| s.portal)
            .collect();
        portals.sort_by(Portal::cmp_address);
        portals.dedup_by(|a, b| a.same_endpoint(b));

        if portals.is_empty() {
            info!(target_iqn = %target_iqn, "No sessions to log out");
            return Ok(DetachReport::default());
        }

        let mut state = AttachState::Unattached;
        transition(target_iqn, &mut state, AttachState::LoggingOut);

        let mut report = DetachReport::default();
        for portal in portals {
            let result = self
                .relay
                .send(
                    &iscsiadm::logout(target_iqn, &portal),
                    self.config.logout_deadline,
                )
                .await;

            match self.classifier.classify(AdminOp::Logout, &result) {
                Outcome::Succeeded => {
                    info!(target_iqn = %target_iqn, portal = %portal, "iSCSI logout successful");
                    report.logged_out.push(portal);
                }
                Outcome::AlreadySatisfied => {
                    debug!(target_iqn = %target_iqn, portal = %portal, "iSCSI session was not logged in");
                    report.logged_out.push(portal);
                }
                Outcome::Unknown => {
                    warn!(target_iqn = %target_iqn, portal = %portal, "iSCSI logout timed out");
                    report.warnings.push(PortalFailure {
                        portal,
                        reason: "logout timed out".to_string(),
                    });
                }
                Outcome::Failed(reason) => {
                    warn!(target_iqn = %target_iqn, portal = %portal, reason = %reason, "iSCSI logout failed");
                    report.warnings.push(PortalFailure { portal, reason });
                }
            }
        }

        if report.logged_out.is_empty() {
            return Err(AttachError::AggregateDetach {
                target: target_iqn.to_string(),
                failures: report.warnings,
            });
        }

        transition(target_iqn, &mut state, AttachState::Unattached);
        Ok(report)
    }

    /// Log out every session for the target on this host.
    ///
    /// Per-portal failures are reported as warnings; only a detach where
    /// every logout failed is an error.
    #[instrument(skip(self, descriptor), fields(target_iqn = %descriptor.target_iqn))]
    pub async fn detach(&self, descriptor: &ConnectionDescriptor) -> Result<DetachReport> {
        let timer = OperationTimer::new("detach");
        let result = self.detach_inner(descriptor).await;
        match &result {
            Ok(report) if !report.warnings.is_empty() => timer.failure("partial_detach"),
            Ok(_) => timer.success(),
            Err(e) => timer.failure(e.kind()),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn portals(addresses: &[&str]) -> Vec<Portal> {
        addresses
            .iter()
            .map(|a| Portal::parse(a, 3260).unwrap())
            .collect()
    }

    #[test]
    fn test_order_portals_by_address() {
        let ordered = order_portals(
            &portals(&["10.0.0.2", "10.0.0.10", "10.0.0.1"]),
            &AttachHints::default(),
        );
        assert_eq!(ordered, portals(&["10.0.0.1", "10.0.0.2", "10.0.0.10"]));
    }

    #[test]
    fn test_order_portals_by_preference() {
        let hints = AttachHints {
            preferred_portals: vec!["10.0.0.3".into(), "10.0.0.2:3260".into()],
            ..Default::default()
        };
        let ordered = order_portals(&portals(&["10.0.0.1", "10.0.0.2", "10.0.0.3"]), &hints);
        assert_eq!(ordered, portals(&["10.0.0.3", "10.0.0.2", "10.0.0.1"]));
    }

    #[test]
    fn test_order_portals_dedups() {
        let ordered = order_portals(
            &portals(&["10.0.0.1", "10.0.0.1:3260"]),
            &AttachHints::default(),
        );
        assert_eq!(ordered.len(), 1);
    }

    #[test]
    fn test_order_portals_dedups_ip_spellings() {
        let ordered = order_portals(
            &portals(&["[fd00:0:0::1]:3260", "fd00::1", "10.0.0.1"]),
            &AttachHints::default(),
        );
        assert_eq!(ordered.len(), 2);
    }

    #[test]
    fn test_required_sessions_counts_distinct_portals() {
        let descriptor =
            ConnectionDescriptor::new("iqn.x", portals(&["10.0.0.1", "10.0.0.1:3260"]))
                .with_replica_count(2);
        assert_eq!(required_sessions(&descriptor, &AttachHints::default()), 1);
    }

    #[test]
    fn test_required_sessions() {
        let descriptor = ConnectionDescriptor::new("iqn.x", portals(&["10.0.0.1", "10.0.0.2"]));
        let hints = AttachHints::default();

        assert_eq!(required_sessions(&descriptor, &hints), 1);
        assert_eq!(
            required_sessions(&descriptor.clone().with_replica_count(0), &hints),
            1
        );
        assert_eq!(
            required_sessions(&descriptor.clone().with_replica_count(5), &hints),
            2
        );

        let hints = AttachHints {
            replica_override: Some(2),
            ..Default::default()
        };
        assert_eq!(required_sessions(&descriptor, &hints), 2);
    }
}
