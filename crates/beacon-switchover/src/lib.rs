//! Live database switchover.
//!
//! # What this crate does
//! Coordinates moving an active Beacon cluster from one Postgres database
//! ("old") to a structurally identical second database ("next") without
//! stopping the service:
//!
//! - [`store`]: the cluster phase row (compare-and-swap on a version
//!   counter) and node membership/heartbeats, both on the old database.
//! - [`bus`]: LISTEN/NOTIFY message channel between replicas.
//! - [`sync`]: trigger-based change capture on old, bulk copy and ordered
//!   change application onto next, lag accounting.
//! - [`handler`]: the per-replica state machine that ties the routing
//!   layer, the bus, and the sync engine together and participates in the
//!   cluster-wide cutover.
//! - [`shell`]: the interactive operator front-end.
//!
//! # Phase model
//! One cluster-wide [`Phase`] lives in `switchover_state`, guarded by a
//! version counter that increments on every transition. All control messages
//! carry the phase and version they apply to; anything stale is dropped.
//! Every replica therefore observes the same totally-ordered phase sequence,
//! even if at different wall-clock moments.

pub mod bus;
pub mod handler;
pub mod message;
pub mod shell;
pub mod store;
pub mod sync;

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Notification channel for cluster coordination.
pub const CHANNEL: &str = "switchover_v1";

/// How often each node refreshes its membership row.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);
/// A node is live while its heartbeat is younger than this.
pub const NODE_TTL: Duration = Duration::from_secs(2);
/// How long the leader waits for control-message acknowledgements.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);
/// Freeze window: no new transactions may start, in-flight work must drain.
pub const FREEZE_BUDGET: Duration = Duration::from_secs(5);
/// Upper bound for a single bulk-copy batch.
pub const COPY_BATCH_TIMEOUT: Duration = Duration::from_secs(30);
/// Delay after `complete` before tearing down triggers.
pub const DETACH_GRACE: Duration = Duration::from_secs(10);

/// Cluster-wide switchover stage. Ordering is total; `Aborted` is terminal
/// for the attempt (a later `reset` starts a fresh one).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    SyncPending,
    Syncing,
    Ready,
    Executing,
    Complete,
    Aborted,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::SyncPending => "sync_pending",
            Phase::Syncing => "syncing",
            Phase::Ready => "ready",
            Phase::Executing => "executing",
            Phase::Complete => "complete",
            Phase::Aborted => "aborted",
        }
    }

    pub fn parse(value: &str) -> Option<Phase> {
        Some(match value {
            "idle" => Phase::Idle,
            "sync_pending" => Phase::SyncPending,
            "syncing" => Phase::Syncing,
            "ready" => Phase::Ready,
            "executing" => Phase::Executing,
            "complete" => Phase::Complete,
            "aborted" => Phase::Aborted,
            _ => return None,
        })
    }

    /// The forward-transition table. Aborting is handled separately because
    /// it is permitted from every non-complete phase.
    pub fn may_advance_to(&self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Idle, Phase::SyncPending)
                | (Phase::SyncPending, Phase::Syncing)
                | (Phase::Syncing, Phase::Ready)
                | (Phase::Ready, Phase::Executing)
                | (Phase::Executing, Phase::Complete)
        )
    }

    /// Whether the attempt can still be aborted from this phase.
    pub fn may_abort(&self) -> bool {
        !matches!(self, Phase::Complete | Phase::Aborted)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A replica's own view of its switchover participation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unknown,
    Ready,
    Armed,
    Flipped,
    Error,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Unknown => "unknown",
            NodeStatus::Ready => "ready",
            NodeStatus::Armed => "armed",
            NodeStatus::Flipped => "flipped",
            NodeStatus::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<NodeStatus> {
        Some(match value {
            "unknown" => NodeStatus::Unknown,
            "ready" => NodeStatus::Ready,
            "armed" => NodeStatus::Armed,
            "flipped" => NodeStatus::Flipped,
            "error" => NodeStatus::Error,
            _ => return None,
        })
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SwitchoverError {
    #[error("validation: {0}")]
    Validation(String),
    /// The attempt is dead; the cluster rolls back to its pre-enable
    /// configuration (old stays authoritative, triggers stay installed).
    #[error("switchover aborted: {0}")]
    Aborted(String),
    /// Invariant violation on the next database. There is no safe automatic
    /// recovery; the process halts after rollback.
    #[error("fatal: {0}")]
    Fatal(String),
    #[error(transparent)]
    Db(#[from] beacon_db::DbError),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type SwitchoverResult<T> = Result<T, SwitchoverError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_codes_round_trip() {
        for phase in [
            Phase::Idle,
            Phase::SyncPending,
            Phase::Syncing,
            Phase::Ready,
            Phase::Executing,
            Phase::Complete,
            Phase::Aborted,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::parse("bogus"), None);
    }

    #[test]
    fn forward_transitions_follow_the_table() {
        assert!(Phase::Idle.may_advance_to(Phase::SyncPending));
        assert!(Phase::SyncPending.may_advance_to(Phase::Syncing));
        assert!(Phase::Syncing.may_advance_to(Phase::Ready));
        assert!(Phase::Ready.may_advance_to(Phase::Executing));
        assert!(Phase::Executing.may_advance_to(Phase::Complete));

        // no skipping
        assert!(!Phase::Idle.may_advance_to(Phase::Syncing));
        assert!(!Phase::Syncing.may_advance_to(Phase::Executing));
        // no going back
        assert!(!Phase::Ready.may_advance_to(Phase::Syncing));
        // terminal states do not advance
        assert!(!Phase::Complete.may_advance_to(Phase::Idle));
        assert!(!Phase::Aborted.may_advance_to(Phase::SyncPending));
    }

    #[test]
    fn abort_is_allowed_from_every_active_phase() {
        for phase in [
            Phase::Idle,
            Phase::SyncPending,
            Phase::Syncing,
            Phase::Ready,
            Phase::Executing,
        ] {
            assert!(phase.may_abort(), "{phase} must be abortable");
        }
        assert!(!Phase::Complete.may_abort());
        assert!(!Phase::Aborted.may_abort());
    }

    #[test]
    fn phase_serializes_as_snake_case() {
        let json = serde_json::to_string(&Phase::SyncPending).unwrap();
        assert_eq!(json, r#""sync_pending""#);
    }
}
