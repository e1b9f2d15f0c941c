//! Dual-backend connection routing.
//!
//! # What this module is
//! One logical database handle backed by two physical pools ("old" and
//! "next"). Every acquired connection is bound to exactly one backend and
//! tagged with the routing *version* current at acquisition time. When the
//! switchover handler advances the version (on freeze, flip, or abort), any
//! connection still carrying an older tag is destroyed on release instead of
//! being returned to its pool. That fencing rule is what makes "no
//! connection may straddle phases" hold without tracking individual
//! statements.
//!
//! # Freeze and drain
//! `freeze()` makes new acquisitions block (bounded); `drain(timeout)` waits
//! for the in-flight count to reach zero. The switchover handler uses the
//! pair to guarantee that no transaction begun against old survives into the
//! flip. `thaw()` re-opens the gate, either after flip (now routing to next)
//! or on abort (still routing to old).
//!
//! # Ordering
//! Within a process, `set_mode` happens-before any later `acquire`: the
//! route table is a single `RwLock`'d record, so an acquisition either sees
//! the old version (and will be fenced at release) or the new one.

use crate::retry::RetryPool;
use crate::{DbError, DbResult};
use parking_lot::RwLock;
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// How long an acquisition may block while the route is frozen or mid-swap.
const ACQUIRE_WAIT: Duration = Duration::from_millis(500);

/// Physical backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Old,
    Next,
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Target::Old => f.write_str("old"),
            Target::Next => f.write_str("next"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RouteState {
    target: Target,
    version: u64,
    frozen: bool,
}

/// What to do with a connection being released.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReleaseAction {
    /// Version still current: hand the connection back to its pool.
    Return,
    /// Version is stale: destroy the connection.
    Discard,
}

/// The routing decision table, separated from the pools so the fencing
/// rules can be exercised without a live backend.
pub(crate) struct RouteTable {
    state: RwLock<RouteState>,
    in_flight: AtomicUsize,
    changed: Notify,
}

impl RouteTable {
    pub(crate) fn new() -> Self {
        Self {
            state: RwLock::new(RouteState {
                target: Target::Old,
                version: 1,
                frozen: false,
            }),
            in_flight: AtomicUsize::new(0),
            changed: Notify::new(),
        }
    }

    pub(crate) fn current(&self) -> (Target, u64) {
        let state = self.state.read();
        (state.target, state.version)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait (bounded) for the gate to open, then record an acquisition and
    /// return the decision the connection must be tagged with.
    pub(crate) async fn begin_acquire(&self, wait: Duration) -> DbResult<(Target, u64)> {
        let deadline = Instant::now() + wait;
        loop {
            // Arm the notification *before* checking so a concurrent thaw
            // between check and await cannot be missed.
            let notified = self.changed.notified();
            {
                let state = self.state.read();
                if !state.frozen {
                    self.in_flight.fetch_add(1, Ordering::SeqCst);
                    return Ok((state.target, state.version));
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DbError::Unavailable(
                    "routing frozen: acquisition timed out".into(),
                ));
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    /// Record a release of a connection tagged with `version`.
    pub(crate) fn end_acquire(&self, version: u64) -> ReleaseAction {
        let action = if self.state.read().version == version {
            ReleaseAction::Return
        } else {
            ReleaseAction::Discard
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.changed.notify_waiters();
        action
    }

    /// Swap the routing target. Version must strictly increase; a stale
    /// swap (out-of-order control message) is ignored.
    pub(crate) fn set_mode(&self, target: Target, version: u64) -> bool {
        let mut state = self.state.write();
        if version <= state.version {
            return false;
        }
        state.target = target;
        state.version = version;
        drop(state);
        self.changed.notify_waiters();
        true
    }

    pub(crate) fn freeze(&self) {
        self.state.write().frozen = true;
    }

    pub(crate) fn thaw(&self) {
        self.state.write().frozen = false;
        self.changed.notify_waiters();
    }

    /// Wait until no acquired connections remain. Returns false on timeout.
    pub(crate) async fn drain(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

/// One logical database handle over two physical backends.
///
/// Cheap to clone; all clones share the route table and pools.
#[derive(Clone)]
pub struct RoutedPool {
    shared: Arc<Shared>,
}

struct Shared {
    old: RetryPool,
    next: RetryPool,
    table: RouteTable,
}

impl RoutedPool {
    pub fn new(old: RetryPool, next: RetryPool) -> Self {
        Self {
            shared: Arc::new(Shared {
                old,
                next,
                table: RouteTable::new(),
            }),
        }
    }

    /// The currently active routing decision.
    pub fn current(&self) -> (Target, u64) {
        self.shared.table.current()
    }

    /// Number of connections currently leased out.
    pub fn in_flight(&self) -> usize {
        self.shared.table.in_flight()
    }

    /// The pool for a specific backend, bypassing routing. The sync engine
    /// uses this: it must address old and next explicitly.
    pub fn backend(&self, target: Target) -> &RetryPool {
        match target {
            Target::Old => &self.shared.old,
            Target::Next => &self.shared.next,
        }
    }

    /// Acquire a connection from whichever backend is currently active.
    pub async fn acquire(&self) -> DbResult<RoutedConn> {
        let (target, version) = self.shared.table.begin_acquire(ACQUIRE_WAIT).await?;
        let pool = match target {
            Target::Old => &self.shared.old,
            Target::Next => &self.shared.next,
        };
        let conn = match pool.acquire().await {
            Ok(conn) => conn,
            Err(err) => {
                // Acquisition never happened; release the slot we claimed.
                self.shared.table.end_acquire(version);
                return Err(err);
            }
        };
        metrics::gauge!("beacon_db_routed_in_flight").set(self.shared.table.in_flight() as f64);
        Ok(RoutedConn {
            conn: Some(conn),
            target,
            version,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Atomically retarget new acquisitions. Returns false if `version` is
    /// not strictly newer than the current route version.
    pub fn set_mode(&self, target: Target, version: u64) -> bool {
        let swapped = self.shared.table.set_mode(target, version);
        if swapped {
            metrics::counter!("beacon_db_route_swaps_total").increment(1);
            tracing::info!(%target, version, "routing target swapped");
        }
        swapped
    }

    /// Refuse new acquisitions until [`RoutedPool::thaw`].
    pub fn freeze(&self) {
        self.shared.table.freeze();
        tracing::info!("routing frozen");
    }

    pub fn thaw(&self) {
        self.shared.table.thaw();
        tracing::info!("routing thawed");
    }

    /// Wait for all leased connections to be released.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.shared.table.drain(timeout).await
    }

    pub async fn close(&self) {
        self.shared.old.close().await;
        self.shared.next.close().await;
    }
}

/// A leased connection bound to one backend and one routing version.
pub struct RoutedConn {
    conn: Option<PoolConnection<Postgres>>,
    target: Target,
    version: u64,
    shared: Arc<Shared>,
}

impl RoutedConn {
    pub fn target(&self) -> Target {
        self.target
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

impl std::ops::Deref for RoutedConn {
    type Target = PoolConnection<Postgres>;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection taken")
    }
}

impl std::ops::DerefMut for RoutedConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for RoutedConn {
    fn drop(&mut self) {
        let action = self.shared.table.end_acquire(self.version);
        if action == ReleaseAction::Discard {
            // The phase moved while this connection was out. Detach it from
            // the pool and close it hard; session state set under the old
            // phase must not leak into a reused connection.
            if let Some(conn) = self.conn.take() {
                let raw = conn.detach();
                drop(raw);
            }
            metrics::counter!("beacon_db_stale_conns_discarded_total").increment(1);
            tracing::debug!(version = self.version, "discarded stale-version connection");
        }
        metrics::gauge!("beacon_db_routed_in_flight").set(self.shared.table.in_flight() as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_tags_current_version() {
        let table = RouteTable::new();
        let (target, version) = table.begin_acquire(ACQUIRE_WAIT).await.unwrap();
        assert_eq!(target, Target::Old);
        assert_eq!(version, 1);
        assert_eq!(table.in_flight(), 1);
        assert_eq!(table.end_acquire(version), ReleaseAction::Return);
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn stale_version_is_discarded_on_release() {
        let table = RouteTable::new();
        let (_, version) = table.begin_acquire(ACQUIRE_WAIT).await.unwrap();
        assert!(table.set_mode(Target::Next, 2));
        assert_eq!(table.end_acquire(version), ReleaseAction::Discard);
    }

    #[tokio::test]
    async fn version_regressions_are_ignored() {
        let table = RouteTable::new();
        assert!(table.set_mode(Target::Next, 5));
        assert!(!table.set_mode(Target::Old, 5));
        assert!(!table.set_mode(Target::Old, 3));
        let (target, version) = table.current();
        assert_eq!(target, Target::Next);
        assert_eq!(version, 5);
    }

    #[tokio::test]
    async fn frozen_acquire_times_out_unavailable() {
        let table = RouteTable::new();
        table.freeze();
        let err = table
            .begin_acquire(Duration::from_millis(20))
            .await
            .expect_err("must time out");
        assert!(matches!(err, DbError::Unavailable(_)));
        assert_eq!(table.in_flight(), 0);
    }

    #[tokio::test]
    async fn thaw_releases_blocked_acquirers() {
        let table = Arc::new(RouteTable::new());
        table.freeze();
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.begin_acquire(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        table.thaw();
        let (target, _) = waiter.await.unwrap().unwrap();
        assert_eq!(target, Target::Old);
    }

    #[tokio::test]
    async fn drain_waits_for_all_releases() {
        let table = Arc::new(RouteTable::new());
        let (_, v1) = table.begin_acquire(ACQUIRE_WAIT).await.unwrap();
        let (_, v2) = table.begin_acquire(ACQUIRE_WAIT).await.unwrap();

        assert!(!table.drain(Duration::from_millis(20)).await);

        let drainer = {
            let table = Arc::clone(&table);
            tokio::spawn(async move { table.drain(Duration::from_secs(5)).await })
        };
        table.end_acquire(v1);
        table.end_acquire(v2);
        assert!(drainer.await.unwrap());
    }

    #[tokio::test]
    async fn freeze_then_drain_observes_inflight_zero() {
        let table = RouteTable::new();
        table.freeze();
        assert!(table.drain(Duration::from_millis(10)).await);
    }
}
