//! Per-replica switchover state machine.
//!
//! # Roles
//! Every replica runs one handler. All of them answer freeze/flip orders;
//! the current leader (lowest live node id) additionally drives phase
//! transitions through the CAS row, runs the sync engine, and collects
//! acknowledgements. Leadership is re-derived from the membership table on
//! every tick, so a dead leader is replaced within a heartbeat or two and
//! the new one picks up where the phase row says the cluster is.
//!
//! # The freeze / flip dance
//! `execute` moves the phase to `executing` and broadcasts `freeze`. Each
//! node stops new transactions, drains in-flight work within the freeze
//! budget, and reports `frozen`. Once every live node is frozen the leader
//! drains the change log to lag zero, confirms liveness one more time,
//! CASes to `complete`, and broadcasts `flip`. Receiving `flip` swaps the
//! routing target, the single instant the next database becomes
//! authoritative. Any miss along the way aborts: old stays authoritative
//! and nothing was written to next that the log had not already shipped.

use crate::bus::Bus;
use crate::message::{Message, MessageKind};
use crate::store::{elect_leader, ClusterStore, NodeIdentity};
use crate::sync::SyncEngine;
use crate::{
    NodeStatus, Phase, SwitchoverError, SwitchoverResult, ACK_TIMEOUT, DETACH_GRACE,
    FREEZE_BUDGET, HEARTBEAT_INTERVAL,
};
use beacon_db::routing::{RoutedPool, Target};
use beacon_engine::EngineHandle;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use uuid::Uuid;

/// Tunables, defaulted from the crate constants.
#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub freeze_budget: Duration,
    pub ack_timeout: Duration,
    pub heartbeat: Duration,
    pub detach_grace: Duration,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            freeze_budget: FREEZE_BUDGET,
            ack_timeout: ACK_TIMEOUT,
            heartbeat: HEARTBEAT_INTERVAL,
            detach_grace: DETACH_GRACE,
        }
    }
}

/// What the leader is currently waiting on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    /// Enable acknowledgements; completion starts the sync engine.
    Enable,
    /// Frozen reports; completion triggers the flip sequence.
    Freeze,
}

/// Outstanding acknowledgement round.
#[derive(Debug)]
struct PendingAcks {
    kind: AckKind,
    version: i64,
    expected: HashSet<Uuid>,
    deadline: Instant,
}

impl PendingAcks {
    fn new(kind: AckKind, version: i64, expected: HashSet<Uuid>, timeout: Duration) -> Self {
        Self {
            kind,
            version,
            expected,
            deadline: Instant::now() + timeout,
        }
    }

    /// Record one ack; true once everyone expected has answered.
    fn observe(&mut self, sender: Uuid) -> bool {
        self.expected.remove(&sender);
        self.expected.is_empty()
    }

    fn expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }
}

/// Fire-and-forget abort trigger handed to the process shutdown path.
#[derive(Clone)]
pub struct AbortTrigger {
    tx: mpsc::Sender<()>,
}

impl AbortTrigger {
    pub fn abort(&self) {
        let _ = self.tx.try_send(());
    }
}

/// The per-replica switchover participant.
pub struct Handler {
    identity: NodeIdentity,
    routed: RoutedPool,
    store: ClusterStore,
    bus: Bus,
    sync: SyncEngine,
    engine: Option<EngineHandle>,
    config: HandlerConfig,
    status: Arc<parking_lot::RwLock<NodeStatus>>,
    abort_rx: mpsc::Receiver<()>,
    abort_tx: mpsc::Sender<()>,
}

struct Attempt {
    phase: Phase,
    version: i64,
    pending: Option<PendingAcks>,
    sync_task: Option<(watch::Sender<bool>, tokio::task::JoinHandle<()>)>,
    retire_at: Option<Instant>,
}

impl Handler {
    pub fn new(
        identity: NodeIdentity,
        routed: RoutedPool,
        store: ClusterStore,
        bus: Bus,
        sync: SyncEngine,
        engine: Option<EngineHandle>,
        config: HandlerConfig,
    ) -> Self {
        let (abort_tx, abort_rx) = mpsc::channel(1);
        Self {
            identity,
            routed,
            store,
            bus,
            sync,
            engine,
            config,
            status: Arc::new(parking_lot::RwLock::new(NodeStatus::Unknown)),
            abort_rx,
            abort_tx,
        }
    }

    /// Trigger usable after `run` has consumed the handler (e.g. from the
    /// process shutdown path).
    pub fn abort_trigger(&self) -> AbortTrigger {
        AbortTrigger {
            tx: self.abort_tx.clone(),
        }
    }

    fn set_status(&self, status: NodeStatus) {
        *self.status.write() = status;
    }

    async fn send(&self, kind: MessageKind, phase: Phase, version: i64) -> SwitchoverResult<()> {
        self.bus
            .send(&Message::new(self.identity.id, kind, phase, version))
            .await
    }

    async fn am_leader(&self) -> SwitchoverResult<bool> {
        let nodes = self.store.nodes().await?;
        Ok(elect_leader(&nodes, Utc::now()) == Some(self.identity.id))
    }

    /// Participate until shutdown (or retirement after a completed flip).
    pub async fn run(mut self, shutdown: watch::Receiver<bool>) -> SwitchoverResult<()> {
        self.store.ensure_schema().await?;
        let mut stream = self.bus.subscribe().await?;

        // Membership heartbeat, runs for the life of the handler.
        let heartbeat_task = {
            let store = self.store.clone();
            let identity = self.identity.clone();
            let status = Arc::clone(&self.status);
            let mut shutdown = shutdown.clone();
            let interval = self.config.heartbeat;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = shutdown.changed() => break,
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                    let current = *status.read();
                    if let Err(err) = store.heartbeat(&identity, current).await {
                        tracing::warn!(error = %err, "heartbeat failed");
                    }
                }
                let _ = store.leave(&identity).await;
            })
        };

        let (phase, version) = self.store.phase().await?;
        let mut attempt = Attempt {
            phase,
            version,
            pending: None,
            sync_task: None,
            retire_at: None,
        };
        let current_status = *self.status.read();
        self.store.heartbeat(&self.identity, current_status).await?;
        self.send(MessageKind::Hello, attempt.phase, attempt.version).await?;

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        let mut shutdown_rx = shutdown.clone();
        let result = loop {
            tokio::select! {
                msg = stream.recv() => match msg {
                    Ok(msg) => {
                        if let Err(err) = self.handle_message(&mut attempt, msg).await {
                            if matches!(err, SwitchoverError::Fatal(_)) {
                                break Err(err);
                            }
                            tracing::error!(error = %err, "handling bus message failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, "bus receive failed; resubscribing");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                        match self.bus.subscribe().await {
                            Ok(new_stream) => stream = new_stream,
                            Err(err) => tracing::error!(error = %err, "resubscribe failed"),
                        }
                    }
                },
                _ = ticker.tick() => {
                    if let Err(err) = self.tick(&mut attempt).await {
                        if matches!(err, SwitchoverError::Fatal(_)) {
                            break Err(err);
                        }
                        tracing::error!(error = %err, "handler tick failed");
                    }
                    if attempt.retire_at.is_some_and(|at| Instant::now() >= at) {
                        break Ok(());
                    }
                }
                Some(()) = self.abort_rx.recv() => {
                    if attempt.phase.may_abort() && attempt.phase != Phase::Idle {
                        let _ = self.abort_attempt(&mut attempt, "shutdown requested").await;
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        self.stop_sync(&mut attempt);
        // The heartbeat task only watches the shutdown channel; when the
        // loop exits for any other reason (retirement, fatal error) stop it
        // here and deregister explicitly.
        heartbeat_task.abort();
        let _ = heartbeat_task.await;
        let _ = self.store.leave(&self.identity).await;
        result
    }

    /// Periodic duties: refresh the phase view, run leader work, expire
    /// pending ack rounds.
    async fn tick(&self, attempt: &mut Attempt) -> SwitchoverResult<()> {
        let (phase, version) = self.store.phase().await?;
        if version != attempt.version {
            // Another actor moved the cluster; adopt its view.
            attempt.phase = phase;
            attempt.version = version;
            if phase == Phase::Ready {
                self.set_status(NodeStatus::Ready);
            }
        }

        if !self.am_leader().await? {
            return Ok(());
        }

        // Leader duties below.
        let _ = self.store.reap_dead().await;

        if let Some(pending) = &attempt.pending {
            if pending.expired(Instant::now()) {
                let kind = pending.kind;
                attempt.pending = None;
                tracing::warn!(?kind, "acknowledgement round timed out");
                self.abort_attempt(attempt, "ack timeout").await?;
                return Ok(());
            }
        }

        match attempt.phase {
            // A leader (original or newly elected) keeps the sync engine
            // running for the active attempt.
            Phase::Syncing | Phase::Ready => self.ensure_sync_running(attempt),
            _ => {}
        }

        if attempt.phase == Phase::Syncing && self.sync.report().ready {
            if let Some(version) = self
                .store
                .cas_phase(Phase::Syncing, attempt.version, Phase::Ready)
                .await?
            {
                attempt.phase = Phase::Ready;
                attempt.version = version;
                self.set_status(NodeStatus::Ready);
                self.send(MessageKind::Status, Phase::Ready, version).await?;
            }
        }
        Ok(())
    }

    async fn handle_message(&self, attempt: &mut Attempt, msg: Message) -> SwitchoverResult<()> {
        // Fencing: control messages from a previous attempt or a stale
        // actor are dropped, not reinterpreted.
        let fenced = matches!(
            msg.kind,
            MessageKind::Freeze | MessageKind::Frozen | MessageKind::Flip | MessageKind::Ack
        );
        if fenced && msg.version < attempt.version {
            tracing::debug!(kind = ?msg.kind, version = msg.version, "dropping stale message");
            return Ok(());
        }

        match msg.kind {
            MessageKind::Hello | MessageKind::Status => Ok(()),
            MessageKind::Enable => self.on_enable(attempt, &msg).await,
            MessageKind::Ack => {
                self.on_ack(attempt, msg.sender, AckKind::Enable).await
            }
            MessageKind::Execute => self.on_execute(attempt).await,
            MessageKind::Freeze => self.on_freeze(attempt, &msg).await,
            MessageKind::Frozen => self.on_ack(attempt, msg.sender, AckKind::Freeze).await,
            MessageKind::Flip => self.on_flip(attempt, &msg).await,
            MessageKind::Abort => self.on_abort(attempt).await,
            MessageKind::Reset => self.on_reset(attempt).await,
            MessageKind::Sync => {
                if self.am_leader().await? {
                    self.sync.recheck();
                }
                Ok(())
            }
            MessageKind::Pause => {
                if self.am_leader().await? {
                    self.sync.pause();
                }
                Ok(())
            }
            MessageKind::Resume => {
                if self.am_leader().await? {
                    self.sync.resume();
                }
                Ok(())
            }
            MessageKind::Unknown => Ok(()),
        }
    }

    /// Operator asked for a switchover. The leader opens the attempt and
    /// waits for every node to acknowledge; everyone acknowledges.
    async fn on_enable(&self, attempt: &mut Attempt, msg: &Message) -> SwitchoverResult<()> {
        if self.am_leader().await? {
            if attempt.phase == Phase::Idle {
                if let Some(version) = self
                    .store
                    .cas_phase(Phase::Idle, attempt.version, Phase::SyncPending)
                    .await?
                {
                    attempt.phase = Phase::SyncPending;
                    attempt.version = version;
                    let expected: HashSet<Uuid> = self
                        .store
                        .nodes()
                        .await?
                        .iter()
                        .filter(|node| node.is_live(Utc::now()))
                        .map(|node| node.node_id)
                        .collect();
                    attempt.pending = Some(PendingAcks::new(
                        AckKind::Enable,
                        version,
                        expected,
                        self.config.ack_timeout,
                    ));
                    // Re-broadcast with the new version so every node (and
                    // our own ack below) is stamped correctly.
                    self.send(MessageKind::Enable, Phase::SyncPending, version).await?;
                }
            }
            // The original operator message carries the old version; only
            // the leader's re-broadcast gets acknowledged.
            if msg.version < attempt.version {
                return Ok(());
            }
        }
        if attempt.phase == Phase::SyncPending || msg.phase == Phase::SyncPending {
            self.send(MessageKind::Ack, msg.phase, msg.version).await?;
        }
        Ok(())
    }

    /// Leader-side ack bookkeeping for enable and freeze rounds.
    async fn on_ack(
        &self,
        attempt: &mut Attempt,
        sender: Uuid,
        kind: AckKind,
    ) -> SwitchoverResult<()> {
        let Some(pending) = &mut attempt.pending else {
            return Ok(());
        };
        if pending.kind != kind || pending.version != attempt.version {
            return Ok(());
        }
        if !pending.observe(sender) {
            return Ok(());
        }
        attempt.pending = None;
        match kind {
            AckKind::Enable => {
                if let Some(version) = self
                    .store
                    .cas_phase(Phase::SyncPending, attempt.version, Phase::Syncing)
                    .await?
                {
                    attempt.phase = Phase::Syncing;
                    attempt.version = version;
                    self.ensure_sync_running(attempt);
                }
                Ok(())
            }
            AckKind::Freeze => self.finish_cutover(attempt).await,
        }
    }

    /// Operator pulled the trigger. Leader only; must be `ready`.
    async fn on_execute(&self, attempt: &mut Attempt) -> SwitchoverResult<()> {
        if !self.am_leader().await? {
            return Ok(());
        }
        if attempt.phase != Phase::Ready {
            tracing::warn!(phase = %attempt.phase, "execute refused outside ready");
            return Ok(());
        }
        let Some(version) = self
            .store
            .cas_phase(Phase::Ready, attempt.version, Phase::Executing)
            .await?
        else {
            return Ok(());
        };
        attempt.phase = Phase::Executing;
        attempt.version = version;

        let expected: HashSet<Uuid> = self
            .store
            .nodes()
            .await?
            .iter()
            .filter(|node| node.is_live(Utc::now()))
            .map(|node| node.node_id)
            .collect();
        attempt.pending = Some(PendingAcks::new(
            AckKind::Freeze,
            version,
            expected,
            self.config.freeze_budget,
        ));
        self.send(MessageKind::Freeze, Phase::Executing, version).await
    }

    /// Freeze order: stop starting transactions, drain, report.
    async fn on_freeze(&self, attempt: &mut Attempt, msg: &Message) -> SwitchoverResult<()> {
        attempt.phase = Phase::Executing;
        attempt.version = msg.version;
        if let Some(engine) = &self.engine {
            engine.pause();
        }
        self.routed.freeze();
        let drained = self.routed.drain(self.config.freeze_budget).await;
        if drained {
            self.set_status(NodeStatus::Armed);
            // Status lands in the membership row immediately, not just at
            // the next heartbeat, so the leader's final liveness round sees
            // every armed node.
            self.store.heartbeat(&self.identity, NodeStatus::Armed).await?;
            self.send(MessageKind::Frozen, Phase::Executing, msg.version).await
        } else {
            tracing::warn!("freeze drain did not finish inside the budget");
            self.set_status(NodeStatus::Error);
            self.send(MessageKind::Abort, Phase::Executing, msg.version).await
        }
    }

    /// Every live node is frozen: verify lag zero, confirm liveness, CAS to
    /// complete, and broadcast the flip.
    async fn finish_cutover(&self, attempt: &mut Attempt) -> SwitchoverResult<()> {
        if let Err(err) = self.sync.final_drain(self.config.freeze_budget).await {
            tracing::error!(error = %err, "final drain failed");
            return self.abort_attempt(attempt, "final drain failed").await;
        }

        // One more membership round: a node that died while frozen would
        // otherwise wake up routing at the wrong database.
        let nodes = self.store.nodes().await?;
        let now = Utc::now();
        if nodes.iter().any(|node| !node.is_live(now)) {
            return self.abort_attempt(attempt, "node lost during freeze").await;
        }

        let Some(version) = self
            .store
            .cas_phase(Phase::Executing, attempt.version, Phase::Complete)
            .await?
        else {
            return self.abort_attempt(attempt, "phase row moved during cutover").await;
        };
        attempt.phase = Phase::Complete;
        attempt.version = version;
        self.send(MessageKind::Flip, Phase::Complete, version).await
    }

    /// The single instant next becomes authoritative on this node.
    async fn on_flip(&self, attempt: &mut Attempt, msg: &Message) -> SwitchoverResult<()> {
        attempt.phase = Phase::Complete;
        attempt.version = msg.version;
        self.routed.set_mode(Target::Next, msg.version as u64);
        self.routed.thaw();
        if let Some(engine) = &self.engine {
            engine.resume();
        }
        self.set_status(NodeStatus::Flipped);
        self.store.heartbeat(&self.identity, NodeStatus::Flipped).await?;
        tracing::info!(version = msg.version, "flipped to next database");

        // Leader tears capture down after the grace window; every handler
        // retires once the attempt is complete.
        if self.am_leader().await? {
            let sync = self.sync.clone();
            let grace = self.config.detach_grace;
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if let Err(err) = sync.detach().await {
                    tracing::warn!(error = %err, "post-flip detach failed");
                }
            });
        }
        attempt.retire_at = Some(Instant::now() + self.config.detach_grace + Duration::from_secs(1));
        Ok(())
    }

    async fn on_abort(&self, attempt: &mut Attempt) -> SwitchoverResult<()> {
        if !attempt.phase.may_abort() {
            return Ok(());
        }
        self.abort_attempt(attempt, "abort received").await
    }

    /// Roll this node (and, via CAS + broadcast, the cluster) back to the
    /// pre-enable configuration. Old stays authoritative; capture triggers
    /// stay installed for the next attempt.
    async fn abort_attempt(&self, attempt: &mut Attempt, reason: &str) -> SwitchoverResult<()> {
        tracing::warn!(reason, phase = %attempt.phase, "aborting switchover");
        attempt.pending = None;
        self.stop_sync(attempt);
        self.routed.thaw();
        if let Some(engine) = &self.engine {
            engine.resume();
        }
        self.set_status(NodeStatus::Unknown);

        if attempt.phase.may_abort() {
            if let Some(version) = self
                .store
                .cas_phase(attempt.phase, attempt.version, Phase::Aborted)
                .await?
            {
                attempt.phase = Phase::Aborted;
                attempt.version = version;
                self.send(MessageKind::Abort, Phase::Aborted, version).await?;
            } else {
                let (phase, version) = self.store.phase().await?;
                attempt.phase = phase;
                attempt.version = version;
            }
        }
        metrics::counter!("beacon_switchover_aborts_total").increment(1);
        Ok(())
    }

    /// Operator cleanup: tear down capture and return to idle. Only
    /// meaningful once the attempt is finished one way or the other.
    async fn on_reset(&self, attempt: &mut Attempt) -> SwitchoverResult<()> {
        if !self.am_leader().await? {
            return Ok(());
        }
        if !matches!(attempt.phase, Phase::Aborted | Phase::Complete) {
            tracing::warn!(phase = %attempt.phase, "reset refused mid-attempt");
            return Ok(());
        }
        self.stop_sync(attempt);
        if let Err(err) = self.sync.detach().await {
            tracing::warn!(error = %err, "detach during reset failed");
        }
        let version = self.store.force_phase(Phase::Idle).await?;
        attempt.phase = Phase::Idle;
        attempt.version = version;
        self.set_status(NodeStatus::Unknown);
        Ok(())
    }

    /// Start the sync engine task if this (leader) node is not running it.
    fn ensure_sync_running(&self, attempt: &mut Attempt) {
        if attempt.sync_task.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            return;
        }
        let (stop_tx, stop_rx) = watch::channel(false);
        let sync = self.sync.clone();
        let task = tokio::spawn(async move {
            if let Err(err) = sync.run(stop_rx).await {
                tracing::error!(error = %err, "sync engine stopped");
            }
        });
        attempt.sync_task = Some((stop_tx, task));
    }

    fn stop_sync(&self, attempt: &mut Attempt) {
        if let Some((stop_tx, _task)) = attempt.sync_task.take() {
            let _ = stop_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_acks_complete_when_everyone_answers() {
        let a = Uuid::from_u128(1);
        let b = Uuid::from_u128(2);
        let mut pending = PendingAcks::new(
            AckKind::Freeze,
            4,
            HashSet::from([a, b]),
            Duration::from_secs(5),
        );
        assert!(!pending.observe(a));
        // duplicate ack changes nothing
        assert!(!pending.observe(a));
        assert!(pending.observe(b));
    }

    #[test]
    fn pending_acks_expire() {
        let pending = PendingAcks::new(
            AckKind::Enable,
            2,
            HashSet::from([Uuid::from_u128(1)]),
            Duration::from_secs(0),
        );
        assert!(pending.expired(Instant::now() + Duration::from_millis(1)));
    }

    #[test]
    fn empty_expected_set_is_immediately_complete() {
        // Single-node cluster: the only expected ack is our own, which
        // arrives via the bus loopback; but a freshly computed empty set
        // (everyone already gone) must not wedge the round.
        let mut pending = PendingAcks::new(
            AckKind::Freeze,
            1,
            HashSet::new(),
            Duration::from_secs(5),
        );
        assert!(pending.observe(Uuid::from_u128(9)));
    }
}
