//! Change-data-capture sync engine.
//!
//! # Lifecycle
//! `attach → bulk_copy → tail → caught_up → detach`. Attach installs the
//! capture triggers and the change log on old; bulk copy moves the existing
//! rows table by table; the tail applies captured changes in log order and
//! keeps the cursor moving; caught-up is a statement about sustained low
//! lag, sampled once a second. Detach only happens after the cluster has
//! cut over (or on an explicit reset); an aborted attempt leaves capture
//! installed so a retry starts warm.
//!
//! # Priorities
//! The tail always wins: after every copy batch the engine drains the
//! change log before copying more, and copy throttles against observed
//! apply latency. Copy is restartable at any point; rows are upserts and
//! the log replays idempotently.

pub mod apply;
pub mod copy;
pub mod schema;

use crate::{SwitchoverError, SwitchoverResult};
use copy::{BatchTuner, TableCopier};
use schema::TablePlan;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Lag at or under this counts as caught up.
const LAG_THRESHOLD: i64 = 10;
/// Consecutive in-threshold samples required before `ready` asserts.
const READY_SAMPLES: u32 = 3;
/// Continuous lag growth for this long trips the error state.
const LAG_STALL: Duration = Duration::from_secs(60);

/// Where the sync engine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Attaching,
    BulkCopy,
    Tail,
    CaughtUp,
    Error,
}

impl std::fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SyncPhase::Attaching => "attaching",
            SyncPhase::BulkCopy => "bulk_copy",
            SyncPhase::Tail => "tail",
            SyncPhase::CaughtUp => "caught_up",
            SyncPhase::Error => "error",
        })
    }
}

/// Point-in-time view of sync progress, rendered by the shell.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub phase: SyncPhase,
    pub lag: i64,
    pub ready: bool,
    pub paused: bool,
    pub rows_copied: u64,
    pub tables_done: usize,
    pub tables_total: usize,
    pub last_error: Option<String>,
}

impl Default for SyncReport {
    fn default() -> Self {
        Self {
            phase: SyncPhase::Attaching,
            lag: 0,
            ready: false,
            paused: false,
            rows_copied: 0,
            tables_done: 0,
            tables_total: 0,
            last_error: None,
        }
    }
}

/// Decides `ready` and the stall error from a stream of lag samples.
#[derive(Debug)]
pub struct ReadyTracker {
    threshold: i64,
    needed: u32,
    stall: Duration,
    streak: u32,
    last_lag: Option<i64>,
    growing_since: Option<Instant>,
    errored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackerState {
    pub ready: bool,
    pub errored: bool,
}

impl ReadyTracker {
    pub fn new(threshold: i64, needed: u32, stall: Duration) -> Self {
        Self {
            threshold,
            needed,
            stall,
            streak: 0,
            last_lag: None,
            growing_since: None,
            errored: false,
        }
    }

    /// Feed one lag sample. The error state is sticky until [`reset`].
    ///
    /// [`reset`]: ReadyTracker::reset
    pub fn observe(&mut self, lag: i64, now: Instant) -> TrackerState {
        if !self.errored {
            if lag <= self.threshold {
                self.streak += 1;
                self.growing_since = None;
            } else {
                self.streak = 0;
                if self.last_lag.is_some_and(|prev| lag > prev) {
                    let since = *self.growing_since.get_or_insert(now);
                    if now.duration_since(since) >= self.stall {
                        self.errored = true;
                    }
                } else {
                    self.growing_since = None;
                }
            }
        }
        self.last_lag = Some(lag);
        TrackerState {
            ready: !self.errored && self.streak >= self.needed,
            errored: self.errored,
        }
    }

    pub fn reset(&mut self) {
        self.streak = 0;
        self.last_lag = None;
        self.growing_since = None;
        self.errored = false;
    }
}

struct Shared {
    paused: AtomicBool,
    clear_error: AtomicBool,
    report: parking_lot::RwLock<SyncReport>,
    plan: parking_lot::RwLock<Option<Vec<TablePlan>>>,
    // apply_batch advances the shared cursor; only one caller at a time.
    apply_lock: tokio::sync::Mutex<()>,
}

/// The sync engine. Clones share state; `run` is only called once, on the
/// leader replica.
#[derive(Clone)]
pub struct SyncEngine {
    old: PgPool,
    next: PgPool,
    shared: Arc<Shared>,
}

impl SyncEngine {
    pub fn new(old: PgPool, next: PgPool) -> Self {
        Self {
            old,
            next,
            shared: Arc::new(Shared {
                paused: AtomicBool::new(false),
                clear_error: AtomicBool::new(false),
                report: parking_lot::RwLock::new(SyncReport::default()),
                plan: parking_lot::RwLock::new(None),
                apply_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
        self.update_report(|report| report.paused = true);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.update_report(|report| report.paused = false);
    }

    /// Clear a stall error and start sampling `ready` from scratch.
    pub fn recheck(&self) {
        self.shared.clear_error.store(true, Ordering::SeqCst);
    }

    pub fn report(&self) -> SyncReport {
        self.shared.report.read().clone()
    }

    fn update_report(&self, f: impl FnOnce(&mut SyncReport)) {
        let mut report = self.shared.report.write();
        f(&mut report);
    }

    /// Drive attach, bulk copy, and the tail until shutdown. Fatal errors
    /// propagate; the report always reflects the last known state.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> SwitchoverResult<()> {
        let result = self.run_inner(shutdown).await;
        if let Err(err) = &result {
            self.update_report(|report| {
                report.phase = SyncPhase::Error;
                report.ready = false;
                report.last_error = Some(err.to_string());
            });
        }
        result
    }

    async fn run_inner(&self, shutdown: watch::Receiver<bool>) -> SwitchoverResult<()> {
        self.update_report(|report| *report = SyncReport::default());

        let plan = schema::discover_plan(&self.old).await?;
        schema::attach(&self.old, &plan).await?;

        // The log position at copy start is where the tail resumes from:
        // everything before it is covered by the copy itself.
        let (hwm,): (i64,) = sqlx::query_as("SELECT COALESCE(max(id), 0) FROM change_log")
            .fetch_one(&self.old)
            .await?;
        apply::ensure_cursor(&self.next, hwm).await?;

        let plan_map: HashMap<String, TablePlan> = plan
            .iter()
            .map(|table| (table.name.clone(), table.clone()))
            .collect();
        self.update_report(|report| {
            report.phase = SyncPhase::BulkCopy;
            report.tables_total = plan.len();
        });
        *self.shared.plan.write() = Some(plan.clone());

        let mut tuner = BatchTuner::new();
        for table in &plan {
            let mut copier = TableCopier::new(table.clone());
            while !copier.is_done() {
                if *shutdown.borrow() {
                    return Ok(());
                }
                if self.shared.paused.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                let batch = copier.step(&self.old, &self.next, &mut tuner).await?;
                self.update_report(|report| report.rows_copied += batch);

                // Tail priority: drain captured changes between batches and
                // throttle the copy if applying is the slow side.
                let apply_spent = self.drain_changes(&plan_map).await?;
                if apply_spent > Duration::from_millis(100) {
                    tokio::time::sleep(apply_spent).await;
                }
            }
            self.update_report(|report| report.tables_done += 1);
        }

        self.update_report(|report| report.phase = SyncPhase::Tail);
        self.tail(&plan_map, shutdown).await
    }

    async fn tail(
        &self,
        plan_map: &HashMap<String, TablePlan>,
        shutdown: watch::Receiver<bool>,
    ) -> SwitchoverResult<()> {
        let mut tracker = ReadyTracker::new(LAG_THRESHOLD, READY_SAMPLES, LAG_STALL);
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if *shutdown.borrow() {
                return Ok(());
            }
            self.drain_changes(plan_map).await?;

            let lag = apply::lag(&self.old, &self.next).await?;
            metrics::gauge!("beacon_sync_lag").set(lag as f64);

            if self.shared.clear_error.swap(false, Ordering::SeqCst) {
                tracker.reset();
            }
            let state = tracker.observe(lag, Instant::now());
            self.update_report(|report| {
                report.lag = lag;
                report.ready = state.ready;
                report.phase = if state.errored {
                    SyncPhase::Error
                } else if state.ready {
                    SyncPhase::CaughtUp
                } else {
                    SyncPhase::Tail
                };
                if state.errored && report.last_error.is_none() {
                    report.last_error =
                        Some(format!("lag {lag} kept growing for {}s", LAG_STALL.as_secs()));
                }
            });
        }
    }

    /// Apply change batches until the log is momentarily drained. Returns
    /// the time spent, which the copy path uses as its throttle signal.
    async fn drain_changes(
        &self,
        plan_map: &HashMap<String, TablePlan>,
    ) -> SwitchoverResult<Duration> {
        let started = Instant::now();
        loop {
            let _guard = self.shared.apply_lock.lock().await;
            let applied =
                apply::apply_batch(&self.old, &self.next, plan_map, apply::APPLY_BATCH_LIMIT)
                    .await?;
            if (applied as i64) < apply::APPLY_BATCH_LIMIT {
                return Ok(started.elapsed());
            }
        }
    }

    /// Apply everything left in the log, down to lag zero. Only called by
    /// the leader once every node is frozen, so nothing new can appear.
    pub async fn final_drain(&self, timeout: Duration) -> SwitchoverResult<()> {
        let plan = self
            .shared
            .plan
            .read()
            .clone()
            .ok_or_else(|| SwitchoverError::Validation("sync engine never attached".into()))?;
        let plan_map: HashMap<String, TablePlan> = plan
            .into_iter()
            .map(|table| (table.name.clone(), table))
            .collect();

        let deadline = Instant::now() + timeout;
        loop {
            self.drain_changes(&plan_map).await?;
            let lag = apply::lag(&self.old, &self.next).await?;
            if lag == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SwitchoverError::Aborted(format!(
                    "change log did not drain: lag {lag} at deadline"
                )));
            }
        }
    }

    /// Drop the capture triggers, the change log, and the sync cursor.
    pub async fn detach(&self) -> SwitchoverResult<()> {
        let current_plan = self.shared.plan.read().clone();
        let plan = match current_plan {
            Some(plan) => plan,
            // Detach may run in a process that never attached (reset after
            // restart); rediscover so the trigger drops still match.
            None => schema::discover_plan(&self.old).await?,
        };
        schema::detach(&self.old, &plan).await?;
        sqlx::query("DROP TABLE IF EXISTS switchover_sync_cursor")
            .execute(&self.next)
            .await?;
        Ok(())
    }
}
