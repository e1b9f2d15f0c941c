//! Background engine cycles.
//!
//! # Purpose
//! An engine cycle is a cursor-driven batch worker: it wakes up, takes its
//! processing lock, works through a bounded batch, advances a persistent
//! cursor, commits, and goes back to sleep. Cycles are deliberately dumb
//! about scheduling: the [`Engine`] runner here owns the tick interval,
//! out-of-band triggering, and the pause gate the switchover handler closes
//! while the database is frozen.
//!
//! A cycle failure is logged and retried on the next tick; it never takes
//! the runner down. A cycle interrupted mid-transaction (connection fenced
//! at flip, backend restart) simply resumes from its saved cursor.

pub mod metrics;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Db(#[from] beacon_db::DbError),
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

/// One schedulable unit of background work.
#[async_trait]
pub trait EngineCycle: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run every pass this cycle owns, each in its own transaction.
    async fn update_all(&self) -> EngineResult<()>;
}

/// Handle for poking the running engine from outside.
#[derive(Clone)]
pub struct EngineHandle {
    trigger_tx: mpsc::Sender<()>,
    pause_tx: Arc<watch::Sender<bool>>,
}

impl EngineHandle {
    /// Request an immediate pass, ahead of the next tick. Coalesces if one
    /// is already queued.
    pub fn trigger(&self) {
        let _ = self.trigger_tx.try_send(());
    }

    /// Stop starting new passes. In-flight work finishes on its own.
    pub fn pause(&self) {
        let _ = self.pause_tx.send(true);
    }

    pub fn resume(&self) {
        let _ = self.pause_tx.send(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.pause_tx.borrow()
    }
}

/// Ticks registered cycles until shutdown.
pub struct Engine {
    cycles: Vec<Arc<dyn EngineCycle>>,
    interval: Duration,
    log_cycles: bool,
    trigger_rx: mpsc::Receiver<()>,
    pause_rx: watch::Receiver<bool>,
    handle: EngineHandle,
}

impl Engine {
    pub fn new(interval: Duration, log_cycles: bool) -> Self {
        let (trigger_tx, trigger_rx) = mpsc::channel(1);
        let (pause_tx, pause_rx) = watch::channel(false);
        let handle = EngineHandle {
            trigger_tx,
            pause_tx: Arc::new(pause_tx),
        };
        Self {
            cycles: Vec::new(),
            interval,
            log_cycles,
            trigger_rx,
            pause_rx,
            handle,
        }
    }

    pub fn register(&mut self, cycle: Arc<dyn EngineCycle>) {
        self.cycles.push(cycle);
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Run until `shutdown` flips to true. Consumes the engine.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                Some(()) = self.trigger_rx.recv() => {}
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        tracing::debug!("engine stopping");
                        return;
                    }
                    continue;
                }
            }

            if *self.pause_rx.borrow() {
                continue;
            }

            for cycle in &self.cycles {
                let started = std::time::Instant::now();
                if self.log_cycles {
                    tracing::info!(cycle = cycle.name(), "engine cycle start");
                }
                match cycle.update_all().await {
                    Ok(()) => {
                        ::metrics::counter!("beacon_engine_cycles_total", "cycle" => cycle.name())
                            .increment(1);
                        if self.log_cycles {
                            tracing::info!(
                                cycle = cycle.name(),
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "engine cycle done"
                            );
                        }
                    }
                    Err(err) => {
                        ::metrics::counter!("beacon_engine_cycle_errors_total", "cycle" => cycle.name())
                            .increment(1);
                        tracing::error!(cycle = cycle.name(), error = %err, "engine cycle failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCycle {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl EngineCycle for CountingCycle {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn update_all(&self) -> EngineResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn trigger_runs_a_pass_before_the_tick() {
        let mut engine = Engine::new(Duration::from_secs(3600), false);
        let cycle = Arc::new(CountingCycle {
            runs: AtomicUsize::new(0),
        });
        engine.register(cycle.clone());
        let handle = engine.handle();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));

        // first interval tick fires immediately; wait it out
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_first = cycle.runs.load(Ordering::SeqCst);
        handle.trigger();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cycle.runs.load(Ordering::SeqCst) > after_first);

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn paused_engine_skips_passes() {
        let mut engine = Engine::new(Duration::from_millis(10), false);
        let cycle = Arc::new(CountingCycle {
            runs: AtomicUsize::new(0),
        });
        engine.register(cycle.clone());
        let handle = engine.handle();
        handle.pause();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(cycle.runs.load(Ordering::SeqCst), 0);

        handle.resume();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(cycle.runs.load(Ordering::SeqCst) > 0);

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn failing_cycle_does_not_stop_the_runner() {
        struct FailingCycle;

        #[async_trait]
        impl EngineCycle for FailingCycle {
            fn name(&self) -> &'static str {
                "failing"
            }

            async fn update_all(&self) -> EngineResult<()> {
                Err(EngineError::Unexpected(anyhow::anyhow!("boom")))
            }
        }

        let mut engine = Engine::new(Duration::from_millis(10), false);
        engine.register(Arc::new(FailingCycle));
        let counting = Arc::new(CountingCycle {
            runs: AtomicUsize::new(0),
        });
        engine.register(counting.clone());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(engine.run(shutdown_rx));
        tokio::time::sleep(Duration::from_millis(80)).await;
        // the cycle after the failing one still runs
        assert!(counting.runs.load(Ordering::SeqCst) > 1);

        let _ = shutdown_tx.send(true);
        task.await.unwrap();
    }
}
