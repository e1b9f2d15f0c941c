//! Bounded retry wrapper over `sqlx` connect and acquire paths.
//!
//! # What gets retried
//! Only *transient* failures: broken sockets, pool exhaustion, and the
//! Postgres "try again shortly" error class (admin shutdown, crash recovery,
//! too many connections). Logical errors (syntax, constraint, permission)
//! propagate on the first attempt, always.
//!
//! # What never gets retried
//! Statements inside a caller-visible transaction. Retrying mid-transaction
//! would silently re-execute work the caller already observed; the only
//! statement-level retry surface is [`RetryPool::execute_idempotent`], and
//! its name is the contract.

use crate::{DbError, DbResult};
use rand::Rng;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use std::str::FromStr;
use std::time::Duration;

/// Postgres SQLSTATE codes that indicate a transient backend condition.
///
/// Class 08 (connection exception) is matched by prefix; the rest are exact:
/// 57P01 admin_shutdown, 57P02 crash_shutdown, 57P03 cannot_connect_now,
/// 53300 too_many_connections, 40001/40P01 serialization & deadlock (safe to
/// retry only for the idempotent path).
const TRANSIENT_CODES: [&str; 6] = ["57P01", "57P02", "57P03", "53300", "40001", "40P01"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Transient,
    Logical,
}

/// Classify an `sqlx` error for retry purposes.
pub fn classify(err: &sqlx::Error) -> ErrorClass {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::Tls(_) => ErrorClass::Transient,
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::WorkerCrashed => {
            ErrorClass::Transient
        }
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if code.starts_with("08") => ErrorClass::Transient,
            Some(code) if TRANSIENT_CODES.contains(&code.as_ref()) => ErrorClass::Transient,
            _ => ErrorClass::Logical,
        },
        _ => ErrorClass::Logical,
    }
}

/// Retry schedule: exponential backoff from `base_delay`, capped at
/// `max_delay`, with up to 50% random jitter added to each sleep.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff for a zero-based attempt number, before jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16));
        exp.min(self.max_delay)
    }

    /// Backoff with jitter applied. Jitter spreads reconnect storms when
    /// every replica loses the same backend at the same moment.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis().max(1) as u64 / 2);
        base + Duration::from_millis(jitter)
    }
}

/// Open a pool with bounded, retried connection establishment.
///
/// Pool sizing and acquire timeouts are explicit because hanging forever on
/// an unhealthy backend is unacceptable for an alerting service.
pub async fn connect_pool(url: &str, max_open: u32, max_idle: u32) -> DbResult<PgPool> {
    let options = PgConnectOptions::from_str(url)
        .map_err(|err| DbError::Validation(format!("parse db url: {err}")))?;
    let policy = RetryPolicy::default();

    let mut attempt = 0;
    loop {
        let result = PgPoolOptions::new()
            .max_connections(max_open)
            .min_connections(max_idle.min(max_open))
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options.clone())
            .await;
        match result {
            Ok(pool) => return Ok(pool),
            Err(err) if classify(&err) == ErrorClass::Transient => {
                attempt += 1;
                if attempt >= policy.max_attempts {
                    return Err(DbError::Unavailable(format!(
                        "connect failed after {attempt} attempts: {err}"
                    )));
                }
                metrics::counter!("beacon_db_connect_retries_total").increment(1);
                tracing::debug!(attempt, error = %err, "transient connect failure, retrying");
                tokio::time::sleep(policy.delay(attempt)).await;
            }
            Err(err) => return Err(DbError::Sql(err)),
        }
    }
}

/// A `PgPool` whose acquire path retries transient failures.
#[derive(Debug, Clone)]
pub struct RetryPool {
    pool: PgPool,
    policy: RetryPolicy,
}

impl RetryPool {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    /// Lease a connection, retrying transient acquire failures.
    pub async fn acquire(&self) -> DbResult<PoolConnection<Postgres>> {
        let mut attempt = 0;
        loop {
            match self.pool.acquire().await {
                Ok(conn) => return Ok(conn),
                Err(err) if classify(&err) == ErrorClass::Transient => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(DbError::Unavailable(format!(
                            "acquire failed after {attempt} attempts: {err}"
                        )));
                    }
                    metrics::counter!("beacon_db_acquire_retries_total").increment(1);
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
                Err(err) => return Err(DbError::Sql(err)),
            }
        }
    }

    /// Execute a standalone statement, retrying transient failures.
    ///
    /// The statement must be idempotent: it may run more than once if the
    /// backend drops the connection after executing but before replying.
    pub async fn execute_idempotent(&self, sql: &str) -> DbResult<u64> {
        let mut attempt = 0;
        loop {
            match sqlx::query(sql).execute(&self.pool).await {
                Ok(done) => return Ok(done.rows_affected()),
                Err(err) if classify(&err) == ErrorClass::Transient => {
                    attempt += 1;
                    if attempt >= self.policy.max_attempts {
                        return Err(DbError::Unavailable(format!(
                            "statement failed after {attempt} attempts: {err}"
                        )));
                    }
                    tokio::time::sleep(self.policy.delay(attempt)).await;
                }
                Err(err) => return Err(DbError::Sql(err)),
            }
        }
    }

    /// Liveness probe.
    pub async fn ping(&self) -> DbResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
