//! Alert metrics cycle.
//!
//! # Theory of operation (per-alert pass)
//! 1. Begin a transaction and take the metrics processing lock.
//! 2. Read the server-side upper time bound (`bound_now`). Client clocks are
//!    never consulted.
//! 3. Scan `alert_logs` for a bounded batch of closed alerts strictly after
//!    the `(last_log_time, last_log_id)` cursor and at or before the bound.
//!    The log id breaks ties between rows sharing a timestamp; without it a
//!    batch boundary inside a tie would skip or replay rows.
//! 4. Non-empty batch: insert derived rows into `alert_metrics`, advance the
//!    cursor to the batch tail.
//! 5. Empty batch: snap the cursor to `(bound_now, 0)`.
//! 6. Save state, commit. Any error rolls the whole pass back, cursor
//!    included, so a retry is always safe.
//!
//! The daily pass runs the same lock pattern in a second transaction: it
//! aggregates one fully-processed day at a time, strictly between
//! `last_metrics_date` and the day of `last_log_time`.

use crate::{EngineCycle, EngineResult};
use anyhow::Context;
use async_trait::async_trait;
use beacon_db::lock_state::{self, ProcessingType};
use beacon_db::DbHandle;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Connection;

/// How many closed alerts one pass will process.
const BATCH_LIMIT: i64 = 500;

const SCAN_LOGS: &str = r#"
SELECT alert_id, timestamp, id
  FROM alert_logs
 WHERE event = 'closed'
   AND (timestamp, id) > ($1, $2)
   AND timestamp <= $3
 ORDER BY timestamp, id
 LIMIT $4
"#;

// now() minus a small buffer: commits racing this pass may still land with
// timestamps at the current instant, and they must fall after the cursor.
const BOUND_NOW: &str = "SELECT now() - '1 second'::interval";

const INSERT_METRICS: &str = r#"
INSERT INTO alert_metrics (alert_id, service_id, time_to_ack, time_to_close, escalated, closed_at)
SELECT a.id,
       a.service_id,
       (SELECT min(l.timestamp) FROM alert_logs l
         WHERE l.alert_id = a.id AND l.event = 'acknowledged') - a.created_at,
       (SELECT max(l.timestamp) FROM alert_logs l
         WHERE l.alert_id = a.id AND l.event = 'closed') - a.created_at,
       EXISTS(SELECT 1 FROM alert_logs l
         WHERE l.alert_id = a.id AND l.event = 'escalated'),
       (SELECT max(l.timestamp) FROM alert_logs l
         WHERE l.alert_id = a.id AND l.event = 'closed')
  FROM alerts a
 WHERE a.id = ANY($1)
    ON CONFLICT (alert_id) DO NOTHING
"#;

const NEXT_DAILY_DATE: &str = r#"
SELECT min(closed_at::date)
  FROM alert_metrics
 WHERE closed_at::date > COALESCE($1, DATE '0001-01-01')
   AND closed_at::date < $2
"#;

const INSERT_DAILY: &str = r#"
INSERT INTO daily_alert_metrics (date, alert_count, escalated_count, avg_time_to_ack, avg_time_to_close)
SELECT $1::date,
       count(*),
       count(*) FILTER (WHERE escalated),
       avg(time_to_ack),
       avg(time_to_close)
  FROM alert_metrics
 WHERE closed_at::date = $1::date
    ON CONFLICT (date) DO UPDATE
   SET alert_count = EXCLUDED.alert_count,
       escalated_count = EXCLUDED.escalated_count,
       avg_time_to_ack = EXCLUDED.avg_time_to_ack,
       avg_time_to_close = EXCLUDED.avg_time_to_close
"#;

/// Persistent cursor blob for the metrics cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsState {
    pub last_log_time: DateTime<Utc>,
    pub last_log_id: i64,
    pub last_metrics_date: Option<NaiveDate>,
}

impl Default for MetricsState {
    fn default() -> Self {
        Self {
            last_log_time: Utc.timestamp_opt(0, 0).single().expect("epoch"),
            last_log_id: 0,
            last_metrics_date: None,
        }
    }
}

/// Advance the cursor after a pass.
///
/// Invariant: within one `last_log_time`, `last_log_id` strictly increases;
/// the time component only moves on an empty batch, and then snaps to the
/// upper bound with the tie-breaker cleared.
fn advance_cursor(
    state: &mut MetricsState,
    batch_tail: Option<(DateTime<Utc>, i64)>,
    bound_now: DateTime<Utc>,
) {
    match batch_tail {
        Some((time, id)) => {
            state.last_log_time = time;
            state.last_log_id = id;
        }
        None => {
            state.last_log_time = bound_now;
            state.last_log_id = 0;
        }
    }
}

/// The metrics engine cycle.
pub struct MetricsCycle {
    db: DbHandle,
}

impl MetricsCycle {
    pub fn new(db: DbHandle) -> Self {
        Self { db }
    }

    /// Process one batch of closed alerts into `alert_metrics`.
    pub async fn update_alert_metrics(&self) -> EngineResult<()> {
        tracing::debug!("running alert_metrics pass");

        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await.context("begin tx")?;
        let mut state: MetricsState =
            lock_state::lock_and_load(ProcessingType::Metrics, &mut tx).await?;

        let bound_now: DateTime<Utc> = sqlx::query_scalar(BOUND_NOW)
            .fetch_one(&mut *tx)
            .await
            .context("select bound now")?;

        let rows: Vec<(i64, DateTime<Utc>, i64)> = sqlx::query_as(SCAN_LOGS)
            .bind(state.last_log_time)
            .bind(state.last_log_id)
            .bind(bound_now)
            .bind(BATCH_LIMIT)
            .fetch_all(&mut *tx)
            .await
            .context("scan logs")?;

        let batch_tail = rows.last().map(|&(_, time, id)| (time, id));
        if !rows.is_empty() {
            let alert_ids: Vec<i64> = rows.iter().map(|&(alert_id, _, _)| alert_id).collect();
            sqlx::query(INSERT_METRICS)
                .bind(&alert_ids)
                .execute(&mut *tx)
                .await
                .context("insert metrics")?;
            metrics::counter!("beacon_alert_metrics_rows_total").increment(alert_ids.len() as u64);
        }
        advance_cursor(&mut state, batch_tail, bound_now);

        lock_state::save(ProcessingType::Metrics, &mut tx, &state).await?;
        tx.commit().await.context("commit")?;
        Ok(())
    }

    /// Aggregate the next fully-processed day into `daily_alert_metrics`.
    pub async fn update_daily_metrics(&self) -> EngineResult<()> {
        tracing::debug!("running daily_alert_metrics pass");

        let mut conn = self.db.acquire().await?;
        let mut tx = conn.begin().await.context("begin tx")?;
        let mut state: MetricsState =
            lock_state::lock_and_load(ProcessingType::Metrics, &mut tx).await?;

        // Only days strictly before the per-alert cursor's day are complete.
        let next_date: Option<NaiveDate> = sqlx::query_scalar(NEXT_DAILY_DATE)
            .bind(state.last_metrics_date)
            .bind(state.last_log_time.date_naive())
            .fetch_one(&mut *tx)
            .await
            .context("select next daily metrics date")?;

        if let Some(date) = next_date {
            sqlx::query(INSERT_DAILY)
                .bind(date)
                .execute(&mut *tx)
                .await
                .context("insert daily metrics")?;

            state.last_metrics_date = Some(date);
            lock_state::save(ProcessingType::Metrics, &mut tx, &state).await?;
        }

        tx.commit().await.context("commit")?;
        Ok(())
    }
}

#[async_trait]
impl EngineCycle for MetricsCycle {
    fn name(&self) -> &'static str {
        "metrics"
    }

    async fn update_all(&self) -> EngineResult<()> {
        self.update_alert_metrics().await?;
        self.update_daily_metrics().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn epoch() -> DateTime<Utc> {
        Utc.timestamp_opt(0, 0).single().unwrap()
    }

    #[test]
    fn default_state_starts_at_epoch() {
        let state = MetricsState::default();
        assert_eq!(state.last_log_time, epoch());
        assert_eq!(state.last_log_id, 0);
        assert!(state.last_metrics_date.is_none());
    }

    #[test]
    fn nonempty_batch_advances_to_tail() {
        let mut state = MetricsState::default();
        let t1 = epoch() + Duration::seconds(100);
        let bound = epoch() + Duration::seconds(500);
        advance_cursor(&mut state, Some((t1, 7)), bound);
        assert_eq!(state.last_log_time, t1);
        assert_eq!(state.last_log_id, 7);
    }

    #[test]
    fn tied_timestamps_advance_by_id_only() {
        let mut state = MetricsState::default();
        let t1 = epoch() + Duration::seconds(100);
        let bound = epoch() + Duration::seconds(500);
        advance_cursor(&mut state, Some((t1, 3)), bound);
        advance_cursor(&mut state, Some((t1, 9)), bound);
        // time is pinned while ids drain the tie
        assert_eq!(state.last_log_time, t1);
        assert_eq!(state.last_log_id, 9);
    }

    #[test]
    fn empty_batch_snaps_to_bound_and_clears_tiebreak() {
        let mut state = MetricsState {
            last_log_time: epoch() + Duration::seconds(100),
            last_log_id: 42,
            last_metrics_date: None,
        };
        let bound = epoch() + Duration::seconds(500);
        advance_cursor(&mut state, None, bound);
        assert_eq!(state.last_log_time, bound);
        assert_eq!(state.last_log_id, 0);
    }

    #[test]
    fn cursor_never_regresses_under_ordered_batches() {
        // Model a sequence of scan results the SQL ordering guarantees:
        // (time, id) strictly increasing past the cursor.
        let mut state = MetricsState::default();
        let bound = epoch() + Duration::seconds(1_000);
        let batches = [
            Some((epoch() + Duration::seconds(10), 1)),
            Some((epoch() + Duration::seconds(10), 5)),
            Some((epoch() + Duration::seconds(20), 2)),
            None,
        ];
        let mut prev = (state.last_log_time, state.last_log_id);
        for tail in batches {
            advance_cursor(&mut state, tail, bound);
            let now = (state.last_log_time, state.last_log_id);
            assert!(now >= prev, "cursor regressed: {prev:?} -> {now:?}");
            prev = now;
        }
        assert_eq!(prev, (bound, 0));
    }

    #[test]
    fn state_blob_round_trips_as_json() {
        let state = MetricsState {
            last_log_time: epoch() + Duration::seconds(123),
            last_log_id: 9,
            last_metrics_date: NaiveDate::from_ymd_opt(2025, 11, 3),
        };
        let value = serde_json::to_value(&state).unwrap();
        let back: MetricsState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests {
    use super::*;
    use beacon_db::retry::RetryPool;
    use sqlx::PgPool;

    async fn seeded_pool() -> PgPool {
        let url = std::env::var("BEACON_TEST_DB_URL").expect("BEACON_TEST_DB_URL");
        let pool = PgPool::connect(&url).await.expect("connect");
        for stmt in [
            "DROP TABLE IF EXISTS daily_alert_metrics, alert_metrics, alert_logs, alerts, engine_state",
            r#"CREATE TABLE engine_state (
                   type_id text PRIMARY KEY,
                   state jsonb NOT NULL,
                   updated_at timestamptz NOT NULL DEFAULT now())"#,
            r#"CREATE TABLE alerts (
                   id bigserial PRIMARY KEY,
                   service_id uuid NOT NULL DEFAULT gen_random_uuid(),
                   created_at timestamptz NOT NULL DEFAULT now())"#,
            r#"CREATE TABLE alert_logs (
                   id bigserial PRIMARY KEY,
                   alert_id bigint NOT NULL REFERENCES alerts (id),
                   event text NOT NULL,
                   timestamp timestamptz NOT NULL DEFAULT now())"#,
            r#"CREATE TABLE alert_metrics (
                   alert_id bigint PRIMARY KEY,
                   service_id uuid NOT NULL,
                   time_to_ack interval,
                   time_to_close interval,
                   escalated boolean NOT NULL DEFAULT false,
                   closed_at timestamptz NOT NULL)"#,
            r#"CREATE TABLE daily_alert_metrics (
                   date date PRIMARY KEY,
                   alert_count bigint NOT NULL,
                   escalated_count bigint NOT NULL,
                   avg_time_to_ack interval,
                   avg_time_to_close interval)"#,
        ] {
            sqlx::query(stmt).execute(&pool).await.expect("schema");
        }
        pool
    }

    async fn close_alert(pool: &PgPool) -> i64 {
        let (alert_id,): (i64,) = sqlx::query_as(
            "INSERT INTO alerts (created_at) VALUES (now() - interval '1 hour') RETURNING id",
        )
        .fetch_one(pool)
        .await
        .unwrap();
        for (event, offset) in [("acknowledged", "50 minutes"), ("closed", "30 minutes")] {
            sqlx::query(
                "INSERT INTO alert_logs (alert_id, event, timestamp)
                 VALUES ($1, $2, now() - $3::interval)",
            )
            .bind(alert_id)
            .bind(event)
            .bind(offset)
            .execute(pool)
            .await
            .unwrap();
        }
        alert_id
    }

    #[tokio::test]
    async fn closed_alert_produces_one_metrics_row() {
        let pool = seeded_pool().await;
        let alert_id = close_alert(&pool).await;

        let cycle = MetricsCycle::new(DbHandle::Plain(RetryPool::new(pool.clone())));
        cycle.update_all().await.expect("cycle");

        let (count,): (i64,) =
            sqlx::query_as("SELECT count(*) FROM alert_metrics WHERE alert_id = $1")
                .bind(alert_id)
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(count, 1);

        // replaying the cycle must not duplicate the row
        cycle.update_all().await.expect("cycle replay");
        let (count,): (i64,) = sqlx::query_as("SELECT count(*) FROM alert_metrics")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn empty_batch_persists_snapped_cursor() {
        let pool = seeded_pool().await;
        let cycle = MetricsCycle::new(DbHandle::Plain(RetryPool::new(pool.clone())));
        cycle.update_alert_metrics().await.expect("cycle");

        let (value,): (serde_json::Value,) =
            sqlx::query_as("SELECT state FROM engine_state WHERE type_id = 'metrics'")
                .fetch_one(&pool)
                .await
                .unwrap();
        let state: MetricsState = serde_json::from_value(value).unwrap();
        assert!(state.last_log_time > MetricsState::default().last_log_time);
        assert_eq!(state.last_log_id, 0);
    }
}
