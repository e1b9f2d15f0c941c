//! Bulk table copy, old → next.
//!
//! Rows stream in primary-key order as jsonb and land on next as batched
//! upserts, so re-running a partially-copied table is harmless. Batch size
//! chases a fixed latency target instead of a fixed row count: a wide table
//! gets small batches, a narrow one large, and the copy never holds a
//! transaction long enough to matter.

use super::schema::TablePlan;
use crate::{SwitchoverError, SwitchoverResult, COPY_BATCH_TIMEOUT};
use sqlx::PgPool;
use std::time::Duration;

const MIN_BATCH: i64 = 64;
const MAX_BATCH: i64 = 10_000;
const START_BATCH: i64 = 256;
/// Per-batch latency target.
const TARGET: Duration = Duration::from_millis(250);

/// Latency-driven batch sizing.
#[derive(Debug)]
pub struct BatchTuner {
    size: i64,
}

impl BatchTuner {
    pub fn new() -> Self {
        Self { size: START_BATCH }
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    /// Feed back one batch's observed latency.
    pub fn observe(&mut self, elapsed: Duration) {
        if elapsed > TARGET + TARGET / 4 {
            self.size = (self.size / 2).max(MIN_BATCH);
        } else if elapsed < TARGET / 2 {
            self.size = (self.size * 2).min(MAX_BATCH);
        }
    }
}

impl Default for BatchTuner {
    fn default() -> Self {
        Self::new()
    }
}

/// Incremental copier for one table. The engine drives it one batch at a
/// time so change-log application can interleave between batches.
pub struct TableCopier {
    table: TablePlan,
    page_sql: String,
    upsert_sql: String,
    cursor: Option<serde_json::Value>,
    done: bool,
    rows_copied: u64,
}

impl TableCopier {
    pub fn new(table: TablePlan) -> Self {
        let page_sql = table.copy_page_sql();
        let upsert_sql = table.upsert_batch_sql();
        Self {
            table,
            page_sql,
            upsert_sql,
            cursor: None,
            done: false,
            rows_copied: 0,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn rows_copied(&self) -> u64 {
        self.rows_copied
    }

    /// Copy one batch. Returns the number of rows moved; marks the copier
    /// done when the source is exhausted.
    pub async fn step(
        &mut self,
        old: &PgPool,
        next: &PgPool,
        tuner: &mut BatchTuner,
    ) -> SwitchoverResult<u64> {
        if self.done {
            return Ok(0);
        }
        let limit = tuner.size();
        let started = tokio::time::Instant::now();

        let batch = tokio::time::timeout(COPY_BATCH_TIMEOUT, async {
            let rows: Vec<(serde_json::Value,)> = sqlx::query_as(&self.page_sql)
                .bind(&self.cursor)
                .bind(limit)
                .fetch_all(old)
                .await?;
            if rows.is_empty() {
                return Ok::<_, SwitchoverError>(0u64);
            }

            let count = rows.len() as u64;
            let last = rows.last().map(|(row,)| row.clone());
            let docs =
                serde_json::Value::Array(rows.into_iter().map(|(row,)| row).collect());

            let mut tx = next.begin().await?;
            // Constraint triggers (FKs) must not fire while tables land in
            // arbitrary order; replica mode also keeps any triggers on next
            // from double-logging.
            sqlx::query("SET LOCAL session_replication_role = replica")
                .execute(&mut *tx)
                .await?;
            sqlx::query(&self.upsert_sql)
                .bind(docs)
                .execute(&mut *tx)
                .await
                .map_err(fatal_on_integrity)?;
            tx.commit().await?;

            self.cursor = last;
            Ok(count)
        })
        .await
        .map_err(|_| {
            SwitchoverError::Db(beacon_db::DbError::Unavailable(format!(
                "copy batch for {:?} exceeded {}s",
                self.table.name,
                COPY_BATCH_TIMEOUT.as_secs()
            )))
        })??;

        tuner.observe(started.elapsed());
        self.rows_copied += batch;
        metrics::counter!("beacon_sync_rows_copied_total").increment(batch);
        if (batch as i64) < limit {
            self.done = true;
            tracing::info!(
                table = %self.table.name,
                rows = self.rows_copied,
                "bulk copy finished"
            );
        }
        Ok(batch)
    }
}

/// During sync only old accepts writes, so any integrity error on next is a
/// corrupted-copy signal, not a race to resolve.
fn fatal_on_integrity(err: sqlx::Error) -> SwitchoverError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().map(|code| code.starts_with("23")).unwrap_or(false) {
            return SwitchoverError::Fatal(format!("apply conflict on next: {db}"));
        }
    }
    SwitchoverError::Sql(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuner_shrinks_on_slow_batches() {
        let mut tuner = BatchTuner::new();
        tuner.observe(Duration::from_millis(900));
        assert_eq!(tuner.size(), START_BATCH / 2);
    }

    #[test]
    fn tuner_grows_on_fast_batches() {
        let mut tuner = BatchTuner::new();
        tuner.observe(Duration::from_millis(10));
        assert_eq!(tuner.size(), START_BATCH * 2);
    }

    #[test]
    fn tuner_holds_steady_near_target() {
        let mut tuner = BatchTuner::new();
        tuner.observe(Duration::from_millis(240));
        assert_eq!(tuner.size(), START_BATCH);
    }

    #[test]
    fn tuner_respects_bounds() {
        let mut tuner = BatchTuner::new();
        for _ in 0..32 {
            tuner.observe(Duration::from_secs(5));
        }
        assert_eq!(tuner.size(), MIN_BATCH);
        for _ in 0..32 {
            tuner.observe(Duration::from_millis(1));
        }
        assert_eq!(tuner.size(), MAX_BATCH);
    }
}
