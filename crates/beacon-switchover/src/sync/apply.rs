//! Ordered change-log application onto next.
//!
//! The tail reads `change_log` rows past the cursor in id order and applies
//! them in bounded transactions. Every operation is idempotent (insert-or-
//! ignore, upsert, delete-if-exists), so replaying any suffix of the log
//! after a crash converges to the same state. The cursor advances in the
//! same transaction as the rows it covers and never regresses.

use super::schema::TablePlan;
use crate::{SwitchoverError, SwitchoverResult};
use sqlx::{FromRow, PgPool};
use std::collections::HashMap;

/// Apply transactions cover at most this many change rows.
pub const APPLY_BATCH_LIMIT: i64 = 1000;

const ENSURE_CURSOR: &str = r#"
CREATE TABLE IF NOT EXISTS switchover_sync_cursor (
    singleton bool PRIMARY KEY DEFAULT true CHECK (singleton),
    last_change_id bigint NOT NULL,
    last_applied_at timestamptz NOT NULL DEFAULT now()
)"#;

#[derive(Debug, Clone, FromRow)]
struct ChangeRow {
    id: i64,
    table_name: String,
    op: String,
    row_key: serde_json::Value,
    row_data: Option<serde_json::Value>,
}

/// Create the cursor row on next, seeded with the change-log high-water
/// mark captured when bulk copy started. No-op if a cursor already exists
/// (a restarted sync resumes where it left off).
pub async fn ensure_cursor(next: &PgPool, seed: i64) -> SwitchoverResult<()> {
    sqlx::query(ENSURE_CURSOR).execute(next).await?;
    sqlx::query(
        r#"INSERT INTO switchover_sync_cursor (singleton, last_change_id)
           VALUES (true, $1) ON CONFLICT (singleton) DO NOTHING"#,
    )
    .bind(seed)
    .execute(next)
    .await?;
    Ok(())
}

/// The greatest change-log id already applied on next.
pub async fn cursor(next: &PgPool) -> SwitchoverResult<i64> {
    let (id,): (i64,) =
        sqlx::query_as("SELECT last_change_id FROM switchover_sync_cursor WHERE singleton")
            .fetch_one(next)
            .await?;
    Ok(id)
}

/// Unapplied change volume: `max(change_log.id) − cursor`, never negative.
pub async fn lag(old: &PgPool, next: &PgPool) -> SwitchoverResult<i64> {
    let (max_id,): (i64,) = sqlx::query_as("SELECT COALESCE(max(id), 0) FROM change_log")
        .fetch_one(old)
        .await?;
    let applied = cursor(next).await?;
    Ok((max_id - applied).max(0))
}

/// Apply up to `limit` change rows and advance the cursor, all in one
/// transaction on next. Returns how many rows were applied.
pub async fn apply_batch(
    old: &PgPool,
    next: &PgPool,
    plan: &HashMap<String, TablePlan>,
    limit: i64,
) -> SwitchoverResult<usize> {
    let from = cursor(next).await?;
    let rows: Vec<ChangeRow> = sqlx::query_as(
        r#"SELECT id, table_name, op, row_key, row_data
             FROM change_log WHERE id > $1 ORDER BY id LIMIT $2"#,
    )
    .bind(from)
    .bind(limit)
    .fetch_all(old)
    .await?;
    if rows.is_empty() {
        return Ok(0);
    }

    let last_id = rows.last().map(|row| row.id).expect("non-empty batch");
    let mut tx = next.begin().await?;
    sqlx::query("SET LOCAL session_replication_role = replica")
        .execute(&mut *tx)
        .await?;

    for row in &rows {
        let table = plan.get(&row.table_name).ok_or_else(|| {
            SwitchoverError::Fatal(format!(
                "change_log row {} references untracked table {:?}",
                row.id, row.table_name
            ))
        })?;
        match row.op.as_str() {
            "I" => {
                let data = require_data(row)?;
                sqlx::query(&table.insert_ignore_sql())
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| fatal_apply(row, err))?;
            }
            "U" => {
                let data = require_data(row)?;
                sqlx::query(&table.upsert_one_sql())
                    .bind(data)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| fatal_apply(row, err))?;
            }
            "D" => {
                sqlx::query(&table.delete_sql())
                    .bind(&row.row_key)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| fatal_apply(row, err))?;
            }
            other => {
                return Err(SwitchoverError::Fatal(format!(
                    "change_log row {} carries unknown op {other:?}",
                    row.id
                )));
            }
        }
    }

    sqlx::query(
        r#"UPDATE switchover_sync_cursor
              SET last_change_id = $1, last_applied_at = now()
            WHERE singleton AND last_change_id < $1"#,
    )
    .bind(last_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    metrics::counter!("beacon_sync_changes_applied_total").increment(rows.len() as u64);
    Ok(rows.len())
}

fn require_data(row: &ChangeRow) -> SwitchoverResult<&serde_json::Value> {
    row.row_data.as_ref().ok_or_else(|| {
        SwitchoverError::Fatal(format!(
            "change_log row {} ({}) is missing row data",
            row.id, row.op
        ))
    })
}

/// Only old serves writes during sync, so integrity violations on next can
/// only mean the copy and the log disagree. That is not recoverable here.
fn fatal_apply(row: &ChangeRow, err: sqlx::Error) -> SwitchoverError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().map(|code| code.starts_with("23")).unwrap_or(false) {
            return SwitchoverError::Fatal(format!(
                "apply conflict at change {} on {:?}: {db}",
                row.id, row.table_name
            ));
        }
    }
    SwitchoverError::Sql(err)
}
