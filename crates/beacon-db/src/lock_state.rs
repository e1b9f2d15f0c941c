//! Advisory-locked cursor storage for engine cycles.
//!
//! # Single-writer discipline
//! Each engine cycle (metrics, and whatever comes next) keeps its cursor in
//! one JSON blob, one row of `engine_state`, keyed by processing type. The
//! blob is only ever read and written inside a transaction that first takes
//! `pg_advisory_xact_lock` on the type's key, so across every replica at
//! most one cycle instance is working at a time. The lock releases with the
//! transaction, and the commit is the only moment a new cursor becomes
//! visible.
//!
//! The advisory keyspace below is reserved; nothing else in the schema may
//! take locks under it.

use crate::DbResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{PgPool, Postgres, Transaction};

/// Base of the advisory-lock keyspace reserved for engine cycles.
const ENGINE_LOCK_KEYSPACE: i64 = 0x6263_6e00_0000_0000;

/// The set of serialized engine-cycle processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingType {
    Metrics,
}

impl ProcessingType {
    /// Stable row key in `engine_state`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessingType::Metrics => "metrics",
        }
    }

    /// Stable advisory lock key. Never renumber these.
    pub fn advisory_key(&self) -> i64 {
        match self {
            ProcessingType::Metrics => ENGINE_LOCK_KEYSPACE | 1,
        }
    }
}

/// Take the processing lock and load the state blob inside `tx`.
///
/// Blocks until the lock is granted; the lock is released when the
/// transaction ends, either way.
pub async fn lock_and_load<T>(
    typ: ProcessingType,
    tx: &mut Transaction<'_, Postgres>,
) -> DbResult<T>
where
    T: DeserializeOwned + Default,
{
    // Serializes every engine-cycle instance, across all replicas.
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(typ.advisory_key())
        .execute(&mut **tx)
        .await?;

    let row: Option<(serde_json::Value,)> =
        sqlx::query_as("SELECT state FROM engine_state WHERE type_id = $1")
            .bind(typ.as_str())
            .fetch_optional(&mut **tx)
            .await?;

    match row {
        Some((value,)) => serde_json::from_value(value)
            .map_err(|err| anyhow::anyhow!("decode engine state: {err}").into()),
        None => Ok(T::default()),
    }
}

/// Persist the state blob inside the caller's transaction. Visible to other
/// readers only once that transaction commits.
pub async fn save<T>(
    typ: ProcessingType,
    tx: &mut Transaction<'_, Postgres>,
    state: &T,
) -> DbResult<()>
where
    T: Serialize,
{
    let value = serde_json::to_value(state)
        .map_err(|err| anyhow::anyhow!("encode engine state: {err}"))?;
    sqlx::query(
        r#"INSERT INTO engine_state (type_id, state, updated_at)
           VALUES ($1, $2, now())
           ON CONFLICT (type_id) DO UPDATE SET state = EXCLUDED.state, updated_at = now()"#,
    )
    .bind(typ.as_str())
    .bind(value)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Pool-bound convenience handle for one processing type's state blob.
#[derive(Debug, Clone)]
pub struct LockStateStore {
    pool: PgPool,
    typ: ProcessingType,
}

impl LockStateStore {
    pub fn new(pool: PgPool, typ: ProcessingType) -> Self {
        Self { pool, typ }
    }

    pub fn processing_type(&self) -> ProcessingType {
        self.typ
    }

    /// Begin a transaction holding this type's advisory lock, and load the
    /// current state blob (or `T::default()` if none was ever saved).
    pub async fn begin_tx_with_state<T>(&self) -> DbResult<(Transaction<'static, Postgres>, T)>
    where
        T: DeserializeOwned + Default,
    {
        let mut tx = self.pool.begin().await?;
        let state = lock_and_load(self.typ, &mut tx).await?;
        Ok((tx, state))
    }

    /// Persist the state blob inside the caller's transaction.
    pub async fn save_state<T>(
        &self,
        tx: &mut Transaction<'static, Postgres>,
        state: &T,
    ) -> DbResult<()>
    where
        T: Serialize,
    {
        save(self.typ, tx, state).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advisory_keys_are_within_reserved_keyspace() {
        let key = ProcessingType::Metrics.advisory_key();
        assert_eq!(key & ENGINE_LOCK_KEYSPACE, ENGINE_LOCK_KEYSPACE);
        assert_ne!(key, ENGINE_LOCK_KEYSPACE);
    }

    #[test]
    fn row_keys_are_stable() {
        assert_eq!(ProcessingType::Metrics.as_str(), "metrics");
    }
}

#[cfg(all(test, feature = "pg-tests"))]
mod pg_tests {
    use super::*;
    use serde::Deserialize;
    use std::time::Duration;

    #[derive(Debug, Default, Serialize, Deserialize, PartialEq)]
    struct Cursor {
        n: i64,
    }

    async fn test_pool() -> PgPool {
        let url = std::env::var("BEACON_TEST_DB_URL").expect("BEACON_TEST_DB_URL");
        let pool = PgPool::connect(&url).await.expect("connect");
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS engine_state (
                   type_id text PRIMARY KEY,
                   state jsonb NOT NULL,
                   updated_at timestamptz NOT NULL DEFAULT now()
               )"#,
        )
        .execute(&pool)
        .await
        .expect("schema");
        pool
    }

    #[tokio::test]
    async fn state_round_trips_through_commit() {
        let pool = test_pool().await;
        let store = LockStateStore::new(pool.clone(), ProcessingType::Metrics);

        let (mut tx, mut state): (_, Cursor) = store.begin_tx_with_state().await.unwrap();
        state.n += 41;
        store.save_state(&mut tx, &state).await.unwrap();
        tx.commit().await.unwrap();

        let (tx, reread): (_, Cursor) = store.begin_tx_with_state().await.unwrap();
        drop(tx);
        assert_eq!(reread.n, state.n);
    }

    #[tokio::test]
    async fn advisory_lock_serializes_writers() {
        let pool = test_pool().await;
        let store = LockStateStore::new(pool.clone(), ProcessingType::Metrics);

        let (tx, _state): (_, Cursor) = store.begin_tx_with_state().await.unwrap();

        // A second writer must block until the first transaction ends.
        let second = LockStateStore::new(pool.clone(), ProcessingType::Metrics);
        let blocked = tokio::time::timeout(Duration::from_millis(250), async {
            second.begin_tx_with_state::<Cursor>().await
        })
        .await;
        assert!(blocked.is_err(), "second writer acquired the lock early");

        drop(tx);
        let unblocked = tokio::time::timeout(Duration::from_secs(5), async {
            second.begin_tx_with_state::<Cursor>().await
        })
        .await;
        assert!(unblocked.is_ok());
    }
}
