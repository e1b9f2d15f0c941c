//! Cluster phase row and node membership, persisted on the old database.
//!
//! # Phase CAS
//! `switchover_state` holds exactly one row: the current phase and a version
//! counter. Every transition is a compare-and-swap against both columns; the
//! version increments on success. The version is the single source of truth
//! for ordering; routing decisions and bus messages are fenced by it.
//!
//! # Membership
//! Each replica upserts its `switchover_nodes` row every heartbeat interval.
//! Liveness is heartbeat age; the leader is simply the lowest live node id,
//! re-derived on every tick, so leader failover needs no extra protocol.

use crate::{NodeStatus, Phase, SwitchoverError, SwitchoverResult, NODE_TTL};
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// This replica's identity on the coordination channel.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub id: Uuid,
    pub region: String,
    pub name: String,
}

impl NodeIdentity {
    /// Identity for this process. The display name folds in region, host,
    /// and PID so operators can tell replicas apart in `status` output.
    pub fn for_process(region: &str) -> Self {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        let pid = std::process::id();
        Self {
            id: Uuid::new_v4(),
            region: region.to_string(),
            name: format!("{region}/{host}:{pid:04x}"),
        }
    }
}

/// One row of `switchover_nodes`.
#[derive(Debug, Clone, FromRow)]
pub struct NodeRow {
    pub node_id: Uuid,
    pub region: String,
    pub name: String,
    pub last_heartbeat: DateTime<Utc>,
    pub local_status: String,
}

impl NodeRow {
    pub fn status(&self) -> NodeStatus {
        NodeStatus::parse(&self.local_status).unwrap_or(NodeStatus::Unknown)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        // NODE_TTL is already 2x the heartbeat interval.
        now.signed_duration_since(self.last_heartbeat)
            <= chrono::Duration::from_std(NODE_TTL).expect("ttl fits")
    }
}

/// The leader is the lowest live node id. Deterministic, no extra state.
pub fn elect_leader(nodes: &[NodeRow], now: DateTime<Utc>) -> Option<Uuid> {
    nodes
        .iter()
        .filter(|node| node.is_live(now))
        .map(|node| node.node_id)
        .min()
}

/// Persistence for the phase row and membership table.
#[derive(Clone)]
pub struct ClusterStore {
    pool: PgPool,
}

impl ClusterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the coordination tables if a migration has not already. Safe
    /// to call from every replica at startup.
    pub async fn ensure_schema(&self) -> SwitchoverResult<()> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS switchover_state (
                   singleton bool PRIMARY KEY DEFAULT true CHECK (singleton),
                   phase text NOT NULL,
                   version bigint NOT NULL,
                   updated_at timestamptz NOT NULL DEFAULT now()
               )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS switchover_nodes (
                   node_id uuid PRIMARY KEY,
                   region text NOT NULL,
                   name text NOT NULL,
                   last_heartbeat timestamptz NOT NULL DEFAULT now(),
                   local_status text NOT NULL DEFAULT 'unknown'
               )"#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"INSERT INTO switchover_state (singleton, phase, version)
               VALUES (true, 'idle', 1)
               ON CONFLICT (singleton) DO NOTHING"#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Read the current cluster phase and version.
    pub async fn phase(&self) -> SwitchoverResult<(Phase, i64)> {
        let (phase, version): (String, i64) =
            sqlx::query_as("SELECT phase, version FROM switchover_state WHERE singleton")
                .fetch_one(&self.pool)
                .await?;
        let phase = Phase::parse(&phase)
            .ok_or_else(|| SwitchoverError::Fatal(format!("unknown persisted phase {phase:?}")))?;
        Ok((phase, version))
    }

    /// Compare-and-swap the phase row. Returns the new version on success,
    /// `None` when another actor already moved the row.
    pub async fn cas_phase(
        &self,
        from: Phase,
        from_version: i64,
        to: Phase,
    ) -> SwitchoverResult<Option<i64>> {
        let permitted = from.may_advance_to(to) || (to == Phase::Aborted && from.may_abort());
        if !permitted {
            return Err(SwitchoverError::Validation(format!(
                "illegal phase transition {from} -> {to}"
            )));
        }
        let row: Option<(i64,)> = sqlx::query_as(
            r#"UPDATE switchover_state
                  SET phase = $3, version = version + 1, updated_at = now()
                WHERE singleton AND phase = $1 AND version = $2
            RETURNING version"#,
        )
        .bind(from.as_str())
        .bind(from_version)
        .bind(to.as_str())
        .fetch_optional(&self.pool)
        .await?;
        if let Some((version,)) = row {
            metrics::counter!("beacon_switchover_phase_transitions_total", "to" => to.as_str())
                .increment(1);
            tracing::info!(%from, %to, version, "phase transition");
            return Ok(Some(version));
        }
        Ok(None)
    }

    /// Force the phase row, bypassing the transition table. Only `reset`
    /// uses this, to leave `aborted`/`complete`.
    pub async fn force_phase(&self, to: Phase) -> SwitchoverResult<i64> {
        let (version,): (i64,) = sqlx::query_as(
            r#"UPDATE switchover_state
                  SET phase = $1, version = version + 1, updated_at = now()
                WHERE singleton
            RETURNING version"#,
        )
        .bind(to.as_str())
        .fetch_one(&self.pool)
        .await?;
        tracing::info!(%to, version, "phase forced");
        Ok(version)
    }

    /// Upsert this node's membership row.
    pub async fn heartbeat(
        &self,
        identity: &NodeIdentity,
        status: NodeStatus,
    ) -> SwitchoverResult<()> {
        sqlx::query(
            r#"INSERT INTO switchover_nodes (node_id, region, name, last_heartbeat, local_status)
               VALUES ($1, $2, $3, now(), $4)
               ON CONFLICT (node_id) DO UPDATE
                  SET last_heartbeat = now(), local_status = EXCLUDED.local_status"#,
        )
        .bind(identity.id)
        .bind(&identity.region)
        .bind(&identity.name)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn nodes(&self) -> SwitchoverResult<Vec<NodeRow>> {
        let rows = sqlx::query_as::<_, NodeRow>(
            r#"SELECT node_id, region, name, last_heartbeat, local_status
                 FROM switchover_nodes ORDER BY node_id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Drop rows whose heartbeat is long gone. Opportunistic; run by
    /// whichever node notices.
    pub async fn reap_dead(&self) -> SwitchoverResult<u64> {
        let done = sqlx::query(
            "DELETE FROM switchover_nodes WHERE last_heartbeat < now() - interval '1 minute'",
        )
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }

    /// Remove this node's row on clean shutdown.
    pub async fn leave(&self, identity: &NodeIdentity) -> SwitchoverResult<()> {
        sqlx::query("DELETE FROM switchover_nodes WHERE node_id = $1")
            .bind(identity.id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: Uuid, beat_age_secs: i64, now: DateTime<Utc>) -> NodeRow {
        NodeRow {
            node_id: id,
            region: "default".into(),
            name: "test".into(),
            last_heartbeat: now - chrono::Duration::seconds(beat_age_secs),
            local_status: "ready".into(),
        }
    }

    #[test]
    fn leader_is_lowest_live_id() {
        let now = Utc::now();
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        let nodes = vec![node(high, 0, now), node(low, 1, now)];
        assert_eq!(elect_leader(&nodes, now), Some(low));
    }

    #[test]
    fn dead_nodes_cannot_lead() {
        let now = Utc::now();
        let low = Uuid::from_u128(1);
        let high = Uuid::from_u128(2);
        // low's heartbeat is past 2x TTL
        let nodes = vec![node(low, 30, now), node(high, 0, now)];
        assert_eq!(elect_leader(&nodes, now), Some(high));
    }

    #[test]
    fn empty_fleet_has_no_leader() {
        assert_eq!(elect_leader(&[], Utc::now()), None);
    }

    #[test]
    fn identity_name_includes_region() {
        let identity = NodeIdentity::for_process("east");
        assert!(identity.name.starts_with("east/"));
    }
}
