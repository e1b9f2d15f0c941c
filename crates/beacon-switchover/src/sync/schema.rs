//! Table discovery, trigger installation, and generated apply SQL.
//!
//! # Dynamic SQL
//! Every statement built here interpolates identifiers, never values. The
//! identifiers come from `information_schema` / `pg_catalog` on the old
//! database (the same allowlist discipline as anywhere else we format
//! table names into SQL) and are double-quote escaped regardless.
//!
//! # Change capture
//! One plpgsql function serves every tracked table; the per-table trigger
//! passes its primary-key column names as trigger arguments so the function
//! can build `row_key` without per-table codegen. Triggers fire AFTER each
//! row mutation, in the mutating transaction: a committed write and its
//! change-log row are atomic, an aborted write leaves nothing behind.

use crate::{SwitchoverError, SwitchoverResult};
use sqlx::PgPool;

/// Bookkeeping tables that must never be captured or copied.
const EXCLUDED_TABLES: [&str; 6] = [
    "change_log",
    "switchover_state",
    "switchover_nodes",
    "switchover_sync_cursor",
    "engine_state",
    "_sqlx_migrations",
];

const CREATE_CHANGE_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS change_log (
    id bigserial PRIMARY KEY,
    table_name text NOT NULL,
    op char(1) NOT NULL CHECK (op IN ('I', 'U', 'D')),
    row_key jsonb NOT NULL,
    row_data jsonb,
    committed_at timestamptz NOT NULL DEFAULT now()
)"#;

const CREATE_TRIGGER_FN: &str = r#"
CREATE OR REPLACE FUNCTION switchover_change_log() RETURNS trigger AS $fn$
DECLARE
    rec jsonb;
    key jsonb := '{}'::jsonb;
    col text;
BEGIN
    IF TG_OP = 'DELETE' THEN
        rec := to_jsonb(OLD);
    ELSE
        rec := to_jsonb(NEW);
    END IF;
    FOREACH col IN ARRAY TG_ARGV LOOP
        key := key || jsonb_build_object(col, rec -> col);
    END LOOP;
    INSERT INTO change_log (table_name, op, row_key, row_data)
    VALUES (TG_TABLE_NAME, left(TG_OP, 1), key,
            CASE WHEN TG_OP = 'DELETE' THEN NULL ELSE rec END);
    RETURN NULL;
END;
$fn$ LANGUAGE plpgsql"#;

/// Double-quote an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Single-quote an SQL string literal.
fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Everything the sync engine needs to know about one tracked table.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePlan {
    pub name: String,
    pub columns: Vec<String>,
    pub pk: Vec<String>,
}

impl TablePlan {
    pub fn trigger_name(&self) -> String {
        format!("zz_switchover_{}", self.name)
    }

    fn quoted_name(&self) -> String {
        quote_ident(&self.name)
    }

    fn column_list(&self) -> String {
        self.columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn select_list(&self, alias: &str) -> String {
        self.columns
            .iter()
            .map(|c| format!("{alias}.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn pk_tuple(&self, alias: &str) -> String {
        self.pk
            .iter()
            .map(|c| format!("{alias}.{}", quote_ident(c)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn conflict_target(&self) -> String {
        self.pk
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn update_assignments(&self) -> Option<String> {
        let assignments: Vec<String> = self
            .columns
            .iter()
            .filter(|c| !self.pk.contains(c))
            .map(|c| format!("{q} = EXCLUDED.{q}", q = quote_ident(c)))
            .collect();
        if assignments.is_empty() {
            None
        } else {
            Some(assignments.join(", "))
        }
    }

    /// `CREATE TRIGGER` for this table, pk columns as trigger arguments.
    pub fn create_trigger_sql(&self) -> String {
        let args = self
            .pk
            .iter()
            .map(|c| quote_literal(c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE TRIGGER {trig} AFTER INSERT OR UPDATE OR DELETE ON {tbl} \
             FOR EACH ROW EXECUTE FUNCTION switchover_change_log({args})",
            trig = quote_ident(&self.trigger_name()),
            tbl = self.quoted_name(),
        )
    }

    pub fn drop_trigger_sql(&self) -> String {
        format!(
            "DROP TRIGGER IF EXISTS {trig} ON {tbl}",
            trig = quote_ident(&self.trigger_name()),
            tbl = self.quoted_name(),
        )
    }

    /// One keyset page of rows as jsonb, primary-key order.
    ///
    /// `$1` is the previous page's last row (jsonb, NULL for the first
    /// page), `$2` the page size.
    pub fn copy_page_sql(&self) -> String {
        format!(
            "SELECT to_jsonb(t) FROM {tbl} AS t \
             WHERE $1::jsonb IS NULL OR ({pk}) > \
             (SELECT {pk_r} FROM jsonb_populate_record(NULL::{tbl}, $1::jsonb) AS r) \
             ORDER BY {pk} LIMIT $2",
            tbl = self.quoted_name(),
            pk = self.pk_tuple("t"),
            pk_r = self.pk_tuple("r"),
        )
    }

    /// Batch upsert from a jsonb array (`$1`), used by bulk copy.
    pub fn upsert_batch_sql(&self) -> String {
        let conflict = match self.update_assignments() {
            Some(assignments) => format!(
                "ON CONFLICT ({}) DO UPDATE SET {assignments}",
                self.conflict_target()
            ),
            None => format!("ON CONFLICT ({}) DO NOTHING", self.conflict_target()),
        };
        format!(
            "INSERT INTO {tbl} ({cols}) \
             SELECT {sel} FROM jsonb_array_elements($1::jsonb) AS e(doc) \
             CROSS JOIN LATERAL jsonb_populate_record(NULL::{tbl}, e.doc) AS r {conflict}",
            tbl = self.quoted_name(),
            cols = self.column_list(),
            sel = self.select_list("r"),
        )
    }

    /// Single-row insert-or-ignore from jsonb (`$1`): change-log `I`.
    pub fn insert_ignore_sql(&self) -> String {
        format!(
            "INSERT INTO {tbl} ({cols}) \
             SELECT {sel} FROM jsonb_populate_record(NULL::{tbl}, $1::jsonb) AS r \
             ON CONFLICT ({pk}) DO NOTHING",
            tbl = self.quoted_name(),
            cols = self.column_list(),
            sel = self.select_list("r"),
            pk = self.conflict_target(),
        )
    }

    /// Single-row upsert from jsonb (`$1`): change-log `U`.
    pub fn upsert_one_sql(&self) -> String {
        let conflict = match self.update_assignments() {
            Some(assignments) => format!(
                "ON CONFLICT ({}) DO UPDATE SET {assignments}",
                self.conflict_target()
            ),
            None => format!("ON CONFLICT ({}) DO NOTHING", self.conflict_target()),
        };
        format!(
            "INSERT INTO {tbl} ({cols}) \
             SELECT {sel} FROM jsonb_populate_record(NULL::{tbl}, $1::jsonb) AS r {conflict}",
            tbl = self.quoted_name(),
            cols = self.column_list(),
            sel = self.select_list("r"),
        )
    }

    /// Delete-by-key from a row_key jsonb (`$1`): change-log `D`.
    pub fn delete_sql(&self) -> String {
        format!(
            "DELETE FROM {tbl} AS t WHERE ({pk}) = \
             (SELECT {pk_r} FROM jsonb_populate_record(NULL::{tbl}, $1::jsonb) AS r)",
            tbl = self.quoted_name(),
            pk = self.pk_tuple("t"),
            pk_r = self.pk_tuple("r"),
        )
    }
}

/// Discover the tracked-table plan on the old database.
///
/// Every ordinary `public` table outside the bookkeeping set is tracked; a
/// tracked table without a primary key cannot be captured or copied and
/// fails the whole attach.
pub async fn discover_plan(pool: &PgPool) -> SwitchoverResult<Vec<TablePlan>> {
    let names: Vec<(String,)> = sqlx::query_as(
        r#"SELECT table_name FROM information_schema.tables
            WHERE table_schema = 'public' AND table_type = 'BASE TABLE'
            ORDER BY table_name"#,
    )
    .fetch_all(pool)
    .await?;

    let mut plan = Vec::new();
    for (name,) in names {
        if EXCLUDED_TABLES.contains(&name.as_str()) {
            continue;
        }
        let columns: Vec<(String,)> = sqlx::query_as(
            r#"SELECT column_name FROM information_schema.columns
                WHERE table_schema = 'public' AND table_name = $1
                ORDER BY ordinal_position"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;
        let pk: Vec<(String,)> = sqlx::query_as(
            r#"SELECT a.attname
                 FROM pg_index i
                 JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY (i.indkey)
                WHERE i.indrelid = ('public.' || quote_ident($1))::regclass
                  AND i.indisprimary
                ORDER BY a.attnum"#,
        )
        .bind(&name)
        .fetch_all(pool)
        .await?;
        if pk.is_empty() {
            return Err(SwitchoverError::Validation(format!(
                "table {name:?} has no primary key and cannot be synced"
            )));
        }
        plan.push(TablePlan {
            name,
            columns: columns.into_iter().map(|(c,)| c).collect(),
            pk: pk.into_iter().map(|(c,)| c).collect(),
        });
    }
    Ok(plan)
}

/// Install change capture on the old database. Idempotent.
pub async fn attach(pool: &PgPool, plan: &[TablePlan]) -> SwitchoverResult<()> {
    sqlx::query(CREATE_CHANGE_LOG).execute(pool).await?;
    sqlx::query(CREATE_TRIGGER_FN).execute(pool).await?;
    for table in plan {
        sqlx::query(&table.drop_trigger_sql()).execute(pool).await?;
        sqlx::query(&table.create_trigger_sql()).execute(pool).await?;
    }
    tracing::info!(tables = plan.len(), "change capture attached");
    Ok(())
}

/// Tear change capture down again. Only runs after the cluster completed
/// (or on reset); an aborted attempt leaves capture in place on purpose.
pub async fn detach(pool: &PgPool, plan: &[TablePlan]) -> SwitchoverResult<()> {
    for table in plan {
        sqlx::query(&table.drop_trigger_sql()).execute(pool).await?;
    }
    sqlx::query("DROP FUNCTION IF EXISTS switchover_change_log()")
        .execute(pool)
        .await?;
    sqlx::query("DROP TABLE IF EXISTS change_log").execute(pool).await?;
    tracing::info!("change capture detached");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TablePlan {
        TablePlan {
            name: "alerts".into(),
            columns: vec!["id".into(), "service_id".into(), "created_at".into()],
            pk: vec!["id".into()],
        }
    }

    #[test]
    fn trigger_sql_passes_pk_columns_as_args() {
        let sql = sample().create_trigger_sql();
        assert!(sql.contains(r#"CREATE TRIGGER "zz_switchover_alerts""#));
        assert!(sql.contains(r#"ON "alerts""#));
        assert!(sql.contains("switchover_change_log('id')"));
        assert!(sql.contains("AFTER INSERT OR UPDATE OR DELETE"));
    }

    #[test]
    fn upsert_updates_only_non_key_columns() {
        let sql = sample().upsert_batch_sql();
        assert!(sql.contains(r#"ON CONFLICT ("id") DO UPDATE"#));
        assert!(sql.contains(r#""service_id" = EXCLUDED."service_id""#));
        assert!(!sql.contains(r#""id" = EXCLUDED."id""#));
    }

    #[test]
    fn all_key_table_upserts_do_nothing() {
        let plan = TablePlan {
            name: "memberships".into(),
            columns: vec!["user_id".into(), "team_id".into()],
            pk: vec!["user_id".into(), "team_id".into()],
        };
        assert!(plan
            .upsert_batch_sql()
            .contains(r#"ON CONFLICT ("user_id", "team_id") DO NOTHING"#));
    }

    #[test]
    fn copy_page_orders_by_full_key() {
        let plan = TablePlan {
            name: "memberships".into(),
            columns: vec!["user_id".into(), "team_id".into(), "role".into()],
            pk: vec!["user_id".into(), "team_id".into()],
        };
        let sql = plan.copy_page_sql();
        assert!(sql.contains(r#"ORDER BY t."user_id", t."team_id" LIMIT $2"#));
        assert!(sql.contains("$1::jsonb IS NULL OR"));
    }

    #[test]
    fn delete_matches_on_key_tuple() {
        let sql = sample().delete_sql();
        assert!(sql.contains(r#"DELETE FROM "alerts" AS t WHERE (t."id") ="#));
    }

    #[test]
    fn identifiers_are_escaped() {
        let plan = TablePlan {
            name: r#"odd"name"#.into(),
            columns: vec!["id".into()],
            pk: vec!["id".into()],
        };
        assert!(plan.copy_page_sql().contains(r#""odd""name""#));
    }
}
