//! Change-capture round-trip tests against real Postgres.
//!
//! Requires the `pg-tests` feature plus two scratch databases:
//! `BEACON_TEST_DB_URL` (old) and `BEACON_TEST_DB_URL_NEXT` (next). Both
//! are wiped per run.
#![cfg(feature = "pg-tests")]

use beacon_switchover::sync::schema::{attach, detach, discover_plan};
use beacon_switchover::sync::{apply, SyncEngine};
use serial_test::serial;
use sqlx::PgPool;
use std::collections::HashMap;

async fn connect(var: &str) -> PgPool {
    let url = std::env::var(var).unwrap_or_else(|_| panic!("{var} must be set"));
    PgPool::connect(&url).await.expect("connect")
}

/// Reset both sides to a tiny alerting schema.
async fn reset(old: &PgPool, next: &PgPool) {
    for pool in [old, next] {
        sqlx::query("DROP TABLE IF EXISTS change_log, switchover_sync_cursor, alerts CASCADE")
            .execute(pool)
            .await
            .expect("drop");
        sqlx::query("DROP FUNCTION IF EXISTS switchover_change_log()")
            .execute(pool)
            .await
            .expect("drop fn");
        sqlx::query(
            r#"CREATE TABLE alerts (
                   id bigserial PRIMARY KEY,
                   summary text NOT NULL,
                   status text NOT NULL DEFAULT 'triggered'
               )"#,
        )
        .execute(pool)
        .await
        .expect("schema");
    }
}

async fn count(pool: &PgPool, sql: &str) -> i64 {
    let (n,): (i64,) = sqlx::query_as(sql).fetch_one(pool).await.expect("count");
    n
}

#[tokio::test]
#[serial]
async fn every_committed_mutation_appends_one_change_row() {
    let old = connect("BEACON_TEST_DB_URL").await;
    let next = connect("BEACON_TEST_DB_URL_NEXT").await;
    reset(&old, &next).await;

    let plan = discover_plan(&old).await.expect("plan");
    attach(&old, &plan).await.expect("attach");

    sqlx::query("INSERT INTO alerts (summary) VALUES ('cpu high')")
        .execute(&old)
        .await
        .expect("insert");
    sqlx::query("UPDATE alerts SET status = 'closed' WHERE summary = 'cpu high'")
        .execute(&old)
        .await
        .expect("update");
    sqlx::query("DELETE FROM alerts WHERE summary = 'cpu high'")
        .execute(&old)
        .await
        .expect("delete");

    assert_eq!(count(&old, "SELECT count(*) FROM change_log").await, 3);
    assert_eq!(
        count(&old, "SELECT count(*) FROM change_log WHERE op = 'I'").await,
        1
    );
    assert_eq!(
        count(&old, "SELECT count(*) FROM change_log WHERE op = 'U'").await,
        1
    );
    assert_eq!(
        count(&old, "SELECT count(*) FROM change_log WHERE op = 'D'").await,
        1
    );

    // a rolled-back transaction must leave nothing behind
    let mut tx = old.begin().await.expect("begin");
    sqlx::query("INSERT INTO alerts (summary) VALUES ('phantom')")
        .execute(&mut *tx)
        .await
        .expect("insert");
    drop(tx);
    assert_eq!(count(&old, "SELECT count(*) FROM change_log").await, 3);

    detach(&old, &plan).await.expect("detach");
}

#[tokio::test]
#[serial]
async fn tail_applies_in_order_and_replays_idempotently() {
    let old = connect("BEACON_TEST_DB_URL").await;
    let next = connect("BEACON_TEST_DB_URL_NEXT").await;
    reset(&old, &next).await;

    let plan = discover_plan(&old).await.expect("plan");
    attach(&old, &plan).await.expect("attach");
    apply::ensure_cursor(&next, 0).await.expect("cursor");

    for i in 0..25 {
        sqlx::query("INSERT INTO alerts (summary) VALUES ($1)")
            .bind(format!("alert {i}"))
            .execute(&old)
            .await
            .expect("insert");
    }
    sqlx::query("UPDATE alerts SET status = 'closed' WHERE id % 2 = 0")
        .execute(&old)
        .await
        .expect("update");
    sqlx::query("DELETE FROM alerts WHERE id = 3")
        .execute(&old)
        .await
        .expect("delete");

    let plan_map: HashMap<_, _> = plan
        .iter()
        .map(|table| (table.name.clone(), table.clone()))
        .collect();
    while apply::apply_batch(&old, &next, &plan_map, 10)
        .await
        .expect("apply")
        > 0
    {}

    assert_eq!(apply::lag(&old, &next).await.expect("lag"), 0);
    assert_eq!(count(&next, "SELECT count(*) FROM alerts").await, 24);
    assert_eq!(
        count(&next, "SELECT count(*) FROM alerts WHERE status = 'closed'").await,
        count(&old, "SELECT count(*) FROM alerts WHERE status = 'closed'").await,
    );

    // Replay the whole log from scratch: the final state must not change.
    sqlx::query("UPDATE switchover_sync_cursor SET last_change_id = 0 WHERE singleton")
        .execute(&next)
        .await
        .expect("rewind");
    while apply::apply_batch(&old, &next, &plan_map, 1000)
        .await
        .expect("replay")
        > 0
    {}
    assert_eq!(count(&next, "SELECT count(*) FROM alerts").await, 24);
    assert!(count(&next, "SELECT count(*) FROM alerts WHERE id = 3").await == 0);

    detach(&old, &plan).await.expect("detach");
}

#[tokio::test]
#[serial]
async fn bulk_copy_then_tail_converges_both_sides() {
    let old = connect("BEACON_TEST_DB_URL").await;
    let next = connect("BEACON_TEST_DB_URL_NEXT").await;
    reset(&old, &next).await;

    // Pre-existing rows on old, one conflicting row already on next: the
    // copy must upsert it, not fail.
    for i in 0..500 {
        sqlx::query("INSERT INTO alerts (summary) VALUES ($1)")
            .bind(format!("alert {i}"))
            .execute(&old)
            .await
            .expect("seed old");
    }
    sqlx::query("INSERT INTO alerts (id, summary, status) VALUES (1, 'stale copy', 'closed')")
        .execute(&next)
        .await
        .expect("seed next");

    let engine = SyncEngine::new(old.clone(), next.clone());
    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let run = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(stop_rx).await }
    });

    // Writes racing the copy are captured and shipped by the tail.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    sqlx::query("INSERT INTO alerts (summary) VALUES ('raced the copy')")
        .execute(&old)
        .await
        .expect("race insert");

    // Wait (bounded) for the engine to report caught up.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(30);
    loop {
        if engine.report().ready {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "sync never reached ready: {:?}",
            engine.report()
        );
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
    }
    let _ = stop_tx.send(true);
    let _ = run.await;

    assert_eq!(
        count(&old, "SELECT count(*) FROM alerts").await,
        count(&next, "SELECT count(*) FROM alerts").await,
    );
    // the conflicting row was overwritten by old's version
    let (summary,): (String,) = sqlx::query_as("SELECT summary FROM alerts WHERE id = 1")
        .fetch_one(&next)
        .await
        .expect("row 1");
    assert_eq!(summary, "alert 0");

    engine.detach().await.expect("detach");
}
