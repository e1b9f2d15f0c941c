//! Database access layer for Beacon.
//!
//! # Purpose
//! Everything in this crate sits between application code and `sqlx`:
//!
//! - [`retry`]: bounded, jittered reconnect/acquire retries with
//!   transient-vs-logical error classification.
//! - [`routing`]: a dual-pool handle that routes every acquired connection
//!   to exactly one of two backends ("old" / "next") and fences stale
//!   connections across switchover phase changes.
//! - [`lock_state`]: an advisory-locked JSON scratch row used by engine
//!   cycles to persist their cursors under a single-writer guarantee.
//!
//! # Notes
//! The routing layer is inert outside of a switchover window: with no next
//! database configured, callers use a plain [`sqlx::PgPool`] and none of the
//! version-fencing machinery is in play.

pub mod lock_state;
pub mod retry;
pub mod routing;

use retry::RetryPool;
use routing::{RoutedConn, RoutedPool};
use sqlx::pool::PoolConnection;
use sqlx::Postgres;
use thiserror::Error;

/// Errors produced by the database layer.
///
/// `Unavailable` is only returned after the retry policy is exhausted, so
/// callers can treat it as "the backend is really down", not a blip.
#[derive(Debug, Error)]
pub enum DbError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("cancelled")]
    Cancelled,
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

pub type DbResult<T> = Result<T, DbError>;

/// The database handle application code holds.
///
/// Outside a switchover window this is a plain retrying pool. With a next
/// database configured it is the routed pool, and connections obtained here
/// are subject to version fencing.
#[derive(Clone)]
pub enum DbHandle {
    Plain(RetryPool),
    Routed(RoutedPool),
}

impl DbHandle {
    pub async fn acquire(&self) -> DbResult<DbConn> {
        match self {
            DbHandle::Plain(pool) => Ok(DbConn::Plain(pool.acquire().await?)),
            DbHandle::Routed(pool) => Ok(DbConn::Routed(pool.acquire().await?)),
        }
    }
}

/// A leased connection from either handle shape.
pub enum DbConn {
    Plain(PoolConnection<Postgres>),
    Routed(RoutedConn),
}

impl std::ops::Deref for DbConn {
    type Target = PoolConnection<Postgres>;

    fn deref(&self) -> &Self::Target {
        match self {
            DbConn::Plain(conn) => conn,
            DbConn::Routed(conn) => conn,
        }
    }
}

impl std::ops::DerefMut for DbConn {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self {
            DbConn::Plain(conn) => conn,
            DbConn::Routed(conn) => conn,
        }
    }
}

/// Append Beacon's connection defaults to a Postgres URL.
///
/// Sets `application_name` (so operators can tell switchover-mode processes
/// apart in `pg_stat_activity`) and `enable_seqscan=off`, which the service
/// has always run with.
pub fn decorate_db_url(url: &str, version: &str, switchover: bool) -> String {
    let app_name = if switchover {
        format!("Beacon {version} (S/O Mode)")
    } else {
        format!("Beacon {version}")
    };
    let encoded: String = app_name
        .bytes()
        .flat_map(|b| match b {
            b' ' => "%20".bytes().collect::<Vec<_>>(),
            b'(' => "%28".bytes().collect(),
            b')' => "%29".bytes().collect(),
            b'/' => "%2F".bytes().collect(),
            _ => vec![b],
        })
        .map(char::from)
        .collect();
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}application_name={encoded}&options=-c%20enable_seqscan%3Doff")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decorate_appends_app_name_and_seqscan() {
        let url = decorate_db_url("postgres://localhost/beacon", "1.2.3", false);
        assert!(url.contains("?application_name=Beacon%201.2.3"));
        assert!(url.contains("enable_seqscan%3Doff"));
    }

    #[test]
    fn decorate_marks_switchover_mode() {
        let url = decorate_db_url("postgres://localhost/beacon?sslmode=disable", "1.2.3", true);
        // existing query string must be extended, not replaced
        assert!(url.contains("sslmode=disable&application_name="));
        assert!(url.contains("%28S%2FO%20Mode%29"));
    }
}
