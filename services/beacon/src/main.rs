// Beacon service binary
// ---------------------
// Subcommand surface around the alerting core:
//
// - (no subcommand)   run the service: migrations, engine cycles, and,
//                     when a next database is configured, the switchover
//                     handler participating on the coordination bus.
// - migrate           apply (or roll back) embedded schema migrations.
// - self-test         validate the environment (DB reachability, DST rules).
// - switchover-shell  interactive operator console for a DB switchover.
//
// Exit codes: 0 success, 1 configuration error, 2 migration verify failure,
// 3 self-test failure, 4 switchover aborted.

mod config;
mod selftest;

use anyhow::{anyhow, bail, Context, Result};
use beacon_db::retry::{connect_pool, RetryPool};
use beacon_db::routing::RoutedPool;
use beacon_db::DbHandle;
use beacon_engine::metrics::MetricsCycle;
use beacon_engine::{Engine, EngineHandle};
use beacon_switchover::bus::Bus;
use beacon_switchover::handler::{Handler, HandlerConfig};
use beacon_switchover::shell;
use beacon_switchover::store::{ClusterStore, NodeIdentity};
use beacon_switchover::sync::SyncEngine;
use beacon_switchover::SwitchoverError;
use clap::{Parser, Subcommand};
use config::{Config, Flags};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::migrate::{MigrationType, Migrator};
use sqlx::PgPool;
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENGINE_INTERVAL: Duration = Duration::from_secs(5);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(25);

const EXIT_CONFIG: i32 = 1;
const EXIT_MIGRATE: i32 = 2;
const EXIT_SELF_TEST: i32 = 3;
const EXIT_ABORTED: i32 = 4;

#[derive(Debug, Parser)]
#[command(name = "beacon", version, about = "On-call alerting platform.")]
struct Cli {
    #[command(flatten)]
    flags: Flags,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Perform migration(s), then exit.
    Migrate {
        /// Target UP migration to apply (name or version).
        #[arg(long)]
        up: Option<String>,
        /// Target DOWN migration to roll back to (name or version).
        #[arg(long)]
        down: Option<String>,
    },

    /// Validate functionality of the Beacon environment.
    SelfTest {
        /// Only perform offline checks.
        #[arg(long)]
        offline: bool,
    },

    /// Start the switchover shell, used to initiate, control, and monitor
    /// a DB switchover operation.
    SwitchoverShell,

    /// Output the current version.
    Version,
}

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_CONFIG } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };
    init_logging(&cli.flags);

    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "beacon exited with error");
            EXIT_CONFIG
        }
    };
    std::process::exit(code);
}

fn init_logging(flags: &Flags) {
    let default = if flags.log_errors_only {
        "error"
    } else if flags.verbose {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if flags.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        None => {
            let config = match Config::from_flags(&cli.flags) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{err:#}");
                    return Ok(EXIT_CONFIG);
                }
            };
            run_service(config).await
        }
        Some(Command::Migrate { up, down }) => {
            let config = match Config::from_flags(&cli.flags) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{err:#}");
                    return Ok(EXIT_CONFIG);
                }
            };
            match migrate_cmd(&config, up.as_deref(), down.as_deref()).await {
                Ok(()) => Ok(0),
                Err(err) => {
                    eprintln!("migrate: {err:#}");
                    Ok(EXIT_MIGRATE)
                }
            }
        }
        Some(Command::SelfTest { offline }) => {
            // Self-test tolerates a missing db-url; it just skips the
            // online checks.
            let config = Config::from_flags(&cli.flags).ok();
            if selftest::run(config.as_ref(), offline).await {
                Ok(0)
            } else {
                println!("one or more checks failed");
                Ok(EXIT_SELF_TEST)
            }
        }
        Some(Command::Version) => {
            print_version();
            Ok(0)
        }
        Some(Command::SwitchoverShell) => {
            let config = match Config::from_flags(&cli.flags) {
                Ok(config) => config,
                Err(err) => {
                    eprintln!("{err:#}");
                    return Ok(EXIT_CONFIG);
                }
            };
            let Some(next_url) = config.db_url_next.clone() else {
                eprintln!("db-url-next must not be empty for switchover");
                return Ok(EXIT_CONFIG);
            };
            let old = PgPool::connect(&config.db_url)
                .await
                .context("connect to postgres")?;
            let next = PgPool::connect(&next_url)
                .await
                .context("connect to postgres (next)")?;
            match shell::run_shell(old, next).await {
                Ok(()) => Ok(0),
                Err(SwitchoverError::Aborted(reason)) => {
                    eprintln!("switchover aborted: {reason}");
                    Ok(EXIT_ABORTED)
                }
                Err(err) => Err(err.into()),
            }
        }
    }
}

/// Long-form version report, the one operators paste into tickets. The
/// migration line tells support what schema a deployment expects before
/// anyone has to touch the database.
fn print_version() {
    let mut versions: Vec<i64> = MIGRATOR.iter().map(|migration| migration.version).collect();
    versions.sort_unstable();
    versions.dedup();
    let head = versions
        .last()
        .and_then(|version| {
            MIGRATOR
                .iter()
                .find(|migration| migration.version == *version)
        })
        .map(|migration| migration.description.as_ref().to_string())
        .unwrap_or_else(|| "none".to_string());

    println!(
        "Version:   {}\n\
         GitCommit: {}\n\
         Platform:  {}/{}\n\
         Migration: {} (#{})",
        env!("CARGO_PKG_VERSION"),
        option_env!("BEACON_GIT_COMMIT").unwrap_or("unknown"),
        std::env::consts::OS,
        std::env::consts::ARCH,
        head,
        versions.len(),
    );
}

/// The long-running service: engine cycles plus, in switchover mode, the
/// per-replica handler.
async fn run_service(config: Config) -> Result<i32> {
    if let Some(addr) = config.listen_prometheus {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("install metrics exporter")?;
    }

    let old_pool = connect_pool(&config.db_url, config.db_max_open, config.db_max_idle)
        .await
        .context("connect to postgres")?;

    if config.api_only {
        if let Err(err) = verify_migrations(&old_pool).await {
            tracing::error!(error = %format!("{err:#}"), "migration verify failed");
            return Ok(EXIT_MIGRATE);
        }
    } else {
        let started = std::time::Instant::now();
        let applied = MIGRATOR.iter().count();
        MIGRATOR.run(&old_pool).await.context("apply migrations")?;
        tracing::debug!(
            migrations = applied,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "migrations up to date"
        );
    }

    let old = RetryPool::new(old_pool.clone());
    old.ping().await.context("ping postgres")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Routing: plain pool without a next database, routed pool with one.
    let mut switchover: Option<(RoutedPool, PgPool)> = None;
    let db = match &config.db_url_next {
        Some(next_url) => {
            let next_pool = connect_pool(next_url, config.db_max_open, config.db_max_idle)
                .await
                .context("connect to postgres (next)")?;
            let next = RetryPool::new(next_pool.clone());
            next.ping().await.context("ping postgres (next)")?;
            let routed = RoutedPool::new(old.clone(), next);
            switchover = Some((routed.clone(), next_pool));
            DbHandle::Routed(routed)
        }
        None => DbHandle::Plain(old.clone()),
    };

    // Engine cycles are disabled in API-only mode; other instances in the
    // cluster process them.
    let mut engine_handle: Option<EngineHandle> = None;
    let mut engine_task = None;
    if !config.api_only {
        let mut engine = Engine::new(ENGINE_INTERVAL, config.log_engine_cycles);
        engine.register(Arc::new(MetricsCycle::new(db.clone())));
        engine_handle = Some(engine.handle());
        engine_task = Some(tokio::spawn(engine.run(shutdown_rx.clone())));
    }

    let mut handler_task = None;
    let mut abort_trigger = None;
    if let Some((routed, next_pool)) = switchover {
        let identity = NodeIdentity::for_process(&config.region_name);
        tracing::info!(node = %identity.name, "switchover mode enabled");
        let handler = Handler::new(
            identity,
            routed,
            ClusterStore::new(old_pool.clone()),
            Bus::new(old_pool.clone()),
            SyncEngine::new(old_pool.clone(), next_pool),
            engine_handle.clone(),
            HandlerConfig::default(),
        );
        abort_trigger = Some(handler.abort_trigger());
        handler_task = Some(tokio::spawn(handler.run(shutdown_rx.clone())));
    }

    tracing::info!(
        listen = %config.listen,
        listen_tls = config.listen_tls.as_deref().unwrap_or("-"),
        region = %config.region_name,
        api_only = config.api_only,
        stub_notifiers = config.stub_notifiers,
        encryption_keys = config.encryption_keys.len(),
        "beacon ready"
    );

    // SIGUSR2 triggers an engine cycle out of band.
    if let Some(handle) = engine_handle.clone() {
        let mut sigusr2 = signal(SignalKind::user_defined2()).context("install SIGUSR2")?;
        tokio::spawn(async move {
            while sigusr2.recv().await.is_some() {
                handle.trigger();
            }
        });
    }

    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT")?;
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM")?;

    let mut exit_code = 0;
    loop {
        tokio::select! {
            _ = sigint.recv() => break,
            _ = sigterm.recv() => break,
            result = async { handler_task.as_mut().expect("guarded").await }, if handler_task.is_some() => {
                handler_task = None;
                match result {
                    Ok(Ok(())) => tracing::info!("switchover handler retired"),
                    Ok(Err(err)) => {
                        tracing::error!(error = %err, "switchover handler failed");
                        exit_code = EXIT_ABORTED;
                        break;
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "switchover handler panicked");
                        exit_code = EXIT_ABORTED;
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("application attempting graceful shutdown");
    if let Some(trigger) = &abort_trigger {
        trigger.abort();
    }
    let _ = shutdown_tx.send(true);

    let graceful = async {
        if let Some(task) = handler_task.take() {
            let _ = task.await;
        }
        if let Some(task) = engine_task.take() {
            let _ = task.await;
        }
    };
    tokio::select! {
        _ = graceful => {}
        _ = tokio::time::sleep(SHUTDOWN_TIMEOUT) => {
            tracing::warn!("graceful shutdown timed out");
        }
        _ = sigint.recv() => tracing::warn!("second signal received, terminating immediately"),
        _ = sigterm.recv() => tracing::warn!("second signal received, terminating immediately"),
    }

    old_pool.close().await;
    Ok(exit_code)
}

/// API-only instances never apply migrations; they require the schema to
/// already be at the embedded head.
async fn verify_migrations(pool: &PgPool) -> Result<()> {
    let head = MIGRATOR
        .iter()
        .map(|migration| migration.version)
        .max()
        .unwrap_or(0);
    let applied: Option<i64> = sqlx::query_scalar(
        "SELECT max(version) FROM _sqlx_migrations WHERE success",
    )
    .fetch_one(pool)
    .await
    .context("read applied migrations")?;
    match applied {
        Some(version) if version == head => Ok(()),
        Some(version) => bail!("schema at migration {version}, expected {head}"),
        None => bail!("no migrations applied, expected {head}"),
    }
}

async fn migrate_cmd(config: &Config, up: Option<&str>, down: Option<&str>) -> Result<()> {
    let pool = PgPool::connect(&config.db_url)
        .await
        .context("connect to postgres")?;

    if let Some(name) = down {
        let target = resolve_migration(name)?;
        let count = migrate_down(&pool, target)
            .await
            .context("apply DOWN migrations")?;
        if count > 0 {
            tracing::debug!(count, "applied DOWN migrations");
        }
    }

    if down.is_none() || up.is_some() {
        match up {
            Some(name) => {
                let target = resolve_migration(name)?;
                let migrations: Vec<_> = MIGRATOR
                    .iter()
                    .filter(|migration| migration.version <= target)
                    .cloned()
                    .collect();
                let partial = Migrator {
                    migrations: Cow::Owned(migrations),
                    ..Migrator::DEFAULT
                };
                partial.run(&pool).await.context("apply UP migrations")?;
            }
            None => {
                MIGRATOR.run(&pool).await.context("apply UP migrations")?;
            }
        }
    }
    Ok(())
}

/// Accept a migration by description or numeric version. Descriptions are
/// stored with underscores turned into spaces, so both spellings work.
fn resolve_migration(name: &str) -> Result<i64> {
    let spaced = name.replace('_', " ");
    MIGRATOR
        .iter()
        .find(|migration| {
            migration.description.as_ref() == name
                || migration.description.as_ref() == spaced
                || migration.version.to_string() == name
        })
        .map(|migration| migration.version)
        .ok_or_else(|| anyhow!("unknown migration {name:?}"))
}


/// Roll back every applied migration newer than `target`, newest first,
/// using the embedded reverse migrations.
async fn migrate_down(pool: &PgPool, target: i64) -> Result<u64> {
    let applied: Vec<(i64,)> = sqlx::query_as(
        "SELECT version FROM _sqlx_migrations WHERE version > $1 ORDER BY version DESC",
    )
    .bind(target)
    .fetch_all(pool)
    .await?;

    let mut count = 0;
    for (version,) in applied {
        let migration = MIGRATOR
            .iter()
            .find(|migration| {
                migration.version == version
                    && matches!(migration.migration_type, MigrationType::ReversibleDown)
            })
            .ok_or_else(|| anyhow!("no reverse migration for version {version}"))?;

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(&migration.sql).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM _sqlx_migrations WHERE version = $1")
            .bind(version)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        count += 1;
    }
    Ok(count)
}
