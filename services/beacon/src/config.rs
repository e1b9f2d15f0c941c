use anyhow::{bail, Result};
use clap::Args;
use std::net::SocketAddr;

// Service configuration, assembled from CLI flags. Every flag can also be
// set through the environment under the BEACON_ prefix with dashes mapped
// to underscores (clap's env support handles the mapping per-flag).
#[derive(Debug, Clone, Args)]
pub struct Flags {
    /// Connection string for Postgres.
    #[arg(long = "db-url", env = "BEACON_DB_URL")]
    pub db_url: Option<String>,

    /// Connection string for the *next* Postgres server (enables DB
    /// switchover mode).
    #[arg(long = "db-url-next", env = "BEACON_DB_URL_NEXT")]
    pub db_url_next: Option<String>,

    /// Used to derive an encryption key for sensitive data. Any length.
    #[arg(long = "data-encryption-key", env = "BEACON_DATA_ENCRYPTION_KEY")]
    pub data_encryption_key: Option<String>,

    /// Fallback key, for decrypting existing data only.
    #[arg(long = "data-encryption-key-old", env = "BEACON_DATA_ENCRYPTION_KEY_OLD")]
    pub data_encryption_key_old: Option<String>,

    /// Listen address:port for the application.
    #[arg(long, env = "BEACON_LISTEN", default_value = "localhost:8081")]
    pub listen: String,

    /// HTTPS listen address:port for the application.
    #[arg(long = "listen-tls", env = "BEACON_LISTEN_TLS")]
    pub listen_tls: Option<String>,

    /// Bind address for Prometheus metrics.
    #[arg(long = "listen-prometheus", env = "BEACON_LISTEN_PROMETHEUS")]
    pub listen_prometheus: Option<SocketAddr>,

    /// API-only mode: engine cycles are not processed on this instance.
    #[arg(long = "api-only", env = "BEACON_API_ONLY")]
    pub api_only: bool,

    /// Max open DB connections.
    #[arg(long = "db-max-open", env = "BEACON_DB_MAX_OPEN", default_value_t = 15)]
    pub db_max_open: u32,

    /// Max idle DB connections.
    #[arg(long = "db-max-idle", env = "BEACON_DB_MAX_IDLE", default_value_t = 5)]
    pub db_max_idle: u32,

    /// Region name for message processing (case sensitive). Only one
    /// instance per region processes outgoing messages.
    #[arg(long = "region-name", env = "BEACON_REGION_NAME", default_value = "default")]
    pub region_name: String,

    /// Replace notification senders with an always-succeeding stub.
    #[arg(long = "stub-notifiers", env = "BEACON_STUB_NOTIFIERS")]
    pub stub_notifiers: bool,

    /// Log in JSON format.
    #[arg(long, env = "BEACON_JSON")]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(long, short = 'v', env = "BEACON_VERBOSE")]
    pub verbose: bool,

    /// Only log errors (supersedes other logging flags).
    #[arg(long = "log-errors-only", env = "BEACON_LOG_ERRORS_ONLY")]
    pub log_errors_only: bool,

    /// Log start and end of each engine cycle.
    #[arg(long = "log-engine-cycles", env = "BEACON_LOG_ENGINE_CYCLES")]
    pub log_engine_cycles: bool,
}

// Validated process configuration with connection defaults applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_url_next: Option<String>,
    pub encryption_keys: Vec<Vec<u8>>,
    pub listen: String,
    pub listen_tls: Option<String>,
    pub listen_prometheus: Option<SocketAddr>,
    pub api_only: bool,
    pub db_max_open: u32,
    pub db_max_idle: u32,
    pub region_name: String,
    pub stub_notifiers: bool,
    pub log_engine_cycles: bool,
}

impl Config {
    pub fn from_flags(flags: &Flags) -> Result<Self> {
        let Some(raw_url) = flags.db_url.as_deref().filter(|url| !url.is_empty()) else {
            bail!("db-url is required");
        };
        let version = env!("CARGO_PKG_VERSION");
        let switchover = flags.db_url_next.as_deref().is_some_and(|url| !url.is_empty());

        let db_url = beacon_db::decorate_db_url(raw_url, version, switchover);
        let db_url_next = flags
            .db_url_next
            .as_deref()
            .filter(|url| !url.is_empty())
            .map(|url| beacon_db::decorate_db_url(url, version, true));

        // Primary key first, old key second for decrypt fallback.
        let encryption_keys = [&flags.data_encryption_key, &flags.data_encryption_key_old]
            .into_iter()
            .flatten()
            .map(|key| key.as_bytes().to_vec())
            .collect();

        Ok(Self {
            db_url,
            db_url_next,
            encryption_keys,
            listen: flags.listen.clone(),
            listen_tls: flags.listen_tls.clone(),
            listen_prometheus: flags.listen_prometheus,
            api_only: flags.api_only,
            db_max_open: flags.db_max_open,
            db_max_idle: flags.db_max_idle,
            region_name: flags.region_name.clone(),
            stub_notifiers: flags.stub_notifiers,
            log_engine_cycles: flags.log_engine_cycles,
        })
    }

    pub fn switchover_enabled(&self) -> bool {
        self.db_url_next.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use serial_test::serial;

    #[derive(Debug, Parser)]
    struct TestCli {
        #[command(flatten)]
        flags: Flags,
    }

    // Flags fall back to BEACON_* env vars, so tests must not see whatever
    // the invoking shell has exported.
    fn clear_beacon_env() {
        for (key, _) in std::env::vars() {
            if key.starts_with("BEACON_") {
                unsafe {
                    std::env::remove_var(key);
                }
            }
        }
    }

    fn parse(args: &[&str]) -> Flags {
        clear_beacon_env();
        TestCli::try_parse_from(std::iter::once("beacon").chain(args.iter().copied()))
            .expect("parse")
            .flags
    }

    #[serial]
    #[test]
    fn missing_db_url_is_a_config_error() {
        let flags = parse(&[]);
        assert!(Config::from_flags(&flags).is_err());
    }

    #[serial]
    #[test]
    fn env_overrides_supply_flag_values() {
        clear_beacon_env();
        unsafe {
            std::env::set_var("BEACON_DB_URL", "postgres://env-host/beacon");
            std::env::set_var("BEACON_REGION_NAME", "west");
        }
        let flags = TestCli::try_parse_from(["beacon"]).expect("parse").flags;
        let config = Config::from_flags(&flags).expect("config");
        assert!(config.db_url.starts_with("postgres://env-host/beacon"));
        assert_eq!(config.region_name, "west");
        clear_beacon_env();
    }

    #[serial]
    #[test]
    fn db_url_next_enables_switchover_and_marks_app_name() {
        let flags = parse(&[
            "--db-url",
            "postgres://localhost/beacon",
            "--db-url-next",
            "postgres://localhost/beacon_next",
        ]);
        let config = Config::from_flags(&flags).expect("config");
        assert!(config.switchover_enabled());
        assert!(config.db_url.contains("S%2FO%20Mode"));
        assert!(config.db_url_next.as_deref().unwrap().contains("S%2FO%20Mode"));
    }

    #[serial]
    #[test]
    fn plain_mode_without_next_url() {
        let flags = parse(&["--db-url", "postgres://localhost/beacon"]);
        let config = Config::from_flags(&flags).expect("config");
        assert!(!config.switchover_enabled());
        assert!(!config.db_url.contains("S%2FO"));
        assert!(config.db_url.contains("enable_seqscan%3Doff"));
    }

    #[serial]
    #[test]
    fn defaults_match_production_settings() {
        let flags = parse(&["--db-url", "postgres://localhost/beacon"]);
        let config = Config::from_flags(&flags).expect("config");
        assert_eq!(config.db_max_open, 15);
        assert_eq!(config.db_max_idle, 5);
        assert_eq!(config.region_name, "default");
        assert_eq!(config.listen, "localhost:8081");
    }

    #[serial]
    #[test]
    fn encryption_keys_keep_primary_before_fallback() {
        let flags = parse(&[
            "--db-url",
            "postgres://localhost/beacon",
            "--data-encryption-key",
            "new",
            "--data-encryption-key-old",
            "old",
        ]);
        let config = Config::from_flags(&flags).expect("config");
        assert_eq!(config.encryption_keys, vec![b"new".to_vec(), b"old".to_vec()]);
    }
}
