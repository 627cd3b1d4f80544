//! Configuration handling for the database bridge.
//!
//! Pool options arrive from code, JSON, key/value pairs (URL query strings) or
//! the environment. Only the recognized option set is accepted; anything else
//! is rejected when the pool is configured rather than silently ignored.

use crate::db::sqlite::SqliteLocation;
use crate::error::{DbError, DbResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_SIZE: usize = 10;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;
pub const DEFAULT_DATABASE: &str = "sqlite::memory:";

// Environment variables read by `PoolConfig::from_env`
pub const ENV_HOST: &str = "DB_BRIDGE_HOST";
pub const ENV_USER: &str = "DB_BRIDGE_USER";
pub const ENV_PASSWORD: &str = "DB_BRIDGE_PASSWORD";
pub const ENV_MAX_SIZE: &str = "DB_BRIDGE_MAX_SIZE";
pub const ENV_IDLE_TIMEOUT_MS: &str = "DB_BRIDGE_IDLE_TIMEOUT_MS";

/// Recognized pool options. Every field is optional; unset fields keep the
/// value of the pool being configured.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PoolOptions {
    pub host: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    /// Maximum concurrently leased handles (default: 10)
    #[serde(alias = "maxSize")]
    pub max_size: Option<usize>,
    /// Idle handles older than this are discarded on next use (default: 60000, 0 disables)
    #[serde(alias = "idleTimeoutMs")]
    pub idle_timeout_ms: Option<u64>,
    /// Deadline for acquiring a handle when the pool is at capacity (default: wait forever)
    #[serde(alias = "acquireTimeoutMs")]
    pub acquire_timeout_ms: Option<u64>,
}

impl PoolOptions {
    /// Option keys accepted by `from_pairs`, in canonical form.
    const KEYS: &'static [&'static str] = &[
        "host",
        "user",
        "password",
        "max_size",
        "idle_timeout_ms",
        "acquire_timeout_ms",
    ];

    /// Parse options from JSON, rejecting unrecognized keys.
    pub fn from_json(value: serde_json::Value) -> DbResult<Self> {
        let opts: Self = serde_json::from_value(value)
            .map_err(|e| DbError::config(format!("Invalid pool options: {}", e)))?;
        opts.validate()?;
        Ok(opts)
    }

    /// Parse options from key/value pairs, rejecting unrecognized keys.
    ///
    /// Keys match case-insensitively and ignoring underscores, so both
    /// `max_size` and `maxSize` are accepted.
    pub fn from_pairs<I, K, V>(pairs: I) -> DbResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut opts = Self::default();
        for (key, value) in pairs {
            let key = key.as_ref();
            let canonical = Self::canonical_key(key).ok_or_else(|| {
                DbError::config(format!(
                    "Unrecognized pool option '{}'. Recognized options: {}",
                    key,
                    Self::KEYS.join(", ")
                ))
            })?;
            let value = value.into();
            match canonical {
                "host" => opts.host = Some(value),
                "user" => opts.user = Some(value),
                "password" => opts.password = Some(value),
                "max_size" => opts.max_size = Some(parse_number(canonical, &value)?),
                "idle_timeout_ms" => opts.idle_timeout_ms = Some(parse_number(canonical, &value)?),
                "acquire_timeout_ms" => {
                    opts.acquire_timeout_ms = Some(parse_number(canonical, &value)?)
                }
                other => {
                    return Err(DbError::config(format!("Unhandled pool option '{}'", other)));
                }
            }
        }
        opts.validate()?;
        Ok(opts)
    }

    fn canonical_key(key: &str) -> Option<&'static str> {
        let normalized: String = key
            .chars()
            .filter(|c| *c != '_')
            .map(|c| c.to_ascii_lowercase())
            .collect();
        Self::KEYS
            .iter()
            .copied()
            .find(|k| k.replace('_', "") == normalized)
    }

    /// Validate option values.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_size == Some(0) {
            return Err(DbError::config("max_size must be greater than 0"));
        }
        if let Some(host) = &self.host {
            if host.trim().is_empty() {
                return Err(DbError::config("host must not be empty"));
            }
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> DbResult<T> {
    value.trim().parse().map_err(|_| {
        DbError::config(format!(
            "Invalid value '{}' for pool option '{}': expected a non-negative integer",
            value, key
        ))
    })
}

/// Resolved pool configuration.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub host: Option<String>,
    pub user: Option<String>,
    /// Sensitive - never log
    pub password: Option<String>,
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub acquire_timeout: Option<Duration>,
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("max_size", &self.max_size)
            .field("idle_timeout", &self.idle_timeout)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            password: None,
            max_size: DEFAULT_MAX_SIZE,
            idle_timeout: Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS),
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Overlay options onto this configuration, producing a new value.
    pub fn merge(&self, opts: &PoolOptions) -> DbResult<Self> {
        opts.validate()?;
        Ok(Self {
            host: opts.host.clone().or_else(|| self.host.clone()),
            user: opts.user.clone().or_else(|| self.user.clone()),
            password: opts.password.clone().or_else(|| self.password.clone()),
            max_size: opts.max_size.unwrap_or(self.max_size),
            idle_timeout: opts
                .idle_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(self.idle_timeout),
            acquire_timeout: opts
                .acquire_timeout_ms
                .map(Duration::from_millis)
                .or(self.acquire_timeout),
        })
    }

    /// Build a configuration from the process environment.
    pub fn from_env() -> DbResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> DbResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let opts = PoolOptions {
            host: lookup(ENV_HOST),
            user: lookup(ENV_USER),
            password: lookup(ENV_PASSWORD),
            max_size: lookup(ENV_MAX_SIZE)
                .map(|v| parse_number(ENV_MAX_SIZE, &v))
                .transpose()?,
            idle_timeout_ms: lookup(ENV_IDLE_TIMEOUT_MS)
                .map(|v| parse_number(ENV_IDLE_TIMEOUT_MS, &v))
                .transpose()?,
            acquire_timeout_ms: None,
        };
        Self::default().merge(&opts)
    }
}

/// Command-line configuration for the `db-bridge` binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "db-bridge",
    about = "Run SQL statements through a pooled, streaming database bridge",
    version
)]
pub struct Config {
    /// Database to open: "sqlite::memory:" or "sqlite:<path>"
    #[arg(
        short = 'd',
        long = "database",
        value_name = "URL",
        default_value = DEFAULT_DATABASE,
        env = "DB_BRIDGE_DATABASE"
    )]
    pub database: String,

    /// Remote host (passed to the connection factory)
    #[arg(long, env = ENV_HOST)]
    pub host: Option<String>,

    /// Remote user (passed to the connection factory)
    #[arg(long, env = ENV_USER)]
    pub user: Option<String>,

    /// Remote password (passed to the connection factory)
    #[arg(long, env = ENV_PASSWORD, hide_env_values = true)]
    pub password: Option<String>,

    /// Maximum concurrently leased connections
    #[arg(long, default_value_t = DEFAULT_MAX_SIZE, env = ENV_MAX_SIZE)]
    pub max_size: usize,

    /// Idle connection timeout in milliseconds (0 disables eviction)
    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_MS, env = ENV_IDLE_TIMEOUT_MS)]
    pub idle_timeout_ms: u64,

    /// Connection acquire timeout in milliseconds
    #[arg(long, env = "DB_BRIDGE_ACQUIRE_TIMEOUT_MS")]
    pub acquire_timeout_ms: Option<u64>,

    /// Rows fetched per round-trip when streaming query results
    #[arg(long, default_value_t = crate::models::DEFAULT_BUFFER_SIZE, env = "DB_BRIDGE_BUFFER_SIZE")]
    pub buffer_size: usize,

    /// Statement to execute. Can be specified multiple times; when absent,
    /// statements are read from stdin, one per line.
    #[arg(short = 'e', long = "execute", value_name = "SQL")]
    pub statements: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn", env = "DB_BRIDGE_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_BRIDGE_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Resolve the pool configuration from the command-line flags.
    pub fn pool_config(&self) -> DbResult<PoolConfig> {
        let opts = PoolOptions {
            host: self.host.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            max_size: Some(self.max_size),
            idle_timeout_ms: Some(self.idle_timeout_ms),
            acquire_timeout_ms: self.acquire_timeout_ms,
        };
        PoolConfig::default().merge(&opts)
    }

    /// Parse the database URL.
    pub fn location(&self) -> DbResult<SqliteLocation> {
        SqliteLocation::parse(&self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::collections::HashMap;

    #[test]
    fn test_default_pool_config() {
        let config = PoolConfig::default();
        assert_eq!(config.max_size, DEFAULT_MAX_SIZE);
        assert_eq!(
            config.idle_timeout,
            Duration::from_millis(DEFAULT_IDLE_TIMEOUT_MS)
        );
        assert!(config.acquire_timeout.is_none());
    }

    #[test]
    fn test_merge_overrides_only_set_fields() {
        let base = PoolConfig {
            host: Some("as400".to_string()),
            max_size: 3,
            ..PoolConfig::default()
        };
        let merged = base
            .merge(&PoolOptions {
                max_size: Some(5),
                ..PoolOptions::default()
            })
            .unwrap();
        assert_eq!(merged.host.as_deref(), Some("as400"));
        assert_eq!(merged.max_size, 5);
        // Source is untouched
        assert_eq!(base.max_size, 3);
    }

    #[test]
    fn test_merge_empty_options_is_equal_copy() {
        let base = PoolConfig::default();
        let merged = base.merge(&PoolOptions::default()).unwrap();
        assert_eq!(base, merged);
    }

    #[test]
    fn test_from_pairs_accepts_known_keys() {
        let opts = PoolOptions::from_pairs([
            ("host", "foo"),
            ("maxSize", "4"),
            ("idle_timeout_ms", "250"),
        ])
        .unwrap();
        assert_eq!(opts.host.as_deref(), Some("foo"));
        assert_eq!(opts.max_size, Some(4));
        assert_eq!(opts.idle_timeout_ms, Some(250));
    }

    #[test]
    fn test_from_pairs_rejects_unknown_key() {
        let err = PoolOptions::from_pairs([("hostname", "foo")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(err.to_string().contains("hostname"));
    }

    #[test]
    fn test_from_pairs_rejects_bad_number() {
        let err = PoolOptions::from_pairs([("max_size", "lots")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_zero_max_size_rejected() {
        let err = PoolOptions::from_pairs([("max_size", "0")]).unwrap_err();
        assert!(err.to_string().contains("greater than 0"));
    }

    #[test]
    fn test_from_json_rejects_unknown_field() {
        let err = PoolOptions::from_json(serde_json::json!({ "host": "foo", "port": 446 }))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_from_json_accepts_camel_case() {
        let opts =
            PoolOptions::from_json(serde_json::json!({ "maxSize": 2, "idleTimeoutMs": 10 }))
                .unwrap();
        assert_eq!(opts.max_size, Some(2));
        assert_eq!(opts.idle_timeout_ms, Some(10));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (ENV_HOST, "myhost"),
            (ENV_USER, "me"),
            (ENV_MAX_SIZE, "7"),
        ]
        .into_iter()
        .collect();
        let config = PoolConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.host.as_deref(), Some("myhost"));
        assert_eq!(config.user.as_deref(), Some("me"));
        assert_eq!(config.max_size, 7);
        assert!(config.password.is_none());
    }

    #[test]
    fn test_debug_masks_password() {
        let config = PoolConfig {
            password: Some("secret".to_string()),
            ..PoolConfig::default()
        };
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_cli_pool_config() {
        let config = Config::parse_from(["db-bridge", "--max-size", "2", "--host", "h"]);
        let pool = config.pool_config().unwrap();
        assert_eq!(pool.max_size, 2);
        assert_eq!(pool.host.as_deref(), Some("h"));
        assert_eq!(config.database, DEFAULT_DATABASE);
    }
}
