use crate::errors::BenchError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod path_resolver;

use path_resolver::PathResolver;

pub const CONFIG_FILE: &str = "config.yaml";
pub const LOG_FILE: &str = "crashbench.log";

/// `config.yaml` as written by the user. Every key is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub index_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scenario_dir: Option<String>,
    #[serde(default)]
    pub postgresql: RawEndpoint,
    #[serde(default)]
    pub reference_postgresql: RawEndpoint,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_crash_safe: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_ratio: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crash_delay: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawEndpoint {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
}

/// Fully resolved connection parameters for one server.
#[derive(Debug, Clone, PartialEq)]
pub struct PgEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl RawEndpoint {
    /// Fills gaps from libpq-style environment variables. The database
    /// name falls back to the user name, as libpq does.
    pub fn resolve(&self, env: impl Fn(&str) -> Option<String>) -> PgEndpoint {
        let host = self
            .host
            .clone()
            .or_else(|| env("PGHOST"))
            .unwrap_or_else(|| "localhost".to_string());
        let port = self
            .port
            .or_else(|| env("PGPORT").and_then(|p| p.parse().ok()))
            .unwrap_or(5432);
        let user = self
            .user
            .clone()
            .or_else(|| env("PGUSER"))
            .or_else(|| env("USER"))
            .unwrap_or_else(|| "postgres".to_string());
        let database = self
            .database
            .clone()
            .or_else(|| env("PGDATABASE"))
            .unwrap_or_else(|| user.clone());
        PgEndpoint {
            host,
            port,
            user,
            password: self.password.clone(),
            database,
        }
    }
}

/// Crash-injection knobs shared by every executor of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct CrashPolicy {
    pub enabled: bool,
    pub crash_ratio: f64,
    pub crash_delay: Duration,
    pub reconnect_interval: Duration,
    pub reconnect_deadline: Duration,
    pub seed: Option<u64>,
}

impl Default for CrashPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            crash_ratio: 1.0,
            crash_delay: Duration::from_secs(1),
            reconnect_interval: Duration::from_millis(10),
            reconnect_deadline: Duration::from_secs(5),
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub dir: PathBuf,
    pub log_dir: PathBuf,
    pub log_level: String,
    pub schema_dir: PathBuf,
    pub data_dir: PathBuf,
    pub index_dir: PathBuf,
    pub scenario_dir: PathBuf,
    pub postgresql: PgEndpoint,
    pub reference_postgresql: PgEndpoint,
    pub crash: CrashPolicy,
}

impl BenchConfig {
    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }

    fn from_raw(
        dir: &Path,
        raw: RawConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, BenchError> {
        let r = PathResolver::new(dir);
        let resolve_dir = |v: &Option<String>, default: &str| r.resolve(v.as_deref().unwrap_or(default));

        let defaults = CrashPolicy::default();
        let crash_delay = raw.crash_delay.unwrap_or(1.0);
        if !crash_delay.is_finite() || crash_delay < 0.0 {
            return Err(BenchError::config(format!(
                "crash_delay must be a non-negative number of seconds, got {crash_delay}"
            )));
        }
        let crash_delay = Duration::try_from_secs_f64(crash_delay).map_err(|e| {
            BenchError::config(format!("crash_delay {crash_delay} is out of range: {e}"))
        })?;
        let crash_ratio = raw.crash_ratio.unwrap_or(defaults.crash_ratio);
        if crash_ratio.is_nan() {
            return Err(BenchError::config("crash_ratio must be a number"));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            log_dir: resolve_dir(&raw.log_dir, "log"),
            log_level: raw.log_level.clone().unwrap_or_else(|| "info".to_string()),
            schema_dir: resolve_dir(&raw.schema_dir, "schema"),
            data_dir: resolve_dir(&raw.data_dir, "data"),
            index_dir: resolve_dir(&raw.index_dir, "index"),
            scenario_dir: resolve_dir(&raw.scenario_dir, "scenario"),
            postgresql: raw.postgresql.resolve(&env),
            reference_postgresql: raw.reference_postgresql.resolve(&env),
            crash: CrashPolicy {
                enabled: raw.test_crash_safe.unwrap_or(false),
                crash_ratio,
                crash_delay,
                reconnect_interval: raw
                    .reconnect_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_interval),
                reconnect_deadline: raw
                    .reconnect_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_deadline),
                seed: raw.seed,
            },
        })
    }
}

/// Loads `<dir>/config.yaml`. A missing file means "all defaults".
pub fn load_config(dir: &Path) -> Result<BenchConfig, BenchError> {
    load_config_with_env(dir, |k| std::env::var(k).ok())
}

pub fn load_config_with_env(
    dir: &Path,
    env: impl Fn(&str) -> Option<String>,
) -> Result<BenchConfig, BenchError> {
    let path = dir.join(CONFIG_FILE);
    let raw = if path.exists() {
        let text = std::fs::read_to_string(&path).map_err(|e| {
            BenchError::config(format!("failed to read config {}: {}", path.display(), e))
        })?;
        parse_raw_config(&text, &path)?
    } else {
        RawConfig::default()
    };
    BenchConfig::from_raw(dir, raw, env)
}

fn parse_raw_config(text: &str, path: &Path) -> Result<RawConfig, BenchError> {
    if text.trim().is_empty() {
        return Ok(RawConfig::default());
    }
    let mut ignored_keys = Vec::new();
    let deserializer = serde_yaml::Deserializer::from_str(text);
    let raw: RawConfig = serde_ignored::deserialize(deserializer, |p| {
        ignored_keys.push(p.to_string());
    })
    .map_err(|e| BenchError::config(format!("failed to parse {}: {}", path.display(), e)))?;

    if !ignored_keys.is_empty() {
        tracing::warn!(
            config = %path.display(),
            keys = ?ignored_keys,
            "ignored unknown config fields"
        );
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_endpoint_env_fallbacks() {
        let raw = RawEndpoint {
            port: Some(15432),
            ..Default::default()
        };
        let ep = raw.resolve(env_from(&[
            ("PGHOST", "pg.internal"),
            ("PGPORT", "9999"),
            ("USER", "alice"),
        ]));
        assert_eq!(ep.host, "pg.internal");
        assert_eq!(ep.port, 15432);
        assert_eq!(ep.user, "alice");
        assert_eq!(ep.database, "alice");
    }

    #[test]
    fn test_defaults_without_file() {
        let raw = RawConfig::default();
        let cfg = BenchConfig::from_raw(Path::new("/work"), raw, env_from(&[])).unwrap();
        assert_eq!(cfg.scenario_dir, PathBuf::from("/work/scenario"));
        assert_eq!(cfg.log_path(), PathBuf::from("/work/log/crashbench.log"));
        assert!(!cfg.crash.enabled);
        assert_eq!(cfg.crash.crash_ratio, 1.0);
        assert_eq!(cfg.crash.reconnect_interval, Duration::from_millis(10));
        assert_eq!(cfg.crash.reconnect_deadline, Duration::from_secs(5));
        assert_eq!(cfg.postgresql.host, "localhost");
    }

    #[test]
    fn test_negative_crash_delay_is_rejected() {
        let raw = RawConfig {
            crash_delay: Some(-1.0),
            ..Default::default()
        };
        let err = BenchConfig::from_raw(Path::new("."), raw, env_from(&[])).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
    }

    #[test]
    fn test_out_of_range_crash_delay_is_rejected() {
        let raw = RawConfig {
            crash_delay: Some(1.0e20),
            ..Default::default()
        };
        let err = BenchConfig::from_raw(Path::new("."), raw, env_from(&[])).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)), "{err:?}");
    }
}
