//! Engine configuration
//!
//! Loaded from environment variables (prefix `DEPLOY_CENTER_`, double
//! underscore as the nesting separator) via the `config` crate, with
//! `dotenvy` picking up a local `.env` file first if present.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory for per-deployment workspaces and the quarantine
    /// directory. Defaults to `<cwd>/deployments`.
    #[serde(default = "default_deployments_path")]
    pub deployments_path: PathBuf,

    /// 32-byte (64 hex-character) key used for AES-256-GCM encryption of
    /// stored SSH private keys.
    #[serde(default)]
    pub encryption_key_hex: String,

    /// Minimum free disk space required at the deployments path, in bytes.
    #[serde(default = "default_min_free_disk_bytes")]
    pub min_free_disk_bytes: u64,

    /// Number of most-recent per-project deployment workspaces kept during
    /// auto-pruning.
    #[serde(default = "default_keep_last_n")]
    pub keep_last_n: usize,

    pub logging: LoggingConfig,
}

fn default_deployments_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| PathBuf::from("."))
        .join("deployments")
}

fn default_min_free_disk_bytes() -> u64 {
    5 * 1024 * 1024 * 1024 // 5 GB
}

fn default_keep_last_n() -> usize {
    5
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            deployments_path: default_deployments_path(),
            encryption_key_hex: String::new(),
            min_free_disk_bytes: default_min_free_disk_bytes(),
            keep_last_n: default_keep_last_n(),
            logging: LoggingConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from `DEPLOY_CENTER_*` environment variables
    /// (picking up a local `.env` file first), falling back to defaults for
    /// anything unset.
    pub fn load() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("deployments_path", defaults.deployments_path.to_string_lossy().to_string())?
            .set_default("encryption_key_hex", defaults.encryption_key_hex.clone())?
            .set_default("min_free_disk_bytes", defaults.min_free_disk_bytes)?
            .set_default("keep_last_n", defaults.keep_last_n as i64)?
            .set_default("logging.target", "console")?
            .set_default("logging.format", "compact")?
            .set_default("logging.level", "info")?
            .add_source(
                config::Environment::with_prefix("DEPLOY_CENTER")
                    .separator("__")
                    .try_parsing(true),
            );

        let settings = builder.build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Decode [`Self::encryption_key_hex`] into the raw 32-byte AES key.
    pub fn encryption_key(&self) -> anyhow::Result<[u8; 32]> {
        let bytes = hex::decode(&self.encryption_key_hex)
            .map_err(|e| anyhow::anyhow!("ENCRYPTION_KEY is not valid hex: {e}"))?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| anyhow::anyhow!("ENCRYPTION_KEY must be 32 bytes, got {}", v.len()))
    }
}

/// Where and how to emit logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub target: LogTarget,
    pub format: LogFormat,
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_log_prefix")]
    pub log_prefix: String,
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_prefix() -> String {
    "deploy-center".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            target: LogTarget::Console,
            format: LogFormat::Compact,
            level: "info".to_string(),
            log_dir: default_log_dir(),
            log_prefix: default_log_prefix(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogTarget {
    Console,
    File,
    Both,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

/// Initialise `tracing` according to [`LoggingConfig`]. Returns a guard that
/// must be kept alive for the lifetime of the process when file logging is
/// enabled, so buffered writes are flushed on shutdown.
pub fn init_logging(config: &LoggingConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    match config.target {
        LogTarget::Console => {
            let subscriber = tracing_subscriber::registry().with(env_filter);
            init_console(subscriber, config.format);
            None
        }
        LogTarget::File => {
            let (writer, guard) = file_writer(config);
            let subscriber = tracing_subscriber::registry().with(env_filter);
            init_file(subscriber, config.format, writer);
            Some(guard)
        }
        LogTarget::Both => {
            let (writer, guard) = file_writer(config);
            let subscriber = tracing_subscriber::registry().with(env_filter);
            init_both(subscriber, config.format, writer);
            Some(guard)
        }
    }
}

fn file_writer(
    config: &LoggingConfig,
) -> (
    tracing_appender::non_blocking::NonBlocking,
    tracing_appender::non_blocking::WorkerGuard,
) {
    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("warning: failed to create log directory {:?}: {e}", config.log_dir);
    }
    let appender = tracing_appender::rolling::daily(&config.log_dir, &config.log_prefix);
    tracing_appender::non_blocking(appender)
}

fn init_console<S>(subscriber: S, format: LogFormat)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    match format {
        LogFormat::Json => subscriber.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer().pretty()).init(),
        LogFormat::Compact => subscriber.with(tracing_subscriber::fmt::layer().compact()).init(),
    }
}

fn init_file<S>(subscriber: S, format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    match format {
        LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json().with_writer(writer))
            .init(),
        LogFormat::Pretty => subscriber
            .with(tracing_subscriber::fmt::layer().pretty().with_writer(writer))
            .init(),
        LogFormat::Compact => subscriber
            .with(tracing_subscriber::fmt::layer().compact().with_writer(writer))
            .init(),
    }
}

fn init_both<S>(subscriber: S, format: LogFormat, writer: tracing_appender::non_blocking::NonBlocking)
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a> + Send + Sync,
{
    let console = tracing_subscriber::fmt::layer();
    let file = tracing_subscriber::fmt::layer().with_writer(writer).with_ansi(false);
    match format {
        LogFormat::Json => subscriber.with(console.json()).with(file.json()).init(),
        LogFormat::Pretty => subscriber.with(console.pretty()).with(file).init(),
        LogFormat::Compact => subscriber.with(console.compact()).with(file).init(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = EngineConfig::default();
        assert_eq!(config.min_free_disk_bytes, 5 * 1024 * 1024 * 1024);
        assert_eq!(config.keep_last_n, 5);
        assert_eq!(config.logging.target, LogTarget::Console);
    }

    #[test]
    fn encryption_key_rejects_wrong_length() {
        let mut config = EngineConfig::default();
        config.encryption_key_hex = hex::encode([0u8; 16]);
        assert!(config.encryption_key().is_err());
    }

    #[test]
    fn encryption_key_decodes_32_bytes() {
        let mut config = EngineConfig::default();
        config.encryption_key_hex = hex::encode([7u8; 32]);
        let key = config.encryption_key().unwrap();
        assert_eq!(key, [7u8; 32]);
    }
}
