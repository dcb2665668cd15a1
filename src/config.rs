use crate::services::storage_service::StoreSettings;
use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt::Display, str::FromStr, time::Duration};

const ENV_PREFIX: &str = "EPHEMERAL_STORE_";

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    pub retention_window: Duration,
    pub chunk_size: usize,
    pub sweep_interval: Duration,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "One-time download object store")]
pub struct Args {
    /// Host to bind to (overrides EPHEMERAL_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EPHEMERAL_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunks are stored (overrides EPHEMERAL_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides EPHEMERAL_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Seconds an unredeemed object is kept (overrides EPHEMERAL_STORE_RETENTION_SECS)
    #[arg(long)]
    pub retention_secs: Option<u64>,

    /// Bytes per stored chunk (overrides EPHEMERAL_STORE_CHUNK_SIZE)
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Seconds between background sweeps (overrides EPHEMERAL_STORE_SWEEP_INTERVAL_SECS)
    #[arg(long)]
    pub sweep_interval_secs: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::merge(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI values over `lookup` (environment) values over defaults.
    pub fn merge<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = env_or(&lookup, "HOST", "0.0.0.0".to_string())?;
        let env_port = env_or(&lookup, "PORT", 3000u16)?;
        let env_storage = env_or(&lookup, "STORAGE_DIR", "./data/chunks".to_string())?;
        let env_db = env_or(
            &lookup,
            "DATABASE_URL",
            "sqlite://./data/meta/ephemeral_store.db".to_string(),
        )?;
        let defaults = StoreSettings::default();
        let env_retention = env_or(&lookup, "RETENTION_SECS", defaults.retention_window.as_secs())?;
        let env_chunk = env_or(&lookup, "CHUNK_SIZE", defaults.chunk_size)?;
        let env_sweep = env_or(
            &lookup,
            "SWEEP_INTERVAL_SECS",
            defaults.sweep_interval.as_secs(),
        )?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            retention_window: Duration::from_secs(args.retention_secs.unwrap_or(env_retention)),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            sweep_interval: Duration::from_secs(args.sweep_interval_secs.unwrap_or(env_sweep)),
        };

        if cfg.chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }
        if cfg.retention_window.is_zero() {
            bail!("retention window must be greater than zero");
        }
        if cfg.sweep_interval.is_zero() {
            bail!("sweep interval must be greater than zero");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            retention_window: self.retention_window,
            chunk_size: self.chunk_size,
            sweep_interval: self.sweep_interval,
        }
    }
}

/// Read `EPHEMERAL_STORE_{suffix}`, falling back to `default` when unset.
fn env_or<F, T>(lookup: &F, suffix: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: Display,
{
    let key = format!("{}{}", ENV_PREFIX, suffix);
    match lookup(&key) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}
