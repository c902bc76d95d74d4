use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};

use talksy_gateway::SyncConfig;

/// Secrets that ship in sample `.env` files. Refused at startup.
const PLACEHOLDER_SECRETS: &[&str] = &["", "changeme", "change-me", "dev-secret-change-me", "secret"];

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub blob_dir: PathBuf,
    pub public_url: String,
    pub sync: SyncConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key -> value source.
    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var_or = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.into());

        let host = var_or("TALKSY_HOST", "0.0.0.0");
        let port: u16 = parse_var(&lookup, "TALKSY_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let jwt_secret = lookup("TALKSY_JWT_SECRET").context("TALKSY_JWT_SECRET must be set")?;
        check_secret(&jwt_secret)?;

        let defaults = SyncConfig::default();
        let sync = SyncConfig {
            heartbeat_interval: secs_var(&lookup, "TALKSY_HEARTBEAT_SECS", defaults.heartbeat_interval)?,
            reconcile_interval: secs_var(&lookup, "TALKSY_RECONCILE_SECS", defaults.reconcile_interval)?,
            online_window: secs_var(&lookup, "TALKSY_ONLINE_WINDOW_SECS", defaults.online_window)?,
            pull_timeout: secs_var(&lookup, "TALKSY_PULL_TIMEOUT_SECS", defaults.pull_timeout)?,
            transient_budget: parse_var(&lookup, "TALKSY_TRANSIENT_BUDGET", defaults.transient_budget)?,
        };
        check_sync(&sync)?;

        Ok(Self {
            addr,
            db_path: PathBuf::from(var_or("TALKSY_DB_PATH", "talksy.db")),
            jwt_secret,
            blob_dir: PathBuf::from(var_or("TALKSY_BLOB_DIR", "./blobs")),
            public_url: var_or("TALKSY_PUBLIC_URL", "http://localhost:3000"),
            sync,
        })
    }
}

fn check_secret(secret: &str) -> anyhow::Result<()> {
    if PLACEHOLDER_SECRETS.contains(&secret.trim()) {
        bail!("TALKSY_JWT_SECRET is a placeholder; set a real secret");
    }
    Ok(())
}

/// A zero pull timeout would abandon every pull.
fn check_sync(sync: &SyncConfig) -> anyhow::Result<()> {
    if sync.heartbeat_interval.is_zero() || sync.reconcile_interval.is_zero() {
        bail!("heartbeat and reconcile intervals must be positive");
    }
    if sync.pull_timeout.is_zero() {
        bail!("TALKSY_PULL_TIMEOUT_SECS must be positive");
    }
    Ok(())
}

fn parse_var<T>(lookup: impl Fn(&str) -> Option<String>, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

fn secs_var(
    lookup: impl Fn(&str) -> Option<String>,
    key: &str,
    default: Duration,
) -> anyhow::Result<Duration> {
    parse_var(lookup, key, default.as_secs()).map(Duration::from_secs)
}
