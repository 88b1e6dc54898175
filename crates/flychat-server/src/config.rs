use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use flychat_gateway::GatewaySettings;

pub const DEV_JWT_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreKind {
    Sqlite(PathBuf),
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub addr: SocketAddr,
    pub jwt_secret: String,
    pub token_ttl_days: i64,
    pub store: StoreKind,
    pub gateway: GatewaySettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let host = get("FLYCHAT_HOST", "0.0.0.0");
        let port: u16 = parse(&lookup, "FLYCHAT_PORT", 3000)?;
        let addr: SocketAddr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", host, port))?;

        let store = match get("FLYCHAT_STORE", "sqlite").as_str() {
            "sqlite" => StoreKind::Sqlite(PathBuf::from(get("FLYCHAT_DB_PATH", "flychat.db"))),
            "memory" => StoreKind::Memory,
            other => bail!("FLYCHAT_STORE must be 'sqlite' or 'memory', got '{}'", other),
        };

        let token_ttl_days: i64 = parse(&lookup, "FLYCHAT_TOKEN_TTL_DAYS", 7)?;
        if token_ttl_days < 1 {
            bail!("FLYCHAT_TOKEN_TTL_DAYS must be at least 1");
        }

        let outbound_capacity: usize = parse(&lookup, "FLYCHAT_OUTBOUND_CAPACITY", 256)?;
        if outbound_capacity == 0 {
            bail!("FLYCHAT_OUTBOUND_CAPACITY must be at least 1");
        }

        let auth_timeout_secs: u64 = parse(&lookup, "FLYCHAT_AUTH_TIMEOUT_SECS", 10)?;
        if auth_timeout_secs == 0 {
            bail!("FLYCHAT_AUTH_TIMEOUT_SECS must be at least 1");
        }

        let heartbeat_secs: u64 = parse(&lookup, "FLYCHAT_HEARTBEAT_SECS", 15)?;
        if heartbeat_secs == 0 {
            bail!("FLYCHAT_HEARTBEAT_SECS must be at least 1");
        }

        Ok(Self {
            addr,
            jwt_secret: get("FLYCHAT_JWT_SECRET", DEV_JWT_SECRET),
            token_ttl_days,
            store,
            gateway: GatewaySettings {
                auth_timeout: Duration::from_secs(auth_timeout_secs),
                outbound_capacity,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
            },
        })
    }

    pub fn uses_dev_secret(&self) -> bool {
        self.jwt_secret == DEV_JWT_SECRET
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[]).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.store, StoreKind::Sqlite(PathBuf::from("flychat.db")));
        assert_eq!(config.token_ttl_days, 7);
        assert_eq!(config.gateway.auth_timeout, Duration::from_secs(10));
        assert_eq!(config.gateway.outbound_capacity, 256);
        assert_eq!(config.gateway.heartbeat_interval, Duration::from_secs(15));
        assert!(config.uses_dev_secret());
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("FLYCHAT_HOST", "127.0.0.1"),
            ("FLYCHAT_PORT", "8080"),
            ("FLYCHAT_STORE", "memory"),
            ("FLYCHAT_JWT_SECRET", "s3cret"),
            ("FLYCHAT_HEARTBEAT_SECS", "5"),
        ])
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.store, StoreKind::Memory);
        assert_eq!(config.gateway.heartbeat_interval, Duration::from_secs(5));
        assert!(!config.uses_dev_secret());
    }

    #[test]
    fn invalid_values_are_startup_errors() {
        assert!(config(&[("FLYCHAT_PORT", "eighty")]).is_err());
        assert!(config(&[("FLYCHAT_STORE", "postgres")]).is_err());
        assert!(config(&[("FLYCHAT_OUTBOUND_CAPACITY", "0")]).is_err());
        assert!(config(&[("FLYCHAT_TOKEN_TTL_DAYS", "-1")]).is_err());
        assert!(config(&[("FLYCHAT_HEARTBEAT_SECS", "0")]).is_err());
        assert!(config(&[("FLYCHAT_AUTH_TIMEOUT_SECS", "0")]).is_err());
        assert!(config(&[("FLYCHAT_HEARTBEAT_SECS", "-5")]).is_err());
        assert!(config(&[("FLYCHAT_AUTH_TIMEOUT_SECS", "1")]).is_ok());
    }
}
