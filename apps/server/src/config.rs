//! Server configuration read from the environment once at startup.

use std::net::SocketAddr;
use std::time::Duration;

use edgesync_core::sync::{DEFAULT_STORE_TIMEOUT, SCHEDULED_SYNC_INTERVAL_SECS};
use thiserror::Error;

pub const DATABASE_PATH_VAR: &str = "EDGESYNC_DATABASE_PATH";
pub const CLOUD_URL_VAR: &str = "EDGESYNC_CLOUD_URL";
pub const CLOUD_SERVICE_KEY_VAR: &str = "EDGESYNC_CLOUD_SERVICE_KEY";
pub const LISTEN_ADDR_VAR: &str = "EDGESYNC_LISTEN_ADDR";
pub const SYNC_INTERVAL_VAR: &str = "EDGESYNC_SYNC_INTERVAL_SECS";
pub const STORE_TIMEOUT_VAR: &str = "EDGESYNC_STORE_TIMEOUT_MS";
pub const ADMIN_TOKEN_VAR: &str = "EDGESYNC_ADMIN_TOKEN";
pub const SCHEDULED_SYNC_VAR: &str = "EDGESYNC_SCHEDULED_SYNC";

const DEFAULT_LISTEN_PORT: u16 = 8088;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

/// Credentials for the PostgREST endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloudConfig {
    pub url: String,
    pub service_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_path: String,
    /// `None` disables cloud sync; the server still serves health checks.
    pub cloud: Option<CloudConfig>,
    pub listen_addr: SocketAddr,
    pub sync_interval: Duration,
    pub store_timeout: Duration,
    pub admin_token: Option<String>,
    pub scheduled_sync: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_path = get(DATABASE_PATH_VAR).ok_or(ConfigError::Missing(DATABASE_PATH_VAR))?;

        let cloud = match (get(CLOUD_URL_VAR), get(CLOUD_SERVICE_KEY_VAR)) {
            (Some(url), Some(service_key)) => Some(CloudConfig {
                url: url.trim_end_matches('/').to_string(),
                service_key,
            }),
            _ => None,
        };

        let listen_addr = parse_var(
            LISTEN_ADDR_VAR,
            get(LISTEN_ADDR_VAR),
            SocketAddr::from(([0, 0, 0, 0], DEFAULT_LISTEN_PORT)),
        )?;
        let sync_interval = Duration::from_secs(parse_var(
            SYNC_INTERVAL_VAR,
            get(SYNC_INTERVAL_VAR),
            SCHEDULED_SYNC_INTERVAL_SECS,
        )?);
        let store_timeout = Duration::from_millis(parse_var(
            STORE_TIMEOUT_VAR,
            get(STORE_TIMEOUT_VAR),
            DEFAULT_STORE_TIMEOUT.as_millis() as u64,
        )?);
        if sync_interval.is_zero() {
            return Err(ConfigError::Invalid {
                var: SYNC_INTERVAL_VAR,
                value: "0".to_string(),
            });
        }

        let scheduled_sync = match get(SCHEDULED_SYNC_VAR) {
            None => true,
            Some(value) => parse_flag(&value).ok_or(ConfigError::Invalid {
                var: SCHEDULED_SYNC_VAR,
                value,
            })?,
        };

        Ok(Self {
            database_path,
            cloud,
            listen_addr,
            sync_interval,
            store_timeout,
            admin_token: get(ADMIN_TOKEN_VAR),
            scheduled_sync,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    var: &'static str,
    raw: Option<String>,
    default: T,
) -> Result<T, ConfigError> {
    match raw {
        None => Ok(default),
        Some(value) => value
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { var, value }),
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
