use std::net::IpAddr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has an invalid value '{value}'")]
    Invalid { var: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub host: IpAddr,
    pub port: u16,
    pub jwt_secret: String,
    pub invoice_directory_url: String,
    pub invoice_fetch_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |var: &'static str| {
            lookup(var)
                .filter(|v| !v.trim().is_empty())
                .ok_or(ConfigError::Missing(var))
        };

        let host = match lookup("HOST") {
            Some(raw) => raw.parse::<IpAddr>().map_err(|_| ConfigError::Invalid { var: "HOST", value: raw })?,
            None => IpAddr::from([127, 0, 0, 1]),
        };
        let port = match lookup("PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::Invalid { var: "PORT", value: raw })?,
            None => 3000,
        };
        let timeout_secs: u64 = match lookup("INVOICE_FETCH_TIMEOUT_SECS") {
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    return Err(ConfigError::Invalid {
                        var: "INVOICE_FETCH_TIMEOUT_SECS",
                        value: raw,
                    })
                }
            },
            None => 10,
        };

        Ok(Config {
            database_url: required("DATABASE_URL")?,
            host,
            port,
            jwt_secret: required("JWT_SECRET")?,
            invoice_directory_url: required("INVOICE_DIRECTORY_URL")?,
            invoice_fetch_timeout: Duration::from_secs(timeout_secs),
        })
    }
}
