use std::env;
use std::str::FromStr;

use anyhow::{Context, Result};

/// Default bind/connect host for the metrics service.
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default port for the metrics service.
pub const DEFAULT_PORT: u16 = 8016;

/// Postgres connection settings shared by every process.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn from_env(default_max_connections: u32) -> Result<Self> {
        Ok(Self {
            url: env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?,
            max_connections: env_or("DATABASE_MAX_CONNECTIONS", default_max_connections)?,
        })
    }

    /// The URL with any password replaced, safe for logs.
    pub fn redacted_url(&self) -> String {
        redact_url(&self.url)
    }
}

/// Host and port of the metrics service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceAddress {
    pub host: String,
    pub port: u16,
}

impl ServiceAddress {
    /// `ONDEMAND_HOST` / `ONDEMAND_PORT`, overridden by `<SERVICE>_HOST` /
    /// `<SERVICE>_PORT` when a service name is given.
    pub fn from_env(service: Option<&str>) -> Result<Self> {
        let lookup = |suffix: &str| -> Option<String> {
            service
                .map(|name| format!("{}_{suffix}", name.to_uppercase().replace([' ', '-'], "_")))
                .and_then(|key| env::var(key).ok())
                .or_else(|| env::var(format!("ONDEMAND_{suffix}")).ok())
        };

        let host = lookup("HOST").unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match lookup("PORT") {
            Some(raw) => raw
                .parse()
                .with_context(|| format!("service port must be a number, got {raw:?}"))?,
            None => DEFAULT_PORT,
        };

        Ok(Self { host, port })
    }

    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read `key`, falling back to `default` when unset.
pub fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{key} has an invalid value {raw:?}")),
        Err(_) => Ok(default),
    }
}

/// Load a `.env` file if one exists. Missing files are not an error.
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn redact_url(url: &str) -> String {
    let Some(scheme_end) = url.find("://") else {
        return url.to_string();
    };
    let rest = &url[scheme_end + 3..];
    let Some(at) = rest.rfind('@') else {
        return url.to_string();
    };
    let credentials = &rest[..at];
    match credentials.find(':') {
        Some(colon) => format!(
            "{}{}:***{}",
            &url[..scheme_end + 3],
            &credentials[..colon],
            &rest[at..]
        ),
        None => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passwords_are_redacted() {
        assert_eq!(
            redact_url("postgres://spt:hunter2@db:5432/spt"),
            "postgres://spt:***@db:5432/spt"
        );
        assert_eq!(redact_url("postgres://db/spt"), "postgres://db/spt");
        assert_eq!(redact_url("postgres://spt@db/spt"), "postgres://spt@db/spt");
    }

    #[test]
    fn socket_addr_joins_host_and_port() {
        let address = ServiceAddress {
            host: "127.0.0.1".into(),
            port: 8016,
        };
        assert_eq!(address.socket_addr(), "127.0.0.1:8016");
    }

    #[test]
    fn env_or_falls_back_when_unset() {
        let value: u64 = env_or("SPT_TEST_SURELY_UNSET_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
