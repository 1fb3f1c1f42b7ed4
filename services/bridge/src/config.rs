//! Runtime configuration.
//!
//! Database and PBX settings come from the environment; AMI credentials can
//! additionally be overridden by the `asterisk_config` table (row
//! `name = 'default'`), which wins when present and complete.

use serde::{Deserialize, Serialize};

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub http_port: u16,
    pub default_trunk: String,
    pub asterisk: AsteriskEnv,
}

impl Config {
    pub fn from_env() -> Self {
        let db_host = env_or("DB_HOST", "localhost");
        let db_port = env_or("DB_PORT", "5432");
        let db_name = env_or("DB_NAME", "securebridge");
        let db_user = env_or("DB_USER", "postgres");
        let db_password = env_or("DB_PASSWORD", "postgres");

        Self {
            database_url: format!(
                "postgres://{db_user}:{db_password}@{db_host}:{db_port}/{db_name}"
            ),
            http_port: std::env::var("BRIDGE_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            default_trunk: env_or("TRUNK_NAME", "default"),
            asterisk: AsteriskEnv::from_env(),
        }
    }
}

/// AMI settings as read from the environment; any field may be absent.
#[derive(Debug, Clone, Default)]
pub struct AsteriskEnv {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub secret: Option<String>,
}

impl AsteriskEnv {
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("ASTERISK_HOST").ok().filter(|v| !v.is_empty()),
            port: std::env::var("ASTERISK_PORT").ok().and_then(|v| v.parse().ok()),
            username: std::env::var("ASTERISK_USERNAME")
                .ok()
                .filter(|v| !v.is_empty()),
            secret: std::env::var("ASTERISK_SECRET").ok(),
        }
    }

    /// Resolve to full credentials, or the list of missing settings.
    ///
    /// The secret is taken verbatim: no trimming, no re-encoding. Secrets with
    /// trailing whitespace must reach the wire byte-identical.
    pub fn credentials(&self) -> Result<AmiCredentials, Vec<&'static str>> {
        let mut missing = Vec::new();
        if self.host.is_none() {
            missing.push("ASTERISK_HOST");
        }
        if self.username.is_none() {
            missing.push("ASTERISK_USERNAME");
        }
        if self.secret.is_none() {
            missing.push("ASTERISK_SECRET");
        }
        match (&self.host, &self.username, &self.secret) {
            (Some(host), Some(username), Some(secret)) => Ok(AmiCredentials {
                host: host.clone(),
                port: self.port.unwrap_or(DEFAULT_AMI_PORT),
                username: username.clone(),
                secret: secret.clone(),
            }),
            _ => Err(missing),
        }
    }
}

pub const DEFAULT_AMI_PORT: u16 = 5038;

/// Fully resolved AMI login parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmiCredentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: String,
}

/// A row of the `asterisk_config` table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsteriskConfigRow {
    pub host: Option<String>,
    pub port: Option<i32>,
    pub username: Option<String>,
    pub secret: Option<String>,
}

impl AsteriskConfigRow {
    /// A row only overrides the environment when it actually carries a host.
    pub fn credentials(&self) -> Option<AmiCredentials> {
        let host = self.host.clone().filter(|h| !h.is_empty())?;
        Some(AmiCredentials {
            host,
            port: self
                .port
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or(DEFAULT_AMI_PORT),
            username: self.username.clone().unwrap_or_default(),
            secret: self.secret.clone().unwrap_or_default(),
        })
    }
}
