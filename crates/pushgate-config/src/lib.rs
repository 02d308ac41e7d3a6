//! Typed, environment-driven configuration for the dispatcher.
//!
//! Unlike a TOML-driven configuration tree, this system's surface is a
//! small, flag-shaped set of options (mirroring the source CLI tool's
//! per-provider flags) — so each field is read straight from an
//! environment variable with a documented default, validated once at
//! startup.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod loader;

pub use loader::ConfigLoader;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {source}")]
    InvalidValue {
        var: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Root application configuration. Each provider's sub-config is `None`
/// when the provider's required credential is unset, meaning the service
/// is simply not registered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub api_addr: SocketAddr,
    pub queue_redis_url: Option<String>,
    pub queue_key_prefix: String,
    pub apns: Option<ApnsConfig>,
    pub fcm: Option<FcmConfig>,
    pub webpush: Option<WebPushConfig>,
    pub telegram: Option<TelegramConfig>,
    pub webhook: Option<WebhookConfig>,
    pub email: Option<EmailConfig>,
}

impl AppConfig {
    /// Load from environment variables, applying documented defaults.
    pub fn load() -> Result<Self, ConfigError> {
        ConfigLoader::new().load()
    }
}

/// Rate-limiting / squashing knobs shared by every squashable provider.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SquashConfig {
    pub rate_max: u32,
    pub rate_per_seconds: u64,
}

impl SquashConfig {
    /// `None` when either side of the pair is zero/unset — squashing is
    /// an opt-in feature per provider.
    pub fn enabled(rate_max: u32, rate_per_seconds: u64) -> Option<Self> {
        if rate_max == 0 || rate_per_seconds == 0 {
            None
        } else {
            Some(Self {
                rate_max,
                rate_per_seconds,
            })
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApnsConfig {
    pub certificate_path: Option<String>,
    pub sandbox_certificate_path: Option<String>,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FcmConfig {
    pub credentials_file: String,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebPushConfig {
    pub vapid_public_key: String,
    pub vapid_private_key: String,
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    pub workers: usize,
    pub squash: Option<SquashConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub plain_auth: bool,
    pub tls: bool,
    pub tls_insecure: bool,
    pub squash: Option<SquashConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn squash_config_disabled_when_either_side_zero() {
        assert!(SquashConfig::enabled(0, 10).is_none());
        assert!(SquashConfig::enabled(5, 0).is_none());
        assert!(SquashConfig::enabled(5, 10).is_some());
    }
}
