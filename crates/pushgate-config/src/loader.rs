//! Environment-variable configuration loader.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use tracing::info;

use crate::{
    ApnsConfig, ConfigError, EmailConfig, FcmConfig, SquashConfig, TelegramConfig, WebPushConfig,
    WebhookConfig,
};
use crate::AppConfig;

/// Reads the dispatcher's configuration surface from environment
/// variables, one struct field per documented variable.
pub struct ConfigLoader;

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self
    }

    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let api_addr = parse_env("API_ADDR", "0.0.0.0:8322")?;
        let queue_redis_url = env::var("QUEUE_REDIS_URL").ok().filter(|s| !s.is_empty());
        let queue_key_prefix =
            env::var("QUEUE_KEY_PREFIX").unwrap_or_else(|_| "pushgate".to_string());

        if queue_redis_url.is_some() {
            info!("persistent (redis) queue backend selected");
        } else {
            info!("in-memory queue backend selected");
        }

        Ok(AppConfig {
            api_addr,
            queue_redis_url,
            queue_key_prefix,
            apns: load_apns()?,
            fcm: load_fcm()?,
            webpush: load_webpush()?,
            telegram: load_telegram()?,
            webhook: load_webhook()?,
            email: load_email()?,
        })
    }
}

fn parse_env<T>(var: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw = env::var(var).unwrap_or_else(|_| default.to_string());
    raw.parse::<T>()
        .map_err(|e| ConfigError::InvalidValue { var, source: Box::new(e) })
}

fn opt_parse_env<T>(var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(var) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue { var, source: Box::new(e) }),
        Err(_) => Ok(default),
    }
}

fn non_empty(var: &str) -> Option<String> {
    env::var(var).ok().filter(|s| !s.is_empty())
}

fn load_apns() -> Result<Option<ApnsConfig>, ConfigError> {
    let certificate_path = non_empty("APNS_CERTIFICATE_PATH");
    let sandbox_certificate_path = non_empty("APNS_SANDBOX_CERTIFICATE_PATH");
    if certificate_path.is_none() && sandbox_certificate_path.is_none() {
        return Ok(None);
    }
    Ok(Some(ApnsConfig {
        certificate_path,
        sandbox_certificate_path,
        workers: opt_parse_env("APNS_WORKERS", 4usize)?,
    }))
}

fn load_fcm() -> Result<Option<FcmConfig>, ConfigError> {
    let Some(credentials_file) = non_empty("FCM_CREDENTIALS_FILE") else {
        return Ok(None);
    };
    Ok(Some(FcmConfig {
        credentials_file,
        workers: opt_parse_env("FCM_WORKERS", 4usize)?,
    }))
}

fn load_webpush() -> Result<Option<WebPushConfig>, ConfigError> {
    let (Some(vapid_public_key), Some(vapid_private_key)) = (
        non_empty("WEBPUSH_VAPID_PUBLIC_KEY"),
        non_empty("WEBPUSH_VAPID_PRIVATE_KEY"),
    ) else {
        return Ok(None);
    };
    Ok(Some(WebPushConfig {
        vapid_public_key,
        vapid_private_key,
        workers: opt_parse_env("WEBPUSH_WORKERS", 8usize)?,
    }))
}

fn load_telegram() -> Result<Option<TelegramConfig>, ConfigError> {
    let Some(bot_token) = non_empty("TELEGRAM_BOT_TOKEN") else {
        return Ok(None);
    };
    let rate_max = opt_parse_env("TELEGRAM_RATE_AMOUNT", 0u32)?;
    let rate_per_seconds = opt_parse_env("TELEGRAM_RATE_PER_SECONDS", 0u64)?;
    Ok(Some(TelegramConfig {
        bot_token,
        workers: opt_parse_env("TELEGRAM_WORKERS", 2usize)?,
        squash: SquashConfig::enabled(rate_max, rate_per_seconds),
    }))
}

fn load_webhook() -> Result<Option<WebhookConfig>, ConfigError> {
    let workers = opt_parse_env("WEBHOOK_WORKERS", 0usize)?;
    if workers == 0 {
        return Ok(None);
    }
    Ok(Some(WebhookConfig { workers }))
}

fn load_email() -> Result<Option<EmailConfig>, ConfigError> {
    let Some(host) = non_empty("EMAIL_HOST") else {
        return Ok(None);
    };
    let rate_max = opt_parse_env("EMAIL_RATE_AMOUNT", 0u32)?;
    let rate_per_seconds = opt_parse_env("EMAIL_RATE_PER_SECONDS", 0u64)?;
    Ok(Some(EmailConfig {
        host,
        port: opt_parse_env("EMAIL_PORT", 25u16)?,
        username: non_empty("EMAIL_USERNAME"),
        password: non_empty("EMAIL_PASSWORD"),
        plain_auth: opt_parse_env("EMAIL_PLAIN_AUTH", false)?,
        tls: opt_parse_env("EMAIL_TLS", false)?,
        tls_insecure: opt_parse_env("EMAIL_TLS_INSECURE", false)?,
        squash: SquashConfig::enabled(rate_max, rate_per_seconds),
    }))
}

#[allow(unused)]
fn parse_socket_addr(raw: &str) -> Result<SocketAddr, std::net::AddrParseError> {
    raw.parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_produce_in_memory_queue_and_no_providers() {
        // SAFETY: tests run single-threaded within this module's env scope.
        for var in [
            "QUEUE_REDIS_URL",
            "APNS_CERTIFICATE_PATH",
            "APNS_SANDBOX_CERTIFICATE_PATH",
            "FCM_CREDENTIALS_FILE",
            "WEBPUSH_VAPID_PUBLIC_KEY",
            "WEBPUSH_VAPID_PRIVATE_KEY",
            "TELEGRAM_BOT_TOKEN",
            "WEBHOOK_WORKERS",
            "EMAIL_HOST",
        ] {
            env::remove_var(var);
        }
        let cfg = ConfigLoader::new().load().unwrap();
        assert!(cfg.queue_redis_url.is_none());
        assert!(cfg.apns.is_none());
        assert!(cfg.fcm.is_none());
        assert!(cfg.webpush.is_none());
        assert!(cfg.telegram.is_none());
        assert!(cfg.webhook.is_none());
        assert!(cfg.email.is_none());
        assert_eq!(cfg.api_addr.to_string(), "0.0.0.0:8322");
    }
}
