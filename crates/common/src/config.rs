use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::types::Channel;

/// A credential that never shows up in `Debug` output.
#[derive(Clone, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(***)")
    }
}

/// Global application configuration loaded from environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Telegram Bot API settings (channel disabled when absent)
    pub telegram: Option<TelegramSettings>,

    /// SMTP settings (channel disabled when absent)
    pub smtp: Option<SmtpSettings>,

    /// SMPP gateway settings (channel disabled when absent)
    pub smpp: Option<SmppSettings>,

    /// Redis connection string for the delivery event stream
    pub redis_url: Option<String>,

    /// Redis stream key that receives delivery events
    pub event_stream_key: String,

    /// Dispatch core tuning
    pub dispatch: DispatchConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramSettings {
    pub bot_token: Secret,
    /// Bot API base URL (default: https://api.telegram.org)
    pub api_url: String,
    /// Long-poll timeout passed to `getUpdates`
    pub poll_timeout_secs: u64,
}

/// How the SMTP connection is secured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmtpTls {
    /// Plain connection upgraded with STARTTLS (port 587)
    Starttls,
    /// Implicit TLS (port 465)
    Tls,
    /// No encryption, for local relays and test servers
    None,
}

impl FromStr for SmtpTls {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "starttls" => Ok(SmtpTls::Starttls),
            "tls" => Ok(SmtpTls::Tls),
            "none" | "plain" => Ok(SmtpTls::None),
            other => Err(AppError::Config(format!(
                "SMTP_TLS must be one of starttls, tls, none (got '{}')",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<Secret>,
    pub tls: SmtpTls,
    /// Sender address (e.g. no-reply@example.com)
    pub from: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmppSettings {
    pub host: String,
    pub port: u16,
    pub system_id: String,
    pub password: Secret,
    pub system_type: String,
    /// Source address stamped on every submit_sm (e.g. "OTPService")
    pub source_addr: String,
}

/// Retry policy parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt
    pub base_delay: Duration,
    /// Multiplier applied per further attempt
    pub factor: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Total attempts before a request is abandoned
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            factor: 2.0,
            max_delay: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

/// Backoff for the per-channel reconnect loop.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Per-channel queue and worker limits.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelLimits {
    /// Maximum concurrent in-flight sends
    pub concurrency_limit: usize,
    /// Worker tasks pulling from the channel queue
    pub workers: usize,
    /// Maximum queued (not yet in-flight) requests
    pub queue_capacity: usize,
    /// Upper bound on a single send
    pub send_timeout: Duration,
}

impl Default for ChannelLimits {
    fn default() -> Self {
        Self {
            concurrency_limit: 4,
            workers: 4,
            queue_capacity: 1000,
            send_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DispatchConfig {
    pub retry: RetryConfig,
    pub reconnect: ReconnectConfig,
    /// Interval between transport heartbeats (SMPP enquire_link)
    pub heartbeat_interval: Duration,
    /// Terminal requests whose history is kept for status queries
    pub archive_capacity: usize,
    pub channels: HashMap<Channel, ChannelLimits>,
}

impl DispatchConfig {
    /// Limits for a channel, falling back to defaults.
    pub fn limits(&self, channel: Channel) -> ChannelLimits {
        self.channels.get(&channel).cloned().unwrap_or_default()
    }
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            reconnect: ReconnectConfig::default(),
            heartbeat_interval: Duration::from_secs(30),
            archive_capacity: 10_000,
            channels: Channel::ALL
                .iter()
                .map(|c| (*c, ChannelLimits::default()))
                .collect(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let telegram = match std::env::var("TELEGRAM_BOT_TOKEN").ok() {
            Some(token) => Some(TelegramSettings {
                bot_token: Secret::new(token),
                api_url: std::env::var("TELEGRAM_API_URL")
                    .unwrap_or_else(|_| "https://api.telegram.org".to_string()),
                poll_timeout_secs: env_parse("TELEGRAM_POLL_TIMEOUT_SECS", 30)?,
            }),
            None => None,
        };

        let smtp = match std::env::var("SMTP_HOST").ok() {
            Some(host) => Some(SmtpSettings {
                host,
                port: env_parse("SMTP_PORT", 587)?,
                username: std::env::var("SMTP_USERNAME").ok(),
                password: std::env::var("SMTP_PASSWORD").ok().map(Secret::new),
                tls: env_parse("SMTP_TLS", SmtpTls::Starttls)?,
                from: std::env::var("EMAIL_FROM").map_err(|_| {
                    AppError::Config("EMAIL_FROM is required with SMTP_HOST".to_string())
                })?,
            }),
            None => None,
        };

        let smpp = match std::env::var("SMPP_HOST").ok() {
            Some(host) => Some(SmppSettings {
                host,
                port: env_parse("SMPP_PORT", 2775)?,
                system_id: std::env::var("SMPP_SYSTEM_ID").map_err(|_| {
                    AppError::Config("SMPP_SYSTEM_ID is required with SMPP_HOST".to_string())
                })?,
                password: Secret::new(std::env::var("SMPP_PASSWORD").unwrap_or_default()),
                system_type: std::env::var("SMPP_SYSTEM_TYPE").unwrap_or_default(),
                source_addr: std::env::var("SMPP_SOURCE_ADDR").unwrap_or_default(),
            }),
            None => None,
        };

        let defaults = RetryConfig::default();
        let retry = RetryConfig {
            base_delay: env_millis("HERALD_RETRY_BASE_MS", defaults.base_delay)?,
            factor: env_parse("HERALD_RETRY_FACTOR", defaults.factor)?,
            max_delay: env_millis("HERALD_RETRY_MAX_DELAY_MS", defaults.max_delay)?,
            max_attempts: env_parse("HERALD_RETRY_MAX_ATTEMPTS", defaults.max_attempts)?,
        };
        if retry.max_attempts == 0 || retry.factor < 1.0 {
            return Err(AppError::Config(
                "HERALD_RETRY_MAX_ATTEMPTS must be >= 1 and HERALD_RETRY_FACTOR >= 1.0".to_string(),
            )
            .into());
        }

        let reconnect_defaults = ReconnectConfig::default();
        let reconnect = ReconnectConfig {
            base_delay: env_millis("HERALD_RECONNECT_BASE_MS", reconnect_defaults.base_delay)?,
            max_delay: env_millis("HERALD_RECONNECT_MAX_MS", reconnect_defaults.max_delay)?,
        };

        let mut channels = HashMap::new();
        for channel in Channel::ALL {
            channels.insert(channel, channel_limits_from_env(channel)?);
        }

        Ok(Self {
            telegram,
            smtp,
            smpp,
            redis_url: std::env::var("REDIS_URL").ok(),
            event_stream_key: std::env::var("EVENT_STREAM_KEY")
                .unwrap_or_else(|_| "herald:delivery_events".to_string()),
            dispatch: DispatchConfig {
                retry,
                reconnect,
                heartbeat_interval: Duration::from_secs(env_parse("HERALD_HEARTBEAT_SECS", 30)?),
                archive_capacity: env_parse("HERALD_ARCHIVE_CAPACITY", 10_000)?,
                channels,
            },
        })
    }

    /// Whether credentials for a channel were supplied.
    pub fn channel_enabled(&self, channel: Channel) -> bool {
        match channel {
            Channel::Telegram => self.telegram.is_some(),
            Channel::Email => self.smtp.is_some(),
            Channel::Sms => self.smpp.is_some(),
        }
    }
}

fn channel_limits_from_env(channel: Channel) -> anyhow::Result<ChannelLimits> {
    let prefix = channel.env_prefix();
    let defaults = ChannelLimits::default();
    let concurrency_limit = env_parse(
        &format!("HERALD_{prefix}_CONCURRENCY"),
        defaults.concurrency_limit,
    )?;
    let limits = ChannelLimits {
        concurrency_limit,
        workers: env_parse(&format!("HERALD_{prefix}_WORKERS"), concurrency_limit)?,
        queue_capacity: env_parse(
            &format!("HERALD_{prefix}_QUEUE_CAPACITY"),
            defaults.queue_capacity,
        )?,
        send_timeout: env_millis(
            &format!("HERALD_{prefix}_SEND_TIMEOUT_MS"),
            defaults.send_timeout,
        )?,
    };
    if limits.concurrency_limit == 0 || limits.workers == 0 {
        return Err(AppError::Config(format!(
            "HERALD_{prefix}_CONCURRENCY and HERALD_{prefix}_WORKERS must be at least 1"
        ))
        .into());
    }
    Ok(limits)
}

/// Parse an optional environment variable, falling back to `default`.
fn env_parse<T: FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| {
            AppError::Config(format!(
                "{} must be a valid {}",
                key,
                std::any::type_name::<T>()
            ))
            .into()
        }),
        Err(_) => Ok(default),
    }
}

fn env_millis(key: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_millis(env_parse(key, default.as_millis() as u64)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_defaults() {
        let retry = RetryConfig::default();
        assert_eq!(retry.base_delay, Duration::from_secs(1));
        assert_eq!(retry.factor, 2.0);
        assert_eq!(retry.max_attempts, 5);
    }

    #[test]
    fn test_dispatch_limits_fallback() {
        let mut config = DispatchConfig::default();
        config.channels.remove(&Channel::Sms);
        assert_eq!(config.limits(Channel::Sms).queue_capacity, 1000);
    }

    #[test]
    fn test_smtp_tls_parse() {
        assert_eq!("STARTTLS".parse::<SmtpTls>().unwrap(), SmtpTls::Starttls);
        assert_eq!("plain".parse::<SmtpTls>().unwrap(), SmtpTls::None);
        assert!("ssl3".parse::<SmtpTls>().is_err());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("hunter2");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        // SAFETY: test-local variable name, not read concurrently elsewhere.
        unsafe { std::env::set_var("HERALD_TEST_GARBAGE", "abc") };
        let err = env_parse::<u64>("HERALD_TEST_GARBAGE", 1).unwrap_err();
        assert!(matches!(err.downcast_ref::<AppError>(), Some(AppError::Config(_))));
        assert_eq!(env_parse::<u64>("HERALD_TEST_UNSET_KEY", 7).unwrap(), 7);
        unsafe { std::env::remove_var("HERALD_TEST_GARBAGE") };
    }

    #[test]
    fn test_zero_workers_is_config_error() {
        // SAFETY: test-local variable name, not read concurrently elsewhere.
        unsafe { std::env::set_var("HERALD_EMAIL_WORKERS", "0") };
        let err = channel_limits_from_env(Channel::Email).unwrap_err();
        unsafe { std::env::remove_var("HERALD_EMAIL_WORKERS") };

        let err = err.downcast_ref::<AppError>().unwrap();
        assert!(matches!(err, AppError::Config(_)));
        assert_eq!(err.kind(), crate::types::ErrorKind::Permanent);
    }

    #[test]
    fn test_channel_enabled_follows_credentials() {
        let mut config = AppConfig {
            telegram: None,
            smtp: None,
            smpp: None,
            redis_url: None,
            event_stream_key: "events".to_string(),
            dispatch: DispatchConfig::default(),
        };
        assert!(Channel::ALL.iter().all(|c| !config.channel_enabled(*c)));

        config.telegram = Some(TelegramSettings {
            bot_token: Secret::new("t"),
            api_url: "http://localhost".to_string(),
            poll_timeout_secs: 1,
        });
        assert!(config.channel_enabled(Channel::Telegram));
        assert!(!config.channel_enabled(Channel::Sms));
    }
}
