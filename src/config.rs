//! Runtime configuration.
//!
//! Everything is sourced from the environment (`.env` via dotenv, or
//! `.env.test` in test mode) and snapshotted into a typed [`Settings`]
//! struct at boot. Components never read the environment directly.

use std::time::Duration;

use tracing::warn;

use crate::util::{env_bool, env_opt, env_parse, env_string};

/// One SMTP account from the configured pool.
#[derive(Debug, Clone)]
pub struct SmtpAccount {
    pub email: String,
    /// Opaque secret; resolved right before use and never logged in full.
    pub password: String,
}

/// Email channel settings.
#[derive(Debug, Clone)]
pub struct SmtpSettings {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    pub use_tls: bool,
    pub from_name: String,
    pub accounts: Vec<SmtpAccount>,
}

/// Persistence target settings.
#[derive(Debug, Clone)]
pub struct DbSettings {
    /// Engine selector (`DB_TYPE`); the built-in backend is `sqlite`.
    pub db_type: String,
    /// SQLite database path (`DB_PATH`).
    pub path: String,
}

/// Fully resolved service settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub http_host: String,
    /// Base admin/lock port; offset by `chunk_number - 1` per instance.
    pub http_port: u16,
    pub admin_domain: String,

    pub db: DbSettings,

    // Chat channel
    pub telegram_throttle_seconds: u64,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,

    // Webhook channel
    pub webhook_enabled: bool,
    pub webhook_throttle_seconds: u64,
    pub webhook_timeout: u64,
    pub webhook_max_retries: u32,

    // Push channel
    pub firebase_throttle_seconds: u64,
    pub firebase_service_account_path: String,

    // Email channel
    pub email_throttle_seconds: u64,
    pub smtp: SmtpSettings,

    // Throttle curve
    pub consecutive_error_threshold: u32,
    pub extended_alert_interval_minutes: u64,
    pub count_send_alert_before_extended_interval: u32,

    // Runtime sizing
    pub max_concurrent_checks: usize,
    pub connection_pool_size: u32,
    pub http_timeout: u64,
}

impl Settings {
    /// Snapshot settings from the current environment.
    pub fn from_env() -> Self {
        Self {
            http_host: env_string("HTTP_HOST", "127.0.0.1"),
            http_port: env_parse("HTTP_PORT", 8080u16),
            admin_domain: env_string("ADMIN_DOMAIN", "monitor.example.com"),

            db: DbSettings {
                db_type: env_string("DB_TYPE", "sqlite"),
                path: env_string("DB_PATH", "./monitor.db"),
            },

            telegram_throttle_seconds: env_parse("TELEGRAM_THROTTLE_SECONDS", 30u64),
            telegram_bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            telegram_chat_id: env_opt("TELEGRAM_CHAT_ID"),

            webhook_enabled: env_bool("WEBHOOK_ENABLED", true),
            webhook_throttle_seconds: env_parse("WEBHOOK_THROTTLE_SECONDS", 30u64),
            webhook_timeout: env_parse("WEBHOOK_TIMEOUT", 10u64),
            webhook_max_retries: env_parse("WEBHOOK_MAX_RETRIES", 2u32),

            firebase_throttle_seconds: env_parse("FIREBASE_THROTTLE_SECONDS", 30u64),
            firebase_service_account_path: env_string(
                "FIREBASE_SERVICE_ACCOUNT_PATH",
                "firebase_service_account.json",
            ),

            email_throttle_seconds: env_parse("EMAIL_THROTTLE_SECONDS", 300u64),
            smtp: Self::smtp_from_env(),

            consecutive_error_threshold: env_parse("CONSECUTIVE_ERROR_THRESHOLD", 10u32),
            extended_alert_interval_minutes: env_parse("EXTENDED_ALERT_INTERVAL_MINUTES", 5u64),
            count_send_alert_before_extended_interval: env_parse(
                "COUNT_SEND_ALERT_BEFORE_EXTENDED_INTERVAL",
                5u32,
            ),

            max_concurrent_checks: env_parse("MAX_CONCURRENT_CHECKS", 500usize),
            connection_pool_size: env_parse("CONNECTION_POOL_SIZE", 50u32),
            http_timeout: env_parse("HTTP_TIMEOUT", 30u64),
        }
    }

    fn smtp_from_env() -> SmtpSettings {
        // Accounts are numbered SMTP_ACCOUNT_1_EMAIL/_PASSWORD upwards;
        // scanning stops at the first gap.
        let mut accounts = Vec::new();
        for i in 1.. {
            let email = env_opt(&format!("SMTP_ACCOUNT_{i}_EMAIL"));
            let password = env_opt(&format!("SMTP_ACCOUNT_{i}_PASSWORD"));
            match (email, password) {
                (Some(email), Some(password)) => accounts.push(SmtpAccount { email, password }),
                _ => break,
            }
        }

        let enabled = env_bool("SMTP_ENABLED", false);
        if enabled && accounts.is_empty() {
            warn!("SMTP_ENABLED is set but no SMTP accounts are configured");
        }

        SmtpSettings {
            enabled,
            host: env_string("SMTP_HOST", "smtp.gmail.com"),
            port: env_parse("SMTP_PORT", 587u16),
            use_tls: env_bool("SMTP_USE_TLS", true),
            from_name: env_string("SMTP_FROM_NAME", "Monitor Alert System"),
            accounts,
        }
    }

    /// Listen port for a given chunk number (1-based).
    pub fn port_for_chunk(&self, chunk_number: u32) -> u16 {
        self.http_port + (chunk_number.saturating_sub(1)) as u16
    }

    pub fn http_timeout_duration(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

/// `--chunk=K-S` slice assignment for one process instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// 1-based chunk number.
    pub number: u32,
    /// Items per chunk.
    pub size: usize,
}

impl Chunk {
    /// Parse the `K-S` form; `1-300` selects the first 300 enabled items.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let (number, size) = raw
            .split_once('-')
            .ok_or_else(|| anyhow::anyhow!("invalid chunk format '{raw}', expected K-S"))?;
        let number: u32 = number
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid chunk number in '{raw}'"))?;
        let size: usize = size
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid chunk size in '{raw}'"))?;
        if number == 0 || size == 0 {
            anyhow::bail!("chunk number and size must both be positive: '{raw}'");
        }
        Ok(Self { number, size })
    }

    /// Offset of the first item in this chunk.
    pub fn offset(&self) -> usize {
        (self.number as usize - 1) * self.size
    }

    /// Slice `ids` down to this chunk's window.
    pub fn apply<T: Clone>(&self, items: &[T]) -> Vec<T> {
        let start = self.offset().min(items.len());
        let end = (start + self.size).min(items.len());
        items[start..end].to_vec()
    }
}

/// Per-process run options from the command line.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub chunk: Option<Chunk>,
    pub limit: Option<usize>,
    pub test_env: bool,
}

impl RunOptions {
    pub fn chunk_number(&self) -> u32 {
        self.chunk.map(|c| c.number).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_chunk_parse_valid() {
        let chunk = Chunk::parse("2-300").unwrap();
        assert_eq!(chunk.number, 2);
        assert_eq!(chunk.size, 300);
        assert_eq!(chunk.offset(), 300);
    }

    #[test]
    fn test_chunk_parse_rejects_garbage() {
        assert!(Chunk::parse("nope").is_err());
        assert!(Chunk::parse("0-10").is_err());
        assert!(Chunk::parse("1-0").is_err());
        assert!(Chunk::parse("1-abc").is_err());
    }

    #[test]
    fn test_chunk_apply_slices_window() {
        let items: Vec<i64> = (0..10).collect();
        assert_eq!(Chunk { number: 1, size: 4 }.apply(&items), vec![0, 1, 2, 3]);
        assert_eq!(Chunk { number: 3, size: 4 }.apply(&items), vec![8, 9]);
        assert_eq!(Chunk { number: 4, size: 4 }.apply(&items), Vec::<i64>::new());
    }

    #[test]
    fn test_port_for_chunk_offsets_base_port() {
        let mut settings = Settings::from_env();
        settings.http_port = 9000;
        assert_eq!(settings.port_for_chunk(1), 9000);
        assert_eq!(settings.port_for_chunk(3), 9002);
    }
}
