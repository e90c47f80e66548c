use crate::error::AppError;
use dotenvy::dotenv;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the durable message store (Postgres backend).
    pub database_url: String,
    /// How long a `send` may stay in flight before the provisional message
    /// is rolled back and the attempt reported as failed.
    pub send_timeout_ms: u64,
    /// Window within which a delivery-channel push is treated as the echo
    /// of this session's own pending write.
    pub echo_window_secs: i64,
    /// Maximum number of messages loaded when opening a conversation.
    pub history_limit: usize,
    /// Maximum characters of message content forwarded to the notification
    /// collaborator.
    pub preview_max_chars: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            send_timeout_ms: 10_000,
            echo_window_secs: 30,
            history_limit: 200,
            preview_max_chars: 100,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let defaults = Config::default();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| AppError::Config("DATABASE_URL must be set".to_string()))?;

        Ok(Self {
            database_url,
            send_timeout_ms: parse_env("SEND_TIMEOUT_MS", defaults.send_timeout_ms)?,
            echo_window_secs: parse_env("ECHO_WINDOW_SECS", defaults.echo_window_secs)?,
            history_limit: parse_env("HISTORY_LIMIT", defaults.history_limit)?,
            preview_max_chars: parse_env("PREVIEW_MAX_CHARS", defaults.preview_max_chars)?,
        })
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| AppError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = Config::default();
        assert_eq!(cfg.send_timeout(), Duration::from_millis(10_000));
        assert_eq!(cfg.history_limit, 200);
        assert!(cfg.echo_window_secs > 0);
    }
}
