use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Process-wide server configuration, read once at startup.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ServerSettings {
    pub database_url: String,
    pub pool_size: u32,
    /// Minimum time between two enrollments of the same osquery host id.
    pub enroll_cooldown_seconds: u64,
    /// How long check-ins are buffered before `seen_time` is flushed.
    pub seen_flush_seconds: u64,
    pub carve_cleanup_seconds: u64,
    pub incoming_cleanup_seconds: u64,
    pub log_spec: String,
    pub log_dir: String,
    pub background_tasks: bool,
}

impl ServerSettings {
    /// Load settings from `DATABASE_URL` and `FLEET_*` environment variables,
    /// falling back to defaults for anything missing or malformed.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env::var("DATABASE_URL").unwrap_or(defaults.database_url),
            pool_size: env_or("FLEET_POOL_SIZE", defaults.pool_size),
            enroll_cooldown_seconds: env_or(
                "FLEET_ENROLL_COOLDOWN_SECS",
                defaults.enroll_cooldown_seconds,
            ),
            seen_flush_seconds: env_or("FLEET_SEEN_FLUSH_SECS", defaults.seen_flush_seconds),
            carve_cleanup_seconds: env_or(
                "FLEET_CARVE_CLEANUP_SECS",
                defaults.carve_cleanup_seconds,
            ),
            incoming_cleanup_seconds: env_or(
                "FLEET_INCOMING_CLEANUP_SECS",
                defaults.incoming_cleanup_seconds,
            ),
            log_spec: env::var("FLEET_LOG_SPEC").unwrap_or(defaults.log_spec),
            log_dir: env::var("FLEET_LOG_DIR").unwrap_or(defaults.log_dir),
            background_tasks: env_or("FLEET_BACKGROUND_TASKS", defaults.background_tasks),
        }
    }

    pub fn enroll_cooldown(&self) -> Duration {
        Duration::from_secs(self.enroll_cooldown_seconds)
    }

    pub fn seen_flush_interval(&self) -> Duration {
        Duration::from_secs(self.seen_flush_seconds.max(1))
    }

    pub fn carve_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.carve_cleanup_seconds.max(1))
    }

    pub fn incoming_cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.incoming_cleanup_seconds.max(1))
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            database_url: "fleet.db".to_string(),
            pool_size: 8,
            enroll_cooldown_seconds: 0,
            seen_flush_seconds: 10,
            carve_cleanup_seconds: 3600,
            incoming_cleanup_seconds: 60,
            log_spec: "info".to_string(),
            log_dir: "logs".to_string(),
            background_tasks: true,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => parse_or(key, &raw, default),
        Err(_) => default,
    }
}

fn parse_or<T: FromStr>(key: &str, raw: &str, default: T) -> T {
    match raw.trim().parse() {
        Ok(v) => v,
        Err(_) => {
            log::warn!("ignoring malformed {}={:?}, using default", key, raw);
            default
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_values_fall_back_to_default() {
        assert_eq!(parse_or("FLEET_POOL_SIZE", "twelve", 8u32), 8);
        assert_eq!(parse_or("FLEET_POOL_SIZE", " 12 ", 8u32), 12);
        assert!(!parse_or("FLEET_BACKGROUND_TASKS", "false", true));
    }

    #[test]
    fn intervals_are_never_zero() {
        let settings = ServerSettings {
            seen_flush_seconds: 0,
            ..ServerSettings::default()
        };
        assert_eq!(settings.seen_flush_interval(), Duration::from_secs(1));
        assert_eq!(settings.enroll_cooldown(), Duration::ZERO);
    }
}
