//! Environment-variable configuration for the gateway.
//!
//! Unlike a TOML-file config, every setting here comes from the process
//! environment so the gateway can be configured the way a single-purpose
//! sidecar usually is: through the container/lambda environment, not a
//! mounted file.

use anyhow::{Context, bail};
use secrecy::SecretString;
use std::time::Duration;

const DEFAULT_AWS_REGION: &str = "us-east-1";
const DEFAULT_RATE_LIMIT_REQUESTS: u32 = 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECS: u64 = 60;
const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_LOG_FILTER: &str = "info";

/// Fully validated gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub log_filter: String,
    pub aws_region: String,
    pub require_api_key: bool,
    pub master_api_key: Option<SecretString>,
    pub rate_limit: RateLimitConfig,
    pub enable_vision: bool,
    pub enable_tool_use: bool,
    pub enable_extended_thinking: bool,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests: u32,
    pub window: Duration,
}

impl Config {
    /// Loads configuration from the process environment, applying defaults
    /// and then validating the combination of settings.
    pub fn load_from_env() -> anyhow::Result<Self> {
        let config = Self {
            listen_addr: env_or("LISTEN_ADDR", DEFAULT_LISTEN_ADDR),
            log_filter: env_or("RUST_LOG", DEFAULT_LOG_FILTER),
            aws_region: env_or("AWS_REGION", DEFAULT_AWS_REGION),
            require_api_key: env_bool("REQUIRE_API_KEY", false)?,
            master_api_key: env_opt("MASTER_API_KEY").map(SecretString::from),
            rate_limit: RateLimitConfig {
                enabled: env_bool("RATE_LIMIT_ENABLED", false)?,
                requests: env_u32("RATE_LIMIT_REQUESTS", DEFAULT_RATE_LIMIT_REQUESTS)?,
                window: Duration::from_secs(env_u64("RATE_LIMIT_WINDOW", DEFAULT_RATE_LIMIT_WINDOW_SECS)?),
            },
            enable_vision: env_bool("ENABLE_VISION", true)?,
            enable_tool_use: env_bool("ENABLE_TOOL_USE", true)?,
            enable_extended_thinking: env_bool("ENABLE_EXTENDED_THINKING", false)?,
        };

        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.require_api_key && self.master_api_key.is_none() {
            bail!(
                "REQUIRE_API_KEY is set but MASTER_API_KEY is empty.\n\
                 \n\
                 Set a master key the gateway can use to bootstrap authentication:\n\
                 \n\
                 \x20\x20REQUIRE_API_KEY=true\n\
                 \x20\x20MASTER_API_KEY=sk-...\n"
            );
        }

        if self.rate_limit.enabled && self.rate_limit.requests == 0 {
            bail!(
                "RATE_LIMIT_ENABLED is set but RATE_LIMIT_REQUESTS is zero.\n\
                 \n\
                 Set how many requests a key may make per window:\n\
                 \n\
                 \x20\x20RATE_LIMIT_ENABLED=true\n\
                 \x20\x20RATE_LIMIT_REQUESTS=60\n\
                 \x20\x20RATE_LIMIT_WINDOW=60\n"
            );
        }

        if self.rate_limit.enabled && self.rate_limit.window.is_zero() {
            bail!("RATE_LIMIT_ENABLED is set but RATE_LIMIT_WINDOW is zero, which never refills the bucket.");
        }

        Ok(())
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_bool(key: &str, default: bool) -> anyhow::Result<bool> {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => bail!("{key} must be a boolean (true/false), got '{other}'"),
        },
        Err(_) => Ok(default),
    }
}

fn env_u32(key: &str, default: u32) -> anyhow::Result<u32> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

fn env_u64(key: &str, default: u64) -> anyhow::Result<u64> {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().with_context(|| format!("{key} must be a non-negative integer, got '{raw}'")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize tests that touch them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn clear_all() {
        for key in [
            "LISTEN_ADDR",
            "RUST_LOG",
            "AWS_REGION",
            "REQUIRE_API_KEY",
            "MASTER_API_KEY",
            "RATE_LIMIT_ENABLED",
            "RATE_LIMIT_REQUESTS",
            "RATE_LIMIT_WINDOW",
            "ENABLE_VISION",
            "ENABLE_TOOL_USE",
            "ENABLE_EXTENDED_THINKING",
        ] {
            unsafe { std::env::remove_var(key) };
        }
    }

    #[test]
    fn defaults_are_permissive_and_valid() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();

        let config = Config::load_from_env().unwrap();

        assert_eq!(config.listen_addr, DEFAULT_LISTEN_ADDR);
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
        assert_eq!(config.aws_region, DEFAULT_AWS_REGION);
        assert!(!config.require_api_key);
        assert!(config.master_api_key.is_none());
        assert!(!config.rate_limit.enabled);
        assert!(config.enable_vision);
        assert!(config.enable_tool_use);
        assert!(!config.enable_extended_thinking);
    }

    #[test]
    fn require_api_key_without_master_key_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("REQUIRE_API_KEY", "true") };

        let err = Config::load_from_env().unwrap_err();

        assert!(err.to_string().contains("MASTER_API_KEY"));
    }

    #[test]
    fn rate_limit_enabled_with_zero_requests_fails() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("RATE_LIMIT_ENABLED", "true") };
        unsafe { std::env::set_var("RATE_LIMIT_REQUESTS", "0") };

        let err = Config::load_from_env().unwrap_err();

        assert!(err.to_string().contains("RATE_LIMIT_REQUESTS"));
    }

    #[test]
    fn invalid_bool_is_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        clear_all();
        unsafe { std::env::set_var("ENABLE_VISION", "maybe") };

        let err = Config::load_from_env().unwrap_err();

        assert!(err.to_string().contains("ENABLE_VISION"));
    }
}
