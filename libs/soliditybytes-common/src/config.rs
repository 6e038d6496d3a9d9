// Application configuration
// Every setting comes from the environment with a working default.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: '{value}' ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Limits applied to a single submission's run and its output stream.
#[derive(Debug, Clone)]
pub struct StreamLimits {
    /// Wall-clock budget from submission start, install included
    pub run_timeout: Duration,
    /// Cumulative bytes of `log` chunks delivered before truncation
    pub max_output_bytes: usize,
    pub keepalive: Duration,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(300),
            max_output_bytes: 200 * 1024,
            keepalive: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub port: u16,
    /// Allowed CORS origins; empty means any origin
    pub frontend_origins: Vec<String>,
    pub content_root: PathBuf,
    pub workspace_root: PathBuf,
    pub data_dir: PathBuf,
    pub toolchain_config: PathBuf,
    pub limits: StreamLimits,
    /// How long a finished submission stays retrievable
    pub submission_grace: Duration,
    pub max_override_bytes: usize,
    pub dev_login: bool,
    pub session_ttl: Duration,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3001,
            frontend_origins: Vec::new(),
            content_root: PathBuf::from("exercises"),
            workspace_root: PathBuf::from(".runner/workspaces"),
            data_dir: PathBuf::from(".data"),
            toolchain_config: PathBuf::from("config/toolchain.json"),
            limits: StreamLimits::default(),
            submission_grace: Duration::from_secs(5 * 60),
            max_override_bytes: 1024 * 1024,
            dev_login: false,
            session_ttl: Duration::from_secs(7 * 24 * 3600),
            log_format: LogFormat::Text,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup; unset keys keep defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(addr) = lookup("BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            config.port = parse("PORT", &port)?;
        }
        if let Some(origins) = lookup("FRONTEND_ORIGIN") {
            config.frontend_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(root) = lookup("CONTENT_ROOT") {
            config.content_root = PathBuf::from(root);
        }
        if let Some(root) = lookup("WORKSPACE_ROOT") {
            config.workspace_root = PathBuf::from(root);
        }
        if let Some(dir) = lookup("DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(path) = lookup("TOOLCHAIN_CONFIG") {
            config.toolchain_config = PathBuf::from(path);
        }
        if let Some(secs) = lookup("RUN_TIMEOUT_SECS") {
            config.limits.run_timeout = Duration::from_secs(parse("RUN_TIMEOUT_SECS", &secs)?);
        }
        if let Some(bytes) = lookup("STREAM_MAX_BYTES") {
            config.limits.max_output_bytes = parse("STREAM_MAX_BYTES", &bytes)?;
        }
        if let Some(secs) = lookup("KEEPALIVE_SECS") {
            config.limits.keepalive = Duration::from_secs(parse("KEEPALIVE_SECS", &secs)?);
        }
        if let Some(secs) = lookup("SUBMISSION_GRACE_SECS") {
            config.submission_grace =
                Duration::from_secs(parse("SUBMISSION_GRACE_SECS", &secs)?);
        }
        if let Some(bytes) = lookup("MAX_OVERRIDE_BYTES") {
            config.max_override_bytes = parse("MAX_OVERRIDE_BYTES", &bytes)?;
        }
        if let Some(flag) = lookup("DEV_LOGIN") {
            config.dev_login = parse_flag("DEV_LOGIN", &flag)?;
        }
        if let Some(hours) = lookup("SESSION_TTL_HOURS") {
            let hours: u64 = parse("SESSION_TTL_HOURS", &hours)?;
            config.session_ttl = Duration::from_secs(hours * 3600);
        }
        if let Some(format) = lookup("LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" | "" => LogFormat::Text,
                _ => {
                    return Err(ConfigError::Invalid {
                        key: "LOG_FORMAT",
                        value: format,
                        reason: "expected 'text' or 'json'".to_string(),
                    })
                }
            };
        }

        Ok(config)
    }

    pub fn progress_file(&self) -> PathBuf {
        self.data_dir.join("progress.json")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

fn parse<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_flag(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Invalid {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.port, 3001);
        assert_eq!(config.limits.max_output_bytes, 200 * 1024);
        assert_eq!(config.limits.keepalive, Duration::from_secs(15));
        assert_eq!(config.submission_grace, Duration::from_secs(300));
        assert!(config.frontend_origins.is_empty());
        assert_eq!(config.progress_file(), PathBuf::from(".data/progress.json"));
    }

    #[test]
    fn test_overrides_from_env() {
        let config = Config::from_lookup(lookup(&[
            ("PORT", "8080"),
            ("FRONTEND_ORIGIN", "https://a.example, https://b.example,"),
            ("RUN_TIMEOUT_SECS", "60"),
            ("DEV_LOGIN", "true"),
            ("LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
        assert_eq!(
            config.frontend_origins,
            vec!["https://a.example", "https://b.example"]
        );
        assert_eq!(config.limits.run_timeout, Duration::from_secs(60));
        assert!(config.dev_login);
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = Config::from_lookup(lookup(&[("PORT", "not-a-port")])).unwrap_err();
        assert!(err.to_string().contains("PORT"));
    }
}
