//! Tracing setup and plugin-scoped logging
//!
//! Plugin log lines go through [`Redactor`] before reaching `tracing`, so
//! secrets and PII-shaped values never leave the sandbox in clear text.

use base64::{engine::general_purpose, Engine as _};
use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LogConfig;
use crate::error::{PluginResult, PluginRuntimeError};

lazy_static! {
    static ref EMAIL_REGEX: Regex =
        Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").unwrap();
    static ref PHONE_REGEX: Regex =
        Regex::new(r"(?:\+1[-.\s]?)?\(?\b[0-9]{3}\)?[-.\s]?[0-9]{3}[-.\s]?[0-9]{4}\b").unwrap();
    static ref SSN_REGEX: Regex = Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap();
    static ref CARD_REGEX: Regex = Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap();
    static ref BEARER_REGEX: Regex = Regex::new(r"(?i)\bbearer\s+[A-Za-z0-9._~+/=-]+").unwrap();
    static ref SECRET_PAIR_REGEX: Regex = Regex::new(
        r#"(?i)\b(password|passwd|secret|token|api[_-]?key|private[_-]?key)\b(\s*[:=]\s*)("[^"]*"|\S+)"#
    )
    .unwrap();
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over `config.level`. Calling this twice returns an error
/// instead of panicking.
pub fn init_tracing(config: &LogConfig) -> PluginResult<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| PluginRuntimeError::ConfigurationError(format!("invalid log level: {e}")))?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    result.map_err(|e| PluginRuntimeError::ConfigurationError(e.to_string()))
}

/// Masks secrets and PII in free-form text.
///
/// Matches are replaced by a short hash so equal values still correlate
/// across log lines.
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    extra_patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Additional host-specific pattern, redacted as `REDACTED[hash]`
    pub fn with_pattern(mut self, pattern: Regex) -> Self {
        self.extra_patterns.push(pattern);
        self
    }

    pub fn redact(&self, text: &str) -> String {
        let mut result = SECRET_PAIR_REGEX
            .replace_all(text, |caps: &regex::Captures| {
                format!("{}{}[REDACTED]", &caps[1], &caps[2])
            })
            .into_owned();
        result = BEARER_REGEX.replace_all(&result, "Bearer [REDACTED]").into_owned();
        result = Self::mask(&EMAIL_REGEX, &result, "EMAIL");
        result = Self::mask(&SSN_REGEX, &result, "SSN");
        result = Self::mask(&CARD_REGEX, &result, "CC");
        result = Self::mask(&PHONE_REGEX, &result, "PHONE");
        for pattern in &self.extra_patterns {
            result = Self::mask(pattern, &result, "REDACTED");
        }
        result
    }

    fn mask(regex: &Regex, text: &str, label: &str) -> String {
        regex
            .replace_all(text, |caps: &regex::Captures| {
                format!("{label}[{}]", hash_value(&caps[0]))
            })
            .into_owned()
    }
}

fn hash_value(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    // First 8 bytes are enough for correlation
    general_purpose::STANDARD.encode(&digest[..8])
}

/// Log level accepted from plugin code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl PluginLogLevel {
    /// Map the numeric level used by the WASM `env.log` import (0 = trace)
    pub fn from_code(code: i32) -> Self {
        match code {
            i32::MIN..=0 => Self::Trace,
            1 => Self::Debug,
            2 => Self::Info,
            3 => Self::Warn,
            _ => Self::Error,
        }
    }
}

/// Logger handed to plugin code; every line carries the plugin id
#[derive(Debug, Clone)]
pub struct PluginLogger {
    plugin_id: Arc<str>,
    redactor: Option<Arc<Redactor>>,
}

impl PluginLogger {
    pub fn new(plugin_id: impl Into<String>, redactor: Option<Arc<Redactor>>) -> Self {
        Self {
            plugin_id: Arc::from(plugin_id.into()),
            redactor,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn log(&self, level: PluginLogLevel, message: &str) {
        let message = match &self.redactor {
            Some(redactor) => redactor.redact(message),
            None => message.to_string(),
        };
        let plugin_id = &*self.plugin_id;
        match level {
            PluginLogLevel::Trace => trace!(plugin_id, "{message}"),
            PluginLogLevel::Debug => debug!(plugin_id, "{message}"),
            PluginLogLevel::Info => info!(plugin_id, "{message}"),
            PluginLogLevel::Warn => warn!(plugin_id, "{message}"),
            PluginLogLevel::Error => error!(plugin_id, "{message}"),
        }
    }

    pub fn debug(&self, message: &str) {
        self.log(PluginLogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.log(PluginLogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.log(PluginLogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.log(PluginLogLevel::Error, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_pairs_are_redacted() {
        let redactor = Redactor::new();
        let out = redactor.redact("connecting with password=hunter2 and api_key: abc123");
        assert!(!out.contains("hunter2"));
        assert!(!out.contains("abc123"));
        assert!(out.contains("password=[REDACTED]"));
    }

    #[test]
    fn test_pii_is_hashed_consistently() {
        let redactor = Redactor::new();
        let a = redactor.redact("patient jane.doe@example.com admitted");
        let b = redactor.redact("discharged jane.doe@example.com");
        assert!(!a.contains("jane.doe"));
        let hash = a.split("EMAIL[").nth(1).and_then(|s| s.split(']').next()).unwrap();
        assert!(b.contains(hash));
    }

    #[test]
    fn test_bearer_and_ssn() {
        let out = Redactor::new().redact("Authorization: Bearer eyJhbGciOi.x.y ssn 123-45-6789");
        assert!(!out.contains("eyJhbGciOi"));
        assert!(!out.contains("123-45-6789"));
        assert!(out.contains("SSN["));
    }

    #[test]
    fn test_wasm_level_codes() {
        assert_eq!(PluginLogLevel::from_code(-3), PluginLogLevel::Trace);
        assert_eq!(PluginLogLevel::from_code(2), PluginLogLevel::Info);
        assert_eq!(PluginLogLevel::from_code(9), PluginLogLevel::Error);
    }
}
