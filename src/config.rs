//! Configuration loading for the gateway runtime.
//!
//! Precedence: environment variables > TOML file > built-in defaults,
//! mirroring the loader shape used elsewhere in this codebase. The TOML
//! file path is `$GATEWAY_CONFIG_PATH` or `./gateway.toml`; its absence is
//! not an error.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Default truncation bound on inbound and outbound text, in characters.
pub const DEFAULT_MAX_TEXT_CHARS: usize = 4000;
/// Default delay before a scheduled reconnect on a general close.
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3000;
/// Default hard cap on QR rotations before pairing locks.
pub const DEFAULT_MAX_QR_GENERATIONS: u32 = 3;
/// Default grace window, in seconds, for messages timestamped before `open`.
pub const DEFAULT_HISTORY_GRACE_WINDOW_SEC: i64 = 90;

/// Gateway runtime configuration (see the crate's external interface table).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Directory for credentials and quarantine files.
    pub auth_dir: PathBuf,
    /// Truncation bound on both inbound and outbound text.
    pub max_text_chars: usize,
    /// Delay before a scheduled reconnect on a general close.
    pub reconnect_delay_ms: u64,
    /// Hard cap on QR rotations before pairing locks.
    pub max_qr_generations: u32,
    /// Allow inbound messages where `from_me == true`.
    pub allow_self_from_me: bool,
    /// Mandatory leading token on inbound text, if any.
    pub require_prefix: Option<String>,
    /// How far before `open` a timestamp may be and still count as live.
    pub history_grace_window_sec: i64,
    /// Canonical JIDs permitted to send inbound; empty means any.
    pub allowed_senders: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            auth_dir: PathBuf::from("./auth"),
            max_text_chars: DEFAULT_MAX_TEXT_CHARS,
            reconnect_delay_ms: DEFAULT_RECONNECT_DELAY_MS,
            max_qr_generations: DEFAULT_MAX_QR_GENERATIONS,
            allow_self_from_me: false,
            require_prefix: None,
            history_grace_window_sec: DEFAULT_HISTORY_GRACE_WINDOW_SEC,
            allowed_senders: Vec::new(),
        }
    }
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("auth_dir", &"[REDACTED]")
            .field("max_text_chars", &self.max_text_chars)
            .field("reconnect_delay_ms", &self.reconnect_delay_ms)
            .field("max_qr_generations", &self.max_qr_generations)
            .field("allow_self_from_me", &self.allow_self_from_me)
            .field("require_prefix", &self.require_prefix)
            .field("history_grace_window_sec", &self.history_grace_window_sec)
            .field("allowed_senders", &self.allowed_senders)
            .finish()
    }
}

impl GatewayConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML file exists but fails to parse.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading gateway config from file");
                let config: GatewayConfig =
                    toml::from_str(&contents).context("failed to parse gateway config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no gateway config file found, using defaults");
                Ok(GatewayConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read gateway config file: {e}")),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("GATEWAY_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("gateway.toml"))
    }

    /// Apply environment variable overrides in place.
    ///
    /// Takes a resolver function for testability (avoids unsafe `set_var`
    /// in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("GATEWAY_AUTH_DIR") {
            self.auth_dir = PathBuf::from(v);
        }
        if let Some(v) = env("GATEWAY_MAX_TEXT_CHARS") {
            match v.parse() {
                Ok(n) => self.max_text_chars = n,
                Err(_) => tracing::warn!(var = "GATEWAY_MAX_TEXT_CHARS", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("GATEWAY_RECONNECT_DELAY_MS") {
            match v.parse() {
                Ok(n) => self.reconnect_delay_ms = n,
                Err(_) => tracing::warn!(var = "GATEWAY_RECONNECT_DELAY_MS", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("GATEWAY_MAX_QR_GENERATIONS") {
            match v.parse() {
                Ok(n) => self.max_qr_generations = n,
                Err(_) => tracing::warn!(var = "GATEWAY_MAX_QR_GENERATIONS", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("GATEWAY_ALLOW_SELF_FROM_ME") {
            match v.parse() {
                Ok(b) => self.allow_self_from_me = b,
                Err(_) => tracing::warn!(var = "GATEWAY_ALLOW_SELF_FROM_ME", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("GATEWAY_REQUIRE_PREFIX") {
            self.require_prefix = if v.trim().is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env("GATEWAY_HISTORY_GRACE_WINDOW_SEC") {
            match v.parse() {
                Ok(n) => self.history_grace_window_sec = n,
                Err(_) => tracing::warn!(var = "GATEWAY_HISTORY_GRACE_WINDOW_SEC", value = %v, "ignoring invalid env override"),
            }
        }
        if let Some(v) = env("GATEWAY_ALLOWED_SENDERS") {
            self.allowed_senders = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect();
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not valid TOML for this shape.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("failed to parse gateway config TOML")
    }
}
