//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Key Rust Concepts Used:
//! - **Serde**: Serialization/deserialization library for converting between Rust structs and data formats
//! - **derive macros**: Automatically generate code for common traits (Debug, Clone, Serialize, Deserialize)
//! - **impl blocks**: Add methods to structs
//! - **Result<T, E>**: Error handling that forces you to handle potential failures
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Deployment variables (HOST, PORT, DEEPGRAM_API_KEY)
//! 2. Environment variables (APP_SERVER__PORT, APP_DEEPGRAM__MODEL, etc.)
//! 3. Configuration file (config.toml)
//! 4. Default values (defined in the Default impl)

use crate::upstream::UpstreamOptions;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// Breaking configuration into logical groups (server, deepgram, relay)
/// keeps the listener settings apart from the upstream protocol settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub deepgram: DeepgramConfig,
    pub relay: RelayConfig,
}

/// Listener settings.
///
/// ## Common values:
/// - `host = "0.0.0.0"`: Accept connections from any IP address (cloud deployment)
/// - `port = 5001`: The relay's default WebSocket port
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Streaming speech-recognition backend settings.
///
/// ## Fields:
/// - `api_key`: backend credential, normally supplied via the `DEEPGRAM_API_KEY` variable
/// - `url`: live transcription endpoint (query parameters are appended per session)
/// - `model` / `language`: recognition model and language code sent at open time
/// - `interim_results`: partial hypotheses (off: only final text is relayed)
/// - `punctuate`: backend-side punctuation (on)
/// - `keepalive`: send KeepAlive frames while the client is silent
/// - `keepalive_interval_secs`: spacing of KeepAlive frames
/// - `keepalive_timeout_secs`: how much client silence the keep-alive covers; the
///   backend alone would close an idle stream after roughly 10 seconds
/// - `connect_timeout_secs`: bound on the upstream handshake
/// - `finish_timeout_secs`: bound on writing the end-of-stream frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepgramConfig {
    pub api_key: String,
    pub url: String,
    pub model: String,
    pub language: String,
    pub interim_results: bool,
    pub punctuate: bool,
    pub keepalive: bool,
    pub keepalive_interval_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub finish_timeout_secs: u64,
}

/// Audio relay tuning.
///
/// ## Fields:
/// - `log_sample_every`: emit per-frame diagnostics for one frame in this many
/// - `frame_queue_capacity`: audio frames buffered per upstream before sends start failing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub log_sample_every: u64,
    pub frame_queue_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5001,
            },
            deepgram: DeepgramConfig {
                api_key: String::new(),
                url: "wss://api.deepgram.com/v1/listen".to_string(),
                model: "nova-3".to_string(),
                language: "en-US".to_string(),
                interim_results: false,
                punctuate: true,
                keepalive: true,
                keepalive_interval_secs: 5,
                keepalive_timeout_secs: 30,
                connect_timeout_secs: 10,
                finish_timeout_secs: 5,
            },
            relay: RelayConfig {
                log_sample_every: 20,
                frame_queue_capacity: 256,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Configuration Loading Process:
    /// 1. Start with built-in defaults
    /// 2. Override with values from config.toml (if it exists)
    /// 3. Override with environment variables prefixed with APP_ (nested keys use `__`)
    /// 4. Handle deployment variables HOST, PORT and DEEPGRAM_API_KEY
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_DEEPGRAM__LANGUAGE=de`: Override recognition language
    /// - `APP_RELAY__LOG_SAMPLE_EVERY=50`: Sample fewer frames
    /// - `PORT=3000`: Special case for deployment platforms
    /// - `DEEPGRAM_API_KEY=...`: Backend credential
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        if let Ok(api_key) = env::var("DEEPGRAM_API_KEY") {
            settings = settings.set_override("deepgram.api_key", api_key)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - Server port is not 0
    /// - A backend credential is present
    /// - Every timeout and the keep-alive interval are non-zero
    /// - Frame sampling and queue capacity are non-zero
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.deepgram.api_key.trim().is_empty() {
            return Err(anyhow::anyhow!(
                "Deepgram API key is missing (set DEEPGRAM_API_KEY)"
            ));
        }

        if self.deepgram.model.trim().is_empty() || self.deepgram.language.trim().is_empty() {
            return Err(anyhow::anyhow!("Deepgram model and language must be set"));
        }

        if self.deepgram.connect_timeout_secs == 0 || self.deepgram.finish_timeout_secs == 0 {
            return Err(anyhow::anyhow!("Upstream timeouts must be greater than 0"));
        }

        if self.deepgram.keepalive
            && (self.deepgram.keepalive_interval_secs == 0
                || self.deepgram.keepalive_timeout_secs == 0)
        {
            return Err(anyhow::anyhow!(
                "Keep-alive interval and timeout must be greater than 0"
            ));
        }

        if self.relay.log_sample_every == 0 {
            return Err(anyhow::anyhow!("Log sample rate must be greater than 0"));
        }

        if self.relay.frame_queue_capacity == 0 {
            return Err(anyhow::anyhow!("Frame queue capacity must be greater than 0"));
        }

        Ok(())
    }

    /// Update configuration from a JSON string (used for runtime config updates).
    ///
    /// ## Partial updates:
    /// Only the upstream options and relay tuning can change at runtime; they apply to
    /// sessions started after the update. Listener settings and the API key are ignored
    /// here because changing them needs a restart.
    /// For example, `{"deepgram": {"language": "fr"}}` switches new sessions to French.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial_config: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(deepgram) = partial_config.get("deepgram") {
            if let Some(model) = deepgram.get("model").and_then(|v| v.as_str()) {
                self.deepgram.model = model.to_string();
            }
            if let Some(language) = deepgram.get("language").and_then(|v| v.as_str()) {
                self.deepgram.language = language.to_string();
            }
            if let Some(interim) = deepgram.get("interim_results").and_then(|v| v.as_bool()) {
                self.deepgram.interim_results = interim;
            }
            if let Some(punctuate) = deepgram.get("punctuate").and_then(|v| v.as_bool()) {
                self.deepgram.punctuate = punctuate;
            }
            if let Some(keepalive) = deepgram.get("keepalive").and_then(|v| v.as_bool()) {
                self.deepgram.keepalive = keepalive;
            }
            if let Some(secs) = deepgram.get("keepalive_timeout_secs").and_then(|v| v.as_u64()) {
                self.deepgram.keepalive_timeout_secs = secs;
            }
            if let Some(secs) = deepgram.get("keepalive_interval_secs").and_then(|v| v.as_u64()) {
                self.deepgram.keepalive_interval_secs = secs;
            }
        }

        if let Some(relay) = partial_config.get("relay") {
            if let Some(every) = relay.get("log_sample_every").and_then(|v| v.as_u64()) {
                self.relay.log_sample_every = every;
            }
        }

        self.validate()?;
        Ok(())
    }
}

impl DeepgramConfig {
    /// Build the per-session open options from the current settings.
    pub fn to_upstream_options(&self) -> UpstreamOptions {
        UpstreamOptions {
            model: self.model.clone(),
            language: self.language.clone(),
            interim_results: self.interim_results,
            punctuate: self.punctuate,
            keepalive: self.keepalive,
            keepalive_interval: Duration::from_secs(self.keepalive_interval_secs),
            keepalive_timeout: Duration::from_secs(self.keepalive_timeout_secs),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn finish_timeout(&self) -> Duration {
        Duration::from_secs(self.finish_timeout_secs)
    }
}
