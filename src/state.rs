//! # Application State Management
//!
//! Shared state handed to every HTTP handler and WebSocket actor.
//!
//! ## Key Rust Concepts:
//!
//! ### Arc<RwLock<T>> Pattern
//! - **Arc**: many handlers hold a reference to the same configuration
//! - **RwLock**: many readers at once, one writer for runtime config updates
//!
//! ### Clone-able handles
//! The session registry and controller are themselves cheap `Arc` handles, so
//! cloning `AppState` for every actix worker never copies session data.

use crate::config::AppConfig;
use crate::relay::{AudioRelay, RelayStats};
use crate::session::{SessionController, SessionRegistry};
use crate::upstream::{UpstreamConnector, UpstreamOptions};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// The state shared across all request handlers and socket actors.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration (can be updated at runtime)
    pub config: Arc<RwLock<AppConfig>>,

    /// Every connected client's session
    pub registry: SessionRegistry,

    /// Start/stop/disconnect rules
    pub controller: SessionController,

    /// Client → upstream audio path
    pub relay: Arc<AudioRelay>,

    /// When the server started
    pub start_time: Instant,
}

impl AppState {
    /// Wire the registry, controller and relay together around one connector.
    pub fn new(config: AppConfig, connector: Arc<dyn UpstreamConnector>) -> Self {
        let controller = SessionController::new(SessionRegistry::new(), connector);
        let registry = controller.registry().clone();
        let relay = Arc::new(AudioRelay::new(
            registry.clone(),
            config.relay.log_sample_every,
        ));

        Self {
            config: Arc::new(RwLock::new(config)),
            registry,
            controller,
            relay,
            start_time: Instant::now(),
        }
    }

    /// Get a copy of the current configuration.
    ///
    /// Cloning releases the lock immediately, so readers never block each other for long.
    pub fn get_config(&self) -> AppConfig {
        self.config
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Options for the next upstream stream a session opens.
    pub fn upstream_options(&self) -> UpstreamOptions {
        self.get_config().deepgram.to_upstream_options()
    }

    /// Replace the configuration after validating it.
    ///
    /// Streams that are already open keep the options they were opened with.
    pub fn update_config(&self, new_config: AppConfig) -> Result<(), String> {
        new_config.validate().map_err(|e| e.to_string())?;
        self.relay
            .set_log_sample_every(new_config.relay.log_sample_every);
        *self.config.write().unwrap_or_else(|p| p.into_inner()) = new_config;
        Ok(())
    }

    pub fn connected_clients(&self) -> usize {
        self.registry.len()
    }

    pub fn active_upstreams(&self) -> usize {
        self.registry.active_upstreams()
    }

    pub fn session_states(&self) -> HashMap<&'static str, usize> {
        self.registry.state_counts()
    }

    pub fn relay_stats(&self) -> RelayStats {
        self.relay.stats()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
