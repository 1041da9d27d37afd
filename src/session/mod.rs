//! # Session Module
//!
//! Per-client session bookkeeping and the start/stop lifecycle.
//!
//! ## Components:
//! - **registry**: the shared `session_id → Session` map
//! - **lifecycle**: opening, finishing and tearing down upstream streams

pub mod lifecycle;
pub mod registry;

pub use lifecycle::SessionController;
pub use registry::{AudioRoute, SessionRegistry, SessionState};
