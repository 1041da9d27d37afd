//! # Relay Module
//!
//! The two directions of the per-session relay:
//! - **audio**: client → upstream audio forwarding
//! - **fanout**: upstream → client event routing

pub mod audio;
pub mod fanout;

pub use audio::{AudioRelay, Delivery, RelayStats};
pub use fanout::EventFanout;
