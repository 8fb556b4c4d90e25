//! Field Server Library
//!
//! This library provides the core of a MapleStory-style channel server: the
//! field simulation engine that tracks every object standing in a map, routes
//! client operations to them and fans packets back out to the users present.
//!
//! ## Modules
//!
//! - `config` - Server configuration management
//! - `error` - Error types and result definitions
//! - `game` - Fields, field objects, characters and static templates
//! - `net` - Network handling and session management
//! - `protocol` - Operation codes, outbound packets and movement paths
//! - `state` - Shared application state

pub mod config;
pub mod error;
pub mod game;
pub mod net;
pub mod protocol;
pub mod state;

// Re-export commonly used types
pub use config::ServerConfig;
pub use error::{FieldServerError, Result};
pub use state::AppState;

/// Server version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
