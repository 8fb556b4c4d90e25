//! Networking module
//!
//! This module handles all network-related functionality for the field server:
//! - Length-prefixed TCP framing
//! - Session management
//! - Connection lifecycle

pub mod buffer;
pub mod handler;
pub mod session;
pub mod transport;
