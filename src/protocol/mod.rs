//! Protocol module
//!
//! This module contains the wire-level pieces of the field protocol:
//! - Operation code tables (inbound and outbound)
//! - Encoded outbound packets, shared between broadcast recipients
//! - Movement path decoding and re-encoding

pub mod movement;
pub mod opcodes;
pub mod packets;

pub use movement::MovePath;
pub use opcodes::{RecvOperation, SendOperation};
pub use packets::OutPacket;
