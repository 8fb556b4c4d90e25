//! Error handling module
//!
//! Defines custom error types for the field server.

use std::io;

use thiserror::Error;

/// Main error type for the field server
#[derive(Error, Debug)]
pub enum FieldServerError {
    /// Network-related errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Protocol-related errors (malformed or truncated packets)
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Game logic errors
    #[error("Game error: {0}")]
    Game(#[from] GameError),

    /// Static data errors
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// JSON data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl FieldServerError {
    /// Whether this error must terminate the connection that produced it.
    ///
    /// Framing and transport failures cannot be recovered locally; game and
    /// template failures abort only the request that raised them.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FieldServerError::Network(_) | FieldServerError::Protocol(_) | FieldServerError::Io(_)
        )
    }
}

/// Network-specific errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection idle for longer than {0:?}")]
    Timeout(std::time::Duration),

    #[error("Too many connections from {0}")]
    TooManyConnections(String),

    #[error("Session not found: {0}")]
    SessionNotFound(u64),

    #[error("Write buffer full")]
    WriteBufferFull,

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },
}

/// Protocol-specific errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Truncated packet: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(i64),

    #[error("Unknown move attribute: {0}")]
    UnknownMoveAttribute(u8),

    #[error("Unexpected packet in state {state}: opcode {opcode:#06x}")]
    UnexpectedPacket { state: String, opcode: u16 },
}

/// Game logic errors
#[derive(Error, Debug)]
pub enum GameError {
    #[error("Character not found: {0}")]
    CharacterNotFound(i32),

    #[error("Field {field_id} has no spawn portal")]
    NoSpawnPortal { field_id: i32 },

    #[error("Field {field_id} has no foothold below x={x}")]
    NoFootholdBelow { field_id: i32, x: i32 },

    #[error("Portal '{name}' not found in field {field_id}")]
    PortalNotFound { field_id: i32, name: String },

    #[error("Character {0} is already online")]
    AlreadyOnline(i32),

    #[error("User {0} is not in a field")]
    NotInField(i32),

    #[error("Field manager is no longer available")]
    FieldManagerGone,
}

/// Static data errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TemplateError {
    #[error("Field template {0} not found")]
    FieldNotFound(i32),

    #[error("NPC template {0} not found")]
    NpcNotFound(i32),

    #[error("Mob template {0} not found")]
    MobNotFound(i32),

    #[error("Reactor template {0} not found")]
    ReactorNotFound(i32),
}

/// Result type alias for field server operations
pub type Result<T> = std::result::Result<T, FieldServerError>;
