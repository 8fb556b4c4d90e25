//! Operation code tables
//!
//! Inbound (client -> server) and outbound (server -> client) operation
//! codes. The numeric values belong to the deployed client build; only the
//! symbolic names matter to the field engine.

/// Inbound operations understood by the field engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecvOperation {
    /// Bind this connection to a character
    MigrateIn,
    UserTransferFieldRequest,
    UserMove,
    UserChat,
    UserEmotion,
    UserCharacterInfoRequest,
    MobMove,
    NpcMove,
    DropPickUpRequest,
    ReactorHit,
    ReactorTouch,
    /// Anything else; routed to the user's generic handler
    Unknown(u16),
}

impl RecvOperation {
    /// Resolve an opcode read off the wire
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x14 => Self::MigrateIn,
            0x29 => Self::UserTransferFieldRequest,
            0x2C => Self::UserMove,
            0x36 => Self::UserChat,
            0x38 => Self::UserEmotion,
            0x60 => Self::UserCharacterInfoRequest,
            0xDC => Self::MobMove,
            0xE9 => Self::NpcMove,
            0x10B => Self::DropPickUpRequest,
            0x10E => Self::ReactorHit,
            0x10F => Self::ReactorTouch,
            other => Self::Unknown(other),
        }
    }

    /// Get the opcode value
    pub fn as_u16(self) -> u16 {
        match self {
            Self::MigrateIn => 0x14,
            Self::UserTransferFieldRequest => 0x29,
            Self::UserMove => 0x2C,
            Self::UserChat => 0x36,
            Self::UserEmotion => 0x38,
            Self::UserCharacterInfoRequest => 0x60,
            Self::MobMove => 0xDC,
            Self::NpcMove => 0xE9,
            Self::DropPickUpRequest => 0x10B,
            Self::ReactorHit => 0x10E,
            Self::ReactorTouch => 0x10F,
            Self::Unknown(value) => value,
        }
    }
}

/// Outbound packet opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum SendOperation {
    TemporaryStatSet = 0x20,
    TemporaryStatReset = 0x21,
    CharacterInfo = 0x3D,
    SetField = 0x8D,
    UserEnterField = 0xB3,
    UserLeaveField = 0xB4,
    UserChat = 0xB5,
    UserMove = 0xD2,
    UserEmotion = 0xE4,
    MobEnterField = 0x11C,
    MobLeaveField = 0x11D,
    MobChangeController = 0x11E,
    MobMove = 0x11F,
    MobCtrlAck = 0x120,
    NpcEnterField = 0x137,
    NpcLeaveField = 0x138,
    NpcChangeController = 0x139,
    NpcMove = 0x13A,
    DropEnterField = 0x144,
    DropLeaveField = 0x145,
    ReactorChangeState = 0x14E,
    ReactorEnterField = 0x150,
    ReactorLeaveField = 0x151,
}

impl SendOperation {
    /// Get the opcode value
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}
