//! Movement path protocol
//!
//! Clients report movement as a path: a start position and velocity followed
//! by discrete move elements. The server does not validate the path; it is
//! decoded, applied to the mover's placement, and re-encoded as-is for the
//! other observers.
//!
//! Wire layout:
//!
//! ```text
//! i16 x, i16 y, i16 vx, i16 vy         start position / velocity
//! u8  count                            number of elements
//! count * element                      see MoveAttribute
//! u8  key_pad_count                    key-pad states, two per byte
//! ceil(key_pad_count / 2) * u8
//! i16 left, top, right, bottom         bounding rectangle
//! ```

use crate::error::ProtocolError;
use crate::game::field::Point;
use crate::net::buffer::{DecodeResult, PacketBuffer};

/// Move element attribute codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MoveAttribute {
    Normal = 0,
    Jump = 1,
    Impact = 2,
    Immediate = 3,
    Teleport = 4,
    HangOnBack = 5,
    Assaulter = 6,
    Assassinate = 7,
    Rush = 8,
    StatChange = 9,
    SitDown = 10,
    StartFallDown = 11,
    FallDown = 12,
    StartWings = 13,
    Wings = 14,
    MobToss = 15,
    MobAttackRush = 16,
    MobAttackRushStop = 17,
}

impl MoveAttribute {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        use MoveAttribute::*;
        let attribute = match value {
            0 => Normal,
            1 => Jump,
            2 => Impact,
            3 => Immediate,
            4 => Teleport,
            5 => HangOnBack,
            6 => Assaulter,
            7 => Assassinate,
            8 => Rush,
            9 => StatChange,
            10 => SitDown,
            11 => StartFallDown,
            12 => FallDown,
            13 => StartWings,
            14 => Wings,
            15 => MobToss,
            16 => MobAttackRush,
            17 => MobAttackRushStop,
            _ => return None,
        };
        Some(attribute)
    }

    /// Get the attribute value
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Attribute-specific payload of a move element
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MoveKind {
    /// Ground or air movement with a full state sample
    Normal {
        position: Point,
        velocity: Point,
        foothold: i16,
        /// Only present for `FallDown`
        fall_start: Option<i16>,
        offset: Point,
    },
    /// Velocity change without a position sample
    Jump { velocity: Point },
    /// Instant relocation
    Teleport { position: Point, foothold: i16 },
    /// Leaving a foothold downwards
    StartFallDown { velocity: Point, fall_start: i16 },
    /// Stat change marker; carries no action or timing
    StatChange { stat: u8 },
}

/// One element of a movement path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MoveElement {
    pub attribute: MoveAttribute,
    pub kind: MoveKind,
    pub move_action: u8,
    pub elapse: i16,
}

impl MoveElement {
    fn decode(buffer: &mut PacketBuffer) -> DecodeResult<Self> {
        use MoveAttribute::*;

        let code = buffer.read_u8()?;
        let attribute =
            MoveAttribute::from_u8(code).ok_or(ProtocolError::UnknownMoveAttribute(code))?;

        let kind = match attribute {
            Normal | HangOnBack | FallDown | Wings | MobAttackRush | MobAttackRushStop => {
                let position = read_point(buffer)?;
                let velocity = read_point(buffer)?;
                let foothold = buffer.read_i16()?;
                let fall_start = if attribute == FallDown {
                    Some(buffer.read_i16()?)
                } else {
                    None
                };
                let offset = read_point(buffer)?;
                MoveKind::Normal {
                    position,
                    velocity,
                    foothold,
                    fall_start,
                    offset,
                }
            }
            Jump | Impact | StartWings | MobToss => MoveKind::Jump {
                velocity: read_point(buffer)?,
            },
            Immediate | Teleport | Assaulter | Assassinate | Rush | SitDown => MoveKind::Teleport {
                position: read_point(buffer)?,
                foothold: buffer.read_i16()?,
            },
            StartFallDown => MoveKind::StartFallDown {
                velocity: read_point(buffer)?,
                fall_start: buffer.read_i16()?,
            },
            StatChange => {
                return Ok(Self {
                    attribute,
                    kind: MoveKind::StatChange {
                        stat: buffer.read_u8()?,
                    },
                    move_action: 0,
                    elapse: 0,
                })
            }
        };

        Ok(Self {
            attribute,
            kind,
            move_action: buffer.read_u8()?,
            elapse: buffer.read_i16()?,
        })
    }

    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_u8(self.attribute.as_u8());

        match &self.kind {
            MoveKind::Normal {
                position,
                velocity,
                foothold,
                fall_start,
                offset,
            } => {
                write_point(buffer, *position);
                write_point(buffer, *velocity);
                buffer.write_i16(*foothold);
                if let Some(fall_start) = fall_start {
                    buffer.write_i16(*fall_start);
                }
                write_point(buffer, *offset);
            }
            MoveKind::Jump { velocity } => write_point(buffer, *velocity),
            MoveKind::Teleport { position, foothold } => {
                write_point(buffer, *position);
                buffer.write_i16(*foothold);
            }
            MoveKind::StartFallDown {
                velocity,
                fall_start,
            } => {
                write_point(buffer, *velocity);
                buffer.write_i16(*fall_start);
            }
            MoveKind::StatChange { stat } => {
                buffer.write_u8(*stat);
                return;
            }
        }

        buffer.write_u8(self.move_action).write_i16(self.elapse);
    }

    /// Position sampled by this element, if any
    pub fn position(&self) -> Option<Point> {
        match &self.kind {
            MoveKind::Normal { position, .. } | MoveKind::Teleport { position, .. } => {
                Some(*position)
            }
            _ => None,
        }
    }

    /// Foothold reported by this element, if any
    pub fn foothold(&self) -> Option<i16> {
        match &self.kind {
            MoveKind::Normal { foothold, .. } | MoveKind::Teleport { foothold, .. } => {
                Some(*foothold)
            }
            _ => None,
        }
    }

    /// Move action of this element, if it carries one
    pub fn action(&self) -> Option<u8> {
        match self.kind {
            MoveKind::StatChange { .. } => None,
            _ => Some(self.move_action),
        }
    }
}

/// Bounding rectangle reported with a path
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bounds {
    pub left: i16,
    pub top: i16,
    pub right: i16,
    pub bottom: i16,
}

/// A decoded movement path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovePath {
    pub start: Point,
    pub velocity: Point,
    pub elements: Vec<MoveElement>,
    pub key_pad_count: u8,
    pub key_pad: Vec<u8>,
    pub bounds: Bounds,
}

impl MovePath {
    /// Decode a path from the read cursor
    pub fn decode(buffer: &mut PacketBuffer) -> DecodeResult<Self> {
        let start = read_point(buffer)?;
        let velocity = read_point(buffer)?;

        let count = buffer.read_u8()? as usize;
        let mut elements = Vec::with_capacity(count);
        for _ in 0..count {
            elements.push(MoveElement::decode(buffer)?);
        }

        let key_pad_count = buffer.read_u8()?;
        let key_pad = buffer.read_bytes((key_pad_count as usize + 1) / 2)?;

        let bounds = Bounds {
            left: buffer.read_i16()?,
            top: buffer.read_i16()?,
            right: buffer.read_i16()?,
            bottom: buffer.read_i16()?,
        };

        Ok(Self {
            start,
            velocity,
            elements,
            key_pad_count,
            key_pad,
            bounds,
        })
    }

    /// Encode the path exactly as it was reported
    pub fn encode(&self, buffer: &mut PacketBuffer) {
        write_point(buffer, self.start);
        write_point(buffer, self.velocity);

        buffer.write_u8(self.elements.len() as u8);
        for element in &self.elements {
            element.encode(buffer);
        }

        buffer
            .write_u8(self.key_pad_count)
            .write_bytes(&self.key_pad)
            .write_i16(self.bounds.left)
            .write_i16(self.bounds.top)
            .write_i16(self.bounds.right)
            .write_i16(self.bounds.bottom);
    }

    /// Final position: the last sampled position, or the start
    pub fn last_position(&self) -> Point {
        self.elements
            .iter()
            .rev()
            .find_map(MoveElement::position)
            .unwrap_or(self.start)
    }

    /// Final move action, if any element carried one
    pub fn last_move_action(&self) -> Option<u8> {
        self.elements.iter().rev().find_map(MoveElement::action)
    }

    /// Final foothold, if any element reported one
    pub fn last_foothold(&self) -> Option<i16> {
        self.elements.iter().rev().find_map(MoveElement::foothold)
    }
}

fn read_point(buffer: &mut PacketBuffer) -> DecodeResult<Point> {
    Ok(Point::new(buffer.read_i16()?, buffer.read_i16()?))
}

fn write_point(buffer: &mut PacketBuffer, point: Point) {
    buffer.write_i16(point.x).write_i16(point.y);
}
