//! Outbound packet definitions
//!
//! An [`OutPacket`] is an encoded, immutable packet: the `u16` opcode followed
//! by its payload. It is cheap to clone, so one encoding is shared by every
//! recipient of a broadcast.

use bytes::Bytes;

use crate::net::buffer::PacketBuffer;
use crate::protocol::opcodes::SendOperation;

/// Encoded outbound packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutPacket {
    data: Bytes,
}

impl OutPacket {
    /// Start building a packet for `operation`
    pub fn builder(operation: SendOperation) -> PacketBuffer {
        let mut buffer = PacketBuffer::with_capacity(64);
        buffer.write_u16(operation.as_u16());
        buffer
    }

    /// Get the opcode of this packet
    pub fn opcode(&self) -> u16 {
        match self.data.get(..2) {
            Some(&[lo, hi]) => u16::from_le_bytes([lo, hi]),
            _ => 0,
        }
    }

    /// Get the full encoded packet (opcode included)
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the payload after the opcode
    pub fn payload(&self) -> &[u8] {
        self.data.get(2..).unwrap_or_default()
    }

    /// Get a reader positioned after the opcode
    pub fn reader(&self) -> PacketBuffer {
        PacketBuffer::from_bytes(self.payload())
    }

    /// Get the shared byte handle
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the packet has no bytes at all
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl PacketBuffer {
    /// Finish a packet started with [`OutPacket::builder`]
    pub fn build(self) -> OutPacket {
        OutPacket {
            data: self.into_inner().freeze(),
        }
    }
}
