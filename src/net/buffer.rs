//! Packet buffer implementation
//!
//! Provides a byte buffer with the game protocol's read/write operations:
//! - Little-endian integers and IEEE floats
//! - Booleans stored as a single byte
//! - Strings prefixed with a 16-bit length
//! - FILETIME timestamps (100ns ticks since 1601-01-01 UTC)
//!
//! Every read is bounds-checked. Running off the end of a packet is a framing
//! error and is returned to the caller instead of yielding a default value.
//!
//! Values can also be read and written through the [`Decode`] and [`Encode`]
//! traits, which lets call sites stay keyed on the Rust type:
//!
//! ```ignore
//! let id: i32 = packet.read()?;
//! out.write(id).write("name").write(true);
//! ```

use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::error::ProtocolError;

/// Maximum packet size (64KB)
pub const MAX_PACKET_SIZE: usize = 65535;

/// Seconds between 1601-01-01 and the Unix epoch
const FILETIME_EPOCH_OFFSET_SECS: i64 = 11_644_473_600;

/// FILETIME ticks per second
const FILETIME_TICKS_PER_SEC: i64 = 10_000_000;

/// Result of a decode operation
pub type DecodeResult<T> = std::result::Result<T, ProtocolError>;

/// Packet buffer for reading and writing game protocol data
#[derive(Debug, Clone, Default)]
pub struct PacketBuffer {
    /// Internal byte buffer
    data: BytesMut,
    /// Current read position
    read_pos: usize,
}

impl PacketBuffer {
    /// Create a new empty packet buffer
    pub fn new() -> Self {
        Self {
            data: BytesMut::new(),
            read_pos: 0,
        }
    }

    /// Create a packet buffer with a specific capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            read_pos: 0,
        }
    }

    /// Create a packet buffer from existing bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            data: BytesMut::from(bytes),
            read_pos: 0,
        }
    }

    /// Create a packet buffer by wrapping a BytesMut
    pub fn wrap(data: BytesMut) -> Self {
        Self { data, read_pos: 0 }
    }

    // ============ Properties ============

    /// Get the current read position
    #[inline]
    pub fn read_position(&self) -> usize {
        self.read_pos
    }

    /// Get the total length of the buffer
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the buffer is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Get the number of bytes remaining to read
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.read_pos)
    }

    /// Check if there are bytes remaining to read
    #[inline]
    pub fn has_remaining(&self) -> bool {
        self.remaining() > 0
    }

    /// Get a reference to the underlying bytes
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Get the underlying BytesMut
    #[inline]
    pub fn into_inner(self) -> BytesMut {
        self.data
    }

    /// Reset read position to start
    pub fn reset(&mut self) {
        self.read_pos = 0;
    }

    /// Take `count` bytes from the read cursor
    fn take(&mut self, count: usize) -> DecodeResult<&[u8]> {
        if self.remaining() < count {
            return Err(ProtocolError::Truncated {
                needed: count,
                remaining: self.remaining(),
            });
        }
        let start = self.read_pos;
        self.read_pos += count;
        Ok(&self.data[start..start + count])
    }

    /// Take exactly `N` bytes as an array
    fn take_array<const N: usize>(&mut self) -> DecodeResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    /// Skip a number of bytes when reading
    pub fn skip(&mut self, count: usize) -> DecodeResult<()> {
        self.take(count).map(|_| ())
    }

    // ============ Reading Methods ============

    /// Read an unsigned byte
    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    /// Read a signed byte
    pub fn read_i8(&mut self) -> DecodeResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    /// Read a boolean (nonzero byte = true)
    pub fn read_bool(&mut self) -> DecodeResult<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a signed short (2 bytes)
    pub fn read_i16(&mut self) -> DecodeResult<i16> {
        Ok(i16::from_le_bytes(self.take_array()?))
    }

    /// Read an unsigned short (2 bytes)
    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Read a signed int (4 bytes)
    pub fn read_i32(&mut self) -> DecodeResult<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    /// Read an unsigned int (4 bytes)
    pub fn read_u32(&mut self) -> DecodeResult<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Read a signed long (8 bytes)
    pub fn read_i64(&mut self) -> DecodeResult<i64> {
        Ok(i64::from_le_bytes(self.take_array()?))
    }

    /// Read a 32-bit float
    pub fn read_f32(&mut self) -> DecodeResult<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    /// Read a 64-bit float
    pub fn read_f64(&mut self) -> DecodeResult<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Read a length-prefixed string
    pub fn read_string(&mut self) -> DecodeResult<String> {
        let length = self.read_u16()? as usize;
        let bytes = self.take(length)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a FILETIME timestamp
    pub fn read_filetime(&mut self) -> DecodeResult<DateTime<Utc>> {
        let ticks = self.read_i64()?;
        let secs = ticks.div_euclid(FILETIME_TICKS_PER_SEC) - FILETIME_EPOCH_OFFSET_SECS;
        let nanos = (ticks.rem_euclid(FILETIME_TICKS_PER_SEC) * 100) as u32;
        DateTime::from_timestamp(secs, nanos).ok_or(ProtocolError::InvalidTimestamp(ticks))
    }

    /// Read a specific number of bytes
    pub fn read_bytes(&mut self, length: usize) -> DecodeResult<Vec<u8>> {
        Ok(self.take(length)?.to_vec())
    }

    /// Read everything left in the buffer
    pub fn read_remaining(&mut self) -> Vec<u8> {
        let bytes = self.data[self.read_pos..].to_vec();
        self.read_pos = self.data.len();
        bytes
    }

    /// Read any [`Decode`] value
    pub fn read<T: Decode>(&mut self) -> DecodeResult<T> {
        T::decode(self)
    }

    // ============ Writing Methods ============

    /// Write an unsigned byte
    pub fn write_u8(&mut self, value: u8) -> &mut Self {
        self.data.put_u8(value);
        self
    }

    /// Write a signed byte
    pub fn write_i8(&mut self, value: i8) -> &mut Self {
        self.data.put_i8(value);
        self
    }

    /// Write a boolean as one byte
    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u8(value as u8)
    }

    /// Write a signed short (2 bytes)
    pub fn write_i16(&mut self, value: i16) -> &mut Self {
        self.data.put_i16_le(value);
        self
    }

    /// Write an unsigned short (2 bytes)
    pub fn write_u16(&mut self, value: u16) -> &mut Self {
        self.data.put_u16_le(value);
        self
    }

    /// Write a signed int (4 bytes)
    pub fn write_i32(&mut self, value: i32) -> &mut Self {
        self.data.put_i32_le(value);
        self
    }

    /// Write an unsigned int (4 bytes)
    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.put_u32_le(value);
        self
    }

    /// Write a signed long (8 bytes)
    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.put_i64_le(value);
        self
    }

    /// Write a 32-bit float
    pub fn write_f32(&mut self, value: f32) -> &mut Self {
        self.data.put_f32_le(value);
        self
    }

    /// Write a 64-bit float
    pub fn write_f64(&mut self, value: f64) -> &mut Self {
        self.data.put_f64_le(value);
        self
    }

    /// Write a length-prefixed string
    ///
    /// Strings longer than the prefix can express are cut at the last
    /// character boundary that fits.
    pub fn write_string(&mut self, value: &str) -> &mut Self {
        let mut length = value.len().min(u16::MAX as usize);
        while !value.is_char_boundary(length) {
            length -= 1;
        }
        if length < value.len() {
            warn!(length = value.len(), kept = length, "String truncated to fit length prefix");
        }

        self.write_u16(length as u16);
        self.data.extend_from_slice(&value.as_bytes()[..length]);
        self
    }

    /// Write a FILETIME timestamp
    pub fn write_filetime(&mut self, value: DateTime<Utc>) -> &mut Self {
        let secs = value.timestamp() + FILETIME_EPOCH_OFFSET_SECS;
        let ticks = secs * FILETIME_TICKS_PER_SEC + (value.timestamp_subsec_nanos() / 100) as i64;
        self.write_i64(ticks)
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    /// Write any [`Encode`] value
    pub fn write<T: Encode>(&mut self, value: T) -> &mut Self {
        value.encode(self);
        self
    }
}

impl From<Vec<u8>> for PacketBuffer {
    fn from(vec: Vec<u8>) -> Self {
        Self::from_bytes(&vec)
    }
}

impl From<&[u8]> for PacketBuffer {
    fn from(slice: &[u8]) -> Self {
        Self::from_bytes(slice)
    }
}

impl AsRef<[u8]> for PacketBuffer {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

// ============ Type-keyed codec ============

/// A value with a wire representation that can be appended to a buffer
pub trait Encode {
    fn encode(&self, buffer: &mut PacketBuffer);
}

/// A value that can be decoded from the read cursor of a buffer
pub trait Decode: Sized {
    fn decode(buffer: &mut PacketBuffer) -> DecodeResult<Self>;
}

macro_rules! primitive_codec {
    ($($ty:ty => $read:ident, $write:ident;)*) => {
        $(
            impl Encode for $ty {
                fn encode(&self, buffer: &mut PacketBuffer) {
                    buffer.$write(*self);
                }
            }

            impl Decode for $ty {
                fn decode(buffer: &mut PacketBuffer) -> DecodeResult<Self> {
                    buffer.$read()
                }
            }
        )*
    };
}

primitive_codec! {
    u8 => read_u8, write_u8;
    i8 => read_i8, write_i8;
    bool => read_bool, write_bool;
    i16 => read_i16, write_i16;
    u16 => read_u16, write_u16;
    i32 => read_i32, write_i32;
    u32 => read_u32, write_u32;
    i64 => read_i64, write_i64;
    f32 => read_f32, write_f32;
    f64 => read_f64, write_f64;
    DateTime<Utc> => read_filetime, write_filetime;
}

impl Encode for str {
    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_string(self);
    }
}

impl Encode for String {
    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_string(self);
    }
}

impl Decode for String {
    fn decode(buffer: &mut PacketBuffer) -> DecodeResult<Self> {
        buffer.read_string()
    }
}

/// A missing string goes out as the empty string
impl Encode for Option<&str> {
    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_string(self.unwrap_or_default());
    }
}

impl Encode for Option<String> {
    fn encode(&self, buffer: &mut PacketBuffer) {
        buffer.write_string(self.as_deref().unwrap_or_default());
    }
}

impl<T: Encode + ?Sized> Encode for &T {
    fn encode(&self, buffer: &mut PacketBuffer) {
        (**self).encode(buffer);
    }
}
