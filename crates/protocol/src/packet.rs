//! Terminal packets exchanged during a running session.
//!
//! A packet is one tag byte followed by a MessagePack payload. Packets that
//! carry nothing ([`PacketType::KeepAlive`]) are the bare tag. Each packet is
//! sent as exactly one frame (see [`crate::framing`]), so the frame length
//! delimits the payload and the receiver always decodes it as one unit.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Single-byte tags identifying the packet kind on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Application-level liveness probe. Echoed back unchanged.
    KeepAlive = 0,
    /// Raw terminal bytes, in either direction.
    TerminalBuffer = 1,
    /// New terminal geometry from the client.
    TerminalInfo = 2,
}

impl PacketType {
    /// The wire tag byte.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(PacketType::KeepAlive),
            1 => Ok(PacketType::TerminalBuffer),
            2 => Ok(PacketType::TerminalInfo),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}

/// Terminal geometry, field for field the OS window-size structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalInfo {
    /// Number of character rows.
    pub rows: u16,
    /// Number of character columns.
    pub columns: u16,
    /// Width in pixels (0 when unknown).
    pub pixel_width: u16,
    /// Height in pixels (0 when unknown).
    pub pixel_height: u16,
}

impl TerminalInfo {
    /// Geometry with the given character size and no pixel dimensions.
    pub fn new(rows: u16, columns: u16) -> Self {
        Self {
            rows,
            columns,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Payload of a `TERMINAL_BUFFER` packet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TerminalBuffer {
    /// Raw terminal bytes, order preserved.
    #[serde(with = "serde_bytes")]
    pub buffer: Vec<u8>,
}

/// A decoded terminal packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Bytes written by the shell, or keystrokes sent by the client.
    TerminalBuffer(Vec<u8>),
    /// Liveness probe.
    KeepAlive,
    /// Window size change.
    TerminalInfo(TerminalInfo),
}

impl Packet {
    /// The tag this packet is sent under.
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::TerminalBuffer(_) => PacketType::TerminalBuffer,
            Packet::KeepAlive => PacketType::KeepAlive,
            Packet::TerminalInfo(_) => PacketType::TerminalInfo,
        }
    }

    /// Encode into the tag byte followed by the serialized payload.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let tag = self.packet_type().as_byte();
        let mut out = vec![tag];

        match self {
            Packet::KeepAlive => {}
            Packet::TerminalBuffer(bytes) => {
                // Borrowing variant of TerminalBuffer so shell output is not copied twice.
                #[derive(Serialize)]
                struct BufferRef<'a> {
                    #[serde(with = "serde_bytes")]
                    buffer: &'a [u8],
                }
                out.extend(rmp_serde::to_vec(&BufferRef { buffer: bytes })?);
            }
            Packet::TerminalInfo(info) => {
                out.extend(rmp_serde::to_vec(info)?);
            }
        }

        Ok(out)
    }

    /// Decode one packet from a complete message.
    pub fn decode(message: &[u8]) -> Result<Packet> {
        let (&tag, payload) = message.split_first().ok_or(ProtocolError::EmptyPacket)?;

        match PacketType::try_from(tag)? {
            PacketType::KeepAlive => {
                if !payload.is_empty() {
                    return Err(ProtocolError::UnexpectedPayload(payload.len()));
                }
                Ok(Packet::KeepAlive)
            }
            PacketType::TerminalBuffer => {
                let TerminalBuffer { buffer } = rmp_serde::from_slice(payload)?;
                Ok(Packet::TerminalBuffer(buffer))
            }
            PacketType::TerminalInfo => Ok(Packet::TerminalInfo(rmp_serde::from_slice(payload)?)),
        }
    }
}
