//! # StayTerm Protocol Library
//!
//! Wire definitions shared by the StayTerm server and its clients.
//!
//! ## Overview
//!
//! - **Frame Codec**: Length-prefixed framing with optional LZ4 compression
//! - **Packets**: The tagged terminal packets of a running session
//! - **Handshake**: The hello and initial payload that open a connection
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │   Packets / Handshake messages          │  tag byte + MessagePack
//! ├─────────────────────────────────────────┤
//! │              Framing                    │  Length-prefixed, LZ4
//! ├─────────────────────────────────────────┤
//! │            Transport (TCP)              │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{Frame, FrameCodec, Packet};
//!
//! let packet = Packet::TerminalBuffer(b"hello\n".to_vec());
//! let codec = FrameCodec::new();
//! let wire = codec.encode(&Frame::new(packet.encode().unwrap())).unwrap();
//!
//! let (frame, _) = codec.decode(&wire).unwrap();
//! assert_eq!(Packet::decode(&frame.payload).unwrap(), packet);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec with compression
//! - [`packet`]: Session packets and their tags
//! - [`handshake`]: Connection-opening messages
//! - [`error`]: Error types

pub mod error;
pub mod framing;
pub mod handshake;
pub mod packet;

pub use error::{ProtocolError, Result};
pub use framing::{
    Frame, FrameCodec, FrameFlags, COMPRESSION_THRESHOLD, FRAME_HEADER_SIZE, FRAME_MAGIC,
    MAX_FRAME_SIZE,
};
pub use handshake::{ClientHello, InitialPayload};
pub use packet::{Packet, PacketType, TerminalBuffer, TerminalInfo};
