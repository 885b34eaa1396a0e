//! Wire message layout: header encoding, target modes, reserved commands.
//!
//! ```text
//! ┌──────────────── header (8 B) ─────────────────┐┌ data 0..MAX_DATA_MSG_SIZE ┐┌ CRC16 (2 B) ┐┌ ack? (1 B) ┐
//! │ cfg:4 | target_mode:4 (1B) │ target:u16 │ source:u16 │ cmd:u8 │ size:u16 │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! All multi-byte fields are little-endian. CRC is seeded `0xFFFF` and
//! covers header + data (+ timestamp trailer, when present); the HAL owns
//! the actual polynomial (`Hal::crc16`) so every node on the bus must be
//! built against the same HAL implementation.

use crate::config::{BROADCAST_VAL, DEFAULTID, HEADER_SIZE, MAX_DATA_MSG_SIZE};

/// Protocol commands reserved by the core; user commands start at
/// [`LUOS_LAST_RESERVED_CMD`].
pub mod cmd {
    pub const WRITE_NODE_ID: u8 = 0;
    pub const START_DETECTION: u8 = 1;
    pub const END_DETECTION: u8 = 2;
    pub const SET_BAUDRATE: u8 = 3;

    /// First command id available to user protocols.
    pub const LUOS_LAST_RESERVED_CMD: u8 = 16;
}

/// Base protocol version tag carried in the header's `cfg` nibble.
pub const BASE_PROTOCOL: u8 = 0;

/// Addressing mode of a message's `target` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TargetMode {
    ServiceId = 0,
    ServiceIdAck = 1,
    Type = 2,
    Broadcast = 3,
    Topic = 4,
    NodeId = 5,
    NodeIdAck = 6,
}

impl TargetMode {
    pub const fn from_bits(bits: u8) -> Option<Self> {
        Some(match bits {
            0 => Self::ServiceId,
            1 => Self::ServiceIdAck,
            2 => Self::Type,
            3 => Self::Broadcast,
            4 => Self::Topic,
            5 => Self::NodeId,
            6 => Self::NodeIdAck,
            _ => return None,
        })
    }

    pub const fn bits(self) -> u8 {
        self as u8
    }

    /// Whether this mode requests a one-byte ACK reply on successful receipt.
    pub const fn wants_ack(self) -> bool {
        matches!(self, Self::ServiceIdAck | Self::NodeIdAck)
    }
}

/// Fixed 8-byte message header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub config: u8,
    pub target_mode: TargetMode,
    pub target: u16,
    pub source: u16,
    pub cmd: u8,
    pub size: u16,
}

impl Header {
    pub const fn broadcast(cmd: u8, size: u16) -> Self {
        Self {
            config: BASE_PROTOCOL,
            target_mode: TargetMode::Broadcast,
            target: BROADCAST_VAL,
            source: DEFAULTID,
            cmd,
            size,
        }
    }

    pub fn encode(&self, out: &mut [u8; HEADER_SIZE]) {
        out[0] = (self.config << 4) | self.target_mode.bits();
        out[1..3].copy_from_slice(&self.target.to_le_bytes());
        out[3..5].copy_from_slice(&self.source.to_le_bytes());
        out[5] = self.cmd;
        out[6..8].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Option<Self> {
        let target_mode = TargetMode::from_bits(buf[0] & 0x0F)?;
        Some(Self {
            config: buf[0] >> 4,
            target_mode,
            target: u16::from_le_bytes([buf[1], buf[2]]),
            source: u16::from_le_bytes([buf[3], buf[4]]),
            cmd: buf[5],
            size: u16::from_le_bytes([buf[6], buf[7]]),
        })
    }
}

/// A complete parsed message: header plus its data payload.
///
/// `data` is bounded by [`MAX_DATA_MSG_SIZE`]; larger requests are
/// truncated by the caller before a [`Header`] with the truncated `size`
/// is ever constructed (see `Service::send`).
#[derive(Debug, Clone)]
pub struct Message {
    pub header: Header,
    pub data: heapless::Vec<u8, MAX_DATA_MSG_SIZE>,
}

impl Message {
    pub fn new(header: Header, data: &[u8]) -> Self {
        let mut buf = heapless::Vec::new();
        let n = data.len().min(MAX_DATA_MSG_SIZE);
        let _ = buf.extend_from_slice(&data[..n]);
        Self { header, data: buf }
    }
}

/// Where a message's concerned services live relative to the sending node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Localhost {
    /// Every concerned service lives on this node; the wire is not needed.
    Localhost,
    /// No concerned service lives on this node; must go out on the wire.
    ExternalHost,
    /// Concerned services exist both locally and elsewhere (broadcast/topic).
    MultiHost,
}

/// Little-endian node bootstrap payload exchanged during `WRITE_NODE_ID`
/// forwarding (the size-4 case in `robus_core::dispatch`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeBootstrap {
    pub prev_nodeid: u16,
    pub nodeid: u16,
}

impl NodeBootstrap {
    pub const ENCODED_SIZE: usize = 4;

    pub fn encode(&self) -> [u8; Self::ENCODED_SIZE] {
        let mut out = [0u8; Self::ENCODED_SIZE];
        out[0..2].copy_from_slice(&self.prev_nodeid.to_le_bytes());
        out[2..4].copy_from_slice(&self.nodeid.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_SIZE {
            return None;
        }
        Some(Self {
            prev_nodeid: u16::from_le_bytes([buf[0], buf[1]]),
            nodeid: u16::from_le_bytes([buf[2], buf[3]]),
        })
    }
}
