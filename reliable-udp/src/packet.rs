//! Wire-format definitions for protocol datagrams.
//!
//! Every datagram exchanged between peers is a [`Packet`].  This module is
//! responsible for:
//! - Defining the on-wire binary layout (header fields, flags, payload).
//! - Serialising a [`Packet`] into a byte buffer ready for transmission.
//! - Deserialising a raw byte slice back into a [`Packet`], returning errors
//!   for malformed or truncated input.
//!
//! No I/O happens here; this is pure data transformation.
//!
//! # Wire format
//!
//! All multi-byte integers are **big-endian**.
//!
//! ```text
//!  0               1               2               3
//!  0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |               Sequence Number / Byte Offset                   |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                    Acknowledgment Number                      |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |             Flags             |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                                                               |
//! +                     Timestamp (milliseconds)                  +
//! |                                                               |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                        Payload ...                            |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! Total header size: [`HEADER_LEN`] = 20 bytes.
//! seq(4) + ack(4) + flags(2) + payload_len(2) + timestamp(8)

use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Bit-flag constants for the `flags` header field.
///
/// A plain DATA packet carries no flags at all.
pub mod flags {
    /// Synchronise (handshake initiation).
    pub const SYN: u16 = 0x01;
    /// Acknowledgement field is valid.
    pub const ACK: u16 = 0x02;
    /// Finish: the sending side has no more data.
    pub const FIN: u16 = 0x04;
}

/// Byte length of the fixed-size header on the wire.
pub const HEADER_LEN: usize = 20;

// Byte offsets of each field within the serialised header.
const OFF_SEQ: usize = 0;
const OFF_ACK: usize = 4;
const OFF_FLAGS: usize = 8;
const OFF_PAYLOAD_LEN: usize = 10;
const OFF_TIMESTAMP: usize = 12;

/// Fixed-size protocol header.
///
/// Fields are in host byte order; [`Packet::encode`] converts to big-endian
/// on the wire and [`Packet::decode`] converts back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Byte offset of the first payload byte (or block index, depending on
    /// the session's ack mode).  Unused by control packets.
    pub seq: u32,
    /// Cumulative acknowledgement value.  Unused by DATA packets.
    pub ack: u32,
    /// Bitmask of [`flags`] constants.
    pub flags: u16,
    /// Length of the payload in bytes.
    ///
    /// On encode this is computed from the actual payload length.
    pub payload_len: u16,
    /// Sender wall-clock time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl Header {
    /// `true` when every bit of `mask` is set.
    pub fn has(&self, mask: u16) -> bool {
        self.flags & mask == mask
    }

    /// A DATA header carries no flags.
    pub fn is_data(&self) -> bool {
        self.flags == 0
    }
}

/// A complete protocol datagram: header + payload bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    fn control(flags: u16, seq: u32, ack: u32) -> Self {
        Packet {
            header: Header {
                seq,
                ack,
                flags,
                payload_len: 0,
                timestamp_ms: now_millis(),
            },
            payload: Vec::new(),
        }
    }

    /// Handshake opener sent by the sender.
    pub fn syn() -> Self {
        Self::control(flags::SYN, 0, 0)
    }

    /// Handshake reply; `ack` is the receiver's first expected value.
    pub fn syn_ack(ack: u32) -> Self {
        Self::control(flags::SYN | flags::ACK, 0, ack)
    }

    /// Cumulative acknowledgement.
    pub fn ack(ack: u32) -> Self {
        Self::control(flags::ACK, 0, ack)
    }

    /// Teardown initiation (sender) or the receiver's trailing FIN.
    pub fn fin(ack: u32) -> Self {
        Self::control(flags::FIN, 0, ack)
    }

    /// Receiver's immediate answer to a FIN.
    pub fn fin_ack(ack: u32) -> Self {
        Self::control(flags::ACK | flags::FIN, 0, ack)
    }

    /// A DATA packet; `seq` is a byte offset or a block index.
    pub fn data(seq: u32, payload: Vec<u8>) -> Self {
        Packet {
            header: Header {
                seq,
                ack: 0,
                flags: 0,
                payload_len: payload.len() as u16,
                timestamp_ms: now_millis(),
            },
            payload,
        }
    }

    /// Serialise this packet into a newly allocated byte vector.
    ///
    /// `header.payload_len` is computed from the actual payload; any value
    /// already stored in that field is ignored.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let payload_len = u16::try_from(self.payload.len())
            .map_err(|_| PacketError::PayloadTooLarge(self.payload.len()))?;
        let mut buf = Vec::with_capacity(HEADER_LEN + self.payload.len());

        buf.extend_from_slice(&self.header.seq.to_be_bytes());
        buf.extend_from_slice(&self.header.ack.to_be_bytes());
        buf.extend_from_slice(&self.header.flags.to_be_bytes());
        buf.extend_from_slice(&payload_len.to_be_bytes());
        buf.extend_from_slice(&self.header.timestamp_ms.to_be_bytes());
        buf.extend_from_slice(&self.payload);

        Ok(buf)
    }

    /// Parse a [`Packet`] from a raw byte slice.
    ///
    /// Returns [`Err`] if:
    /// - `buf` is shorter than [`HEADER_LEN`], or
    /// - fewer payload bytes follow the header than `payload_len` announces.
    ///
    /// Trailing bytes beyond `payload_len` are ignored.
    pub fn decode(buf: &[u8]) -> Result<Self, PacketError> {
        if buf.len() < HEADER_LEN {
            return Err(PacketError::MalformedHeader(buf.len()));
        }

        let seq = read_u32(buf, OFF_SEQ);
        let ack = read_u32(buf, OFF_ACK);
        let flags = read_u16(buf, OFF_FLAGS);
        let payload_len = read_u16(buf, OFF_PAYLOAD_LEN);
        let timestamp_ms = read_u64(buf, OFF_TIMESTAMP);

        let body = &buf[HEADER_LEN..];
        if body.len() < payload_len as usize {
            return Err(PacketError::TruncatedPayload {
                expected: payload_len,
                actual: body.len(),
            });
        }

        Ok(Packet {
            header: Header {
                seq,
                ack,
                flags,
                payload_len,
                timestamp_ms,
            },
            payload: body[..payload_len as usize].to_vec(),
        })
    }
}

/// Errors that can arise when encoding or parsing a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PacketError {
    /// Buffer shorter than the fixed header size.
    #[error("malformed header: {0} bytes, need {HEADER_LEN}")]
    MalformedHeader(usize),
    /// Header announces more payload than the datagram holds.
    #[error("truncated payload: header says {expected} bytes, got {actual}")]
    TruncatedPayload { expected: u16, actual: usize },
    /// Payload does not fit the 16-bit length field.
    #[error("payload of {0} bytes exceeds the 16-bit length field")]
    PayloadTooLarge(usize),
}

/// Milliseconds since the Unix epoch, or 0 if the clock is before it.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

/// Render a millisecond timestamp as a UTC `HH:MM:SS` wall-clock string.
///
/// The result is UTC, not local time; log lines that print it say `UTC`.
pub fn clock_string(timestamp_ms: u64) -> String {
    let secs = (timestamp_ms / 1000) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([buf[off], buf[off + 1]])
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_be_bytes(b)
}

fn read_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_be_bytes(b)
}
