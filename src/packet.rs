//! GEA packets and wire constants
//!
//! A [Packet] is the in-memory form of one frame: the two address fields and
//! the payload. The wire form additionally carries a length byte, a CRC-16,
//! and STX/ETX framing, see [`frame`][crate::frame].

use heapless::Vec;

/// Escape byte, prefixes any data byte in the `0xE0..=0xE3` range
pub const ESC: u8 = 0xE0;
/// Bus acknowledgement byte (GEA2 only)
pub const ACK: u8 = 0xE1;
/// Start of frame
pub const STX: u8 = 0xE2;
/// End of frame
pub const ETX: u8 = 0xE3;

/// The broadcast address
pub const BROADCAST_ADDRESS: u8 = 0xFF;

/// Seed of the frame CRC
pub const CRC_SEED: u16 = 0x1021;

/// STX, ETX, CRC (MSB + LSB), destination, length, source
pub const TRANSMISSION_OVERHEAD: usize = 7;

/// Destination, length, source
pub const HEADER_SIZE: usize = 3;

/// Largest payload that fits in a frame whose length byte must fit in a `u8`
pub const MAX_PAYLOAD: usize = 255 - TRANSMISSION_OVERHEAD;

/// Everything between STX and ETX: header, payload and CRC
pub(crate) const MAX_FRAME_BODY: usize = HEADER_SIZE + MAX_PAYLOAD + 2;

const GEA2_BROADCAST_MASK: u8 = 0xF0;

/// Does this byte collide with one of the control bytes?
#[inline]
pub const fn needs_escape(byte: u8) -> bool {
    (byte & 0xFC) == ESC
}

/// Is this address broadcast-class on a GEA2 bus?
///
/// GEA2 treats every address in `0xF0..=0xFF` as a broadcast.
#[inline]
pub const fn is_gea2_broadcast(address: u8) -> bool {
    (address & GEA2_BROADCAST_MASK) == GEA2_BROADCAST_MASK
}

/// Is this the GEA3 broadcast address?
#[inline]
pub const fn is_gea3_broadcast(address: u8) -> bool {
    address == BROADCAST_ADDRESS
}

/// Fold one byte into a running CRC-16 (polynomial 0x1021, MSB first)
#[inline]
pub const fn crc16_byte(crc: u16, byte: u8) -> u16 {
    let mut x = ((crc >> 8) as u8) ^ byte;
    x ^= x >> 4;
    let x = x as u16;
    (crc << 8) ^ (x << 12) ^ (x << 5) ^ x
}

/// Fold a block of bytes into a running CRC-16
pub fn crc16_block(seed: u16, data: &[u8]) -> u16 {
    data.iter().fold(seed, |crc, b| crc16_byte(crc, *b))
}

/// One GEA packet, without its wire framing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Address of the node this packet is for
    pub destination: u8,
    /// Address of the node that sent this packet
    pub source: u8,
    /// The payload, at most [MAX_PAYLOAD] bytes
    pub payload: Vec<u8, MAX_PAYLOAD>,
}

impl Packet {
    /// Create a packet with a zero-filled payload of `payload_len` bytes
    ///
    /// Returns [None] if `payload_len` exceeds [MAX_PAYLOAD].
    pub fn zeroed(destination: u8, source: u8, payload_len: usize) -> Option<Self> {
        let mut payload = Vec::new();
        payload.resize(payload_len, 0).ok()?;
        Some(Self {
            destination,
            source,
            payload,
        })
    }

    /// Create a packet carrying a copy of `payload`
    pub fn new(destination: u8, source: u8, payload: &[u8]) -> Option<Self> {
        Some(Self {
            destination,
            source,
            payload: Vec::from_slice(payload).ok()?,
        })
    }

    /// The value of the wire length byte for this packet
    #[inline]
    pub fn wire_length(&self) -> u8 {
        // payload is capped at MAX_PAYLOAD, so this always fits
        (self.payload.len() + TRANSMISSION_OVERHEAD) as u8
    }

    /// Serialize the unescaped frame body: header, payload, then CRC
    pub(crate) fn to_frame_body(&self) -> Vec<u8, MAX_FRAME_BODY> {
        let mut body: Vec<u8, MAX_FRAME_BODY> = Vec::new();
        // Capacity is sized for a full header, payload and CRC, none of
        // these pushes can fail.
        let _ = body.push(self.destination);
        let _ = body.push(self.wire_length());
        let _ = body.push(self.source);
        let _ = body.extend_from_slice(&self.payload);
        let crc = crc16_block(CRC_SEED, &body);
        let _ = body.extend_from_slice(&crc.to_be_bytes());
        body
    }

    /// Rebuild a packet from an already-validated frame body
    pub(crate) fn from_frame_body(body: &[u8]) -> Option<Self> {
        if body.len() < HEADER_SIZE + 2 {
            return None;
        }
        let payload = &body[HEADER_SIZE..body.len() - 2];
        Self::new(body[0], body[2], payload)
    }
}
