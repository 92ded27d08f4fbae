//! Frame encoding and accumulation
//!
//! Both bus generations share the same framing:
//!
//! ```text
//! STX [destination] [length] [source] [payload...] [crc_hi] [crc_lo] ETX
//! ```
//!
//! Any byte between STX and ETX that falls in the control range
//! (`0xE0..=0xE3`) is sent as `ESC` followed by the byte itself. The CRC is
//! computed over the unescaped bytes from `destination` to the end of the
//! payload; continuing it over the two CRC bytes yields zero.
//!
//! The transmitters push one byte at a time, so the [FrameEncoder] hands
//! out bytes one at a time as well. The [FrameAccumulator] is the mirror
//! image, consuming one received byte at a time.

use heapless::Vec;

use crate::packet::{
    crc16_byte, needs_escape, Packet, CRC_SEED, ESC, ETX, HEADER_SIZE, MAX_FRAME_BODY, STX,
};

/// Worst case size of a fully escaped frame, including STX and ETX
pub const MAX_ENCODED_FRAME: usize = 2 + 2 * MAX_FRAME_BODY;

#[derive(Debug, Clone, Copy, PartialEq)]
enum EncodeState {
    Stx,
    Body { offset: usize, escaped: bool },
    Etx,
    Done,
}

/// Byte-at-a-time frame transmitter
pub struct FrameEncoder {
    body: Vec<u8, MAX_FRAME_BODY>,
    state: EncodeState,
}

impl FrameEncoder {
    /// Prepare a packet for transmission
    pub fn new(packet: &Packet) -> Self {
        Self {
            body: packet.to_frame_body(),
            state: EncodeState::Stx,
        }
    }

    /// Start over from the STX, e.g. to retry a send
    pub fn restart(&mut self) {
        self.state = EncodeState::Stx;
    }

    /// Destination address of the frame being sent
    #[inline]
    pub fn destination(&self) -> u8 {
        self.body[0]
    }

    /// Has the ETX been handed out?
    #[inline]
    pub fn is_done(&self) -> bool {
        self.state == EncodeState::Done
    }

    /// Get the next byte to put on the wire, or [None] once the ETX has
    /// been handed out
    pub fn next_byte(&mut self) -> Option<u8> {
        match self.state {
            EncodeState::Stx => {
                self.state = EncodeState::Body {
                    offset: 0,
                    escaped: false,
                };
                Some(STX)
            }
            EncodeState::Body { offset, escaped } => {
                let byte = self.body[offset];
                if !escaped && needs_escape(byte) {
                    self.state = EncodeState::Body {
                        offset,
                        escaped: true,
                    };
                    return Some(ESC);
                }
                let offset = offset + 1;
                self.state = if offset >= self.body.len() {
                    EncodeState::Etx
                } else {
                    EncodeState::Body {
                        offset,
                        escaped: false,
                    }
                };
                Some(byte)
            }
            EncodeState::Etx => {
                self.state = EncodeState::Done;
                Some(ETX)
            }
            EncodeState::Done => None,
        }
    }
}

/// Encode a whole packet into its wire form
pub fn encode(packet: &Packet) -> Vec<u8, MAX_ENCODED_FRAME> {
    let mut enc = FrameEncoder::new(packet);
    let mut out = Vec::new();
    while let Some(b) = enc.next_byte() {
        // MAX_ENCODED_FRAME covers every byte being escaped
        let _ = out.push(b);
    }
    out
}

/// The result of feeding one byte to a [FrameAccumulator]
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Feed {
    /// The byte was buffered, or was an escape
    Consumed,
    /// The byte arrived outside of a frame and was dropped
    Ignored,
    /// An STX started a new frame
    Started,
    /// An ETX ended a frame with a valid length and CRC
    Complete,
    /// An ETX ended a frame that failed validation
    Rejected,
}

/// Byte-at-a-time frame receiver
///
/// Unescapes and buffers the bytes between STX and ETX, folding the CRC as
/// it goes. Address filtering is left to the interface, since GEA2 and GEA3
/// disagree on what counts as a broadcast.
pub struct FrameAccumulator {
    buf: Vec<u8, MAX_FRAME_BODY>,
    crc: u16,
    escaped: bool,
    overflow: bool,
    started: bool,
}

impl FrameAccumulator {
    /// Create an idle accumulator
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            crc: CRC_SEED,
            escaped: false,
            overflow: false,
            started: false,
        }
    }

    /// Discard anything buffered and begin a new frame, as if an STX had
    /// just been received
    pub fn start(&mut self) {
        self.buf.clear();
        self.crc = CRC_SEED;
        self.escaped = false;
        self.overflow = false;
        self.started = true;
    }

    /// Feed one received byte
    pub fn feed(&mut self, byte: u8) -> Feed {
        if self.escaped {
            self.escaped = false;
            return self.buffer(byte);
        }

        match byte {
            STX => {
                self.start();
                Feed::Started
            }
            ESC if self.started => {
                self.escaped = true;
                Feed::Consumed
            }
            ETX if self.started => {
                self.started = false;
                if self.is_valid() {
                    Feed::Complete
                } else {
                    gea_debug!("Dropping frame, {=usize} bytes", self.buf.len());
                    Feed::Rejected
                }
            }
            _ => self.buffer(byte),
        }
    }

    /// The unescaped bytes between STX and ETX, CRC included
    #[inline]
    pub fn body(&self) -> &[u8] {
        &self.buf
    }

    /// Destination of the buffered frame, if a header byte has arrived
    #[inline]
    pub fn destination(&self) -> Option<u8> {
        self.buf.first().copied()
    }

    /// Rebuild the packet of a [Feed::Complete] frame
    pub fn packet(&self) -> Option<Packet> {
        Packet::from_frame_body(&self.buf)
    }

    fn buffer(&mut self, byte: u8) -> Feed {
        if !self.started {
            return Feed::Ignored;
        }
        if self.buf.push(byte).is_err() {
            self.overflow = true;
        } else {
            self.crc = crc16_byte(self.crc, byte);
        }
        Feed::Consumed
    }

    fn is_valid(&self) -> bool {
        let count = self.buf.len();
        let has_min_len = count >= HEADER_SIZE + 2;
        // The length byte counts STX and ETX, which are never buffered
        let has_valid_len = has_min_len && usize::from(self.buf[1]) == count + 2;
        !self.overflow && has_valid_len && self.crc == 0
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
