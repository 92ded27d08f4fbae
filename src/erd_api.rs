//! ERD command payloads
//!
//! The first payload byte of every ERD packet is a command opcode. This
//! module decodes a received payload into a borrowed [Command], checking its
//! length (and enumerated fields) against the command's layout, and encodes
//! a [Command] into an outgoing payload.
//!
//! ERD identifiers are always big-endian on the wire.
//!
//! ```text
//! ReadRequest           A0 request_id erd_hi erd_lo
//! ReadResponse          A1 request_id result erd_hi erd_lo [size data...]
//! WriteRequest          A2 request_id erd_hi erd_lo size data...
//! WriteResponse         A3 request_id result erd_hi erd_lo
//! SubscribeAllRequest   A4 request_id type
//! SubscribeAllResponse  A5 request_id result
//! Publication           A6 context request_id count (erd_hi erd_lo size data...)*
//! PublicationAck        A7 context request_id
//! HostStartup           A8
//! ```

use crate::packet::MAX_PAYLOAD;

/// A 16-bit Extended Resource Descriptor identifier
pub type Erd = u16;

/// ERD command opcodes
pub mod opcode {
    /// Read one ERD
    pub const READ_REQUEST: u8 = 0xA0;
    /// Answer to [READ_REQUEST]
    pub const READ_RESPONSE: u8 = 0xA1;
    /// Write one ERD
    pub const WRITE_REQUEST: u8 = 0xA2;
    /// Answer to [WRITE_REQUEST]
    pub const WRITE_RESPONSE: u8 = 0xA3;
    /// Subscribe to (or retain a subscription to) every ERD of a host
    pub const SUBSCRIBE_ALL_REQUEST: u8 = 0xA4;
    /// Answer to [SUBSCRIBE_ALL_REQUEST]
    pub const SUBSCRIBE_ALL_RESPONSE: u8 = 0xA5;
    /// Unsolicited ERD values from a subscription host
    pub const PUBLICATION: u8 = 0xA6;
    /// Acknowledges a [PUBLICATION]
    pub const PUBLICATION_ACK: u8 = 0xA7;
    /// A subscription host (re)started and lost its subscribers
    pub const SUBSCRIPTION_HOST_STARTUP: u8 = 0xA8;
}

const READ_REQUEST_LEN: usize = 4;
const READ_RESPONSE_HEADER_LEN: usize = 5;
const WRITE_REQUEST_HEADER_LEN: usize = 5;
const WRITE_RESPONSE_LEN: usize = 5;
const SUBSCRIBE_ALL_LEN: usize = 3;
const PUBLICATION_HEADER_LEN: usize = 4;
const PUBLICATION_ACK_LEN: usize = 3;
const PUBLICATION_ENTRY_HEADER_LEN: usize = 3;

/// Largest ERD value that fits in a write request or a read response
pub const MAX_DATA_SIZE: usize = MAX_PAYLOAD - WRITE_REQUEST_HEADER_LEN;

// Received values are copied into MAX_DATA_SIZE buffers
const _: () = assert!(MAX_PAYLOAD - READ_RESPONSE_HEADER_LEN - 1 <= MAX_DATA_SIZE);
const _: () = assert!(
    MAX_PAYLOAD - PUBLICATION_HEADER_LEN - PUBLICATION_ENTRY_HEADER_LEN <= MAX_DATA_SIZE
);

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident = $val:literal, )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        #[repr(u8)]
        pub enum $name {
            $( $(#[$vmeta])* $variant = $val, )*
        }

        impl TryFrom<u8> for $name {
            type Error = u8;

            fn try_from(value: u8) -> Result<Self, u8> {
                match value {
                    $( $val => Ok(Self::$variant), )*
                    other => Err(other),
                }
            }
        }
    };
}

wire_enum! {
    /// Result field of a read response
    pub enum ReadResult {
        /// The data follows
        Success = 0,
        /// The host does not have this ERD
        UnsupportedErd = 1,
        /// The host can't answer right now, try again later
        Busy = 2,
    }
}

wire_enum! {
    /// Result field of a write response
    pub enum WriteResult {
        /// The value was written
        Success = 0,
        /// The host does not have this ERD
        UnsupportedErd = 1,
        /// The value has the wrong size for this ERD
        IncorrectSize = 2,
        /// The host can't answer right now, try again later
        Busy = 3,
    }
}

wire_enum! {
    /// Result field of a subscribe-all response
    pub enum SubscribeAllResult {
        /// The subscription was added or retained
        Success = 0,
        /// The host has no room for another subscriber
        NoAvailableSubscriptions = 1,
    }
}

wire_enum! {
    /// Type field of a subscribe-all request
    pub enum SubscribeType {
        /// Start a new subscription
        Add = 0,
        /// Keep an existing subscription alive
        Retain = 1,
    }
}

/// One decoded ERD command, borrowing its data from the packet payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Command<'a> {
    ReadRequest {
        request_id: u8,
        erd: Erd,
    },
    /// `data` is empty unless `result` is [ReadResult::Success]
    ReadResponse {
        request_id: u8,
        result: ReadResult,
        erd: Erd,
        data: &'a [u8],
    },
    WriteRequest {
        request_id: u8,
        erd: Erd,
        data: &'a [u8],
    },
    WriteResponse {
        request_id: u8,
        result: WriteResult,
        erd: Erd,
    },
    SubscribeAllRequest {
        request_id: u8,
        kind: SubscribeType,
    },
    SubscribeAllResponse {
        request_id: u8,
        result: SubscribeAllResult,
    },
    Publication(Publication<'a>),
    PublicationAck {
        context: u8,
        request_id: u8,
    },
    SubscriptionHostStartup,
}

#[inline]
fn erd_at(payload: &[u8], idx: usize) -> Erd {
    Erd::from_be_bytes([payload[idx], payload[idx + 1]])
}

impl<'a> Command<'a> {
    /// Decode and validate a packet payload
    ///
    /// Returns [None] for unknown opcodes, payloads whose length does not
    /// match their layout, and out of range enumerated fields.
    pub fn decode(payload: &'a [u8]) -> Option<Self> {
        let (&op, _) = payload.split_first()?;
        let len = payload.len();

        let cmd = match op {
            opcode::READ_REQUEST if len == READ_REQUEST_LEN => Command::ReadRequest {
                request_id: payload[1],
                erd: erd_at(payload, 2),
            },
            opcode::READ_RESPONSE if len >= READ_RESPONSE_HEADER_LEN => {
                let result = ReadResult::try_from(payload[2]).ok()?;
                let data = match (result, len) {
                    (ReadResult::Success, _) => {
                        let size = usize::from(*payload.get(READ_RESPONSE_HEADER_LEN)?);
                        let data = &payload[READ_RESPONSE_HEADER_LEN + 1..];
                        if data.len() != size {
                            return None;
                        }
                        data
                    }
                    (_, READ_RESPONSE_HEADER_LEN) => &[],
                    _ => return None,
                };
                Command::ReadResponse {
                    request_id: payload[1],
                    result,
                    erd: erd_at(payload, 3),
                    data,
                }
            }
            opcode::WRITE_REQUEST if len >= WRITE_REQUEST_HEADER_LEN => {
                let data = &payload[WRITE_REQUEST_HEADER_LEN..];
                if data.len() != usize::from(payload[4]) {
                    return None;
                }
                Command::WriteRequest {
                    request_id: payload[1],
                    erd: erd_at(payload, 2),
                    data,
                }
            }
            opcode::WRITE_RESPONSE if len == WRITE_RESPONSE_LEN => Command::WriteResponse {
                request_id: payload[1],
                result: WriteResult::try_from(payload[2]).ok()?,
                erd: erd_at(payload, 3),
            },
            opcode::SUBSCRIBE_ALL_REQUEST if len == SUBSCRIBE_ALL_LEN => {
                Command::SubscribeAllRequest {
                    request_id: payload[1],
                    kind: SubscribeType::try_from(payload[2]).ok()?,
                }
            }
            opcode::SUBSCRIBE_ALL_RESPONSE if len == SUBSCRIBE_ALL_LEN => {
                Command::SubscribeAllResponse {
                    request_id: payload[1],
                    result: SubscribeAllResult::try_from(payload[2]).ok()?,
                }
            }
            opcode::PUBLICATION => Command::Publication(Publication::decode(payload)?),
            opcode::PUBLICATION_ACK if len == PUBLICATION_ACK_LEN => Command::PublicationAck {
                context: payload[1],
                request_id: payload[2],
            },
            opcode::SUBSCRIPTION_HOST_STARTUP if len == 1 => Command::SubscriptionHostStartup,
            _ => return None,
        };

        Some(cmd)
    }

    /// The size of this command's payload
    pub fn encoded_len(&self) -> usize {
        match self {
            Command::ReadRequest { .. } => READ_REQUEST_LEN,
            Command::ReadResponse { result, data, .. } => match result {
                ReadResult::Success => READ_RESPONSE_HEADER_LEN + 1 + data.len(),
                _ => READ_RESPONSE_HEADER_LEN,
            },
            Command::WriteRequest { data, .. } => WRITE_REQUEST_HEADER_LEN + data.len(),
            Command::WriteResponse { .. } => WRITE_RESPONSE_LEN,
            Command::SubscribeAllRequest { .. } | Command::SubscribeAllResponse { .. } => {
                SUBSCRIBE_ALL_LEN
            }
            Command::Publication(publication) => publication.payload.len(),
            Command::PublicationAck { .. } => PUBLICATION_ACK_LEN,
            Command::SubscriptionHostStartup => 1,
        }
    }

    /// Encode this command into the start of `out`
    ///
    /// Returns the number of bytes written, or [None] if `out` is too
    /// small or the data does not fit in a one byte size field.
    pub fn encode(&self, out: &mut [u8]) -> Option<usize> {
        let len = self.encoded_len();
        let out = out.get_mut(..len)?;

        match *self {
            Command::ReadRequest { request_id, erd } => {
                out[0] = opcode::READ_REQUEST;
                out[1] = request_id;
                out[2..4].copy_from_slice(&erd.to_be_bytes());
            }
            Command::ReadResponse {
                request_id,
                result,
                erd,
                data,
            } => {
                out[0] = opcode::READ_RESPONSE;
                out[1] = request_id;
                out[2] = result as u8;
                out[3..5].copy_from_slice(&erd.to_be_bytes());
                if result == ReadResult::Success {
                    out[5] = u8::try_from(data.len()).ok()?;
                    out[6..].copy_from_slice(data);
                }
            }
            Command::WriteRequest {
                request_id,
                erd,
                data,
            } => {
                out[0] = opcode::WRITE_REQUEST;
                out[1] = request_id;
                out[2..4].copy_from_slice(&erd.to_be_bytes());
                out[4] = u8::try_from(data.len()).ok()?;
                out[5..].copy_from_slice(data);
            }
            Command::WriteResponse {
                request_id,
                result,
                erd,
            } => {
                out[0] = opcode::WRITE_RESPONSE;
                out[1] = request_id;
                out[2] = result as u8;
                out[3..5].copy_from_slice(&erd.to_be_bytes());
            }
            Command::SubscribeAllRequest { request_id, kind } => {
                out.copy_from_slice(&[opcode::SUBSCRIBE_ALL_REQUEST, request_id, kind as u8]);
            }
            Command::SubscribeAllResponse { request_id, result } => {
                out.copy_from_slice(&[opcode::SUBSCRIBE_ALL_RESPONSE, request_id, result as u8]);
            }
            Command::Publication(publication) => {
                out.copy_from_slice(publication.payload);
            }
            Command::PublicationAck {
                context,
                request_id,
            } => {
                out.copy_from_slice(&[opcode::PUBLICATION_ACK, context, request_id]);
            }
            Command::SubscriptionHostStartup => {
                out[0] = opcode::SUBSCRIPTION_HOST_STARTUP;
            }
        }

        Some(len)
    }
}

/// A validated subscription publication
///
/// Holds the whole payload, which has already been checked to contain
/// exactly `count` well formed entries ending at the payload end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Publication<'a> {
    /// Opaque value echoed back in the acknowledgement
    pub context: u8,
    /// Opaque value echoed back in the acknowledgement
    pub request_id: u8,
    payload: &'a [u8],
}

impl<'a> Publication<'a> {
    fn decode(payload: &'a [u8]) -> Option<Self> {
        if payload.len() < PUBLICATION_HEADER_LEN {
            return None;
        }

        let claimed = usize::from(payload[3]);
        let mut entries = PublicationEntries {
            rest: &payload[PUBLICATION_HEADER_LEN..],
        };
        let mut actual = 0;
        while !entries.rest.is_empty() {
            entries.next()?;
            actual += 1;
        }

        (actual == claimed).then_some(Self {
            context: payload[1],
            request_id: payload[2],
            payload,
        })
    }

    /// Number of ERD values carried
    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.payload[3])
    }

    /// Does this publication carry no ERD values at all?
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate over the `(erd, data)` entries
    pub fn entries(&self) -> PublicationEntries<'a> {
        PublicationEntries {
            rest: &self.payload[PUBLICATION_HEADER_LEN..],
        }
    }
}

/// Iterator over the entries of a [Publication]
#[derive(Debug, Clone)]
pub struct PublicationEntries<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for PublicationEntries<'a> {
    type Item = (Erd, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < PUBLICATION_ENTRY_HEADER_LEN {
            return None;
        }
        let erd = erd_at(self.rest, 0);
        let size = usize::from(self.rest[2]);
        let end = PUBLICATION_ENTRY_HEADER_LEN + size;
        let data = self.rest.get(PUBLICATION_ENTRY_HEADER_LEN..end)?;
        self.rest = &self.rest[end..];
        Some((erd, data))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        frame::{encode, Feed, FrameAccumulator},
        packet::{crc16_block, Packet, CRC_SEED, ETX, STX},
    };

    fn round_trip(cmd: Command<'_>) {
        let mut buf = [0u8; MAX_PAYLOAD];
        let len = cmd.encode(&mut buf).unwrap();
        assert_eq!(len, cmd.encoded_len());
        assert_eq!(Command::decode(&buf[..len]), Some(cmd));
    }

    #[test]
    fn read_request_from_the_wire() {
        // dest C0, src E4, ReadRequest for ERD 0x0008 with request id 1
        let body = [0xC0, 0x0B, 0xE4, 0xA0, 0x01, 0x00, 0x08];
        let crc = crc16_block(CRC_SEED, &body);
        let mut acc = FrameAccumulator::new();
        acc.feed(STX);
        for b in body.iter().chain(crc.to_be_bytes().iter()) {
            acc.feed(*b);
        }
        assert_eq!(acc.feed(ETX), Feed::Complete);

        let packet = acc.packet().unwrap();
        assert_eq!(packet.destination, 0xC0);
        assert_eq!(packet.source, 0xE4);
        assert_eq!(
            Command::decode(&packet.payload),
            Some(Command::ReadRequest {
                request_id: 1,
                erd: 0x0008
            })
        );
    }

    #[test]
    fn every_command_round_trips() {
        round_trip(Command::ReadRequest {
            request_id: 3,
            erd: 0xF00D,
        });
        round_trip(Command::ReadResponse {
            request_id: 3,
            result: ReadResult::Success,
            erd: 0x1234,
            data: &[1, 2, 3],
        });
        round_trip(Command::ReadResponse {
            request_id: 3,
            result: ReadResult::UnsupportedErd,
            erd: 0x1234,
            data: &[],
        });
        round_trip(Command::WriteRequest {
            request_id: 9,
            erd: 0x0035,
            data: &[0xE2, 0xE3],
        });
        round_trip(Command::WriteResponse {
            request_id: 9,
            result: WriteResult::IncorrectSize,
            erd: 0x0035,
        });
        round_trip(Command::SubscribeAllRequest {
            request_id: 0,
            kind: SubscribeType::Retain,
        });
        round_trip(Command::SubscribeAllResponse {
            request_id: 0,
            result: SubscribeAllResult::NoAvailableSubscriptions,
        });
        round_trip(Command::PublicationAck {
            context: 7,
            request_id: 8,
        });
        round_trip(Command::SubscriptionHostStartup);
    }

    #[test]
    fn erds_are_big_endian() {
        let mut buf = [0u8; 4];
        Command::ReadRequest {
            request_id: 0,
            erd: 0x1234,
        }
        .encode(&mut buf)
        .unwrap();
        assert_eq!(buf, [0xA0, 0x00, 0x12, 0x34]);
    }

    #[test]
    fn encode_needs_room() {
        let mut buf = [0u8; 3];
        let cmd = Command::ReadRequest {
            request_id: 0,
            erd: 0,
        };
        assert_eq!(cmd.encode(&mut buf), None);
    }

    #[test]
    fn bad_lengths_are_rejected() {
        let bad: &[&[u8]] = &[
            &[],
            &[0xA0, 0x01, 0x00],
            &[0xA0, 0x01, 0x00, 0x08, 0x00],
            // success without a size byte
            &[0xA1, 0x01, 0x00, 0x00, 0x08],
            // size says 2, one byte present
            &[0xA1, 0x01, 0x00, 0x00, 0x08, 0x02, 0xAA],
            // failure with trailing data
            &[0xA1, 0x01, 0x01, 0x00, 0x08, 0x00],
            &[0xA2, 0x01, 0x00, 0x08, 0x02, 0xAA],
            &[0xA3, 0x01, 0x00, 0x00],
            &[0xA4, 0x01],
            &[0xA5, 0x01, 0x00, 0x00],
            &[0xA7, 0x01],
            &[0xA8, 0x00],
            &[0xA9],
        ];
        for payload in bad {
            assert_eq!(Command::decode(payload), None, "{payload:02X?}");
        }
    }

    #[test]
    fn bad_enumerations_are_rejected() {
        assert_eq!(Command::decode(&[0xA1, 0x01, 0x03, 0x00, 0x08]), None);
        assert_eq!(Command::decode(&[0xA3, 0x01, 0x04, 0x00, 0x08]), None);
        assert_eq!(Command::decode(&[0xA4, 0x01, 0x02]), None);
        assert_eq!(Command::decode(&[0xA5, 0x01, 0x02]), None);
    }

    #[test]
    fn busy_results_decode() {
        assert_eq!(
            Command::decode(&[0xA1, 0x01, 0x02, 0x00, 0x08]),
            Some(Command::ReadResponse {
                request_id: 1,
                result: ReadResult::Busy,
                erd: 8,
                data: &[],
            })
        );
        assert_eq!(
            Command::decode(&[0xA3, 0x01, 0x03, 0x00, 0x08]),
            Some(Command::WriteResponse {
                request_id: 1,
                result: WriteResult::Busy,
                erd: 8,
            })
        );
    }

    #[test]
    fn publication_entries() {
        let payload = [
            0xA6, 0x11, 0x22, 0x02, // header
            0x00, 0x01, 0x01, 0xAA, // 0x0001 = [AA]
            0x12, 0x34, 0x00, // 0x1234 = []
        ];
        let Some(Command::Publication(publication)) = Command::decode(&payload) else {
            panic!("not a publication");
        };
        assert_eq!(publication.context, 0x11);
        assert_eq!(publication.request_id, 0x22);
        assert_eq!(publication.len(), 2);

        let mut entries = publication.entries();
        assert_eq!(entries.next(), Some((0x0001, &[0xAA][..])));
        assert_eq!(entries.next(), Some((0x1234, &[][..])));
        assert_eq!(entries.next(), None);

        round_trip(Command::Publication(publication));
    }

    #[test]
    fn empty_publication() {
        let Some(Command::Publication(publication)) = Command::decode(&[0xA6, 0, 0, 0]) else {
            panic!("not a publication");
        };
        assert!(publication.is_empty());
        assert_eq!(publication.entries().next(), None);
    }

    #[test]
    fn publication_count_mismatch_is_rejected() {
        // claims two entries, only one fits
        assert_eq!(
            Command::decode(&[0xA6, 0x11, 0x22, 0x02, 0x00, 0x01, 0x01, 0xAA]),
            None
        );
        // claims one entry, carries two
        assert_eq!(
            Command::decode(&[0xA6, 0, 0, 0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x00]),
            None
        );
        // entry size runs past the end
        assert_eq!(
            Command::decode(&[0xA6, 0, 0, 0x01, 0x00, 0x01, 0x02, 0xAA]),
            None
        );
        // trailing bytes too short to be an entry
        assert_eq!(
            Command::decode(&[0xA6, 0, 0, 0x01, 0x00, 0x01, 0x00, 0x55]),
            None
        );
        assert_eq!(Command::decode(&[0xA6, 0, 0]), None);
    }

    #[test]
    fn max_data_size_fits_a_frame() {
        let data = [0x5A; MAX_DATA_SIZE];
        let cmd = Command::WriteRequest {
            request_id: 0,
            erd: 1,
            data: &data,
        };
        assert_eq!(cmd.encoded_len(), MAX_PAYLOAD);
        let mut packet = Packet::zeroed(0xC0, 0xE4, cmd.encoded_len()).unwrap();
        cmd.encode(&mut packet.payload).unwrap();
        let wire = encode(&packet);
        let mut acc = FrameAccumulator::new();
        let mut last = Feed::Ignored;
        for b in wire.iter() {
            last = acc.feed(*b);
        }
        assert_eq!(last, Feed::Complete);
        assert_eq!(Command::decode(&acc.packet().unwrap().payload), Some(cmd));
    }
}
