//! # GEA Comms
//!
//! This is a small netstack for GE Appliances' serial appliance bus. It has
//! two halves:
//!
//! 1. Link layer interfaces, which turn a raw, error-prone serial byte stream
//!    into validated [Packet]s, for both generations of the bus:
//!     * [GEA2][gea2::Gea2Interface]: a half-duplex, multi-drop bus with
//!       byte-echo collision detection, bus-level ACKs and randomized backoff
//!     * [GEA3][gea3::Gea3Interface]: a simpler link with an outbound packet
//!       queue, and no bus-level reliability at all
//! 2. An [ERD client][erd_client::ErdClient], which turns packets into
//!    correlated read, write and subscribe requests on 16-bit ERD
//!    ("Extended Resource Descriptor") identifiers, with queueing,
//!    deduplication, retries and subscription fan-out.
//!
//! ## Message Framing
//!
//! Both generations share the same frame:
//!
//! ```text
//! STX(E2) [destination] [length] [source] [payload...] [crc_hi] [crc_lo] ETX(E3)
//! ```
//!
//! * `length` counts the whole frame, including STX, ETX and the CRC, so it is
//!   always the payload length plus seven.
//! * Any byte in `0xE0..=0xE3` between STX and ETX is preceded by an `ESC(E0)`.
//! * The CRC is a CRC-16 (polynomial `0x1021`) seeded with `0x1021`, over the
//!   unescaped bytes from `destination` to the end of the payload. A frame is
//!   valid when continuing the CRC over the two CRC bytes yields zero.
//!
//! Frames with a bad length, a bad CRC, or a destination that is not ours
//! are silently dropped. Recovery is up to whoever sent them.
//!
//! ## Collision avoidance on GEA2
//!
//! GEA2 has no arbitration hardware. Every byte put on the wire is echoed back
//! to the sender, so the sender compares each echo ("reflection") against
//! what it sent. A mismatch or a missing echo means someone else was talking,
//! and the sender backs off for an address-salted pseudo-random period before
//! trying again. Unicast frames are additionally acknowledged with a single
//! unescaped `ACK(E1)` byte.
//!
//! ## Scheduling
//!
//! Everything in this crate is single-threaded and cooperative. Nothing blocks:
//! waiting is always expressed as returning to the caller with a deadline
//! armed, which is checked again on the next poll.
//!
//! The host is expected to:
//!
//! * Call `byte_received` for every byte the UART receives, and (for GEA3)
//!   `byte_sent` every time the UART finishes sending a byte
//! * Call `tick` on a GEA2 interface once per millisecond
//! * Call [`ErdClient::run()`][erd_client::ErdClient::run] from its main loop
//!
//! The byte handlers mutate interface state directly. If they are called from
//! an interrupt on a preemptive target, wrap the interface in a
//! [SharedInterface][shared::SharedInterface] so that every access is made
//! under a mutex.
//!
//! A received packet is only handed out, and its buffer only released, from
//! [`GeaInterface::receive()`]. Until then, bytes of any following frame
//! are dropped rather than overwriting a packet that has not been read yet.

#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs)]

#[macro_use]
mod macros;

pub mod erd_api;
pub mod erd_client;
pub mod frame;
pub mod gea2;
pub mod gea3;
pub mod packet;
pub mod shared;
mod timer;

use embassy_time::Instant;

pub use crate::{
    erd_client::{Activity, ActivitySink, ErdClient},
    gea2::Gea2Interface,
    gea3::Gea3Interface,
    packet::Packet,
};

/// An error when handing a packet to an interface for sending
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SendError {
    /// A send is already in progress, and this interface does not queue
    Busy,
    /// The payload does not fit in a single frame
    PayloadTooLarge,
    /// A send is in progress, and the outgoing queue is full
    QueueFull,
}

/// A trait representing the byte-level transmit side of a UART
///
/// Reception is the other way around: the host pushes each received byte
/// into the interface with its `byte_received` method.
pub trait ByteSerial {
    /// Begin sending a single byte.
    ///
    /// This MUST NOT block. Interfaces that need to know when the byte has
    /// left the wire expect the host to report it back, e.g.
    /// [`Gea3Interface::byte_sent()`].
    fn send(&mut self, byte: u8);
}

/// A monotonic millisecond clock
pub trait TimeSource {
    /// The current time
    fn now(&self) -> Instant;
}

impl<T: TimeSource> TimeSource for &T {
    fn now(&self) -> Instant {
        T::now(self)
    }
}

/// The packet-level capability shared by the GEA2 and GEA3 interfaces
pub trait GeaInterface {
    /// Send a packet to `destination`, stamping our own address as the source.
    ///
    /// `populate` is given a packet with a zeroed payload of `payload_len`
    /// bytes, and writes the payload directly into the outgoing buffer. It is
    /// not called at all if the packet cannot be accepted.
    fn send<F>(&mut self, destination: u8, payload_len: usize, populate: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet);

    /// Like [GeaInterface::send()], but the source address written by
    /// `populate` is kept as-is.
    fn forward<F>(
        &mut self,
        destination: u8,
        payload_len: usize,
        populate: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet);

    /// Take the received packet, if any.
    ///
    /// This is the only place a received packet is handed out, and the
    /// receive buffer is only released for the next frame after that.
    fn receive(&mut self) -> Option<Packet>;
}
