//! GEA3 Interface
//!
//! GEA3 uses the same framing as GEA2, but without any of its bus-level
//! reliability: no ACK byte, no reflection checking and no backoff. Lost
//! frames are recovered by the ERD client's own retries.
//!
//! Sending is driven by the UART's transmit-complete notification. The host
//! calls [Gea3Interface::byte_sent()] every time a byte has left the wire,
//! and the interface answers with the next one. Packets handed over while
//! a frame is still going out wait in a bounded FIFO.

use heapless::Deque;

use crate::{
    frame::{Feed, FrameAccumulator, FrameEncoder},
    packet::{is_gea3_broadcast, Packet},
    ByteSerial, GeaInterface, SendError,
};

/// Default number of packets that can wait behind the one being sent
pub const DEFAULT_SEND_QUEUE_DEPTH: usize = 4;

/// Configuration of a [Gea3Interface]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gea3Config {
    /// Our own address on the bus
    pub address: u8,
    /// Accept every frame regardless of its destination, for bus capture
    pub ignore_destination_address: bool,
}

impl Default for Gea3Config {
    fn default() -> Self {
        Self {
            address: 0xE4,
            ignore_destination_address: false,
        }
    }
}

/// A GEA3 link interface
///
/// `Q` is the depth of the outgoing queue, not counting the packet
/// currently being sent.
pub struct Gea3Interface<S: ByteSerial, const Q: usize = DEFAULT_SEND_QUEUE_DEPTH> {
    serial: S,
    config: Gea3Config,
    rx: FrameAccumulator,
    rx_ready: Option<Packet>,
    tx: Option<FrameEncoder>,
    queue: Deque<Packet, Q>,
}

impl<S: ByteSerial, const Q: usize> Gea3Interface<S, Q> {
    /// Create a new, idle interface
    pub const fn new(serial: S, config: Gea3Config) -> Self {
        Self {
            serial,
            config,
            rx: FrameAccumulator::new(),
            rx_ready: None,
            tx: None,
            queue: Deque::new(),
        }
    }

    /// Our own address on the link
    #[inline]
    pub fn address(&self) -> u8 {
        self.config.address
    }

    /// Is a frame currently being handed to the UART?
    #[inline]
    pub fn is_sending(&self) -> bool {
        self.tx.is_some()
    }

    /// Number of packets waiting behind the current one
    #[inline]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Handle one byte received from the UART
    pub fn byte_received(&mut self, byte: u8) {
        // Hold off entirely until the last packet has been picked up
        if self.rx_ready.is_some() {
            return;
        }

        if self.rx.feed(byte) != Feed::Complete {
            return;
        }

        match self.rx.destination() {
            Some(dest) if self.is_addressed_to_me(dest) => {
                self.rx_ready = self.rx.packet();
            }
            _ => {}
        }
    }

    /// Handle the UART finishing the last byte it was given
    pub fn byte_sent(&mut self) {
        match self.tx.as_mut() {
            Some(encoder) => {
                if let Some(byte) = encoder.next_byte() {
                    if encoder.is_done() {
                        self.tx = None;
                    }
                    self.serial.send(byte);
                }
            }
            None => {
                if let Some(packet) = self.queue.pop_front() {
                    self.start(&packet);
                }
            }
        }
    }

    fn start(&mut self, packet: &Packet) {
        let mut encoder = FrameEncoder::new(packet);
        if let Some(stx) = encoder.next_byte() {
            self.tx = Some(encoder);
            self.serial.send(stx);
        }
    }

    fn is_addressed_to_me(&self, destination: u8) -> bool {
        destination == self.config.address
            || is_gea3_broadcast(destination)
            || self.config.ignore_destination_address
    }

    fn send_worker<F>(
        &mut self,
        destination: u8,
        payload_len: usize,
        populate: F,
        set_source_address: bool,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet),
    {
        let mut packet = Packet::zeroed(destination, self.config.address, payload_len)
            .ok_or(SendError::PayloadTooLarge)?;

        if self.tx.is_some() && self.queue.is_full() {
            gea_warn!("GEA3 send queue full");
            return Err(SendError::QueueFull);
        }

        populate(&mut packet);
        if set_source_address {
            packet.source = self.config.address;
        }
        packet.destination = destination;

        if self.tx.is_some() {
            // Checked for room above
            let _ = self.queue.push_back(packet);
        } else {
            self.start(&packet);
        }
        Ok(())
    }
}

impl<S: ByteSerial, const Q: usize> GeaInterface for Gea3Interface<S, Q> {
    fn send<F>(&mut self, destination: u8, payload_len: usize, populate: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet),
    {
        self.send_worker(destination, payload_len, populate, true)
    }

    fn forward<F>(
        &mut self,
        destination: u8,
        payload_len: usize,
        populate: F,
    ) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet),
    {
        self.send_worker(destination, payload_len, populate, false)
    }

    fn receive(&mut self) -> Option<Packet> {
        self.rx_ready.take()
    }
}
