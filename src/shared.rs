//! Sharing an interface with an interrupt handler
//!
//! The byte handlers of the bus interfaces are typically called from UART
//! interrupts, while the [ErdClient][crate::ErdClient] polls the same
//! interface from the main loop. On a preemptive target those accesses must
//! not interleave.
//!
//! A [SharedInterface] keeps the interface behind a blocking mutex, and
//! exposes the interrupt-side methods through `&self`. A shared reference to
//! it is itself a [GeaInterface], so the client can own one.
//!
//! ```rust
//! use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
//! use gea_comms::{
//!     gea3::{Gea3Config, Gea3Interface},
//!     shared::SharedInterface,
//!     ByteSerial,
//! };
//!
//! struct Uart;
//!
//! impl ByteSerial for Uart {
//!     fn send(&mut self, _byte: u8) {
//!         // write to the TX register
//!     }
//! }
//!
//! // NOTE: any mutex suitable for you will do, such as `ThreadModeRawMutex`
//! // if the interface is never touched from an interrupt
//! static GEA3: SharedInterface<CriticalSectionRawMutex, Gea3Interface<Uart>> =
//!     SharedInterface::new(Gea3Interface::new(
//!         Uart,
//!         Gea3Config {
//!             address: 0xE4,
//!             ignore_destination_address: false,
//!         },
//!     ));
//!
//! // In the UART interrupt handler
//! GEA3.byte_received(0xE2);
//! GEA3.byte_sent();
//! ```

use core::cell::RefCell;

use embassy_sync::blocking_mutex::{raw::RawMutex, Mutex};

use crate::{
    gea2::Gea2Interface, gea3::Gea3Interface, ByteSerial, GeaInterface, Packet, SendError,
    TimeSource,
};

/// A bus interface behind a blocking mutex
pub struct SharedInterface<R: RawMutex, I> {
    inner: Mutex<R, RefCell<I>>,
}

impl<R: RawMutex, I> SharedInterface<R, I> {
    /// Wrap an interface
    pub const fn new(iface: I) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(iface)),
        }
    }

    /// Run `f` with exclusive access to the interface
    pub fn lock<T>(&self, f: impl FnOnce(&mut I) -> T) -> T {
        self.inner.lock(|cell| f(&mut cell.borrow_mut()))
    }
}

impl<R: RawMutex, S: ByteSerial, C: TimeSource> SharedInterface<R, Gea2Interface<S, C>> {
    /// See [Gea2Interface::byte_received()]
    pub fn byte_received(&self, byte: u8) {
        self.lock(|iface| iface.byte_received(byte))
    }

    /// See [Gea2Interface::tick()]
    pub fn tick(&self) {
        self.lock(|iface| iface.tick())
    }
}

impl<R: RawMutex, S: ByteSerial, const Q: usize> SharedInterface<R, Gea3Interface<S, Q>> {
    /// See [Gea3Interface::byte_received()]
    pub fn byte_received(&self, byte: u8) {
        self.lock(|iface| iface.byte_received(byte))
    }

    /// See [Gea3Interface::byte_sent()]
    pub fn byte_sent(&self) {
        self.lock(|iface| iface.byte_sent())
    }
}

impl<R: RawMutex, I: GeaInterface> GeaInterface for &SharedInterface<R, I> {
    fn send<F>(&mut self, destination: u8, payload_len: usize, populate: F) -> Result<(), SendError>
    where
        F: FnOnce(&mut Packet),
    {
        self.lock(|iface| iface.send(destination, payload_len, populate))
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
        self.lock(|iface| iface.forward(destination, payload_len, populate))
    }

    fn receive(&mut self) -> Option<Packet> {
        self.lock(|iface| iface.receive())
    }
}
