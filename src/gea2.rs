//! GEA2 Interface
//!
//! GEA2 is a shared, half-duplex, multi-drop bus with no arbitration
//! hardware. Every byte we put on the wire is echoed back to us, so the echo
//! doubles as both flow control and collision detection:
//!
//! * Each sent byte arms a reflection timer, and the next byte is only sent
//!   once the echo of the previous one has come back unchanged.
//! * A mismatched echo, or no echo at all, means a collision. The send is
//!   abandoned and retried after an address-salted pseudo-random backoff.
//! * Unicast frames are acknowledged by the receiver with a single `ACK` byte.
//!
//! The interface does not queue: only one packet may be in flight at a time,
//! and [`send()`][GeaInterface::send] fails with [SendError::Busy] until it
//! is done. Request/response correlation is left to the layer above.
//!
//! States:
//!
//! ```text
//! Idle -> Receive -> IdleCooldown -> Idle
//! Idle -> Send -> WaitForAck -> IdleCooldown -> Idle
//!          \          \
//!           +----------+--> CollisionCooldown -> Idle
//! ```

use embassy_time::Duration;

use crate::{
    frame::{Feed, FrameAccumulator, FrameEncoder},
    packet::{is_gea2_broadcast, Packet, ACK, STX},
    timer::Deadline,
    ByteSerial, GeaInterface, SendError, TimeSource,
};

/// Time allowed for a sent byte to be echoed back
pub const REFLECTION_TIMEOUT: Duration = Duration::from_millis(6);

/// Time allowed for the receiver of a unicast frame to ACK it
pub const ACK_TIMEOUT: Duration = Duration::from_millis(8);

/// Maximum gap between two bytes of one frame
pub const INTERBYTE_TIMEOUT: Duration = Duration::from_millis(6);

/// Default number of times a failed send is retried
pub const DEFAULT_RETRIES: u8 = 2;

/// Configuration of a [Gea2Interface]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gea2Config {
    /// Our own address on the bus
    pub address: u8,
    /// How many times a send is retried after a collision or missing ACK
    pub retries: u8,
    /// Accept every frame regardless of its destination, for bus capture
    pub ignore_destination_address: bool,
}

impl Default for Gea2Config {
    fn default() -> Self {
        Self {
            address: 0xE4,
            retries: DEFAULT_RETRIES,
            ignore_destination_address: false,
        }
    }
}

/// The state of the bus, as seen by a [Gea2Interface]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Nothing is happening on the bus
    Idle,
    /// A frame is being received
    Receive,
    /// Letting the bus settle after activity
    IdleCooldown,
    /// A frame is being sent, one reflected byte at a time
    Send,
    /// A unicast frame was sent, waiting for its ACK
    WaitForAck,
    /// Backing off after a failed send
    CollisionCooldown,
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    ByteReceived(u8),
    SendReady,
    Timeout,
}

struct Outgoing {
    encoder: FrameEncoder,
    retries: u8,
    expected_reflection: Option<u8>,
}

/// Time spent in [State::IdleCooldown]
fn idle_cooldown(address: u8) -> Duration {
    Duration::from_millis(10 + u64::from(address & 0x1F))
}

/// Time spent in [State::CollisionCooldown]
///
/// Salted with our address, so two nodes that collided are unlikely to
/// retry at the same moment.
fn collision_cooldown(address: u8, pseudo_random: u8) -> Duration {
    Duration::from_millis(
        43 + u64::from(address & 0x1F) + u64::from((pseudo_random ^ address) & 0x1F),
    )
}

/// A GEA2 bus interface
///
/// The host must:
///
/// * call [Gea2Interface::byte_received()] for every received byte,
///   including the echoes of our own bytes
/// * call [Gea2Interface::tick()] once per millisecond, from the same
///   context as `byte_received`
/// * poll [GeaInterface::receive()] from its main loop
pub struct Gea2Interface<S: ByteSerial, C: TimeSource> {
    serial: S,
    clock: C,
    config: Gea2Config,
    state: State,
    timer: Deadline,
    rx: FrameAccumulator,
    rx_ready: Option<Packet>,
    tx: Option<Outgoing>,
    send_pending: bool,
}

impl<S: ByteSerial, C: TimeSource> Gea2Interface<S, C> {
    /// Create a new interface, starting in [State::Idle]
    pub fn new(serial: S, clock: C, config: Gea2Config) -> Self {
        Self {
            serial,
            clock,
            config,
            state: State::Idle,
            timer: Deadline::new(),
            rx: FrameAccumulator::new(),
            rx_ready: None,
            tx: None,
            send_pending: false,
        }
    }

    /// Our own address on the bus
    #[inline]
    pub fn address(&self) -> u8 {
        self.config.address
    }

    /// The current state of the bus state machine
    #[inline]
    pub fn state(&self) -> State {
        self.state
    }

    /// Is a packet waiting to be sent, or being sent?
    ///
    /// New sends are refused while this is true.
    #[inline]
    pub fn is_sending(&self) -> bool {
        self.tx.is_some()
    }

    /// Handle one byte received from the UART
    pub fn byte_received(&mut self, byte: u8) {
        self.dispatch(Signal::ByteReceived(byte));
    }

    /// Handle the one millisecond tick
    ///
    /// Starts any send queued since the last tick, and fires an expired
    /// timer.
    pub fn tick(&mut self) {
        if self.send_pending {
            self.send_pending = false;
            self.dispatch(Signal::SendReady);
        }

        if self.timer.poll_expired(self.clock.now()) {
            self.dispatch(Signal::Timeout);
        }
    }

    fn dispatch(&mut self, signal: Signal) {
        use Signal::*;

        match (self.state, signal) {
            (State::Idle, SendReady) => {
                if self.tx.is_some() {
                    self.transition(State::Send);
                }
            }
            (State::Idle, ByteReceived(byte)) => {
                if self.rx_ready.is_some() {
                    return;
                }
                if byte == STX {
                    self.transition(State::Receive);
                } else {
                    self.transition(State::IdleCooldown);
                }
            }

            (State::Receive, ByteReceived(byte)) => {
                self.timer.start(self.clock.now(), INTERBYTE_TIMEOUT);
                if self.rx.feed(byte) == Feed::Complete {
                    self.frame_complete();
                }
            }
            (State::Receive, Timeout) => {
                gea_debug!("Interbyte timeout");
                self.transition(State::IdleCooldown);
            }

            (State::IdleCooldown, ByteReceived(byte)) => {
                if byte == STX && self.rx_ready.is_none() {
                    self.transition(State::Receive);
                } else {
                    self.transition(State::IdleCooldown);
                }
            }
            (State::IdleCooldown, Timeout) => self.transition(State::Idle),

            (State::Send, ByteReceived(byte)) => self.reflection_received(byte),
            (State::Send, Timeout) => {
                gea_debug!("Reflection timeout");
                self.send_failed();
            }

            (State::WaitForAck, ByteReceived(byte)) => {
                if byte == ACK {
                    self.tx = None;
                    self.transition(State::IdleCooldown);
                } else {
                    self.send_failed();
                }
            }
            (State::WaitForAck, Timeout) => {
                gea_debug!("ACK timeout");
                self.send_failed();
            }

            (State::CollisionCooldown, ByteReceived(byte)) => {
                if byte == STX {
                    self.transition(State::Receive);
                }
            }
            (State::CollisionCooldown, Timeout) => self.transition(State::Idle),

            _ => {}
        }
    }

    fn transition(&mut self, state: State) {
        self.state = state;
        let now = self.clock.now();

        match state {
            State::Idle => {
                self.timer.stop();
                if self.tx.is_some() {
                    self.transition(State::Send);
                }
            }
            State::Receive => {
                self.rx.start();
                self.timer.start(now, INTERBYTE_TIMEOUT);
            }
            State::IdleCooldown => {
                self.timer.start(now, idle_cooldown(self.config.address));
            }
            State::Send => {
                if let Some(tx) = self.tx.as_mut() {
                    tx.encoder.restart();
                }
                self.send_next_byte();
            }
            State::WaitForAck => {
                self.timer.start(now, ACK_TIMEOUT);
            }
            State::CollisionCooldown => {
                // Only the low byte of the tick count is used as the random source
                let pseudo_random = now.as_millis() as u8;
                self.timer
                    .start(now, collision_cooldown(self.config.address, pseudo_random));
            }
        }
    }

    fn send_next_byte(&mut self) {
        let Some(tx) = self.tx.as_mut() else {
            return;
        };
        let Some(byte) = tx.encoder.next_byte() else {
            return;
        };
        tx.expected_reflection = Some(byte);
        self.timer.start(self.clock.now(), REFLECTION_TIMEOUT);
        self.serial.send(byte);
    }

    fn reflection_received(&mut self, byte: u8) {
        let Some(tx) = self.tx.as_ref() else {
            self.transition(State::IdleCooldown);
            return;
        };

        if tx.expected_reflection != Some(byte) {
            gea_debug!("Collision, sent {=?} got {=u8}", tx.expected_reflection, byte);
            self.send_failed();
            return;
        }

        if !tx.encoder.is_done() {
            self.send_next_byte();
        } else if is_gea2_broadcast(tx.encoder.destination()) {
            self.tx = None;
            self.transition(State::IdleCooldown);
        } else {
            self.transition(State::WaitForAck);
        }
    }

    fn send_failed(&mut self) {
        if let Some(tx) = self.tx.as_mut() {
            if tx.retries > 0 {
                tx.retries -= 1;
                gea_debug!("Send failed, {=u8} retries left", tx.retries);
            } else {
                gea_warn!("Send failed, giving up");
                self.tx = None;
            }
        }
        self.transition(State::CollisionCooldown);
    }

    fn frame_complete(&mut self) {
        let Some(destination) = self.rx.destination() else {
            return;
        };
        if !self.is_addressed_to_me(destination) {
            return;
        }

        // The previous packet has not been picked up yet, don't clobber it
        // and don't ACK, the sender will retry.
        if self.rx_ready.is_some() {
            gea_debug!("Dropping frame, previous packet not yet received");
            self.transition(State::IdleCooldown);
            return;
        }

        self.rx_ready = self.rx.packet();
        if !is_gea2_broadcast(destination) {
            self.serial.send(ACK);
        }
        self.transition(State::IdleCooldown);
    }

    fn is_addressed_to_me(&self, destination: u8) -> bool {
        destination == self.config.address
            || is_gea2_broadcast(destination)
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
        if self.tx.is_some() {
            return Err(SendError::Busy);
        }

        let mut packet = Packet::zeroed(destination, self.config.address, payload_len)
            .ok_or(SendError::PayloadTooLarge)?;
        populate(&mut packet);
        if set_source_address {
            packet.source = self.config.address;
        }
        packet.destination = destination;

        self.tx = Some(Outgoing {
            encoder: FrameEncoder::new(&packet),
            retries: self.config.retries,
            expected_reflection: None,
        });
        self.send_pending = true;
        Ok(())
    }
}

impl<S: ByteSerial, C: TimeSource> GeaInterface for Gea2Interface<S, C> {
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

#[cfg(test)]
mod test {
    use super::*;
    use crate::{
        frame::encode,
        mock::{ManualClock, MockSerial},
        packet::{ETX, ESC},
    };

    const ME: u8 = 0xE4;
    const PEER: u8 = 0xC0;

    type Iface<'a> = Gea2Interface<MockSerial, &'a ManualClock>;

    fn setup(clock: &ManualClock, config: Gea2Config) -> (Iface<'_>, MockSerial) {
        let serial = MockSerial::default();
        (Gea2Interface::new(serial.clone(), clock, config), serial)
    }

    fn feed(iface: &mut Iface<'_>, bytes: &[u8]) {
        for b in bytes {
            iface.byte_received(*b);
        }
    }

    /// Echo every sent byte back until the interface leaves the Send state
    fn reflect_all(iface: &mut Iface<'_>, serial: &MockSerial) {
        while iface.state() == State::Send {
            let b = serial.last().unwrap();
            iface.byte_received(b);
        }
    }

    fn start_send(iface: &mut Iface<'_>, destination: u8, payload: &[u8]) {
        iface
            .send(destination, payload.len(), |p| {
                p.payload.copy_from_slice(payload)
            })
            .unwrap();
        iface.tick();
    }

    #[test]
    fn receives_unicast_and_acks() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());
        let pkt = Packet::new(ME, PEER, &[0xA1, 0x01, 0x00]).unwrap();

        feed(&mut iface, &encode(&pkt));

        assert_eq!(serial.take(), [ACK]);
        assert_eq!(iface.state(), State::IdleCooldown);
        assert_eq!(iface.receive(), Some(pkt));
        assert_eq!(iface.receive(), None);
    }

    #[test]
    fn receives_broadcast_without_ack() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        for dest in [0xFF, 0xF5] {
            let pkt = Packet::new(dest, PEER, &[0xA8]).unwrap();
            feed(&mut iface, &encode(&pkt));
            assert_eq!(iface.receive(), Some(pkt));
            clock.advance(Duration::from_millis(100));
            iface.tick();
            assert_eq!(iface.state(), State::Idle);
        }
        assert_eq!(serial.len(), 0);
    }

    #[test]
    fn ignores_frames_for_others() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());
        let pkt = Packet::new(0x10, PEER, &[1, 2, 3]).unwrap();

        feed(&mut iface, &encode(&pkt));

        assert_eq!(iface.receive(), None);
        assert_eq!(serial.len(), 0);
    }

    #[test]
    fn ignore_destination_address_captures_everything() {
        let clock = ManualClock::at(1000);
        let config = Gea2Config {
            ignore_destination_address: true,
            ..Default::default()
        };
        let (mut iface, _serial) = setup(&clock, config);
        let pkt = Packet::new(0x10, PEER, &[1, 2, 3]).unwrap();

        feed(&mut iface, &encode(&pkt));

        assert_eq!(iface.receive(), Some(pkt));
    }

    #[test]
    fn drops_bad_crc() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());
        let pkt = Packet::new(ME, PEER, &[1, 2, 3]).unwrap();
        let mut wire = encode(&pkt);
        // corrupt the last payload byte
        let idx = wire.len() - 4;
        wire[idx] ^= 0x01;

        feed(&mut iface, &wire);

        assert_eq!(iface.receive(), None);
        assert_eq!(serial.len(), 0);
    }

    #[test]
    fn interbyte_timeout_abandons_receive() {
        let clock = ManualClock::at(1000);
        let (mut iface, _serial) = setup(&clock, Gea2Config::default());
        feed(&mut iface, &[STX, ME, 0x0A]);
        assert_eq!(iface.state(), State::Receive);

        clock.advance(Duration::from_millis(5));
        iface.tick();
        assert_eq!(iface.state(), State::Receive);

        clock.advance(Duration::from_millis(1));
        iface.tick();
        assert_eq!(iface.state(), State::IdleCooldown);

        // 10 + (0xE4 & 0x1F)
        clock.advance(Duration::from_millis(13));
        iface.tick();
        assert_eq!(iface.state(), State::IdleCooldown);
        clock.advance(Duration::from_millis(1));
        iface.tick();
        assert_eq!(iface.state(), State::Idle);
    }

    #[test]
    fn noise_while_idle_cools_down() {
        let clock = ManualClock::at(1000);
        let (mut iface, _serial) = setup(&clock, Gea2Config::default());
        iface.byte_received(0x42);
        assert_eq!(iface.state(), State::IdleCooldown);
        iface.byte_received(STX);
        assert_eq!(iface.state(), State::Receive);
    }

    #[test]
    fn pending_packet_blocks_next_receive() {
        let clock = ManualClock::at(1000);
        let (mut iface, _serial) = setup(&clock, Gea2Config::default());
        let first = Packet::new(ME, PEER, &[1]).unwrap();
        feed(&mut iface, &encode(&first));

        clock.advance(Duration::from_millis(100));
        iface.tick();
        assert_eq!(iface.state(), State::Idle);

        iface.byte_received(STX);
        assert_eq!(iface.state(), State::Idle);

        assert_eq!(iface.receive(), Some(first));
        iface.byte_received(STX);
        assert_eq!(iface.state(), State::Receive);
    }

    #[test]
    fn unicast_send_waits_for_ack() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[0xA0, 0x01, 0x00, 0xE2]);
        assert_eq!(iface.state(), State::Send);
        assert_eq!(serial.last(), Some(STX));

        reflect_all(&mut iface, &serial);
        assert_eq!(iface.state(), State::WaitForAck);

        let expected = Packet::new(PEER, ME, &[0xA0, 0x01, 0x00, 0xE2]).unwrap();
        assert_eq!(serial.take(), encode(&expected).as_slice());

        iface.byte_received(ACK);
        assert_eq!(iface.state(), State::IdleCooldown);
        assert!(!iface.is_sending());
    }

    #[test]
    fn escaped_bytes_are_reflected_individually() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[ETX]);
        reflect_all(&mut iface, &serial);
        let sent = serial.take();
        assert!(sent.windows(2).any(|w| w == [ESC, ETX]));
        assert_eq!(iface.state(), State::WaitForAck);
    }

    #[test]
    fn broadcast_send_does_not_wait_for_ack() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, 0xFF, &[0xA8]);
        reflect_all(&mut iface, &serial);

        assert_eq!(iface.state(), State::IdleCooldown);
        assert!(!iface.is_sending());
    }

    #[test]
    fn reflection_mismatch_backs_off_and_retries() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[0xA0, 0x01, 0x00, 0x08]);
        // STX, destination, length echo fine
        for _ in 0..3 {
            iface.byte_received(serial.last().unwrap());
        }
        assert_eq!(iface.state(), State::Send);

        // The fourth byte (offset 3) gets clobbered
        iface.byte_received(serial.last().unwrap() ^ 0x55);
        assert_eq!(iface.state(), State::CollisionCooldown);
        assert!(iface.is_sending());
        serial.take();

        // 43 + (0xE4 & 0x1F) + (((1000 as u8) ^ 0xE4) & 0x1F) = 43 + 4 + 12
        clock.advance(Duration::from_millis(58));
        iface.tick();
        assert_eq!(iface.state(), State::CollisionCooldown);

        clock.advance(Duration::from_millis(1));
        iface.tick();
        assert_eq!(iface.state(), State::Send);
        assert_eq!(serial.last(), Some(STX));

        reflect_all(&mut iface, &serial);
        iface.byte_received(ACK);
        assert!(!iface.is_sending());
    }

    #[test]
    fn reflection_timeout_is_a_collision() {
        let clock = ManualClock::at(1000);
        let (mut iface, _serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[1]);
        clock.advance(REFLECTION_TIMEOUT);
        iface.tick();

        assert_eq!(iface.state(), State::CollisionCooldown);
        assert!(iface.is_sending());
    }

    #[test]
    fn retries_are_exhausted() {
        let clock = ManualClock::at(1000);
        let config = Gea2Config {
            retries: 1,
            ..Default::default()
        };
        let (mut iface, serial) = setup(&clock, config);

        start_send(&mut iface, PEER, &[1]);
        for attempt in 0..2 {
            reflect_all(&mut iface, &serial);
            assert_eq!(iface.state(), State::WaitForAck, "attempt {attempt}");
            clock.advance(ACK_TIMEOUT);
            iface.tick();
            assert_eq!(iface.state(), State::CollisionCooldown);
            clock.advance(Duration::from_millis(200));
            iface.tick();
        }

        // Abandoned: we went back to idle, and nothing new went out
        assert_eq!(iface.state(), State::Idle);
        assert!(!iface.is_sending());
        serial.take();
        iface.tick();
        assert_eq!(serial.len(), 0);
    }

    #[test]
    fn wrong_ack_byte_is_a_failure() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[1]);
        reflect_all(&mut iface, &serial);
        iface.byte_received(0x00);
        assert_eq!(iface.state(), State::CollisionCooldown);
    }

    #[test]
    fn stx_preempts_collision_cooldown() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        start_send(&mut iface, PEER, &[1]);
        iface.byte_received(serial.last().unwrap() ^ 1);
        assert_eq!(iface.state(), State::CollisionCooldown);

        let pkt = Packet::new(ME, PEER, &[7]).unwrap();
        feed(&mut iface, &encode(&pkt));
        assert_eq!(iface.receive(), Some(pkt));
        assert!(iface.is_sending());
    }

    #[test]
    fn only_one_send_at_a_time() {
        let clock = ManualClock::at(1000);
        let (mut iface, _serial) = setup(&clock, Gea2Config::default());

        assert_eq!(
            iface.send(PEER, crate::packet::MAX_PAYLOAD + 1, |_| panic!()),
            Err(SendError::PayloadTooLarge)
        );
        iface.send(PEER, 1, |_| {}).unwrap();
        assert_eq!(iface.send(PEER, 1, |_| panic!()), Err(SendError::Busy));
    }

    #[test]
    fn forward_keeps_source() {
        let clock = ManualClock::at(1000);
        let (mut iface, serial) = setup(&clock, Gea2Config::default());

        iface
            .forward(PEER, 1, |p| {
                p.source = 0x33;
                p.payload[0] = 0x44;
            })
            .unwrap();
        iface.tick();
        reflect_all(&mut iface, &serial);

        let expected = Packet::new(PEER, 0x33, &[0x44]).unwrap();
        assert_eq!(serial.take(), encode(&expected).as_slice());
    }
}
