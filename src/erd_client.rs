//! ERD Client
//!
//! The [ErdClient] turns ERD reads, writes and subscriptions into request
//! packets, and matches the replies that come back. It sits on top of any
//! [GeaInterface].
//!
//! ## Requests
//!
//! Requests wait in a bounded FIFO, and only the one at its head is ever in
//! flight. The in-flight request is stamped with the client's rolling
//! request id, and retried on a timer until either a matching reply arrives
//! or the retry budget is spent. Either way, the request is then removed,
//! the request id advances by one, and the next request goes out.
//!
//! Queueing a request that is already waiting does not add a second copy.
//! The queue is searched from the tail back towards the head for an equal
//! request, but the search stops at the first request that must stay
//! ordered before the new one:
//!
//! * a read can't be merged past a queued write
//! * a write can't be merged past a queued write or read
//! * subscriptions merge with any equal request
//!
//! ## Activity
//!
//! Outcomes are reported as [Activity] values, handed to the host's
//! [ActivitySink] as they happen, from within [ErdClient::run()]. Every
//! activity is delivered exactly once. A host that wants to consume them
//! elsewhere forwards them into a queue of its own choosing, and owns the
//! decision of what to do when that queue is full.
//!
//! Publications from a subscription host arrive unsolicited, and are
//! acknowledged automatically once each of their values has been handed to
//! the sink.

use embassy_time::Duration;
use heapless::{Deque, Vec};

use crate::{
    erd_api::{
        Command, Erd, Publication, ReadResult, SubscribeAllResult, SubscribeType, WriteResult,
        MAX_DATA_SIZE,
    },
    packet::{Packet, BROADCAST_ADDRESS},
    timer::Deadline,
    GeaInterface, TimeSource,
};

/// Default depth of the request queue, including the request in flight
pub const DEFAULT_REQUEST_QUEUE_DEPTH: usize = 8;

/// The request id carried by requests and their responses
pub type RequestId = u8;

/// The value of one ERD
pub type ErdData = Vec<u8, MAX_DATA_SIZE>;

/// Receives every [Activity] of an [ErdClient]
///
/// Any `FnMut(Activity)` closure is a sink.
pub trait ActivitySink {
    /// Handle one activity.
    ///
    /// This is called from within [ErdClient::run()], and MUST NOT block.
    fn on_activity(&mut self, activity: Activity);
}

impl<F: FnMut(Activity)> ActivitySink for F {
    fn on_activity(&mut self, activity: Activity) {
        self(activity)
    }
}

/// Configuration of an [ErdClient]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErdClientConfig {
    /// How long to wait for a reply before resending a request
    pub request_timeout: Duration,
    /// How many times a request is resent before it fails
    pub request_retries: u8,
}

impl Default for ErdClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(250),
            request_retries: 10,
        }
    }
}

/// An error when queueing a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum RequestError {
    /// The request queue has no room
    QueueFull,
    /// Write data is larger than [MAX_DATA_SIZE]
    DataTooLarge,
}

/// A queued request
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Request {
    Read { address: u8, erd: Erd },
    Write { address: u8, erd: Erd, data: ErdData },
    Subscribe { address: u8, retain: bool },
}

impl Request {
    /// The node this request is sent to
    pub fn address(&self) -> u8 {
        match self {
            Request::Read { address, .. }
            | Request::Write { address, .. }
            | Request::Subscribe { address, .. } => *address,
        }
    }

    /// Must `self` stay queued after `queued`, rather than being merged
    /// into an equal request ahead of it?
    fn conflicts_with(&self, queued: &Request) -> bool {
        match self {
            Request::Read { .. } => matches!(queued, Request::Write { .. }),
            Request::Write { .. } => {
                matches!(queued, Request::Write { .. } | Request::Read { .. })
            }
            Request::Subscribe { .. } => false,
        }
    }
}

/// Why a read failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFailureReason {
    /// No matching reply after every retry
    RetriesExhausted,
    /// The node does not have this ERD
    NotSupported,
}

/// Why a write failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteFailureReason {
    /// No matching reply after every retry
    RetriesExhausted,
    /// The node does not have this ERD
    NotSupported,
    /// The node expected data of a different size
    IncorrectSize,
}

/// Something the [ErdClient] has to report
///
/// `address` is always the peer the activity concerns: the responder for
/// completions and publications, or the request's destination for
/// failures.
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Activity {
    ReadCompleted {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
    },
    ReadFailed {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        reason: ReadFailureReason,
    },
    WriteCompleted {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
    },
    WriteFailed {
        address: u8,
        request_id: RequestId,
        erd: Erd,
        data: ErdData,
        reason: WriteFailureReason,
    },
    SubscriptionAddedOrRetained {
        address: u8,
    },
    SubscribeFailed {
        address: u8,
    },
    SubscriptionPublicationReceived {
        address: u8,
        erd: Erd,
        data: ErdData,
    },
    SubscriptionHostCameOnline {
        address: u8,
    },
}

fn erd_data(data: &[u8]) -> ErdData {
    // Bounded at compile time in erd_api
    let mut out = ErdData::new();
    let res = out.extend_from_slice(data);
    debug_assert!(res.is_ok(), "ERD value larger than MAX_DATA_SIZE");
    out
}

/// An ERD client
///
/// The host must call [ErdClient::run()] regularly, e.g. from its main loop.
pub struct ErdClient<I, C, A, const N: usize = DEFAULT_REQUEST_QUEUE_DEPTH>
where
    I: GeaInterface,
    C: TimeSource,
    A: ActivitySink,
{
    iface: I,
    clock: C,
    config: ErdClientConfig,
    activity: A,
    queue: Deque<Request, N>,
    request_id: RequestId,
    busy: bool,
    remaining_retries: u8,
    timer: Deadline,
}

impl<I, C, A, const N: usize> ErdClient<I, C, A, N>
where
    I: GeaInterface,
    C: TimeSource,
    A: ActivitySink,
{
    /// Create a new client, reporting its activity to `activity`
    pub fn new(iface: I, clock: C, config: ErdClientConfig, activity: A) -> Self {
        Self {
            iface,
            clock,
            config,
            activity,
            queue: Deque::new(),
            request_id: 0,
            busy: false,
            remaining_retries: 0,
            timer: Deadline::new(),
        }
    }

    /// Access the underlying interface, e.g. to feed it received bytes
    pub fn interface_mut(&mut self) -> &mut I {
        &mut self.iface
    }

    /// The request id the request in flight carries
    #[inline]
    pub fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Number of queued requests, including the one in flight
    #[inline]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Is a request in flight?
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.busy
    }

    /// Queue a read of `erd` from `address`
    ///
    /// Returns the request id the read is expected to carry on the wire.
    pub fn read(&mut self, address: u8, erd: Erd) -> Result<RequestId, RequestError> {
        self.queue_request(Request::Read { address, erd })
    }

    /// Queue a write of `data` to `erd` on `address`
    ///
    /// Returns the request id the write is expected to carry on the wire.
    pub fn write(&mut self, address: u8, erd: Erd, data: &[u8]) -> Result<RequestId, RequestError> {
        let data = Vec::from_slice(data).map_err(|_| RequestError::DataTooLarge)?;
        self.queue_request(Request::Write { address, erd, data })
    }

    /// Queue a subscription to every ERD of `address`
    pub fn subscribe(&mut self, address: u8) -> Result<(), RequestError> {
        self.queue_request(Request::Subscribe {
            address,
            retain: false,
        })
        .map(drop)
    }

    /// Queue a keep-alive for an existing subscription to `address`
    pub fn retain_subscription(&mut self, address: u8) -> Result<(), RequestError> {
        self.queue_request(Request::Subscribe {
            address,
            retain: true,
        })
        .map(drop)
    }

    /// Handle received packets and request timeouts
    pub fn run(&mut self) {
        while let Some(packet) = self.iface.receive() {
            self.packet_received(&packet);
        }

        if self.timer.poll_expired(self.clock.now()) {
            self.request_timed_out();
        }
    }

    fn queue_request(&mut self, request: Request) -> Result<RequestId, RequestError> {
        let res = self.enqueue_if_unique(request);
        self.send_request_if_not_busy();
        // The queue is far shorter than the request id space
        res.map(|index| self.request_id.wrapping_add(index as u8))
    }

    fn enqueue_if_unique(&mut self, request: Request) -> Result<usize, RequestError> {
        let mut index = self.queue.len();
        for queued in self.queue.iter().rev() {
            index -= 1;
            if *queued == request {
                return Ok(index);
            }
            if request.conflicts_with(queued) {
                break;
            }
        }

        let index = self.queue.len();
        self.queue.push_back(request).map_err(|_| {
            gea_warn!("ERD request queue full");
            RequestError::QueueFull
        })?;
        Ok(index)
    }

    fn send_request_if_not_busy(&mut self) {
        if !self.busy && !self.queue.is_empty() {
            self.busy = true;
            self.remaining_retries = self.config.request_retries;
            self.send_request();
        }
    }

    fn send_request(&mut self) {
        let Some(request) = self.queue.front() else {
            return;
        };

        let request_id = self.request_id;
        let command = match request {
            Request::Read { erd, .. } => Command::ReadRequest {
                request_id,
                erd: *erd,
            },
            Request::Write { erd, data, .. } => Command::WriteRequest {
                request_id,
                erd: *erd,
                data,
            },
            Request::Subscribe { retain, .. } => Command::SubscribeAllRequest {
                request_id,
                kind: if *retain {
                    SubscribeType::Retain
                } else {
                    SubscribeType::Add
                },
            },
        };

        // A refused send is recovered by the request timeout
        let res = self
            .iface
            .send(request.address(), command.encoded_len(), |packet| {
                let _ = command.encode(&mut packet.payload);
            });
        if res.is_err() {
            gea_debug!("Interface refused request {=u8}", request_id);
        }

        self.timer
            .start(self.clock.now(), self.config.request_timeout);
    }

    /// Remove the request in flight and send the next one, returning the
    /// finished request and the id it carried
    fn finish_request(&mut self) -> Option<(RequestId, Request)> {
        let request = self.queue.pop_front()?;
        let request_id = self.request_id;

        self.timer.stop();
        self.request_id = self.request_id.wrapping_add(1);
        self.busy = false;
        self.send_request_if_not_busy();

        Some((request_id, request))
    }

    fn request_timed_out(&mut self) {
        if self.remaining_retries > 0 {
            self.remaining_retries -= 1;
            gea_debug!("Request timed out, {=u8} retries left", self.remaining_retries);
            self.send_request();
            return;
        }

        let Some((request_id, request)) = self.finish_request() else {
            return;
        };
        gea_warn!("Request {=u8} to {=u8} failed, retries exhausted", request_id, request.address());

        let activity = match request {
            Request::Read { address, erd } => Activity::ReadFailed {
                address,
                request_id,
                erd,
                reason: ReadFailureReason::RetriesExhausted,
            },
            Request::Write { address, erd, data } => Activity::WriteFailed {
                address,
                request_id,
                erd,
                data,
                reason: WriteFailureReason::RetriesExhausted,
            },
            Request::Subscribe { address, .. } => Activity::SubscribeFailed { address },
        };
        self.publish(activity);
    }

    fn publish(&mut self, activity: Activity) {
        self.activity.on_activity(activity);
    }

    fn packet_received(&mut self, packet: &Packet) {
        let Some(command) = Command::decode(&packet.payload) else {
            gea_trace!("Ignoring invalid ERD payload from {=u8}", packet.source);
            return;
        };

        match command {
            Command::ReadResponse {
                request_id,
                result,
                erd,
                data,
            } => self.read_response(packet.source, request_id, result, erd, data),
            Command::WriteResponse {
                request_id,
                result,
                erd,
            } => self.write_response(packet.source, request_id, result, erd),
            Command::SubscribeAllResponse { request_id, result } => {
                self.subscribe_all_response(packet.source, request_id, result)
            }
            Command::Publication(publication) => self.publication(packet.source, &publication),
            Command::SubscriptionHostStartup => {
                self.publish(Activity::SubscriptionHostCameOnline {
                    address: packet.source,
                });
            }
            _ => {}
        }
    }

    fn response_matches(&self, source: u8, request_id: RequestId, address: u8) -> bool {
        request_id == self.request_id && (address == source || address == BROADCAST_ADDRESS)
    }

    fn read_response(
        &mut self,
        source: u8,
        request_id: RequestId,
        result: ReadResult,
        erd: Erd,
        data: &[u8],
    ) {
        let Some(Request::Read {
            address,
            erd: wanted,
        }) = self.queue.front()
        else {
            return;
        };
        let address = *address;
        if *wanted != erd || !self.response_matches(source, request_id, address) {
            return;
        }

        let activity = match result {
            ReadResult::Success => Activity::ReadCompleted {
                address: source,
                request_id,
                erd,
                data: erd_data(data),
            },
            ReadResult::UnsupportedErd => Activity::ReadFailed {
                address,
                request_id,
                erd,
                reason: ReadFailureReason::NotSupported,
            },
            // Still working on it, keep waiting
            ReadResult::Busy => return,
        };
        self.finish_request();
        self.publish(activity);
    }

    fn write_response(&mut self, source: u8, request_id: RequestId, result: WriteResult, erd: Erd) {
        let Some(Request::Write {
            address,
            erd: wanted,
            ..
        }) = self.queue.front()
        else {
            return;
        };
        let address = *address;
        if *wanted != erd || !self.response_matches(source, request_id, address) {
            return;
        }

        let reason = match result {
            WriteResult::Success => None,
            WriteResult::UnsupportedErd => Some(WriteFailureReason::NotSupported),
            WriteResult::IncorrectSize => Some(WriteFailureReason::IncorrectSize),
            WriteResult::Busy => return,
        };

        let Some((request_id, Request::Write { data, .. })) = self.finish_request() else {
            return;
        };
        let activity = match reason {
            None => Activity::WriteCompleted {
                address: source,
                request_id,
                erd,
                data,
            },
            Some(reason) => Activity::WriteFailed {
                address,
                request_id,
                erd,
                data,
                reason,
            },
        };
        self.publish(activity);
    }

    fn subscribe_all_response(
        &mut self,
        source: u8,
        request_id: RequestId,
        result: SubscribeAllResult,
    ) {
        let Some(Request::Subscribe { address, .. }) = self.queue.front() else {
            return;
        };
        // Subscriptions are never broadcast, the responder must be exact
        if request_id != self.request_id || *address != source {
            return;
        }

        let activity = match result {
            SubscribeAllResult::Success => Activity::SubscriptionAddedOrRetained { address: source },
            SubscribeAllResult::NoAvailableSubscriptions => {
                Activity::SubscribeFailed { address: source }
            }
        };
        self.finish_request();
        self.publish(activity);
    }

    fn publication(&mut self, source: u8, publication: &Publication<'_>) {
        for (erd, data) in publication.entries() {
            self.publish(Activity::SubscriptionPublicationReceived {
                address: source,
                erd,
                data: erd_data(data),
            });
        }

        let ack = Command::PublicationAck {
            context: publication.context,
            request_id: publication.request_id,
        };
        let res = self.iface.send(source, ack.encoded_len(), |packet| {
            let _ = ack.encode(&mut packet.payload);
        });
        if res.is_err() {
            gea_debug!("Interface refused publication ack to {=u8}", source);
        }
    }
}
