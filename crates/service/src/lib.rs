//! ## CoAP message engine
//!
//! [draft-ietf-core-coap-09]: https://tools.ietf.org/html/draft-ietf-core-coap-09
//!
//! The UDP-oriented engine of a CoAP endpoint: it parses datagrams into
//! PDUs, performs reliable delivery for confirmable messages with
//! exponentially backed-off retransmissions, suppresses duplicates
//! within the exchange lifetime, dispatches requests to resource
//! handlers and maintains long-lived observer registrations pinned by
//! in-flight notifications.
//!
//! The engine is single-threaded and event-loop driven. A host loop
//! alternates three operations: drain readable datagrams into the
//! receive queue ([`Endpoint::receive`]), drain the receive queue
//! through the dispatcher ([`Endpoint::dispatch`]), and fire due
//! retransmissions ([`Endpoint::retransmit`]). Timeouts are
//! cooperative: a late driver only delays retransmissions, it never
//! breaks them.

pub mod dedup;
pub mod observe;
pub mod queue;
pub mod resource;
pub mod response;
pub mod statistics;

use crate::{
    dedup::DuplicateCache,
    observe::Registration,
    queue::{Received, SendQueue, TICKS_PER_SECOND, Tick, TransmitEntry},
    resource::ResourceMap,
    response::{new_error_response, wellknown_response},
    statistics::Statistics,
};

use std::{collections::VecDeque, net::SocketAddr, sync::Arc};

use codec::{
    Error, MessageKind, REQUEST_GET, VERSION, is_response,
    key::{ResourceKey, Tid, transaction_id},
    option::{OptionFilter, OptionType, is_critical},
    payload::{PayloadHeader, retag_retransmitted},
    pdu::{Pdu, RawHeader},
    response_code,
};

use rand::Rng;

/// A confirmable message is given up after this many retransmissions.
pub const MAX_RETRANSMIT: u8 = 4;

/// Critical options every context understands out of the box.
const BUILTIN_OPTIONS: [OptionType; 7] = [
    OptionType::ContentType,
    OptionType::ProxyUri,
    OptionType::UriHost,
    OptionType::UriPort,
    OptionType::UriPath,
    OptionType::Token,
    OptionType::UriQuery,
];

/// The transport socket is a collaborator: the engine hands it
/// assembled datagrams and never blocks on it.
pub trait Transport {
    fn send(&self, to: &SocketAddr, bytes: &[u8]) -> std::io::Result<usize>;
}

/// Application hook for incoming responses, invoked with the remote
/// address, the matched outstanding request (if any), the response and
/// its transaction id.
pub type ResponseHandler = Arc<dyn Fn(&SocketAddr, Option<&Pdu>, &Pdu, Tid) + Send + Sync>;

pub struct EndpointOptions<T> {
    /// Address the transport is bound to, consulted for the multicast
    /// response-suppression rule.
    pub local: SocketAddr,
    pub transport: T,
}

/// One CoAP endpoint: queues, duplicate cache, resource registry and
/// message-id seed.
///
/// # Test
///
/// ```
/// use std::net::SocketAddr;
/// use coap_server_service::{Endpoint, EndpointOptions, Transport};
///
/// struct Discard;
///
/// impl Transport for Discard {
///     fn send(&self, _to: &SocketAddr, bytes: &[u8]) -> std::io::Result<usize> {
///         Ok(bytes.len())
///     }
/// }
///
/// let endpoint = Endpoint::new(EndpointOptions {
///     local: "127.0.0.1:5683".parse().unwrap(),
///     transport: Discard,
/// });
///
/// assert!(endpoint.can_exit());
/// ```
pub struct Endpoint<T> {
    local: SocketAddr,
    transport: T,
    sendqueue: SendQueue,
    recvqueue: VecDeque<Received>,
    alive_mids: DuplicateCache,
    resources: ResourceMap,
    known_options: OptionFilter,
    message_id: u16,
    response_handler: Option<ResponseHandler>,
    statistics: Statistics,
}

impl<T> Endpoint<T>
where
    T: Transport,
{
    pub fn new(options: EndpointOptions<T>) -> Self {
        let mut known_options = OptionFilter::default();
        for kind in BUILTIN_OPTIONS {
            known_options.set(kind as u16);
        }

        Self {
            local: options.local,
            transport: options.transport,
            sendqueue: SendQueue::default(),
            recvqueue: VecDeque::new(),
            alive_mids: DuplicateCache::default(),
            resources: ResourceMap::default(),
            known_options,
            message_id: rand::rng().random(),
            response_handler: None,
            statistics: Statistics::default(),
        }
    }

    pub fn local(&self) -> SocketAddr {
        self.local
    }

    pub fn resources(&self) -> &ResourceMap {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut ResourceMap {
        &mut self.resources
    }

    /// Declares a critical option as understood, so it no longer
    /// triggers 4.02 Bad Option.
    pub fn register_option(&mut self, kind: u16) {
        self.known_options.set(kind);
    }

    pub fn set_response_handler(
        &mut self,
        handler: impl Fn(&SocketAddr, Option<&Pdu>, &Pdu, Tid) + Send + Sync + 'static,
    ) {
        self.response_handler = Some(Arc::new(handler));
    }

    /// Cloneable handle over the endpoint counters.
    pub fn statistics(&self) -> Statistics {
        self.statistics.clone()
    }

    pub fn sendqueue(&self) -> &SendQueue {
        &self.sendqueue
    }

    /// Whether both queues have drained.
    pub fn can_exit(&self) -> bool {
        self.recvqueue.is_empty() && self.sendqueue.is_empty()
    }

    /// Fresh message id for an outgoing message.
    pub fn next_message_id(&mut self) -> u16 {
        self.message_id = self.message_id.wrapping_add(1);
        self.message_id
    }

    /// Parses one datagram into the receive queue.
    ///
    /// A malformed message is dropped; when at least the header parsed
    /// and the message was confirmable or non-confirmable, a Reset is
    /// emitted so the peer stops retrying.
    pub fn receive(&mut self, bytes: &[u8], from: SocketAddr, now: Tick) -> Result<(), Error> {
        self.statistics.datagram_in(bytes.len());

        match Pdu::decode(bytes) {
            Ok(pdu) => {
                let id = transaction_id(&from, pdu.message_id_bytes());
                log::trace!("received from {from}: {pdu}");
                self.recvqueue.push_back(Received {
                    pdu,
                    peer: from,
                    local: self.local,
                    t: now,
                    id,
                });

                Ok(())
            }
            Err(error) => {
                match RawHeader::peek(bytes) {
                    Some(header)
                        if header.version == VERSION
                            && matches!(
                                header.kind,
                                MessageKind::Confirmable | MessageKind::NonConfirmable
                            ) =>
                    {
                        let reset = Pdu::new(MessageKind::Reset, 0, header.message_id);
                        self.send_impl(&from, &reset);
                        log::debug!("sent RST on malformed message");
                    }
                    _ => log::debug!("discarded invalid frame"),
                }

                Err(error)
            }
        }
    }

    /// Drives the CON/NON/ACK/RST state machine over every queued
    /// datagram and routes requests and responses to their handlers.
    /// Every error is local to one message; the dispatcher never
    /// aborts.
    pub fn dispatch(&mut self, now: Tick) {
        while let Some(rcvd) = self.recvqueue.pop_front() {
            self.statistics.message_in(rcvd.pdu.kind(), rcvd.pdu.len());

            let mut sent: Option<TransmitEntry> = None;

            match rcvd.pdu.kind() {
                MessageKind::Acknowledgement => {
                    log::debug!("incoming ACK, mid={}", rcvd.pdu.message_id());

                    // Stop the retransmissions of the matched
                    // transaction. A notification entry pinned its
                    // registration; the observer is alive again, so the
                    // fail count restarts, unless teardown has already
                    // begun, in which case the late ACK only gives the
                    // queue's reference back.
                    sent = self.sendqueue.remove(rcvd.id);
                    if let Some(entry) = sent.as_mut() {
                        if let Some(reg) = entry.registration.take() {
                            if !reg.is_invalid() {
                                reg.clear_failures();
                            }

                            self.release_registration(reg);
                        }
                    }

                    if rcvd.pdu.code() == 0 {
                        continue;
                    }
                }
                MessageKind::Reset => {
                    log::warn!("got RST for message {}", rcvd.pdu.message_id());

                    // The receiver disliked what we sent: remove the
                    // transaction, and for a notification also tear
                    // down the observer relationship.
                    if let Some(mut entry) = self.sendqueue.remove(rcvd.id) {
                        if let Some(reg) = entry.registration.take() {
                            self.failed_notify(reg);
                        }
                    }

                    continue;
                }
                MessageKind::NonConfirmable => {
                    let mut unknown = OptionFilter::default();
                    if !self.check_critical(&rcvd.pdu, &mut unknown) {
                        continue;
                    }

                    self.alive_mids.evict_expired(now);
                    if self
                        .alive_mids
                        .find(&rcvd.peer, rcvd.pdu.message_id())
                        .is_some()
                    {
                        // Already processed and nothing to replay for a
                        // NON.
                        self.statistics.duplicate();
                        continue;
                    }
                }
                MessageKind::Confirmable => {
                    let mut unknown = OptionFilter::default();
                    if !self.check_critical(&rcvd.pdu, &mut unknown) {
                        if self
                            .send_error(&rcvd.peer, &rcvd.pdu, response_code(402), &unknown)
                            .is_none()
                        {
                            log::warn!("error sending 4.02 response");
                        }

                        continue;
                    }

                    self.alive_mids.evict_expired(now);
                    if let Some(record) = self.alive_mids.find(&rcvd.peer, rcvd.pdu.message_id()) {
                        // A CON must be answered even when it is a
                        // duplicate. Replay the recorded reaction; when
                        // the original arrived as NON there is nothing
                        // recorded, and RST tells the sender to stop.
                        let reply = record.reply;
                        self.statistics.duplicate();

                        if reply == Some(MessageKind::Acknowledgement) {
                            log::debug!("replaying ACK to a duplicate request");
                            self.send_ack(&rcvd.peer, &rcvd.pdu);
                        } else {
                            log::debug!("replaying RST to a duplicate request");
                            self.send_rst(&rcvd.peer, &rcvd.pdu);
                        }

                        continue;
                    }
                }
            }

            let code = rcvd.pdu.code();
            if codec::is_request(code) {
                self.handle_request(&rcvd, now);
            } else if is_response(code) {
                self.handle_response(sent.as_ref(), &rcvd);
            } else {
                log::debug!("dropped message with invalid code {code}");
                self.send_rst(&rcvd.peer, &rcvd.pdu);
            }
        }
    }

    /// Fires every due entry: re-send with doubled timeout while the
    /// retransmission budget lasts, give up afterwards.
    pub fn retransmit(&mut self, now: Tick) {
        while let Some(mut entry) = self.sendqueue.pop_due(now) {
            if entry.retransmit_cnt < MAX_RETRANSMIT {
                entry.retransmit_cnt += 1;
                entry.t += entry.timeout << entry.retransmit_cnt;

                let sensor = PayloadHeader::read(entry.pdu.data()).map(|header| header.sensor);
                self.statistics.retransmitted(sensor);
                // Receivers tell replayed datapoints apart by the tag.
                retag_retransmitted(entry.pdu.data_mut());

                log::debug!(
                    "retransmission #{} of transaction {}",
                    entry.retransmit_cnt,
                    entry.id
                );

                if let Some(id) = self.send_impl(&entry.peer, &entry.pdu) {
                    entry.id = id;
                }

                self.sendqueue.insert(entry);
                continue;
            }

            log::debug!("transaction {} unsuccessful, removed", entry.id);

            if let Some(reg) = entry.registration.take() {
                if is_response(entry.pdu.code()) {
                    // The unacknowledged PDU was a notification; the
                    // observer behind its token is written off.
                    log::info!(
                        "cancelling observer {} after {} attempts",
                        reg.peer(),
                        entry.retransmit_cnt + 1
                    );
                    self.failed_notify(reg);
                } else {
                    self.release_registration(reg);
                }
            }
        }
    }

    /// Tick at which the earliest outstanding confirmable fires.
    pub fn next_retransmit(&self) -> Option<Tick> {
        self.sendqueue.next_deadline()
    }

    /// Sends a one-shot message without retransmission state.
    pub fn send(&mut self, dst: &SocketAddr, pdu: &Pdu) -> Option<Tid> {
        self.send_impl(dst, pdu)
    }

    /// Acknowledges a confirmable request with an empty ACK.
    pub fn send_ack(&mut self, dst: &SocketAddr, request: &Pdu) -> Option<Tid> {
        if request.kind() != MessageKind::Confirmable {
            return None;
        }

        let response = Pdu::new(MessageKind::Acknowledgement, 0, request.message_id());
        self.send_impl(dst, &response)
    }

    /// Rejects a message with an empty Reset mirroring its id.
    pub fn send_rst(&mut self, dst: &SocketAddr, request: &Pdu) -> Option<Tid> {
        let response = Pdu::new(MessageKind::Reset, 0, request.message_id());
        self.send_impl(dst, &response)
    }

    /// Builds and sends an error response for `request`.
    pub fn send_error(
        &mut self,
        dst: &SocketAddr,
        request: &Pdu,
        code: u8,
        filter: &OptionFilter,
    ) -> Option<Tid> {
        match new_error_response(request, code, filter) {
            Ok(response) => self.send_impl(dst, &response),
            Err(error) => {
                log::warn!("cannot create error response: {error}");
                None
            }
        }
    }

    /// Sends a confirmable message and queues it for retransmission.
    /// Returns `None` when nothing was queued or sent.
    pub fn send_confirmed(&mut self, dst: SocketAddr, pdu: Pdu, now: Tick) -> Option<Tid> {
        let id = self.send_impl(&dst, &pdu)?;
        let timeout = initial_timeout();
        log::debug!(
            "sent CON mid={}, outstanding transaction {id}, timeout {timeout}",
            pdu.message_id()
        );

        self.sendqueue.insert(TransmitEntry {
            pdu,
            peer: dst,
            id,
            t: now + timeout,
            timeout,
            retransmit_cnt: 0,
            registration: None,
        });

        Some(id)
    }

    /// Sends a confirmable notification, pinning the checked-out
    /// registration into the queue entry. The caller performs the
    /// checkout (`notify_confirmed(dst, pdu, reg.checkout(), now)`);
    /// the engine owns the matching release once the entry leaves the
    /// queue. On send failure the reference is given back immediately.
    pub fn notify_confirmed(
        &mut self,
        dst: SocketAddr,
        pdu: Pdu,
        registration: Arc<Registration>,
        now: Tick,
    ) -> Option<Tid> {
        let Some(id) = self.send_impl(&dst, &pdu) else {
            self.release_registration(registration);
            return None;
        };

        let timeout = initial_timeout();
        log::debug!(
            "sent CON notification mid={}, outstanding transaction {id}",
            pdu.message_id()
        );

        self.sendqueue.insert(TransmitEntry {
            pdu,
            peer: dst,
            id,
            t: now + timeout,
            timeout,
            retransmit_cnt: 0,
            registration: Some(registration),
        });

        Some(id)
    }

    /// Releases queue state, resources and their subscriber lists.
    pub fn shutdown(&mut self) {
        for entry in self.sendqueue.drain() {
            if let Some(reg) = entry.registration {
                self.release_registration(reg);
            }
        }

        self.recvqueue.clear();
        self.alive_mids.clear();
        self.resources.clear();
    }

    fn send_impl(&mut self, dst: &SocketAddr, pdu: &Pdu) -> Option<Tid> {
        match self.transport.send(dst, pdu.wire()) {
            Ok(written) => {
                self.statistics.datagram_out(written);
                self.statistics.message_out(pdu.kind(), written);
                log::trace!("sent to {dst}: {pdu}");
                Some(transaction_id(dst, pdu.message_id_bytes()))
            }
            Err(error) => {
                log::error!("send to {dst} failed: {error}");
                None
            }
        }
    }

    /// Collects unknown critical options of `pdu` into `unknown`.
    /// Returns whether the message is acceptable.
    fn check_critical(&self, pdu: &Pdu, unknown: &mut OptionFilter) -> bool {
        let mut ok = true;

        for (kind, _) in pdu.options() {
            if is_critical(kind) && !self.known_options.contains(kind) {
                log::debug!("unknown critical option {kind}");
                ok = false;

                // Beyond the filter range everything is unknown anyway.
                if !unknown.set(kind) {
                    break;
                }
            }
        }

        ok
    }

    fn handle_request(&mut self, rcvd: &Received, now: Tick) {
        log::debug!(
            "incoming request: transaction={}, mid={}",
            rcvd.id,
            rcvd.pdu.message_id()
        );

        let mut filter = OptionFilter::default();
        filter.set(OptionType::Token as u16);

        let key = ResourceKey::from_request(&rcvd.pdu);
        let code = rcvd.pdu.code();

        if !self.resources.contains(&key) {
            // No such resource. A GET may still hit the well-known URI;
            // everything else is 4.04/4.05, with 4.05 suppressed for
            // multicast destinations.
            let response = match code {
                REQUEST_GET if key == ResourceKey::wellknown() => {
                    log::debug!("create default response for .well-known/core");
                    wellknown_response(&self.resources, &rcvd.pdu).ok()
                }
                REQUEST_GET => {
                    log::debug!("GET for unknown resource {:02x?}, return 4.04", key.0);
                    new_error_response(&rcvd.pdu, response_code(404), &filter).ok()
                }
                _ if !rcvd.local.ip().is_multicast() => {
                    log::debug!("unhandled request for unknown resource {:02x?}", key.0);
                    new_error_response(&rcvd.pdu, response_code(405), &filter).ok()
                }
                _ => None,
            };

            if let Some(response) = response {
                if self.send_impl(&rcvd.peer, &response).is_none() {
                    log::warn!("cannot send response for transaction {}", rcvd.id);
                }
            }

            return;
        }

        let handler = self
            .resources
            .get(&key)
            .and_then(|resource| resource.handler(code));

        if let Some(handler) = handler {
            log::debug!("call custom handler for resource {:02x?}", key.0);

            let mut response = Pdu::new(
                if rcvd.pdu.kind() == MessageKind::Confirmable {
                    MessageKind::Acknowledgement
                } else {
                    MessageKind::NonConfirmable
                },
                0,
                rcvd.pdu.message_id(),
            );

            let token = rcvd.pdu.token();
            if let Some(resource) = self.resources.get_mut(&key) {
                handler(resource, &rcvd.peer, &rcvd.pdu, &token, &mut response);
            }

            // The request has now been processed once; its message id
            // stays alive for the exchange lifetime and records how it
            // was answered so duplicates can replay it.
            self.alive_mids.evict_expired(now);
            self.alive_mids.insert(rcvd.peer, rcvd.pdu.message_id(), now);
            match response.kind() {
                MessageKind::Acknowledgement | MessageKind::Reset => {
                    self.alive_mids
                        .set_reply(&rcvd.peer, rcvd.pdu.message_id(), response.kind());
                }
                MessageKind::Confirmable => {
                    log::warn!("answering a CON message with a CON response instead of an ACK");
                }
                MessageKind::NonConfirmable => {}
            }

            if response.kind() != MessageKind::NonConfirmable
                || (is_response(response.code()) && !rcvd.local.ip().is_multicast())
            {
                if self.send_impl(&rcvd.peer, &response).is_none() {
                    log::debug!("cannot send response for message {}", rcvd.pdu.message_id());
                }
            }
        } else {
            let response = if code == REQUEST_GET && key == ResourceKey::wellknown() {
                log::debug!("create default response for .well-known/core");
                wellknown_response(&self.resources, &rcvd.pdu).ok()
            } else {
                new_error_response(&rcvd.pdu, response_code(405), &filter).ok()
            };

            match response {
                Some(response) if self.send_impl(&rcvd.peer, &response).is_some() => {}
                _ => log::debug!("cannot send response for transaction {}", rcvd.id),
            }
        }
    }

    fn handle_response(&mut self, sent: Option<&TransmitEntry>, rcvd: &Received) {
        log::debug!("incoming response: transaction={}", rcvd.id);

        // Call the application-specific response handler when
        // available. If there is none, confirmable responses still must
        // be acknowledged.
        if let Some(handler) = self.response_handler.clone() {
            handler(&rcvd.peer, sent.map(|entry| &entry.pdu), &rcvd.pdu, rcvd.id);
        } else {
            self.send_ack(&rcvd.peer, &rcvd.pdu);
        }
    }

    /// Failed-notify path: a confirmable notification exhausted its
    /// retransmissions or was reset. The owning resource's unregister
    /// hook runs once (guarded by the one-way `invalid` flag), then the
    /// queue's reference is released.
    fn failed_notify(&mut self, reg: Arc<Registration>) {
        reg.note_failure();

        let key = reg.reskey();
        let Some(resource) = self.resources.get_mut(&key) else {
            reg.release_ref();
            return;
        };

        if !reg.is_invalid() {
            if let Some(handler) = resource.unregister_handler() {
                handler(resource, &reg);
            }

            reg.invalidate();
        }

        resource.release_registration(reg);
    }

    /// Balances one registration checkout, looking up the owning
    /// resource so a zero count can scrub the subscriber list.
    fn release_registration(&mut self, reg: Arc<Registration>) {
        let key = reg.reskey();
        match self.resources.get_mut(&key) {
            Some(resource) => resource.release_registration(reg),
            None => {
                reg.release_ref();
            }
        }
    }
}

/// Randomized first timeout per RFC 7252:
/// `ACK_TIMEOUT * (1 + random(0, ACK_RANDOM_FACTOR - 1))`, realized as
/// `a = 0.150 * 1024` ticks and `timeout = a + (a / 3) * uniform(0, 1)`.
fn initial_timeout() -> Tick {
    let a = (0.150 * TICKS_PER_SECOND as f64) as Tick;
    a + (rand::rng().random::<f64>() * (a / 3) as f64) as Tick
}
