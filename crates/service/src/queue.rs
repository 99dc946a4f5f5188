use crate::observe::Registration;

use std::{net::SocketAddr, sync::Arc};

use codec::{
    key::{ResourceKey, Tid},
    pdu::Pdu,
};

/// Engine time, in ticks of 1/1024 second. The platform clock is a
/// collaborator: callers pass the current tick in, the engine never
/// reads a clock itself.
pub type Tick = u64;

pub const TICKS_PER_SECOND: Tick = 1024;

/// An outstanding confirmable transmission.
///
/// Owns the assembled PDU for re-sending and, when the PDU is a
/// notification, a checked-out registration that must be released when
/// the entry leaves the queue.
pub struct TransmitEntry {
    pub pdu: Pdu,
    pub peer: SocketAddr,
    pub id: Tid,
    /// Absolute tick at which the entry next fires.
    pub t: Tick,
    pub timeout: Tick,
    pub retransmit_cnt: u8,
    pub registration: Option<Arc<Registration>>,
}

impl TransmitEntry {
    /// Resource key of the pinned registration, if any.
    pub fn reskey(&self) -> Option<ResourceKey> {
        self.registration.as_ref().map(|reg| reg.reskey())
    }
}

/// Send queue ordered by firing time, FIFO among equal times.
///
/// # Test
///
/// ```
/// use std::net::SocketAddr;
/// use coap_server_service::queue::{SendQueue, TransmitEntry};
/// use codec::{MessageKind, pdu::Pdu};
///
/// let peer: SocketAddr = "127.0.0.1:5683".parse().unwrap();
/// let entry = |id, t| TransmitEntry {
///     pdu: Pdu::new(MessageKind::Confirmable, 0, id as u16),
///     peer,
///     id,
///     t,
///     timeout: 100,
///     retransmit_cnt: 0,
///     registration: None,
/// };
///
/// let mut queue = SendQueue::default();
/// queue.insert(entry(1, 30));
/// queue.insert(entry(2, 10));
/// queue.insert(entry(3, 30));
///
/// assert_eq!(queue.next_deadline(), Some(10));
/// assert_eq!(queue.pop_due(10).unwrap().id, 2);
/// assert_eq!(queue.pop_due(10).map(|e| e.id), None);
///
/// // Equal firing times keep insertion order.
/// assert_eq!(queue.pop_due(30).unwrap().id, 1);
/// assert_eq!(queue.pop_due(30).unwrap().id, 3);
/// assert!(queue.is_empty());
/// ```
#[derive(Default)]
pub struct SendQueue {
    entries: Vec<TransmitEntry>,
}

impl SendQueue {
    /// Splices the entry in after every entry with an equal or earlier
    /// firing time, keeping ties stable.
    pub fn insert(&mut self, entry: TransmitEntry) {
        let index = self.entries.partition_point(|queued| queued.t <= entry.t);
        self.entries.insert(index, entry);
    }

    pub fn peek(&self) -> Option<&TransmitEntry> {
        self.entries.first()
    }

    /// Detaches the head if it is due.
    pub fn pop_due(&mut self, now: Tick) -> Option<TransmitEntry> {
        if self.entries.first()?.t <= now {
            Some(self.entries.remove(0))
        } else {
            None
        }
    }

    /// Detaches the first entry matching the transaction id. The caller
    /// is responsible for releasing any pinned registration.
    pub fn remove(&mut self, id: Tid) -> Option<TransmitEntry> {
        let index = self.entries.iter().position(|entry| entry.id == id)?;
        log::debug!("removed transaction {id}");
        Some(self.entries.remove(index))
    }

    pub fn find(&self, id: Tid) -> Option<&TransmitEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    pub fn next_deadline(&self) -> Option<Tick> {
        self.entries.first().map(|entry| entry.t)
    }

    pub fn drain(&mut self) -> Vec<TransmitEntry> {
        std::mem::take(&mut self.entries)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TransmitEntry> {
        self.entries.iter()
    }
}

/// A parsed datagram waiting for dispatch.
pub struct Received {
    pub pdu: Pdu,
    /// Source address of the datagram.
    pub peer: SocketAddr,
    /// Local address the datagram arrived on, consulted for the
    /// multicast response-suppression rule.
    pub local: SocketAddr,
    pub t: Tick,
    pub id: Tid,
}
