use crate::queue::{TICKS_PER_SECOND, Tick};

use std::net::SocketAddr;

use codec::MessageKind;

/// How long a message id stays bound to its originator for duplicate
/// suppression.
pub const EXCHANGE_LIFETIME: Tick = 247 * TICKS_PER_SECOND;

/// One recently seen request.
pub struct AliveMid {
    pub peer: SocketAddr,
    /// Message id in wire byte order.
    pub mid: u16,
    /// How the request was answered: `Acknowledgement`, `Reset`, or
    /// `None` while undefined (the request arrived as NON, or the
    /// response has not been emitted yet).
    pub reply: Option<MessageKind>,
    pub expiry: Tick,
}

/// Per-peer window of alive message ids.
///
/// # Test
///
/// ```
/// use std::net::SocketAddr;
/// use coap_server_service::dedup::{DuplicateCache, EXCHANGE_LIFETIME};
/// use codec::MessageKind;
///
/// let peer: SocketAddr = "10.0.0.1:5683".parse().unwrap();
/// let mut cache = DuplicateCache::default();
///
/// cache.insert(peer, 0x0077, 0);
/// assert!(cache.find(&peer, 0x0077).is_some());
/// assert!(cache.find(&peer, 0x0078).is_none());
///
/// cache.set_reply(&peer, 0x0077, MessageKind::Acknowledgement);
/// assert_eq!(
///     cache.find(&peer, 0x0077).unwrap().reply,
///     Some(MessageKind::Acknowledgement)
/// );
///
/// cache.evict_expired(EXCHANGE_LIFETIME + 1);
/// assert!(cache.find(&peer, 0x0077).is_none());
/// ```
#[derive(Default)]
pub struct DuplicateCache {
    entries: Vec<AliveMid>,
}

impl DuplicateCache {
    pub fn evict_expired(&mut self, now: Tick) {
        self.entries.retain(|entry| {
            if entry.expiry < now {
                log::debug!("mid {} expired, deleting", entry.mid);
                false
            } else {
                true
            }
        });
    }

    /// Matches by message id and source address, as the standard
    /// requires.
    pub fn find(&self, peer: &SocketAddr, mid: u16) -> Option<&AliveMid> {
        self.entries
            .iter()
            .find(|entry| entry.mid == mid && entry.peer == *peer)
    }

    /// Records a freshly accepted request with an undefined reply type.
    pub fn insert(&mut self, peer: SocketAddr, mid: u16, now: Tick) {
        self.entries.push(AliveMid {
            peer,
            mid,
            reply: None,
            expiry: now + EXCHANGE_LIFETIME,
        });
    }

    /// Fixes the reply type once the local response has been emitted.
    pub fn set_reply(&mut self, peer: &SocketAddr, mid: u16, reply: MessageKind) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|entry| entry.mid == mid && entry.peer == *peer)
        {
            entry.reply = Some(reply);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
