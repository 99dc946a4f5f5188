use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering},
    },
};

use codec::{Token, key::ResourceKey};

use parking_lot::Mutex;
use rand::Rng;

/// Up to 15 non-confirmable notifications may go out back to back
/// before a confirmable one is forced.
pub const OBS_MAX_NON: u8 = 15;

/// Up to 3 confirmable notifications may fail before the observer is
/// written off.
pub const OBS_MAX_FAIL: u8 = 3;

/// A persistent subscription of one peer to one resource.
///
/// Registrations are shared: the owning resource's subscriber list
/// holds the record, and every in-flight confirmable notification pins
/// it through its send-queue entry. The explicit reference count tracks
/// checkouts only; the list itself does not count. The record is
/// scrubbed from the list when the balancing release brings the count
/// to zero.
///
/// `invalid` is a one-way state bit meaning stream teardown is in
/// progress; it is not a refcount condition, and handlers must not
/// invoke the unregister hook once it is set.
pub struct Registration {
    peer: SocketAddr,
    reskey: ResourceKey,
    token: Mutex<Token>,
    refcnt: AtomicU32,
    invalid: AtomicBool,
    /// Send non-confirmable notifications when set.
    non: AtomicBool,
    non_cnt: AtomicU8,
    fail_cnt: AtomicU8,
    /// Notification sequence number, seeded randomly like an RTP
    /// sequence.
    notcnt: AtomicU16,
    octets: AtomicU64,
    packets: AtomicU64,
    last_sr_octets: AtomicU64,
    last_sr_packets: AtomicU64,
    ntp_twin: AtomicU64,
    rtp_twin: AtomicU32,
    sr_ready: AtomicBool,
}

impl Registration {
    pub fn new(reskey: ResourceKey, peer: SocketAddr, token: &Token) -> Arc<Self> {
        Arc::new(Self {
            peer,
            reskey,
            token: Mutex::new(*token),
            refcnt: AtomicU32::new(0),
            invalid: AtomicBool::new(false),
            non: AtomicBool::new(false),
            non_cnt: AtomicU8::new(0),
            fail_cnt: AtomicU8::new(0),
            notcnt: AtomicU16::new(rand::rng().random()),
            octets: AtomicU64::new(0),
            packets: AtomicU64::new(0),
            last_sr_octets: AtomicU64::new(0),
            last_sr_packets: AtomicU64::new(0),
            ntp_twin: AtomicU64::new(0),
            rtp_twin: AtomicU32::new(0),
            sr_ready: AtomicBool::new(false),
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn reskey(&self) -> ResourceKey {
        self.reskey
    }

    pub fn token(&self) -> Token {
        *self.token.lock()
    }

    pub(crate) fn set_token(&self, token: &Token) {
        *self.token.lock() = *token;
    }

    /// Takes one reference on the record. Checkout and release are the
    /// sole mutators of the count.
    pub fn checkout(self: &Arc<Self>) -> Arc<Registration> {
        self.refcnt.fetch_add(1, Ordering::Relaxed);
        self.clone()
    }

    /// Drops one reference, returning the remaining count.
    pub(crate) fn release_ref(&self) -> u32 {
        self.refcnt.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt.load(Ordering::Relaxed)
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Relaxed)
    }

    /// Marks the stream teardown. Returns true only for the call that
    /// made the transition, so the unregister hook runs at most once.
    pub fn invalidate(&self) -> bool {
        !self.invalid.swap(true, Ordering::Relaxed)
    }

    pub fn fail_cnt(&self) -> u8 {
        self.fail_cnt.load(Ordering::Relaxed)
    }

    pub fn clear_failures(&self) {
        self.fail_cnt.store(0, Ordering::Relaxed);
    }

    pub(crate) fn note_failure(&self) -> u8 {
        let count = self.fail_cnt.load(Ordering::Relaxed).saturating_add(1);
        self.fail_cnt.store(count.min(OBS_MAX_FAIL), Ordering::Relaxed);
        count
    }

    pub fn set_non(&self, non: bool) {
        self.non.store(non, Ordering::Relaxed);
        self.non_cnt.store(0, Ordering::Relaxed);
    }

    /// Notification cadence: a confirmable is due when the observer is
    /// in confirmable mode, or after [`OBS_MAX_NON`] consecutive
    /// non-confirmables.
    ///
    /// # Test
    ///
    /// ```
    /// use coap_server_service::observe::{OBS_MAX_NON, Registration};
    /// use codec::{Token, key::ResourceKey};
    ///
    /// let reg = Registration::new(
    ///     ResourceKey::from_path("sensors/accel"),
    ///     "10.0.0.1:5683".parse().unwrap(),
    ///     &Token::default(),
    /// );
    ///
    /// reg.set_non(true);
    /// for _ in 0..OBS_MAX_NON {
    ///     assert!(!reg.next_is_confirmable());
    /// }
    /// assert!(reg.next_is_confirmable());
    /// assert!(!reg.next_is_confirmable());
    /// ```
    pub fn next_is_confirmable(&self) -> bool {
        if !self.non.load(Ordering::Relaxed) {
            return true;
        }

        let count = self.non_cnt.load(Ordering::Relaxed);
        if count < OBS_MAX_NON {
            self.non_cnt.store(count + 1, Ordering::Relaxed);
            false
        } else {
            self.non_cnt.store(0, Ordering::Relaxed);
            true
        }
    }

    /// Next value of the notification sequence.
    pub fn next_notification(&self) -> u16 {
        self.notcnt.fetch_add(1, Ordering::Relaxed)
    }

    /// Accounts one delivered payload toward the stream counters.
    pub fn note_sent(&self, octets: u64) {
        self.octets.fetch_add(octets, Ordering::Relaxed);
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn octets(&self) -> u64 {
        self.octets.load(Ordering::Relaxed)
    }

    pub fn packets(&self) -> u64 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Snapshots the stream counters for a sender report and stores the
    /// NTP/RTP timestamp twin it was taken at.
    pub fn sender_report(&self, ntp: u64, rtp: u32) {
        self.ntp_twin.store(ntp, Ordering::Relaxed);
        self.rtp_twin.store(rtp, Ordering::Relaxed);
        self.last_sr_octets
            .store(self.octets(), Ordering::Relaxed);
        self.last_sr_packets
            .store(self.packets(), Ordering::Relaxed);
        self.sr_ready.store(true, Ordering::Relaxed);
    }

    pub fn sr_ready(&self) -> bool {
        self.sr_ready.load(Ordering::Relaxed)
    }

    pub fn last_report(&self) -> (u64, u32, u64, u64) {
        (
            self.ntp_twin.load(Ordering::Relaxed),
            self.rtp_twin.load(Ordering::Relaxed),
            self.last_sr_octets.load(Ordering::Relaxed),
            self.last_sr_packets.load(Ordering::Relaxed),
        )
    }
}
