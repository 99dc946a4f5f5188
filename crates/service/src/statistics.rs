use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use codec::{MessageKind, payload::SensorKind};

pub trait Number {
    fn add(&self, value: u64);
    fn get(&self) -> u64;
}

#[derive(Default)]
pub struct Count(AtomicU64);

impl Number for Count {
    fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Octet and packet counters for one traffic direction.
#[derive(Default)]
pub struct Traffic {
    pub octets: Count,
    pub packets: Count,
}

impl Traffic {
    fn add(&self, octets: usize) {
        self.octets.add(octets as u64);
        self.packets.add(1);
    }
}

/// Endpoint counters, read-only to consumers.
///
/// Indexed arrays use [`MessageKind::index`] and [`SensorKind::index`].
pub struct Counts {
    pub udp_in: Traffic,
    pub udp_out: Traffic,
    pub message_in: [Traffic; 4],
    pub message_out: [Traffic; 4],
    pub retransmits: Count,
    pub sensor_retransmits: [Count; SensorKind::COUNT],
    pub duplicates: Count,
}

impl Default for Counts {
    fn default() -> Self {
        Self {
            udp_in: Traffic::default(),
            udp_out: Traffic::default(),
            message_in: std::array::from_fn(|_| Traffic::default()),
            message_out: std::array::from_fn(|_| Traffic::default()),
            retransmits: Count::default(),
            sensor_retransmits: std::array::from_fn(|_| Count::default()),
            duplicates: Count::default(),
        }
    }
}

/// Cloneable handle over the endpoint counters.
///
/// # Test
///
/// ```
/// use coap_server_service::statistics::{Number, Statistics};
/// use codec::MessageKind;
///
/// let statistics = Statistics::default();
/// statistics.datagram_in(100);
/// statistics.message_in(MessageKind::Confirmable, 100);
///
/// assert_eq!(statistics.udp_in.octets.get(), 100);
/// assert_eq!(statistics.udp_in.packets.get(), 1);
/// assert_eq!(statistics.message_in[MessageKind::Confirmable.index()].packets.get(), 1);
/// assert_eq!(statistics.message_in[MessageKind::Reset.index()].packets.get(), 0);
/// ```
#[derive(Default, Clone)]
pub struct Statistics(Arc<Counts>);

impl std::ops::Deref for Statistics {
    type Target = Counts;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Statistics {
    pub fn datagram_in(&self, octets: usize) {
        self.udp_in.add(octets);
    }

    pub fn datagram_out(&self, octets: usize) {
        self.udp_out.add(octets);
    }

    pub fn message_in(&self, kind: MessageKind, octets: usize) {
        self.message_in[kind.index()].add(octets);
    }

    pub fn message_out(&self, kind: MessageKind, octets: usize) {
        self.message_out[kind.index()].add(octets);
    }

    pub fn retransmitted(&self, sensor: Option<SensorKind>) {
        self.retransmits.add(1);
        if let Some(sensor) = sensor {
            self.sensor_retransmits[sensor.index()].add(1);
        }
    }

    pub fn duplicate(&self) {
        self.duplicates.add(1);
    }
}
