use num_enum::{IntoPrimitive, TryFromPrimitive};

/// First byte of every notification payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum PacketKind {
    Datapoint = 1,
    /// Set in place of [`PacketKind::Datapoint`] on the first
    /// retransmission so receivers can tell replays apart.
    DatapointRetransmitted = 2,
    SenderReport = 3,
}

/// Second byte of every notification payload, using the Android sensor
/// numbering of the original data source.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum SensorKind {
    Accelerometer = 1,
    Gyroscope = 4,
    Light = 5,
    Proximity = 8,
}

impl SensorKind {
    pub const COUNT: usize = 4;

    /// Dense index for per-sensor counter arrays.
    pub fn index(self) -> usize {
        match self {
            Self::Accelerometer => 0,
            Self::Gyroscope => 1,
            Self::Light => 2,
            Self::Proximity => 3,
        }
    }
}

/// Two-byte header prefixed to sensor payloads.
///
/// # Test
///
/// ```
/// use coap_server_codec::payload::{PacketKind, PayloadHeader, SensorKind};
///
/// let header = PayloadHeader {
///     packet: PacketKind::Datapoint,
///     sensor: SensorKind::Light,
/// };
///
/// let mut data = vec![0u8; 2];
/// header.write(&mut data);
///
/// assert_eq!(PayloadHeader::read(&data), Some(header));
/// assert_eq!(PayloadHeader::read(&[1]), None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    pub packet: PacketKind,
    pub sensor: SensorKind,
}

impl PayloadHeader {
    pub const SIZE: usize = 2;

    pub fn read(data: &[u8]) -> Option<Self> {
        if data.len() < Self::SIZE {
            return None;
        }

        Some(Self {
            packet: PacketKind::try_from(data[0]).ok()?,
            sensor: SensorKind::try_from(data[1]).ok()?,
        })
    }

    pub fn write(&self, data: &mut [u8]) {
        data[0] = self.packet.into();
        data[1] = self.sensor.into();
    }
}

/// Flips a datapoint payload to its retransmitted tag in place.
/// Returns whether anything changed; subsequent calls are no-ops.
///
/// # Test
///
/// ```
/// use coap_server_codec::payload::{PacketKind, retag_retransmitted};
///
/// let mut data = vec![PacketKind::Datapoint as u8, 5];
/// assert!(retag_retransmitted(&mut data));
/// assert_eq!(data[0], PacketKind::DatapointRetransmitted as u8);
/// assert!(!retag_retransmitted(&mut data));
/// ```
pub fn retag_retransmitted(data: &mut [u8]) -> bool {
    match PayloadHeader::read(data) {
        Some(header) if header.packet == PacketKind::Datapoint => {
            data[0] = PacketKind::DatapointRetransmitted.into();
            true
        }
        _ => false,
    }
}
