use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Option numbers of draft-ietf-core-coap-09.
///
/// Odd numbers are critical: an endpoint that does not understand them
/// must reject the message instead of skipping them.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum OptionType {
    ContentType = 1,
    MaxAge = 2,
    ProxyUri = 3,
    Etag = 4,
    UriHost = 5,
    LocationPath = 6,
    UriPort = 7,
    LocationQuery = 8,
    UriPath = 9,
    Observe = 10,
    Token = 11,
    Accept = 12,
    IfMatch = 13,
    UriQuery = 15,
    IfNoneMatch = 21,
}

/// Fence-post options are placed at multiples of this divisor to bridge
/// type deltas larger than 14; they are elective and carry no value.
pub const FENCEPOST_DIVISOR: u16 = 14;

/// Whether an option number denotes a critical option.
///
/// # Test
///
/// ```
/// use coap_server_codec::option::{OptionType, is_critical};
///
/// assert!(is_critical(OptionType::Token as u16));
/// assert!(is_critical(99));
/// assert!(!is_critical(OptionType::Observe as u16));
/// ```
pub const fn is_critical(kind: u16) -> bool {
    kind & 0x01 == 0x01
}

/// Bit vector over option numbers, used both for the context's known
/// critical options and for selecting which request options an error
/// response echoes.
///
/// # Test
///
/// ```
/// use coap_server_codec::option::OptionFilter;
///
/// let mut filter = OptionFilter::default();
/// assert!(!filter.contains(11));
///
/// assert!(filter.set(11));
/// assert!(filter.contains(11));
///
/// filter.clear(11);
/// assert!(!filter.contains(11));
///
/// // Numbers beyond the vector are rejected, never silently wrapped.
/// assert!(!filter.set(4096));
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OptionFilter([u8; 16]);

impl OptionFilter {
    /// Marks an option number. Returns false when the number falls
    /// outside the vector, which callers use to stop scanning.
    pub fn set(&mut self, kind: u16) -> bool {
        let index = (kind >> 3) as usize;
        if index >= self.0.len() {
            return false;
        }

        self.0[index] |= 1 << (kind & 0x07);
        true
    }

    pub fn clear(&mut self, kind: u16) {
        let index = (kind >> 3) as usize;
        if index < self.0.len() {
            self.0[index] &= !(1 << (kind & 0x07));
        }
    }

    pub fn contains(&self, kind: u16) -> bool {
        let index = (kind >> 3) as usize;
        if index >= self.0.len() {
            return false;
        }

        self.0[index] & (1 << (kind & 0x07)) != 0
    }
}
