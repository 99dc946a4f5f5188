use crate::{option::OptionType, pdu::Pdu};

use std::net::SocketAddr;

/// Transaction id matching an ACK or RST against an outstanding
/// confirmable message. Derived from the peer transport address and the
/// message id; collisions only cost a linear send-queue walk.
pub type Tid = u32;

/// Rolls `data` into the four-byte digest. Not cryptographic, just a
/// cheap spreading fold.
pub fn hash(data: &[u8], digest: &mut [u8; 4]) {
    for &byte in data {
        let mut index = digest.len() - 1;
        while index > 0 {
            digest[index] =
                ((digest[index] << 7) | (digest[index - 1] >> 1)).wrapping_add(digest[index]);
            index -= 1;
        }

        digest[0] = (digest[0] << 7).wrapping_add(digest[0]).wrapping_add(byte);
    }
}

/// Derives the transaction id of a message exchanged with `peer`.
///
/// The port and address octets are hashed; for IPv6 the flowinfo and
/// scope fields are deliberately left out so that two sockets differing
/// only in those produce the same id. The message id goes in last, in
/// wire byte order, and the digest is folded to 32 bits.
///
/// # Test
///
/// ```
/// use std::net::{SocketAddr, SocketAddrV6};
/// use coap_server_codec::key::transaction_id;
///
/// let peer: SocketAddr = "10.0.0.1:5683".parse().unwrap();
/// let mid = [0x12, 0x34];
///
/// assert_eq!(transaction_id(&peer, mid), transaction_id(&peer, mid));
///
/// // IPv6 scope and flowinfo do not participate.
/// let a = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 5683, 7, 1));
/// let b = SocketAddr::V6(SocketAddrV6::new("fe80::1".parse().unwrap(), 5683, 0, 9));
/// assert_eq!(transaction_id(&a, mid), transaction_id(&b, mid));
/// ```
pub fn transaction_id(peer: &SocketAddr, message_id: [u8; 2]) -> Tid {
    let mut digest = [0u8; 4];

    hash(&peer.port().to_be_bytes(), &mut digest);
    match peer {
        SocketAddr::V4(addr) => hash(&addr.ip().octets(), &mut digest),
        SocketAddr::V6(addr) => hash(&addr.ip().octets(), &mut digest),
    }

    hash(&message_id, &mut digest);

    (((digest[0] as u32) << 8) | digest[1] as u32)
        ^ (((digest[2] as u32) << 8) | digest[3] as u32)
}

/// Hash key identifying a resource in the registry.
///
/// # Test
///
/// ```
/// use coap_server_codec::key::ResourceKey;
///
/// let a = ResourceKey::from_path("sensors/accel");
/// let b = ResourceKey::from_segments(["sensors", "accel"].into_iter());
/// assert_eq!(a, b);
/// assert_ne!(a, ResourceKey::from_path("sensors/gyro"));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKey(pub [u8; 4]);

impl ResourceKey {
    pub fn from_segments<'a>(segments: impl Iterator<Item = &'a str>) -> Self {
        let mut digest = [0u8; 4];
        for segment in segments {
            hash(segment.as_bytes(), &mut digest);
        }

        Self(digest)
    }

    pub fn from_path(path: &str) -> Self {
        Self::from_segments(path.split('/').filter(|segment| !segment.is_empty()))
    }

    /// Folds the Uri-Path options of a request into the lookup key.
    pub fn from_request(pdu: &Pdu) -> Self {
        let mut digest = [0u8; 4];
        for segment in pdu.option_values(OptionType::UriPath as u16) {
            hash(segment, &mut digest);
        }

        Self(digest)
    }

    /// The reserved key of `.well-known/core`.
    pub fn wellknown() -> Self {
        Self::from_segments([".well-known", "core"].into_iter())
    }
}
