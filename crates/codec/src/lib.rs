//! ## Constrained Application Protocol (CoAP)
//!
//! [draft-ietf-core-coap-09]: https://tools.ietf.org/html/draft-ietf-core-coap-09
//! [draft-ietf-core-observe]: https://tools.ietf.org/html/draft-ietf-core-observe
//!
//! CoAP is a specialized web transfer protocol for use with constrained
//! nodes and constrained (e.g., low-power, lossy) networks.  The
//! protocol is designed for machine-to-machine (M2M) applications such
//! as smart energy and building automation.  CoAP provides a
//! request/response interaction model between application endpoints,
//! supports built-in discovery of services and resources, and includes
//! key concepts of the Web such as URIs and Internet media types.  CoAP
//! is designed to easily interface with HTTP for integration with the
//! Web while meeting specialized requirements such as multicast
//! support, very low overhead and simplicity for constrained
//! environments.  See [draft-ietf-core-coap-09] for the framing used
//! here and [draft-ietf-core-observe] for the subscription extension.

pub mod key;
pub mod option;
pub mod payload;
pub mod pdu;

use std::array::TryFromSliceError;

use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug)]
pub enum Error {
    InvalidInput,
    UnknownVersion,
    MalformedOptions,
    OptionOrder,
    OptionTooLong,
    DataAlreadyPresent,
    TryFromSliceError(TryFromSliceError),
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidInput, Self::InvalidInput) => true,
            (Self::UnknownVersion, Self::UnknownVersion) => true,
            (Self::MalformedOptions, Self::MalformedOptions) => true,
            (Self::OptionOrder, Self::OptionOrder) => true,
            (Self::OptionTooLong, Self::OptionTooLong) => true,
            (Self::DataAlreadyPresent, Self::DataAlreadyPresent) => true,
            (Self::TryFromSliceError(_), Self::TryFromSliceError(_)) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl std::error::Error for Error {}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<TryFromSliceError> for Error {
    fn from(value: TryFromSliceError) -> Self {
        Self::TryFromSliceError(value)
    }
}

/// Protocol version carried in the two top bits of the first header byte.
pub const VERSION: u8 = 1;

/// Fixed header size, bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest datagram this implementation reads or builds.
pub const MAX_PDU_SIZE: usize = 1400;

/// Tokens are capped at eight bytes on the wire.
pub const MAX_TOKEN_LENGTH: usize = 8;

/// Sentinel value of the header option-count nibble marking a long
/// option list, terminated by [`OPT_END`] instead of a count.
pub const OPT_LONG: u8 = 0x0f;

/// End-of-options marker, only legal when the header carries
/// [`OPT_LONG`].
pub const OPT_END: u8 = 0xf0;

/// Upper bound on the extended-length encoding of a single option.
pub const MAX_OPT_LENGTH: usize = 780;

pub const REQUEST_GET: u8 = 1;
pub const REQUEST_POST: u8 = 2;
pub const REQUEST_PUT: u8 = 3;
pub const REQUEST_DELETE: u8 = 4;

pub const MEDIATYPE_TEXT_PLAIN: u32 = 0;
pub const MEDIATYPE_APPLICATION_LINK_FORMAT: u32 = 40;
pub const MEDIATYPE_APPLICATION_OCTET_STREAM: u32 = 42;

/// Maps a dotted response code written as a decimal (for example `205`
/// for 2.05, `404` for 4.04) to its one-byte wire form.
///
/// # Test
///
/// ```
/// use coap_server_codec::response_code;
///
/// assert_eq!(response_code(205), 69);
/// assert_eq!(response_code(402), 130);
/// assert_eq!(response_code(404), 132);
/// assert_eq!(response_code(405), 133);
/// ```
pub const fn response_code(dotted: u16) -> u8 {
    (((dotted / 100) << 5) | (dotted % 100)) as u8
}

/// Request method codes occupy 1..=31.
pub const fn is_request(code: u8) -> bool {
    code >= 1 && code < 32
}

/// Response codes occupy 64..=191.
pub const fn is_response(code: u8) -> bool {
    code >= 64 && code < 192
}

/// The four message types of the two-bit T header field.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum MessageKind {
    Confirmable = 0,
    NonConfirmable = 1,
    Acknowledgement = 2,
    Reset = 3,
}

impl MessageKind {
    /// Stable index for per-type counter arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Opaque request/response correlation value, at most
/// [`MAX_TOKEN_LENGTH`] bytes.
///
/// # Test
///
/// ```
/// use coap_server_codec::Token;
///
/// let token = Token::new(&[0xde, 0xad, 0xbe, 0xef]);
/// assert_eq!(token.as_slice(), &[0xde, 0xad, 0xbe, 0xef]);
/// assert_eq!(token.len(), 4);
///
/// // Oversized inputs are truncated to the wire limit.
/// let token = Token::new(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
/// assert_eq!(token.len(), 8);
/// ```
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    length: u8,
    bytes: [u8; MAX_TOKEN_LENGTH],
}

impl Token {
    pub fn new(value: &[u8]) -> Self {
        let length = value.len().min(MAX_TOKEN_LENGTH);
        let mut bytes = [0u8; MAX_TOKEN_LENGTH];
        bytes[..length].copy_from_slice(&value[..length]);

        Self {
            length: length as u8,
            bytes,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.length as usize]
    }

    pub fn len(&self) -> usize {
        self.length as usize
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

/// Encodes an integer option value with leading zero bytes removed, the
/// way media types and sequence numbers are carried.
///
/// # Test
///
/// ```
/// use coap_server_codec::encode_var_bytes;
///
/// let mut buf = [0u8; 4];
/// assert_eq!(encode_var_bytes(0, &mut buf), 0);
/// assert_eq!(encode_var_bytes(40, &mut buf), 1);
/// assert_eq!(&buf[..1], &[40]);
/// assert_eq!(encode_var_bytes(0x1234, &mut buf), 2);
/// assert_eq!(&buf[..2], &[0x12, 0x34]);
/// ```
pub fn encode_var_bytes(value: u32, buf: &mut [u8; 4]) -> usize {
    let length = 4 - (value.leading_zeros() / 8) as usize;
    buf[..length].copy_from_slice(&value.to_be_bytes()[4 - length..]);
    length
}
