use crate::{
    Error, HEADER_SIZE, MAX_OPT_LENGTH, MAX_TOKEN_LENGTH, MessageKind, OPT_END, OPT_LONG, Token,
    VERSION,
    option::{FENCEPOST_DIVISOR, OptionType},
};

use std::ops::Range;

use bytes::{BufMut, BytesMut};

/// Peeked header fields of a datagram that may not parse as a whole
/// PDU. The dispatcher uses this to decide whether a malformed message
/// still deserves a Reset.
#[derive(Debug, Clone, Copy)]
pub struct RawHeader {
    pub version: u8,
    pub kind: MessageKind,
    pub code: u8,
    pub message_id: u16,
}

impl RawHeader {
    pub fn peek(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < HEADER_SIZE {
            return None;
        }

        Some(Self {
            version: bytes[0] >> 6,
            // Two bits, the conversion cannot fail.
            kind: MessageKind::try_from((bytes[0] >> 4) & 0x03).ok()?,
            code: bytes[1],
            message_id: u16::from_be_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// A single CoAP message: four-byte header, type-delta encoded option
/// list and an optional data region.
///
/// The wire image is kept assembled at all times so that a queued
/// message can be retransmitted without re-encoding. Options must be
/// appended in non-decreasing type order and before any data.
///
/// # Test
///
/// ```
/// use coap_server_codec::{MessageKind, pdu::Pdu, option::OptionType, response_code};
///
/// let mut pdu = Pdu::new(MessageKind::Acknowledgement, response_code(205), 0x1234);
/// pdu.add_option(OptionType::ContentType as u16, &[40]).unwrap();
/// pdu.add_option(OptionType::Token as u16, b"tk").unwrap();
/// pdu.add_data(b"payload");
///
/// let decoded = Pdu::decode(pdu.wire()).unwrap();
/// assert_eq!(decoded.kind(), MessageKind::Acknowledgement);
/// assert_eq!(decoded.code(), 69);
/// assert_eq!(decoded.message_id(), 0x1234);
/// assert_eq!(decoded.option_first(OptionType::Token as u16), Some(&b"tk"[..]));
/// assert_eq!(decoded.data(), b"payload");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pdu {
    bytes: BytesMut,
    options: Vec<(u16, Range<usize>)>,
    data_off: usize,
    last_type: u16,
    long_list: bool,
}

impl Pdu {
    pub fn new(kind: MessageKind, code: u8, message_id: u16) -> Self {
        let mut bytes = BytesMut::with_capacity(64);
        bytes.put_u8((VERSION << 6) | (u8::from(kind) << 4));
        bytes.put_u8(code);
        bytes.put_u16(message_id);

        Self {
            bytes,
            options: Vec::new(),
            data_off: HEADER_SIZE,
            last_type: 0,
            long_list: false,
        }
    }

    /// Parses a datagram, walking the option list defensively: the walk
    /// fails on any byte that would reach past the buffer, on reserved
    /// `0xFx` codes, and on an end-of-options marker in a short list.
    /// The computed data offset therefore always lies within the
    /// datagram.
    pub fn decode(input: &[u8]) -> Result<Self, Error> {
        if input.len() < HEADER_SIZE {
            return Err(Error::InvalidInput);
        }

        if input[0] >> 6 != VERSION {
            return Err(Error::UnknownVersion);
        }

        let optcnt = input[0] & 0x0f;
        let long_list = optcnt == OPT_LONG;
        let mut options = Vec::with_capacity(optcnt as usize);
        let mut remaining = optcnt;
        let mut kind = 0u16;
        let mut off = HEADER_SIZE;

        while long_list || remaining > 0 {
            if off >= input.len() {
                log::debug!("option list reaches past the datagram");
                return Err(Error::MalformedOptions);
            }

            let mut byte = input[off];
            if byte & 0xf0 == 0xf0 {
                match byte {
                    OPT_END => {
                        if long_list {
                            off += 1;
                            break;
                        }

                        log::debug!("unexpected end-of-options marker");
                        return Err(Error::MalformedOptions);
                    }
                    0xf1..=0xf3 => {
                        // Option jump: skip the low two bits of bytes.
                        let skip = (byte & 0x03) as usize;
                        if off + skip >= input.len() {
                            log::debug!("broken option jump");
                            return Err(Error::MalformedOptions);
                        }

                        off += skip;
                        byte = input[off];
                        if byte & 0xf0 == 0xf0 {
                            return Err(Error::MalformedOptions);
                        }
                    }
                    _ => {
                        log::debug!("unknown special character {byte:02x} in option list");
                        return Err(Error::MalformedOptions);
                    }
                }
            }

            kind += (byte >> 4) as u16;
            let mut length = (byte & 0x0f) as usize;
            off += 1;

            if length == 15 {
                // Extended length: continuation bytes of 0xff each add
                // 255, a final byte adds its own value.
                while off < input.len() && input[off] == 0xff && length < MAX_OPT_LENGTH {
                    length += 255;
                    off += 1;
                }

                if off >= input.len() {
                    return Err(Error::MalformedOptions);
                }

                length += input[off] as usize;
                off += 1;
            }

            if off + length > input.len() {
                log::debug!("option of length {length} exceeds the datagram");
                return Err(Error::MalformedOptions);
            }

            options.push((kind, off..off + length));
            off += length;

            if !long_list {
                remaining -= 1;
            }
        }

        Ok(Self {
            bytes: BytesMut::from(input),
            options,
            data_off: off,
            last_type: kind,
            long_list,
        })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        self.bytes[0] >> 6
    }

    #[inline]
    pub fn kind(&self) -> MessageKind {
        // Two bits, infallible by construction.
        MessageKind::try_from((self.bytes[0] >> 4) & 0x03).unwrap_or(MessageKind::Reset)
    }

    #[inline]
    pub fn code(&self) -> u8 {
        self.bytes[1]
    }

    pub fn set_code(&mut self, code: u8) {
        self.bytes[1] = code;
    }

    /// Message id, preserving wire byte order on re-encode.
    #[inline]
    pub fn message_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    /// The two raw message-id bytes as they appeared on the wire,
    /// hashed into the transaction id.
    #[inline]
    pub fn message_id_bytes(&self) -> [u8; 2] {
        [self.bytes[2], self.bytes[3]]
    }

    pub fn option_count(&self) -> usize {
        self.options.len()
    }

    /// Appends an option. Types must not decrease; a gap wider than the
    /// 4-bit delta is bridged with empty fence-post options at
    /// multiples of [`FENCEPOST_DIVISOR`].
    pub fn add_option(&mut self, kind: u16, value: &[u8]) -> Result<(), Error> {
        if self.data_off < self.bytes.len() {
            return Err(Error::DataAlreadyPresent);
        }

        if kind < self.last_type {
            return Err(Error::OptionOrder);
        }

        if value.len() > MAX_OPT_LENGTH {
            return Err(Error::OptionTooLong);
        }

        while kind - self.last_type > 14 {
            let fence = (self.last_type / FENCEPOST_DIVISOR + 1) * FENCEPOST_DIVISOR;
            self.push_option(fence, &[]);
        }

        self.push_option(kind, value);
        Ok(())
    }

    fn push_option(&mut self, kind: u16, value: &[u8]) {
        // A long list keeps its terminator at the tail so the wire
        // image stays valid between appends.
        if self.long_list {
            self.bytes.truncate(self.bytes.len() - 1);
        }

        let delta = (kind - self.last_type) as u8;
        if value.len() < 15 {
            self.bytes.put_u8((delta << 4) | value.len() as u8);
        } else {
            self.bytes.put_u8((delta << 4) | 0x0f);
            let mut rest = value.len() - 15;
            while rest >= 255 {
                self.bytes.put_u8(0xff);
                rest -= 255;
            }
            self.bytes.put_u8(rest as u8);
        }

        let start = self.bytes.len();
        self.bytes.extend_from_slice(value);
        self.options.push((kind, start..start + value.len()));
        self.last_type = kind;

        if !self.long_list {
            if self.options.len() > 14 {
                self.long_list = true;
            } else {
                self.bytes[0] = (self.bytes[0] & 0xf0) | self.options.len() as u8;
            }
        }

        if self.long_list {
            self.bytes[0] = (self.bytes[0] & 0xf0) | OPT_LONG;
            self.bytes.put_u8(OPT_END);
        }

        self.data_off = self.bytes.len();
    }

    pub fn add_data(&mut self, data: &[u8]) {
        self.bytes.extend_from_slice(data);
    }

    /// Options in wire order as `(type, value)` pairs.
    pub fn options(&self) -> impl Iterator<Item = (u16, &[u8])> {
        self.options
            .iter()
            .map(|(kind, range)| (*kind, &self.bytes[range.clone()]))
    }

    /// First option of the given type, if any.
    pub fn option_first(&self, kind: u16) -> Option<&[u8]> {
        self.options
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, range)| &self.bytes[range.clone()])
    }

    /// All values of a repeatable option, e.g. Uri-Path segments.
    pub fn option_values(&self, kind: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, range)| &self.bytes[range.clone()])
    }

    /// The Token option value, empty when absent or oversized input was
    /// truncated to [`MAX_TOKEN_LENGTH`].
    pub fn token(&self) -> Token {
        self.option_first(OptionType::Token as u16)
            .map(|value| Token::new(&value[..value.len().min(MAX_TOKEN_LENGTH)]))
            .unwrap_or_default()
    }

    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.bytes[self.data_off..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[self.data_off..]
    }

    /// The assembled wire image.
    #[inline]
    pub fn wire(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }
}

impl std::fmt::Display for Pdu {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v:{} t:{:?} oc:{} c:{} id:{}",
            self.version(),
            self.kind(),
            self.option_count(),
            self.code(),
            self.message_id()
        )?;

        for (kind, value) in self.options() {
            write!(f, " opt{}:'{}'", kind, Escaped(value))?;
        }

        if !self.data().is_empty() {
            write!(f, " data:'{}'", Escaped(self.data()))?;
        }

        Ok(())
    }
}

/// Renders opaque bytes for logging, hex-escaping anything that is not
/// printable ASCII.
struct Escaped<'a>(&'a [u8]);

impl std::fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &byte in self.0 {
            if byte.is_ascii_graphic() || byte == b' ' {
                write!(f, "{}", byte as char)?;
            } else {
                write!(f, "\\x{byte:02x}")?;
            }
        }

        Ok(())
    }
}
