use crate::resource::ResourceMap;

use codec::{
    Error, MEDIATYPE_APPLICATION_LINK_FORMAT, MEDIATYPE_TEXT_PLAIN, MessageKind, encode_var_bytes,
    option::{OptionFilter, OptionType},
    pdu::Pdu,
    response_code,
};

/// Reason phrases are appended to error responses while this is
/// non-zero.
pub const ERROR_PHRASE_LENGTH: usize = 32;

/// Human-readable phrase for a one-byte response code.
pub fn response_phrase(code: u8) -> Option<&'static str> {
    Some(match code {
        _ if code == response_code(201) => "Created",
        _ if code == response_code(202) => "Deleted",
        _ if code == response_code(203) => "Valid",
        _ if code == response_code(204) => "Changed",
        _ if code == response_code(205) => "Content",
        _ if code == response_code(400) => "Bad Request",
        _ if code == response_code(401) => "Unauthorized",
        _ if code == response_code(402) => "Bad Option",
        _ if code == response_code(403) => "Forbidden",
        _ if code == response_code(404) => "Not Found",
        _ if code == response_code(405) => "Method Not Allowed",
        _ if code == response_code(412) => "Precondition Failed",
        _ if code == response_code(413) => "Request Entity Too Large",
        _ if code == response_code(415) => "Unsupported Media Type",
        _ if code == response_code(500) => "Internal Server Error",
        _ if code == response_code(501) => "Not Implemented",
        _ if code == response_code(502) => "Bad Gateway",
        _ if code == response_code(503) => "Service Unavailable",
        _ if code == response_code(504) => "Gateway Timeout",
        _ if code == response_code(505) => "Proxying Not Supported",
        _ => return None,
    })
}

/// Frames the ACK (confirmable request) or NON response that mirrors
/// `request`'s message id.
fn response_frame(request: &Pdu, code: u8) -> Pdu {
    let kind = if request.kind() == MessageKind::Confirmable {
        MessageKind::Acknowledgement
    } else {
        MessageKind::NonConfirmable
    };

    Pdu::new(kind, code, request.message_id())
}

/// Builds an error response for `request`.
///
/// The Token option is always mirrored; any further options selected by
/// `filter` (typically the unknown critical options behind a 4.02) are
/// copied over, while Content-Type is reserved for the reason phrase.
///
/// # Test
///
/// ```
/// use coap_server_service::response::new_error_response;
/// use codec::{MessageKind, option::{OptionFilter, OptionType}, pdu::Pdu, response_code};
///
/// let mut request = Pdu::new(MessageKind::Confirmable, 1, 0x0042);
/// request.add_option(OptionType::Token as u16, b"tk").unwrap();
///
/// let filter = OptionFilter::default();
/// let response = new_error_response(&request, response_code(404), &filter).unwrap();
///
/// assert_eq!(response.kind(), MessageKind::Acknowledgement);
/// assert_eq!(response.code(), 132);
/// assert_eq!(response.message_id(), 0x0042);
/// assert_eq!(response.option_first(OptionType::Token as u16), Some(&b"tk"[..]));
/// assert_eq!(response.data(), b"Not Found");
/// ```
pub fn new_error_response(request: &Pdu, code: u8, filter: &OptionFilter) -> Result<Pdu, Error> {
    let mut opts = *filter;
    opts.clear(OptionType::ContentType as u16);
    opts.set(OptionType::Token as u16);

    let mut response = response_frame(request, code);

    let phrase = if ERROR_PHRASE_LENGTH > 0 {
        response_phrase(code)
    } else {
        None
    };

    if phrase.is_some() {
        let mut buf = [0u8; 4];
        let length = encode_var_bytes(MEDIATYPE_TEXT_PLAIN, &mut buf);
        response.add_option(OptionType::ContentType as u16, &buf[..length])?;
    }

    for (kind, value) in request.options() {
        if opts.contains(kind) {
            response.add_option(kind, value)?;
        }
    }

    if let Some(phrase) = phrase {
        response.add_data(phrase.as_bytes());
    }

    Ok(response)
}

/// Builds the link-format listing response for GET `.well-known/core`.
pub fn wellknown_response(resources: &ResourceMap, request: &Pdu) -> Result<Pdu, Error> {
    let mut response = response_frame(request, response_code(205));

    let mut buf = [0u8; 4];
    let length = encode_var_bytes(MEDIATYPE_APPLICATION_LINK_FORMAT, &mut buf);
    response.add_option(OptionType::ContentType as u16, &buf[..length])?;

    let token = request.token();
    if !token.is_empty() {
        response.add_option(OptionType::Token as u16, token.as_slice())?;
    }

    response.add_data(resources.link_format().as_bytes());
    Ok(response)
}
