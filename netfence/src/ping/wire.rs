//! Datagram layout for the ping protocol.
//!
//! Every message starts with an 8-byte header: a 4-byte ASCII tag
//! followed by a big-endian `u32` sequence number. Requests append
//! the raw session token after the header; responses are header-only.

/// Length of the ASCII message tag.
pub const TAG_LEN: usize = 4;

/// Length of the fixed header (tag + sequence).
pub const HEADER_LEN: usize = 8;

/// Client probe request.
pub const TAG_REQUEST: [u8; TAG_LEN] = *b"RP01";

/// Server success response.
pub const TAG_SUCCESS: [u8; TAG_LEN] = *b"RR01";

/// Server error response.
pub const TAG_ERROR: [u8; TAG_LEN] = *b"RE01";

/// A parsed server response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    /// The probe with this sequence number completed.
    Success { sequence: u32 },
    /// The server rejected the probe with this sequence number. A
    /// sequence of zero (or any unknown sequence) condemns the whole
    /// session rather than a single probe.
    Error { sequence: u32 },
}

/// Encode a probe request for the wire.
pub fn encode_request(sequence: u32, token: &[u8]) -> Vec<u8> {
    let mut datagram = Vec::with_capacity(HEADER_LEN + token.len());
    datagram.extend_from_slice(&TAG_REQUEST);
    datagram.extend_from_slice(&sequence.to_be_bytes());
    datagram.extend_from_slice(token);
    datagram
}

/// Parse a server datagram.
///
/// Returns `None` for datagrams shorter than the header or carrying
/// an unknown tag; the caller ignores those and keeps waiting.
pub fn parse_response(datagram: &[u8]) -> Option<Response> {
    if datagram.len() < HEADER_LEN {
        return None;
    }
    let sequence = u32::from_be_bytes([datagram[4], datagram[5], datagram[6], datagram[7]]);
    if datagram[..TAG_LEN] == TAG_SUCCESS {
        Some(Response::Success { sequence })
    } else if datagram[..TAG_LEN] == TAG_ERROR {
        Some(Response::Error { sequence })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_request_layout() {
        let datagram = encode_request(0x0102_0304, b"tok");
        assert_eq!(&datagram[..4], b"RP01");
        assert_eq!(&datagram[4..8], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&datagram[8..], b"tok");
    }

    #[test]
    fn test_encode_request_empty_token() {
        let datagram = encode_request(7, b"");
        assert_eq!(datagram.len(), HEADER_LEN);
        assert_eq!(&datagram[4..8], &7u32.to_be_bytes());
    }

    #[test]
    fn test_parse_success() {
        let mut datagram = Vec::from(TAG_SUCCESS);
        datagram.extend_from_slice(&42u32.to_be_bytes());
        assert_eq!(
            parse_response(&datagram),
            Some(Response::Success { sequence: 42 })
        );
    }

    #[test]
    fn test_parse_error() {
        let mut datagram = Vec::from(TAG_ERROR);
        datagram.extend_from_slice(&0u32.to_be_bytes());
        assert_eq!(
            parse_response(&datagram),
            Some(Response::Error { sequence: 0 })
        );
    }

    #[test]
    fn test_parse_ignores_trailing_bytes() {
        let mut datagram = Vec::from(TAG_SUCCESS);
        datagram.extend_from_slice(&9u32.to_be_bytes());
        datagram.extend_from_slice(b"extra");
        assert_eq!(
            parse_response(&datagram),
            Some(Response::Success { sequence: 9 })
        );
    }

    #[test]
    fn test_parse_rejects_short_datagram() {
        assert_eq!(parse_response(b"RR01"), None);
        assert_eq!(parse_response(b"RR01\x00\x00\x00"), None);
        assert_eq!(parse_response(b""), None);
    }

    #[test]
    fn test_parse_rejects_unknown_tag() {
        let mut datagram = Vec::from(*b"XX99");
        datagram.extend_from_slice(&1u32.to_be_bytes());
        assert_eq!(parse_response(&datagram), None);
    }
}
