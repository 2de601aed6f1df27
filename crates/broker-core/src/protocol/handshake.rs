//! HTTP Upgrade handshake: request-head parsing and the literal `101` reply.
//!
//! The request head is parsed with `httparse` (the parser underneath hyper).
//! The reply is written by hand so its bytes never drift.
//!
//! Wire format of the response (byte-exact, no HTTP library involved):
//!
//! ```text
//! HTTP/1.1 101 Web Socket Protocol Handshake\r\n
//! Upgrade: WebSocket\r\n
//! Connection: Upgrade\r\n
//! Sec-WebSocket-Accept: <base64>\r\n
//! Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=15\r\n   (optional)
//! \r\n
//! ```
//!
//! The extension line is emitted whenever the client mentions
//! `permessage-deflate` anywhere in its extensions header.  The window-bits
//! parameter is fixed at 15; client-side parameters are never negotiated.

use std::collections::HashMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// RFC 6455 GUID appended to the client's key before hashing.
pub const WEBSOCKET_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Extension token looked for in `Sec-WebSocket-Extensions`.
pub const DEFLATE_EXTENSION: &str = "permessage-deflate";

/// Largest request head accepted before the connection is rejected.
pub const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Header slots offered to the parser; a head with more lines is rejected.
pub const MAX_HEADERS: usize = 64;

const STATUS_LINE: &str = "HTTP/1.1 101 Web Socket Protocol Handshake";
const DEFLATE_RESPONSE_LINE: &str =
    "Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=15";

/// Errors produced while reading an upgrade request.
#[derive(Debug, Error, PartialEq)]
pub enum HandshakeError {
    /// The head terminator (`\r\n\r\n`) has not arrived yet.
    #[error("insufficient data: request head incomplete after {available} bytes")]
    InsufficientData { available: usize },

    /// The head grew past [`MAX_HEAD_SIZE`] without a terminator.
    #[error("request head exceeds {max} bytes")]
    HeadTooLarge { max: usize },

    /// The request is not a usable WebSocket upgrade.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(String),
}

/// Case-insensitive header map.  Names are stored lowercased.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpgradeHeaders {
    inner: HashMap<String, String>,
}

impl UpgradeHeaders {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a header.  Repeated names are joined with `", "` as HTTP allows.
    pub fn insert(&mut self, name: &str, value: &str) {
        let key = name.trim().to_ascii_lowercase();
        let value = value.trim();
        self.inner
            .entry(key)
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(value);
            })
            .or_insert_with(|| value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.inner
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<'a> FromIterator<(&'a str, &'a str)> for UpgradeHeaders {
    fn from_iter<I: IntoIterator<Item = (&'a str, &'a str)>>(iter: I) -> Self {
        let mut headers = UpgradeHeaders::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A parsed HTTP request head.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub headers: UpgradeHeaders,
}

impl UpgradeRequest {
    /// Returns `true` when the request asks for `Upgrade: websocket`.
    pub fn is_websocket_upgrade(&self) -> bool {
        self.headers
            .get("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }
}

/// The computed upgrade reply, written verbatim to the socket by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct HandshakeResult {
    pub response_bytes: Vec<u8>,
    pub compression_enabled: bool,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses one request head from the start of `bytes`.
///
/// Returns the request and the number of bytes consumed (head plus the
/// terminating blank line).  Anything after that belongs to the WebSocket
/// stream and must be handed to the frame decoder.
///
/// # Errors
///
/// - [`HandshakeError::InsufficientData`] – keep reading and call again.
/// - [`HandshakeError::HeadTooLarge`] – give up on this connection.
/// - [`HandshakeError::MalformedHandshake`] – the head is not valid HTTP/1.x
///   or carries more than [`MAX_HEADERS`] header lines.
///
/// # Examples
///
/// ```rust
/// use broker_core::protocol::handshake::parse_request_head;
///
/// let raw = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\nextra";
/// let (req, consumed) = parse_request_head(raw).unwrap();
/// assert!(req.is_websocket_upgrade());
/// assert_eq!(&raw[consumed..], b"extra");
/// ```
pub fn parse_request_head(bytes: &[u8]) -> Result<(UpgradeRequest, usize), HandshakeError> {
    let mut slots = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut slots);
    let consumed = match parsed.parse(bytes) {
        Ok(httparse::Status::Complete(consumed)) => consumed,
        Ok(httparse::Status::Partial) if bytes.len() > MAX_HEAD_SIZE => {
            return Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_SIZE })
        }
        Ok(httparse::Status::Partial) => {
            return Err(HandshakeError::InsufficientData {
                available: bytes.len(),
            })
        }
        Err(e) => {
            return Err(HandshakeError::MalformedHandshake(format!(
                "unparseable request head: {e}"
            )))
        }
    };
    if consumed > MAX_HEAD_SIZE {
        return Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_SIZE });
    }

    let (Some(method), Some(path)) = (parsed.method, parsed.path) else {
        return Err(HandshakeError::MalformedHandshake(
            "request line without method or target".into(),
        ));
    };

    let mut headers = UpgradeHeaders::new();
    for header in parsed.headers.iter() {
        // Values are opaque bytes on the wire; the ones we read are ASCII.
        headers.insert(header.name, &String::from_utf8_lossy(header.value));
    }

    Ok((
        UpgradeRequest {
            method: method.to_string(),
            path: path.to_string(),
            headers,
        },
        consumed,
    ))
}

/// Computes the `101` response for an upgrade request.
///
/// Pure and deterministic: the same headers always produce the same bytes.
///
/// # Errors
///
/// Returns [`HandshakeError::MalformedHandshake`] when `Sec-WebSocket-Key`
/// is absent or empty.
///
/// # Examples
///
/// ```rust
/// use broker_core::protocol::handshake::{compute_upgrade_response, UpgradeHeaders};
///
/// let headers: UpgradeHeaders = [("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")]
///     .into_iter()
///     .collect();
/// let result = compute_upgrade_response(&headers).unwrap();
/// let text = String::from_utf8(result.response_bytes).unwrap();
/// assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo="));
/// assert!(!result.compression_enabled);
/// ```
pub fn compute_upgrade_response(
    headers: &UpgradeHeaders,
) -> Result<HandshakeResult, HandshakeError> {
    let key = headers
        .get("sec-websocket-key")
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            HandshakeError::MalformedHandshake("missing Sec-WebSocket-Key header".into())
        })?;

    let compression_enabled = headers
        .get("sec-websocket-extensions")
        .map(|ext| ext.to_ascii_lowercase().contains(DEFLATE_EXTENSION))
        .unwrap_or(false);

    let mut lines = vec![
        STATUS_LINE.to_string(),
        "Upgrade: WebSocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Accept: {}", accept_key(key)),
    ];
    if compression_enabled {
        lines.push(DEFLATE_RESPONSE_LINE.to_string());
    }
    let response = lines.join("\r\n") + "\r\n\r\n";

    Ok(HandshakeResult {
        response_bytes: response.into_bytes(),
        compression_enabled,
    })
}

/// base64(SHA-1(key ++ magic)).
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_MAGIC.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// The reply for upgrade requests that fail validation.  No body.
pub fn bad_request_response() -> &'static [u8] {
    b"HTTP/1.1 400 Bad Request\r\n\r\n"
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> UpgradeHeaders {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_accept_key_matches_rfc6455_sample() {
        // The sample nonce from RFC 6455 §1.3.
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_response_without_extensions_is_byte_exact() {
        let h = headers(&[("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")]);
        let result = compute_upgrade_response(&h).unwrap();
        let expected = "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
                        Upgrade: WebSocket\r\n\
                        Connection: Upgrade\r\n\
                        Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        assert_eq!(String::from_utf8(result.response_bytes).unwrap(), expected);
        assert!(!result.compression_enabled);
    }

    #[test]
    fn test_deflate_extension_is_advertised_with_fixed_window_bits() {
        // Client asks for client_max_window_bits; the reply ignores it.
        let h = headers(&[
            ("sec-websocket-key", "abc"),
            (
                "Sec-WebSocket-Extensions",
                "PerMessage-Deflate; client_max_window_bits",
            ),
        ]);
        let result = compute_upgrade_response(&h).unwrap();
        let text = String::from_utf8(result.response_bytes).unwrap();
        assert!(result.compression_enabled);
        assert!(text.ends_with(
            "Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=15\r\n\r\n"
        ));
    }

    #[test]
    fn test_unknown_extensions_are_ignored() {
        let h = headers(&[
            ("Sec-WebSocket-Key", "abc"),
            ("Sec-WebSocket-Extensions", "x-webkit-deflate-frame"),
        ]);
        let result = compute_upgrade_response(&h).unwrap();
        assert!(!result.compression_enabled);
        assert!(!String::from_utf8(result.response_bytes)
            .unwrap()
            .contains("Extensions"));
    }

    #[test]
    fn test_missing_key_is_malformed() {
        let h = headers(&[("Upgrade", "websocket")]);
        assert!(matches!(
            compute_upgrade_response(&h),
            Err(HandshakeError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_empty_key_is_malformed() {
        let h = headers(&[("Sec-WebSocket-Key", "  ")]);
        assert!(compute_upgrade_response(&h).is_err());
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let h = headers(&[("UPGRADE", "WebSocket")]);
        assert_eq!(h.get("upgrade"), Some("WebSocket"));
        assert_eq!(h.get("Upgrade"), Some("WebSocket"));
    }

    #[test]
    fn test_repeated_headers_are_joined() {
        let h = headers(&[
            ("Sec-WebSocket-Extensions", "foo"),
            ("sec-websocket-extensions", "permessage-deflate"),
        ]);
        assert_eq!(
            h.get("sec-websocket-extensions"),
            Some("foo, permessage-deflate")
        );
    }

    #[test]
    fn test_parse_request_head_waits_for_terminator() {
        let partial = b"GET / HTTP/1.1\r\nHost: x\r\n";
        assert_eq!(
            parse_request_head(partial),
            Err(HandshakeError::InsufficientData {
                available: partial.len()
            })
        );
    }

    #[test]
    fn test_parse_request_head_reports_consumed_bytes() {
        let raw = b"GET /ws?x=1 HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: k\r\n\r\n\x81\x80";
        let (req, consumed) = parse_request_head(raw).unwrap();
        assert_eq!(req.method, "GET");
        assert_eq!(req.path, "/ws?x=1");
        assert_eq!(req.headers.get("sec-websocket-key"), Some("k"));
        assert_eq!(&raw[consumed..], b"\x81\x80");
    }

    #[test]
    fn test_parse_request_head_rejects_oversized_head() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEAD_SIZE + 1));
        assert_eq!(
            parse_request_head(&raw),
            Err(HandshakeError::HeadTooLarge { max: MAX_HEAD_SIZE })
        );
    }

    #[test]
    fn test_parse_request_head_rejects_garbage_request_line() {
        let raw = b"hello\r\n\r\n";
        assert!(matches!(
            parse_request_head(raw),
            Err(HandshakeError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_parse_request_head_skips_leading_empty_line() {
        // Arrange
        let raw = b"\r\nGET / HTTP/1.1\r\nUpgrade: websocket\r\nSec-WebSocket-Key: abc\r\n\r\n";

        // Act
        let (req, consumed) = parse_request_head(raw).unwrap();

        // Assert
        assert_eq!(req.method, "GET");
        assert!(req.is_websocket_upgrade());
        assert_eq!(req.headers.get("sec-websocket-key"), Some("abc"));
        assert_eq!(consumed, raw.len());
    }

    #[test]
    fn test_parse_request_head_rejects_header_without_colon() {
        let raw = b"GET / HTTP/1.1\r\nnot a header\r\n\r\n";
        assert!(matches!(
            parse_request_head(raw),
            Err(HandshakeError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_parse_request_head_rejects_too_many_headers() {
        let mut raw = b"GET / HTTP/1.1\r\n".to_vec();
        for i in 0..=MAX_HEADERS {
            raw.extend(format!("X-Filler-{i}: v\r\n").into_bytes());
        }
        raw.extend(b"\r\n");
        assert!(matches!(
            parse_request_head(&raw),
            Err(HandshakeError::MalformedHandshake(_))
        ));
    }

    #[test]
    fn test_is_websocket_upgrade_requires_websocket_token() {
        let (req, _) = parse_request_head(b"GET / HTTP/1.1\r\nUpgrade: h2c\r\n\r\n").unwrap();
        assert!(!req.is_websocket_upgrade());
    }

    #[test]
    fn test_bad_request_response_has_no_body() {
        assert_eq!(bad_request_response(), b"HTTP/1.1 400 Bad Request\r\n\r\n");
    }
}
