//! HTTP/1.1 upgrade handshake (RFC 6455 section 4).
//!
//! Only the pieces the echo endpoint and its probe client need: request and
//! response heads, the accept-key digest, and plain-text rejections.

use std::collections::HashMap;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};

use crate::error::{Error, Result};

/// GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers that must appear at most once in a request.
const SINGLE_HEADERS: [&str; 5] = [
    "host",
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
];

/// `Base64(SHA-1(key + GUID))`.
///
/// ```
/// use pmdecho::protocol::compute_accept_key;
///
/// assert_eq!(
///     compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Fresh random `Sec-WebSocket-Key`.
///
/// # Errors
///
/// Returns [`Error::Io`] if the OS entropy source fails.
pub fn generate_key() -> Result<String> {
    let mut nonce = [0u8; 16];
    getrandom::getrandom(&mut nonce).map_err(|e| Error::Io(e.to_string()))?;
    Ok(BASE64.encode(nonce))
}

/// Offset just past the blank line that ends an HTTP head, if present.
pub fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Lower-cased header map. Repeated non-critical headers are joined with
/// `", "`, which is how `Sec-WebSocket-Extensions` may legally be split.
fn parse_headers<'a, I>(lines: I, single: &[&str]) -> Result<HashMap<String, String>>
where
    I: Iterator<Item = &'a str>,
{
    let mut headers: HashMap<String, String> = HashMap::new();

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(Error::InvalidHandshake(format!("malformed header line: {line}")));
        };
        let name = name.trim().to_ascii_lowercase();
        let value = value.trim();

        match headers.get_mut(&name) {
            Some(_) if single.contains(&name.as_str()) => {
                return Err(Error::InvalidHandshake(format!("duplicate header: {name}")));
            }
            Some(existing) => {
                existing.push_str(", ");
                existing.push_str(value);
            }
            None => {
                headers.insert(name, value.to_string());
            }
        }
    }

    Ok(headers)
}

fn validate_header_value(header: &str, value: &str) -> Result<()> {
    if value.contains(['\r', '\n']) {
        return Err(Error::InvalidHeaderValue {
            header: header.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

fn head_text(data: &[u8]) -> Result<&str> {
    std::str::from_utf8(data).map_err(|_| Error::InvalidHandshake("head is not UTF-8".into()))
}

fn require<'h>(headers: &'h HashMap<String, String>, name: &str) -> Result<&'h str> {
    headers
        .get(name)
        .map(String::as_str)
        .ok_or_else(|| Error::InvalidHandshake(format!("missing {name} header")))
}

fn check_upgrade_headers(headers: &HashMap<String, String>) -> Result<()> {
    let upgrade = require(headers, "upgrade")?;
    if !upgrade.eq_ignore_ascii_case("websocket") {
        return Err(Error::InvalidHandshake(format!(
            "invalid Upgrade header: {upgrade}"
        )));
    }
    let connection = require(headers, "connection")?;
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(Error::InvalidHandshake(format!(
            "invalid Connection header: {connection}"
        )));
    }
    Ok(())
}

/// Client upgrade request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    /// Request target, e.g. `/ws`.
    pub path: String,
    /// `Host` header.
    pub host: String,
    /// `Sec-WebSocket-Key` header.
    pub key: String,
    /// `Sec-WebSocket-Version`; only 13 is accepted.
    pub version: u8,
    /// Combined `Sec-WebSocket-Extensions` value, if any.
    pub extensions: Option<String>,
}

impl HandshakeRequest {
    /// Build a request for the client side.
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        key: impl Into<String>,
        extensions: Option<String>,
    ) -> Self {
        Self {
            path: path.into(),
            host: host.into(),
            key: key.into(),
            version: 13,
            extensions,
        }
    }

    /// Parse a request head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] for a non-GET or non-HTTP/1.1
    /// request line, duplicated critical headers, or missing or wrong
    /// `Upgrade`, `Connection`, `Host`, `Sec-WebSocket-Key` and
    /// `Sec-WebSocket-Version` headers.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = head_text(data)?;
        let mut lines = text.split("\r\n");

        let request_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("empty request".into()))?;
        let parts: Vec<&str> = request_line.split_whitespace().collect();
        let [method, path, version] = parts.as_slice() else {
            return Err(Error::InvalidHandshake(format!(
                "invalid request line: {request_line}"
            )));
        };
        if *method != "GET" {
            return Err(Error::InvalidHandshake(format!(
                "expected GET method, got {method}"
            )));
        }
        if *version != "HTTP/1.1" {
            return Err(Error::InvalidHandshake(format!(
                "expected HTTP/1.1, got {version}"
            )));
        }

        let headers = parse_headers(lines, &SINGLE_HEADERS)?;
        check_upgrade_headers(&headers)?;

        let version_str = require(&headers, "sec-websocket-version")?;
        let ws_version: u8 = version_str
            .parse()
            .map_err(|_| Error::InvalidHandshake(format!("invalid version: {version_str}")))?;

        Ok(Self {
            path: (*path).to_string(),
            host: require(&headers, "host")?.to_string(),
            key: require(&headers, "sec-websocket-key")?.to_string(),
            version: ws_version,
            extensions: headers.get("sec-websocket-extensions").cloned(),
        })
    }

    /// Semantic checks: version 13, a 16-byte base64 key, a non-empty host.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] on the first failed check.
    pub fn validate(&self) -> Result<()> {
        if self.version != 13 {
            return Err(Error::InvalidHandshake(format!(
                "unsupported WebSocket version: {} (expected 13)",
                self.version
            )));
        }
        match BASE64.decode(&self.key) {
            Ok(decoded) if decoded.len() == 16 => {}
            Ok(decoded) => {
                return Err(Error::InvalidHandshake(format!(
                    "Sec-WebSocket-Key must be 16 bytes, got {}",
                    decoded.len()
                )));
            }
            Err(_) => {
                return Err(Error::InvalidHandshake(
                    "Sec-WebSocket-Key is not valid base64".into(),
                ));
            }
        }
        if self.host.is_empty() {
            return Err(Error::InvalidHandshake("Host header is empty".into()));
        }
        Ok(())
    }

    /// Serialize the request head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeaderValue`] if a value contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("Host", &self.host)?;
        validate_header_value("Request-Target", &self.path)?;
        buf.extend_from_slice(format!("GET {} HTTP/1.1\r\n", self.path).as_bytes());
        buf.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        buf.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Key: {}\r\n", self.key).as_bytes());
        buf.extend_from_slice(format!("Sec-WebSocket-Version: {}\r\n", self.version).as_bytes());
        if let Some(ext) = &self.extensions {
            validate_header_value("Sec-WebSocket-Extensions", ext)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Extensions: {ext}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

/// Server `101 Switching Protocols` response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResponse {
    /// `Sec-WebSocket-Accept` value.
    pub accept: String,
    /// Accepted `Sec-WebSocket-Extensions`, if any.
    pub extensions: Option<String>,
}

impl HandshakeResponse {
    /// Response to a validated request with the negotiated extensions.
    pub fn from_request(req: &HandshakeRequest, extensions: Option<String>) -> Self {
        Self {
            accept: compute_accept_key(&req.key),
            extensions,
        }
    }

    /// Serialize the response head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHeaderValue`] if the extension value contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        buf.extend_from_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.extend_from_slice(b"Upgrade: websocket\r\nConnection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Accept: {}\r\n", self.accept).as_bytes());
        if let Some(ext) = &self.extensions {
            validate_header_value("Sec-WebSocket-Extensions", ext)?;
            buf.extend_from_slice(format!("Sec-WebSocket-Extensions: {ext}\r\n").as_bytes());
        }
        buf.extend_from_slice(b"\r\n");
        Ok(())
    }

    /// Parse a response head.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] unless the status is 101 and the
    /// upgrade headers and `Sec-WebSocket-Accept` are present.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let text = head_text(data)?;
        let mut lines = text.split("\r\n");

        let status_line = lines
            .next()
            .ok_or_else(|| Error::InvalidHandshake("empty response".into()))?;
        if !status_line.starts_with("HTTP/1.1 101") {
            return Err(Error::InvalidHandshake(format!(
                "expected 101 status, got: {status_line}"
            )));
        }

        let headers = parse_headers(lines, &["sec-websocket-accept"])?;
        check_upgrade_headers(&headers)?;

        Ok(Self {
            accept: require(&headers, "sec-websocket-accept")?.to_string(),
            extensions: headers.get("sec-websocket-extensions").cloned(),
        })
    }

    /// Check the accept value against the key the client sent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidHandshake`] on mismatch.
    pub fn verify(&self, key: &str) -> Result<()> {
        if self.accept == compute_accept_key(key) {
            Ok(())
        } else {
            Err(Error::InvalidHandshake(format!(
                "Sec-WebSocket-Accept mismatch: {}",
                self.accept
            )))
        }
    }
}

/// Plain-text HTTP error response that ends a failed upgrade.
pub fn write_rejection(status: u16, reason: &str, detail: &str, buf: &mut Vec<u8>) {
    let body = detail.replace(['\r', '\n'], " ");
    buf.extend_from_slice(format!("HTTP/1.1 {status} {reason}\r\n").as_bytes());
    buf.extend_from_slice(b"Content-Type: text/plain; charset=utf-8\r\n");
    buf.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    buf.extend_from_slice(b"Connection: close\r\n\r\n");
    buf.extend_from_slice(body.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /ws HTTP/1.1\r\n\
        Host: 127.0.0.1:8083\r\n\
        Upgrade: websocket\r\n\
        Connection: keep-alive, Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Sec-WebSocket-Version: 13\r\n\
        Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n\
        \r\n";

    #[test]
    fn test_compute_accept_key_rfc_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn test_generate_key_is_valid() {
        let key = generate_key().unwrap();
        assert_eq!(BASE64.decode(&key).unwrap().len(), 16);
        assert_ne!(key, generate_key().unwrap());
    }

    #[test]
    fn test_parse_valid_request() {
        let req = HandshakeRequest::parse(REQUEST).unwrap();
        assert_eq!(req.path, "/ws");
        assert_eq!(req.host, "127.0.0.1:8083");
        assert_eq!(req.version, 13);
        assert_eq!(
            req.extensions.as_deref(),
            Some("permessage-deflate; client_max_window_bits")
        );
        assert!(req.validate().is_ok());
    }

    #[test]
    fn test_repeated_extension_headers_joined() {
        let request = b"GET /ws HTTP/1.1\r\n\
            Host: h\r\n\
            Upgrade: websocket\r\n\
            Connection: Upgrade\r\n\
            Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
            Sec-WebSocket-Version: 13\r\n\
            Sec-WebSocket-Extensions: permessage-deflate; server_max_window_bits=10\r\n\
            sec-websocket-extensions: permessage-deflate\r\n\
            \r\n";
        let req = HandshakeRequest::parse(request).unwrap();
        assert_eq!(
            req.extensions.as_deref(),
            Some("permessage-deflate; server_max_window_bits=10, permessage-deflate")
        );
    }

    #[test]
    fn test_parse_request_errors() {
        let cases: [&[u8]; 5] = [
            b"POST /ws HTTP/1.1\r\nHost: h\r\n\r\n",
            b"GET /ws HTTP/1.0\r\nHost: h\r\n\r\n",
            b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
            b"GET /ws HTTP/1.1\r\nHost: h\r\nConnection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n",
            b"GET /ws HTTP/1.1\r\nHost: a\r\nHost: b\r\nUpgrade: websocket\r\n\
              Connection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        ];
        for case in cases {
            assert!(
                matches!(HandshakeRequest::parse(case), Err(Error::InvalidHandshake(_))),
                "{}",
                String::from_utf8_lossy(case)
            );
        }
    }

    #[test]
    fn test_validate_request() {
        let mut req = HandshakeRequest::parse(REQUEST).unwrap();
        req.version = 8;
        assert!(req.validate().is_err());

        let mut req = HandshakeRequest::parse(REQUEST).unwrap();
        req.key = "c2hvcnQ=".into();
        assert!(req.validate().is_err());

        let mut req = HandshakeRequest::parse(REQUEST).unwrap();
        req.key = "!!!".into();
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_request_write_roundtrip() {
        let req = HandshakeRequest::new(
            "localhost:8083",
            "/ws",
            "dGhlIHNhbXBsZSBub25jZQ==",
            Some("permessage-deflate; client_max_window_bits".into()),
        );
        let mut buf = Vec::new();
        req.write(&mut buf).unwrap();
        assert_eq!(find_head_end(&buf), Some(buf.len()));
        assert_eq!(HandshakeRequest::parse(&buf).unwrap(), req);
    }

    #[test]
    fn test_response_roundtrip_and_verify() {
        let req = HandshakeRequest::parse(REQUEST).unwrap();
        let resp = HandshakeResponse::from_request(&req, Some("permessage-deflate".into()));

        let mut buf = Vec::new();
        resp.write(&mut buf).unwrap();
        let text = String::from_utf8(buf.clone()).unwrap();
        assert!(text.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(text.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

        let parsed = HandshakeResponse::parse(&buf).unwrap();
        assert_eq!(parsed, resp);
        assert!(parsed.verify(&req.key).is_ok());
        assert!(parsed.verify("AAAAAAAAAAAAAAAAAAAAAA==").is_err());
    }

    #[test]
    fn test_parse_response_errors() {
        assert!(HandshakeResponse::parse(b"HTTP/1.1 400 Bad Request\r\n\r\n").is_err());
        assert!(
            HandshakeResponse::parse(
                b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
            )
            .is_err()
        );
    }

    #[test]
    fn test_crlf_in_extension_rejected() {
        let resp = HandshakeResponse {
            accept: "x".into(),
            extensions: Some("permessage-deflate\r\nX-Evil: 1".into()),
        };
        assert!(matches!(
            resp.write(&mut Vec::new()),
            Err(Error::InvalidHeaderValue { .. })
        ));
    }

    #[test]
    fn test_rejection_response() {
        let mut buf = Vec::new();
        write_rejection(400, "Bad Request", "missing Sec-WebSocket-Key header", &mut buf);
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.ends_with("\r\n\r\nmissing Sec-WebSocket-Key header"));
        assert!(text.contains("Content-Length: 32\r\n"));
    }

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n\x81\x00"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
    }
}
