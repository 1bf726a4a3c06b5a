//! WebSocket opening handshake
//!
//! HTTP/1.1 upgrade parsing and validation for both roles. Parsing uses
//! `httparse` over the connection's receive buffer; header blocks are copied
//! into an `http::HeaderMap` once complete. The negotiators only compute
//! outcomes and render bytes. The connection decides what to send.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{BufMut, Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};

use crate::WS_GUID;
use crate::error::HandshakeError;
use crate::extension::{ExtensionNegotiator, NegotiatedExtensions};
use crate::mask::fill_random;

/// Header slots handed to httparse
const MAX_HEADERS: usize = 64;

/// Parsed upgrade request
#[derive(Debug, Clone)]
pub struct Request {
    /// Request method
    pub method: String,
    /// Target resource
    pub path: String,
    /// HTTP minor version (1 for HTTP/1.1)
    pub version: u8,
    /// Request headers
    pub headers: HeaderMap,
}

/// Parsed upgrade response
#[derive(Debug, Clone)]
pub struct Response {
    /// Status code
    pub status: u16,
    /// Response headers
    pub headers: HeaderMap,
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

/// All lines of a header joined with `, `
fn header_joined(headers: &HeaderMap, name: &str) -> Option<String> {
    let values: Vec<&str> = headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    if values.is_empty() {
        None
    } else {
        Some(values.join(", "))
    }
}

/// True if a comma separated header contains `token` (case-insensitive)
fn has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn to_header_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, HandshakeError> {
    let mut map = HeaderMap::with_capacity(raw.len());
    for h in raw {
        let name = HeaderName::from_bytes(h.name.as_bytes())
            .map_err(|_| HandshakeError::Malformed("invalid header name"))?;
        let value = HeaderValue::from_bytes(h.value)
            .map_err(|_| HandshakeError::Malformed("invalid header value"))?;
        map.append(name, value);
    }
    Ok(map)
}

fn parse_error(e: httparse::Error) -> HandshakeError {
    match e {
        httparse::Error::TooManyHeaders => HandshakeError::Malformed("too many headers"),
        httparse::Error::Version => HandshakeError::Malformed("unsupported HTTP version"),
        _ => HandshakeError::Malformed("invalid HTTP syntax"),
    }
}

/// Parse an upgrade request
///
/// Returns the request and the length of the header block, or `Ok(None)` if
/// the block is incomplete. Fails once the block exceeds `max_size` bytes.
pub fn parse_request(
    buf: &[u8],
    max_size: usize,
) -> Result<Option<(Request, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf).map_err(parse_error)? {
        httparse::Status::Complete(len) if len > max_size => Err(HandshakeError::TooLarge(max_size)),
        httparse::Status::Complete(len) => {
            let request = Request {
                method: req.method.unwrap_or_default().to_string(),
                path: req.path.unwrap_or("/").to_string(),
                version: req.version.unwrap_or(0),
                headers: to_header_map(req.headers)?,
            };
            Ok(Some((request, len)))
        }
        httparse::Status::Partial if buf.len() > max_size => Err(HandshakeError::TooLarge(max_size)),
        httparse::Status::Partial => Ok(None),
    }
}

/// Parse an upgrade response
pub fn parse_response(
    buf: &[u8],
    max_size: usize,
) -> Result<Option<(Response, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut res = httparse::Response::new(&mut headers);

    match res.parse(buf).map_err(parse_error)? {
        httparse::Status::Complete(len) if len > max_size => Err(HandshakeError::TooLarge(max_size)),
        httparse::Status::Complete(len) => {
            let response = Response {
                status: res.code.unwrap_or(0),
                headers: to_header_map(res.headers)?,
            };
            Ok(Some((response, len)))
        }
        httparse::Status::Partial if buf.len() > max_size => Err(HandshakeError::TooLarge(max_size)),
        httparse::Status::Partial => Ok(None),
    }
}

/// Compute the Sec-WebSocket-Accept value for a key
///
/// Base64(SHA-1(key + GUID))
#[inline]
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Generate a fresh random Sec-WebSocket-Key
pub fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    fill_random(&mut nonce);
    STANDARD.encode(nonce)
}

/// Outcome of a successful handshake
#[derive(Debug)]
pub struct Negotiated {
    /// Target resource of the upgrade request
    pub path: String,
    /// Sec-WebSocket-Accept value
    pub accept_key: String,
    /// Selected subprotocol
    pub subprotocol: Option<String>,
    /// Extensions in effect
    pub extensions: NegotiatedExtensions,
}

/// Server side of the opening handshake
#[derive(Debug, Clone, Default)]
pub struct ServerHandshake {
    subprotocols: Vec<String>,
    extensions: ExtensionNegotiator,
}

impl ServerHandshake {
    /// Create a negotiator supporting the given subprotocols and extensions
    pub fn new(subprotocols: Vec<String>, extensions: ExtensionNegotiator) -> Self {
        Self {
            subprotocols,
            extensions,
        }
    }

    /// Check the upgrade request and return its key
    pub fn validate<'a>(&self, req: &'a Request) -> Result<&'a str, HandshakeError> {
        if req.method != "GET" {
            return Err(HandshakeError::InvalidMethod);
        }
        if req.version != 1 {
            return Err(HandshakeError::Malformed("HTTP/1.1 required"));
        }
        if header_str(&req.headers, "host").is_none() {
            return Err(HandshakeError::MissingHeader("Host"));
        }
        if !has_token(&req.headers, "upgrade", "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !has_token(&req.headers, "connection", "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }

        match header_str(&req.headers, "sec-websocket-version") {
            Some("13") => {}
            Some(v) => return Err(HandshakeError::UnsupportedVersion(v.to_string())),
            None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Version")),
        }

        let key = header_str(&req.headers, "sec-websocket-key")
            .ok_or(HandshakeError::MissingHeader("Sec-WebSocket-Key"))?;
        match STANDARD.decode(key) {
            Ok(nonce) if nonce.len() == 16 => Ok(key),
            _ => Err(HandshakeError::InvalidKey),
        }
    }

    /// First subprotocol in the client's order that we support
    pub fn select_subprotocol(&self, req: &Request) -> Option<String> {
        let offered = header_joined(&req.headers, "sec-websocket-protocol")?;
        offered
            .split(',')
            .map(str::trim)
            .find(|p| self.subprotocols.iter().any(|s| s == p))
            .map(str::to_string)
    }

    /// Validate the request and negotiate subprotocol and extensions
    pub fn accept(&self, req: &Request) -> Result<Negotiated, HandshakeError> {
        let key = self.validate(req)?;
        let offers = header_joined(&req.headers, "sec-websocket-extensions");
        let extensions = self.extensions.negotiate_offers(offers.as_deref())?;

        Ok(Negotiated {
            path: req.path.clone(),
            accept_key: accept_key(key),
            subprotocol: self.select_subprotocol(req),
            extensions,
        })
    }

    /// Render the 101 response for an accepted handshake
    pub fn build_response(negotiated: &Negotiated) -> Bytes {
        let mut buf = BytesMut::with_capacity(256);

        buf.put_slice(b"HTTP/1.1 101 Switching Protocols\r\n");
        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(b"Sec-WebSocket-Accept: ");
        buf.put_slice(negotiated.accept_key.as_bytes());
        buf.put_slice(b"\r\n");

        if let Some(proto) = &negotiated.subprotocol {
            buf.put_slice(b"Sec-WebSocket-Protocol: ");
            buf.put_slice(proto.as_bytes());
            buf.put_slice(b"\r\n");
        }

        if let Some(ext) = negotiated.extensions.header_value() {
            buf.put_slice(b"Sec-WebSocket-Extensions: ");
            buf.put_slice(ext.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Render the error response for a rejected handshake
    ///
    /// Version problems get `426 Upgrade Required` advertising version 13,
    /// everything else `400 Bad Request`.
    pub fn reject_response(err: &HandshakeError) -> Bytes {
        let mut buf = BytesMut::with_capacity(128);

        match err {
            HandshakeError::UnsupportedVersion(_)
            | HandshakeError::MissingHeader("Sec-WebSocket-Version") => {
                buf.put_slice(b"HTTP/1.1 426 Upgrade Required\r\n");
                buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");
            }
            _ => buf.put_slice(b"HTTP/1.1 400 Bad Request\r\n"),
        }
        buf.put_slice(b"Connection: close\r\n");
        buf.put_slice(b"Content-Length: 0\r\n");
        buf.put_slice(b"\r\n");
        buf.freeze()
    }
}

/// Client side of the opening handshake
#[derive(Debug, Clone)]
pub struct ClientHandshake {
    host: String,
    path: String,
    key: String,
    protocols: Vec<String>,
    extensions: ExtensionNegotiator,
}

impl ClientHandshake {
    /// Create a handshake with a fresh random key
    pub fn new(
        host: impl Into<String>,
        path: impl Into<String>,
        protocols: Vec<String>,
        extensions: ExtensionNegotiator,
    ) -> Self {
        Self {
            host: host.into(),
            path: path.into(),
            key: generate_key(),
            protocols,
            extensions,
        }
    }

    /// The Sec-WebSocket-Key sent with the request
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Render the upgrade request
    pub fn request(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(512);

        buf.put_slice(b"GET ");
        buf.put_slice(self.path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");
        buf.put_slice(b"Host: ");
        buf.put_slice(self.host.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(b"Upgrade: websocket\r\n");
        buf.put_slice(b"Connection: Upgrade\r\n");
        buf.put_slice(b"Sec-WebSocket-Key: ");
        buf.put_slice(self.key.as_bytes());
        buf.put_slice(b"\r\n");
        buf.put_slice(b"Sec-WebSocket-Version: 13\r\n");

        if !self.protocols.is_empty() {
            buf.put_slice(b"Sec-WebSocket-Protocol: ");
            buf.put_slice(self.protocols.join(", ").as_bytes());
            buf.put_slice(b"\r\n");
        }

        if let Some(ext) = self.extensions.offer_header() {
            buf.put_slice(b"Sec-WebSocket-Extensions: ");
            buf.put_slice(ext.as_bytes());
            buf.put_slice(b"\r\n");
        }

        buf.put_slice(b"\r\n");
        buf.freeze()
    }

    /// Check a parsed response against what we sent
    pub fn verify(&self, res: &Response) -> Result<Negotiated, HandshakeError> {
        if res.status != 101 {
            return Err(HandshakeError::UnexpectedStatus(res.status));
        }
        if !has_token(&res.headers, "upgrade", "websocket") {
            return Err(HandshakeError::MissingHeader("Upgrade"));
        }
        if !has_token(&res.headers, "connection", "upgrade") {
            return Err(HandshakeError::MissingHeader("Connection"));
        }

        let expected = accept_key(&self.key);
        match header_str(&res.headers, "sec-websocket-accept") {
            Some(accept) if accept == expected => {}
            Some(_) => return Err(HandshakeError::AcceptMismatch),
            None => return Err(HandshakeError::MissingHeader("Sec-WebSocket-Accept")),
        }

        let subprotocol = match header_str(&res.headers, "sec-websocket-protocol") {
            Some(p) if self.protocols.iter().any(|o| o == p) => Some(p.to_string()),
            Some(p) => return Err(HandshakeError::UnofferedSubprotocol(p.to_string())),
            None => None,
        };

        let responses = header_joined(&res.headers, "sec-websocket-extensions");
        let extensions = self.extensions.accept_response(responses.as_deref())?;

        Ok(Negotiated {
            path: self.path.clone(),
            accept_key: expected,
            subprotocol,
            extensions,
        })
    }

    /// Parse and verify the server's response
    ///
    /// Returns the outcome and the length of the header block; bytes after
    /// it belong to the frame stream.
    pub fn verify_response(
        &self,
        buf: &[u8],
        max_size: usize,
    ) -> Result<Option<(Negotiated, usize)>, HandshakeError> {
        match parse_response(buf, max_size)? {
            Some((res, len)) => Ok(Some((self.verify(&res)?, len))),
            None => Ok(None),
        }
    }
}
