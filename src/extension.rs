//! Extension negotiation (RFC 6455 section 9)
//!
//! An [`Extension`] is a negotiation policy: it looks at an offer (server) or
//! a response (client) and either declines or produces a [`Transform`].
//! [`ExtensionNegotiator`] runs the policies over a parsed
//! `Sec-WebSocket-Extensions` header and freezes the outcome in
//! [`NegotiatedExtensions`], which the assembler drives for every message.
//!
//! Encode-side transforms run in negotiation order; decode-side transforms
//! run in reverse, so the first negotiated extension is the outermost one on
//! the wire.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::{ExtensionError, HandshakeError};

/// A single `name[=value]` extension parameter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionParam {
    /// Parameter name
    pub name: String,
    /// Parameter value, unquoted
    pub value: Option<String>,
}

/// One element of a `Sec-WebSocket-Extensions` list
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtensionOffer {
    /// Extension token
    pub name: String,
    /// Parameters in header order
    pub params: Vec<ExtensionParam>,
}

impl ExtensionOffer {
    /// Create an offer with no parameters
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter
    pub fn param(mut self, name: impl Into<String>, value: Option<&str>) -> Self {
        self.params.push(ExtensionParam {
            name: name.into(),
            value: value.map(String::from),
        });
        self
    }

    /// Look up a parameter by name (first occurrence)
    pub fn get(&self, name: &str) -> Option<&ExtensionParam> {
        self.params.iter().find(|p| p.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ExtensionOffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for p in &self.params {
            write!(f, "; {}", p.name)?;
            if let Some(v) = &p.value {
                if v.bytes().all(is_tchar) && !v.is_empty() {
                    write!(f, "={v}")?;
                } else {
                    write!(f, "=\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))?;
                }
            }
        }
        Ok(())
    }
}

/// RFC 7230 token character
#[inline]
fn is_tchar(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Split `input` at top-level occurrences of `sep`, ignoring separators
/// inside quoted strings
fn split_unquoted(input: &str, sep: u8) -> Result<Vec<&str>, ExtensionError> {
    let bytes = input.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' if in_quotes => i += 1,
            b'"' => in_quotes = !in_quotes,
            b if b == sep && !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if in_quotes {
        return Err(ExtensionError::Malformed("unterminated quoted string"));
    }
    parts.push(&input[start..]);
    Ok(parts)
}

fn parse_token(s: &str) -> Result<String, ExtensionError> {
    let s = s.trim();
    if s.is_empty() || !s.bytes().all(is_tchar) {
        return Err(ExtensionError::Malformed("expected token"));
    }
    Ok(s.to_string())
}

fn parse_value(s: &str) -> Result<String, ExtensionError> {
    let s = s.trim();
    let Some(inner) = s.strip_prefix('"') else {
        return parse_token(s);
    };
    let inner = inner
        .strip_suffix('"')
        .ok_or(ExtensionError::Malformed("unterminated quoted string"))?;

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next().ok_or(ExtensionError::Malformed("dangling escape"))?);
        } else {
            out.push(c);
        }
    }
    // RFC 6455 section 9.1: quoted values must still be tokens once unquoted
    parse_token(&out)
}

/// Parse a `Sec-WebSocket-Extensions` value into offers
///
/// Accepts `name; p1; p2=v, name2; p="quoted"` lists. Empty list elements
/// are skipped.
pub fn parse_offers(header: &str) -> Result<Vec<ExtensionOffer>, ExtensionError> {
    let mut offers = Vec::new();
    for element in split_unquoted(header, b',')? {
        if element.trim().is_empty() {
            continue;
        }
        let mut pieces = split_unquoted(element, b';')?.into_iter();
        let name = parse_token(pieces.next().unwrap_or_default())?;
        let mut offer = ExtensionOffer::new(name);
        for piece in pieces {
            let (pname, value) = match piece.split_once('=') {
                Some((n, v)) => (parse_token(n)?, Some(parse_value(v)?)),
                None => (parse_token(piece)?, None),
            };
            offer.params.push(ExtensionParam { name: pname, value });
        }
        offers.push(offer);
    }
    Ok(offers)
}

/// Whether a transform runs once per message or on every frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Granularity {
    /// Applied to the reassembled message payload
    #[default]
    PerMessage,
    /// Applied to each frame payload independently
    PerFrame,
}

/// Payload transform installed by a negotiated extension
pub trait Transform: Send {
    /// Transform an outgoing payload
    ///
    /// `Ok(None)` leaves the payload untouched and keeps the extension's
    /// reserved bits clear.
    fn encode(&mut self, payload: Bytes) -> Result<Option<Bytes>, ExtensionError>;

    /// Reverse the transform on an incoming payload
    ///
    /// Must not produce more than `max_size` bytes; return
    /// [`ExtensionError::PayloadTooBig`] instead.
    fn decode(&mut self, payload: Bytes, max_size: usize) -> Result<Bytes, ExtensionError>;
}

/// Outcome of accepting an extension
pub struct Accepted {
    /// Parameters to echo in the response (server) or that were agreed (client)
    pub params: Vec<ExtensionParam>,
    /// Transform for this connection
    pub transform: Box<dyn Transform>,
}

/// Negotiation policy for one extension
pub trait Extension: Send + Sync {
    /// Extension token as it appears on the wire
    fn name(&self) -> &str;

    /// RSV bits this extension uses to mark transformed payloads
    fn reserved_bits(&self) -> u8 {
        0
    }

    /// Transform granularity
    fn granularity(&self) -> Granularity {
        Granularity::PerMessage
    }

    /// If true, failing to negotiate this extension fails the handshake
    fn mandatory(&self) -> bool {
        false
    }

    /// Server side: accept a client offer (optionally adjusting parameters)
    /// or decline it with `Ok(None)`
    fn accept_offer(&self, offer: &ExtensionOffer) -> Result<Option<Accepted>, ExtensionError>;

    /// Client side: the offer to send
    fn offer(&self) -> ExtensionOffer;

    /// Client side: validate the server's choice
    fn accept_response(&self, response: &ExtensionOffer) -> Result<Accepted, ExtensionError>;
}

/// An extension in effect on a connection
pub struct NegotiatedExtension {
    /// Extension token
    pub name: String,
    /// Agreed parameters
    pub params: Vec<ExtensionParam>,
    /// Claimed RSV bits
    pub rsv: u8,
    /// Transform granularity
    pub granularity: Granularity,
    transform: Box<dyn Transform>,
}

impl NegotiatedExtension {
    fn new(ext: &dyn Extension, accepted: Accepted) -> Self {
        Self {
            name: ext.name().to_string(),
            params: accepted.params,
            rsv: ext.reserved_bits(),
            granularity: ext.granularity(),
            transform: accepted.transform,
        }
    }

    #[inline]
    fn applies_to(&self, rsv: u8) -> bool {
        self.rsv == 0 || rsv & self.rsv != 0
    }

    /// Render this extension as a response list element
    pub fn to_offer(&self) -> ExtensionOffer {
        ExtensionOffer {
            name: self.name.clone(),
            params: self.params.clone(),
        }
    }
}

impl fmt::Debug for NegotiatedExtension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NegotiatedExtension")
            .field("name", &self.name)
            .field("params", &self.params)
            .field("rsv", &self.rsv)
            .field("granularity", &self.granularity)
            .finish_non_exhaustive()
    }
}

/// The frozen, ordered set of extensions in effect on a connection
#[derive(Debug, Default)]
pub struct NegotiatedExtensions {
    list: Vec<NegotiatedExtension>,
}

impl NegotiatedExtensions {
    /// No extensions
    pub fn none() -> Self {
        Self::default()
    }

    /// True if nothing was negotiated
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Extensions in negotiation order
    pub fn iter(&self) -> impl Iterator<Item = &NegotiatedExtension> {
        self.list.iter()
    }

    /// Union of RSV bits claimed by the negotiated extensions
    pub fn reserved_bits(&self) -> u8 {
        self.list.iter().fold(0, |bits, e| bits | e.rsv)
    }

    /// RSV bits claimed by per-message extensions
    pub fn message_reserved_bits(&self) -> u8 {
        self.list
            .iter()
            .filter(|e| e.granularity == Granularity::PerMessage)
            .fold(0, |bits, e| bits | e.rsv)
    }

    /// Value for the `Sec-WebSocket-Extensions` response header
    pub fn header_value(&self) -> Option<String> {
        if self.list.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.list.iter().map(|e| e.to_offer().to_string()).collect();
        Some(parts.join(", "))
    }

    /// True if a message whose first frame carried `rsv` needs a per-message decode
    pub fn decodes_message(&self, rsv: u8) -> bool {
        self.list
            .iter()
            .any(|e| e.granularity == Granularity::PerMessage && e.applies_to(rsv))
    }

    fn encode(
        &mut self,
        granularity: Granularity,
        mut payload: Bytes,
    ) -> Result<(Bytes, u8), ExtensionError> {
        let mut rsv = 0;
        for ext in self.list.iter_mut().filter(|e| e.granularity == granularity) {
            if let Some(out) = ext.transform.encode(payload.clone())? {
                payload = out;
                rsv |= ext.rsv;
            }
        }
        Ok((payload, rsv))
    }

    fn decode(
        &mut self,
        granularity: Granularity,
        mut payload: Bytes,
        rsv: u8,
        max_size: usize,
    ) -> Result<Bytes, ExtensionError> {
        for ext in self.list.iter_mut().rev() {
            if ext.granularity == granularity && ext.applies_to(rsv) {
                payload = ext.transform.decode(payload, max_size)?;
            }
        }
        Ok(payload)
    }

    /// Apply per-message encode transforms in negotiation order
    ///
    /// Returns the payload and the RSV bits for the first frame.
    pub fn encode_message(&mut self, payload: Bytes) -> Result<(Bytes, u8), ExtensionError> {
        self.encode(Granularity::PerMessage, payload)
    }

    /// Apply per-frame encode transforms in negotiation order
    pub fn encode_frame(&mut self, payload: Bytes) -> Result<(Bytes, u8), ExtensionError> {
        self.encode(Granularity::PerFrame, payload)
    }

    /// Apply per-message decode transforms in reverse negotiation order
    pub fn decode_message(
        &mut self,
        payload: Bytes,
        rsv: u8,
        max_size: usize,
    ) -> Result<Bytes, ExtensionError> {
        self.decode(Granularity::PerMessage, payload, rsv, max_size)
    }

    /// Apply per-frame decode transforms in reverse negotiation order
    pub fn decode_frame(
        &mut self,
        payload: Bytes,
        rsv: u8,
        max_size: usize,
    ) -> Result<Bytes, ExtensionError> {
        self.decode(Granularity::PerFrame, payload, rsv, max_size)
    }
}

/// Supported extensions, in local preference order
#[derive(Clone, Default)]
pub struct ExtensionNegotiator {
    supported: Vec<Arc<dyn Extension>>,
}

impl fmt::Debug for ExtensionNegotiator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.supported.iter().map(|e| e.name()))
            .finish()
    }
}

impl ExtensionNegotiator {
    /// Negotiator with no supported extensions
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a supported extension
    pub fn with(mut self, ext: impl Extension + 'static) -> Self {
        self.supported.push(Arc::new(ext));
        self
    }

    /// Add a shared extension policy
    pub fn with_shared(mut self, ext: Arc<dyn Extension>) -> Self {
        self.supported.push(ext);
        self
    }

    /// True if no extension is supported
    pub fn is_empty(&self) -> bool {
        self.supported.is_empty()
    }

    fn find(&self, name: &str) -> Option<&Arc<dyn Extension>> {
        self.supported
            .iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
    }

    fn require_mandatory(&self, negotiated: &NegotiatedExtensions) -> Result<(), HandshakeError> {
        for ext in self.supported.iter().filter(|e| e.mandatory()) {
            if !negotiated.list.iter().any(|n| n.name.eq_ignore_ascii_case(ext.name())) {
                return Err(HandshakeError::Extension(format!(
                    "mandatory extension {} not negotiated",
                    ext.name()
                )));
            }
        }
        Ok(())
    }

    /// Server side: negotiate the client's offer list
    ///
    /// Offers are considered in client order; the first acceptable offer of
    /// each extension wins. Failures decline the extension unless it is
    /// mandatory, in which case the handshake fails.
    pub fn negotiate_offers(
        &self,
        header: Option<&str>,
    ) -> Result<NegotiatedExtensions, HandshakeError> {
        let mut negotiated = NegotiatedExtensions::none();

        let offers = match header.map(parse_offers).transpose() {
            Ok(offers) => offers.unwrap_or_default(),
            Err(e) => {
                if self.supported.iter().any(|ext| ext.mandatory()) {
                    return Err(HandshakeError::Extension(e.to_string()));
                }
                Vec::new()
            }
        };

        for offer in &offers {
            let Some(ext) = self.find(&offer.name) else {
                continue;
            };
            if negotiated.list.iter().any(|n| n.name.eq_ignore_ascii_case(ext.name())) {
                continue;
            }

            let outcome = if negotiated.reserved_bits() & ext.reserved_bits() != 0 {
                Err(ExtensionError::ReservedBitConflict(ext.name().to_string()))
            } else {
                ext.accept_offer(offer)
            };

            match outcome {
                Ok(Some(accepted)) => negotiated
                    .list
                    .push(NegotiatedExtension::new(ext.as_ref(), accepted)),
                Ok(None) => {}
                Err(e) if ext.mandatory() => return Err(HandshakeError::Extension(e.to_string())),
                Err(_) => {}
            }
        }

        self.require_mandatory(&negotiated)?;
        Ok(negotiated)
    }

    /// Client side: value for the `Sec-WebSocket-Extensions` request header
    pub fn offer_header(&self) -> Option<String> {
        if self.supported.is_empty() {
            return None;
        }
        let parts: Vec<String> = self.supported.iter().map(|e| e.offer().to_string()).collect();
        Some(parts.join(", "))
    }

    /// Client side: validate the server's `Sec-WebSocket-Extensions` response
    ///
    /// The server may only select extensions that were offered, each at most
    /// once. Any invalid response fails the handshake.
    pub fn accept_response(
        &self,
        header: Option<&str>,
    ) -> Result<NegotiatedExtensions, HandshakeError> {
        let mut negotiated = NegotiatedExtensions::none();
        let responses = header
            .map(parse_offers)
            .transpose()
            .map_err(|e| HandshakeError::Extension(e.to_string()))?
            .unwrap_or_default();

        for response in &responses {
            let ext = self.find(&response.name).ok_or_else(|| {
                HandshakeError::Extension(
                    ExtensionError::NotOffered(response.name.clone()).to_string(),
                )
            })?;
            if negotiated.list.iter().any(|n| n.name.eq_ignore_ascii_case(ext.name()))
                || negotiated.reserved_bits() & ext.reserved_bits() != 0
            {
                return Err(HandshakeError::Extension(
                    ExtensionError::ReservedBitConflict(ext.name().to_string()).to_string(),
                ));
            }
            let accepted = ext
                .accept_response(response)
                .map_err(|e| HandshakeError::Extension(e.to_string()))?;
            negotiated
                .list
                .push(NegotiatedExtension::new(ext.as_ref(), accepted));
        }

        self.require_mandatory(&negotiated)?;
        Ok(negotiated)
    }
}
