//! Error types for the WebSocket protocol engine
//!
//! Errors fall into four families that drive different teardown paths:
//! protocol violations close with a status code, handshake failures never
//! reach `Open`, extension failures decline the extension unless it was
//! mandatory, and transport failures skip the close handshake entirely.

use std::io;

use thiserror::Error;

use crate::timer::TimerKind;

/// Result type alias for WebSocket operations
pub type Result<T> = std::result::Result<T, Error>;

/// WebSocket error types
#[derive(Debug, Error)]
pub enum Error {
    /// Peer violated the framing or messaging rules
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    /// Opening handshake failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),
    /// Extension negotiation or transform failed
    #[error("extension error: {0}")]
    Extension(#[from] ExtensionError),
    /// I/O failure reported by the transport
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// A guard timer expired
    #[error("{0} timeout expired")]
    Timeout(TimerKind),
    /// Operation not allowed in the current state
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Send queue exceeded the configured backpressure limit
    #[error("send buffer full")]
    BufferFull,
    /// Connection already closed
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Close status code to report for this error
    pub fn close_code(&self) -> u16 {
        match self {
            Error::Protocol(e) => e.close_code(),
            Error::Extension(_) => CloseReason::PROTOCOL_ERROR,
            // No close frame is exchanged for these
            Error::Handshake(_)
            | Error::Transport(_)
            | Error::Timeout(_)
            | Error::ConnectionClosed => CloseReason::ABNORMAL,
            Error::InvalidState(_) | Error::BufferFull => CloseReason::INTERNAL,
        }
    }
}

/// Framing and messaging violations. Always fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Opcode outside the defined set
    #[error("invalid opcode {0:#x}")]
    InvalidOpcode(u8),
    /// RSV bit set that no negotiated extension claims
    #[error("reserved bits set without a negotiated extension")]
    ReservedBits,
    /// Server received an unmasked frame
    #[error("client frames must be masked")]
    UnmaskedFrame,
    /// Client received a masked frame
    #[error("server frames must not be masked")]
    MaskedFrame,
    /// Extended length used where a shorter form fits
    #[error("payload length not minimally encoded")]
    NonMinimalLength,
    /// 64-bit length with the high bit set
    #[error("payload length MSB must be 0")]
    LengthOverflow,
    /// Control frame longer than 125 bytes
    #[error("control frame payload exceeds 125 bytes")]
    ControlFrameTooLarge,
    /// Control frame without FIN
    #[error("control frame must not be fragmented")]
    FragmentedControl,
    /// Continuation with nothing to continue
    #[error("continuation frame without a message in progress")]
    UnexpectedContinuation,
    /// Text or binary frame inside a fragmented message
    #[error("new data frame while a fragmented message is in progress")]
    ExpectedContinuation,
    /// Frame or reassembled message over the configured limit
    #[error("message too big")]
    MessageTooBig,
    /// Text message or close reason is not UTF-8
    #[error("invalid UTF-8 in text payload")]
    InvalidUtf8,
    /// Close payload of one byte
    #[error("invalid close frame payload")]
    InvalidClosePayload,
    /// Close code that may not appear on the wire
    #[error("invalid close code {0}")]
    InvalidCloseCode(u16),
    /// Inbound extension transform rejected the payload
    #[error("extension transform failed: {0}")]
    Extension(String),
}

impl ProtocolError {
    /// Close status code sent to the peer when this error fails the connection
    pub fn close_code(&self) -> u16 {
        match self {
            ProtocolError::MessageTooBig => CloseReason::TOO_BIG,
            ProtocolError::InvalidUtf8 => CloseReason::INVALID_PAYLOAD,
            _ => CloseReason::PROTOCOL_ERROR,
        }
    }
}

/// Opening handshake failures. The connection never reaches `Open`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeError {
    /// Request or response is not valid HTTP/1.1
    #[error("malformed HTTP message: {0}")]
    Malformed(&'static str),
    /// Header block over the size limit
    #[error("handshake exceeds {0} bytes")]
    TooLarge(usize),
    /// Upgrade request with a method other than GET
    #[error("method must be GET")]
    InvalidMethod,
    /// Required header absent or with the wrong value
    #[error("missing or invalid {0} header")]
    MissingHeader(&'static str),
    /// Sec-WebSocket-Version other than 13
    #[error("unsupported WebSocket version {0:?}")]
    UnsupportedVersion(String),
    /// Key does not decode to 16 bytes
    #[error("Sec-WebSocket-Key is not 16 bytes of base64")]
    InvalidKey,
    /// Server answered with a status other than 101
    #[error("expected 101 Switching Protocols, got {0}")]
    UnexpectedStatus(u16),
    /// Accept header does not match our key
    #[error("Sec-WebSocket-Accept mismatch")]
    AcceptMismatch,
    /// Server picked a subprotocol the client never offered
    #[error("server selected a subprotocol that was not offered: {0}")]
    UnofferedSubprotocol(String),
    /// Negotiation failure that fails the whole handshake
    #[error("extension negotiation failed: {0}")]
    Extension(String),
}

/// Extension negotiation failures.
///
/// During negotiation these decline the extension unless it is mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtensionError {
    /// Sec-WebSocket-Extensions value does not parse
    #[error("malformed extension header: {0}")]
    Malformed(&'static str),
    /// Parameter the extension does not define
    #[error("{extension}: unknown parameter {param}")]
    UnknownParameter { extension: String, param: String },
    /// Parameter given more than once
    #[error("{extension}: duplicate parameter {param}")]
    DuplicateParameter { extension: String, param: String },
    /// Parameter value out of range
    #[error("{extension}: invalid value for {param}")]
    InvalidParameter { extension: String, param: String },
    /// Response accepted an extension the client did not offer
    #[error("{0} was not offered")]
    NotOffered(String),
    /// Two extensions claim the same RSV bit
    #[error("{0} claims reserved bits already in use")]
    ReservedBitConflict(String),
    /// Decompressed payload over the message limit
    #[error("transformed payload exceeds the message size limit")]
    PayloadTooBig,
    /// Codec failure inside a transform
    #[error("transform failed: {0}")]
    Transform(String),
}

/// Close frame reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseReason {
    /// Close status code
    pub code: u16,
    /// Optional reason string
    pub reason: String,
}

impl CloseReason {
    /// Normal closure
    pub const NORMAL: u16 = 1000;
    /// Going away (e.g., server shutdown)
    pub const GOING_AWAY: u16 = 1001;
    /// Protocol error
    pub const PROTOCOL_ERROR: u16 = 1002;
    /// Unsupported data
    pub const UNSUPPORTED: u16 = 1003;
    /// No status received
    pub const NO_STATUS: u16 = 1005;
    /// Abnormal closure
    pub const ABNORMAL: u16 = 1006;
    /// Invalid frame payload
    pub const INVALID_PAYLOAD: u16 = 1007;
    /// Policy violation
    pub const POLICY: u16 = 1008;
    /// Message too big
    pub const TOO_BIG: u16 = 1009;
    /// Mandatory extension
    pub const EXTENSION: u16 = 1010;
    /// Internal server error
    pub const INTERNAL: u16 = 1011;

    /// Largest reason that fits a control frame next to the status code
    pub const MAX_REASON_LEN: usize = 123;

    /// Create a new close reason
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Check if the close code may appear on the wire per RFC 6455
    ///
    /// 1005, 1006 and 1015 are reserved for local reporting only.
    pub fn is_valid_code(code: u16) -> bool {
        matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
    }

    /// Parse a close frame payload (empty, or code followed by UTF-8 text)
    pub fn parse(payload: &[u8]) -> std::result::Result<Option<Self>, ProtocolError> {
        match payload.len() {
            0 => Ok(None),
            1 => Err(ProtocolError::InvalidClosePayload),
            _ => {
                let code = u16::from_be_bytes([payload[0], payload[1]]);
                if !Self::is_valid_code(code) {
                    return Err(ProtocolError::InvalidCloseCode(code));
                }
                let reason = std::str::from_utf8(&payload[2..])
                    .map_err(|_| ProtocolError::InvalidUtf8)?;
                Ok(Some(Self::new(code, reason)))
            }
        }
    }

    /// Encode as a close frame payload
    pub fn to_payload(&self) -> Vec<u8> {
        let mut p = Vec::with_capacity(2 + self.reason.len());
        p.extend_from_slice(&self.code.to_be_bytes());
        p.extend_from_slice(self.reason.as_bytes());
        p
    }
}
