//! Message reassembly and outbound fragmentation
//!
//! Inbound, [`MessageAssembler`] turns a run of data frames into one
//! [`Message`], enforcing the fragmentation rules, the message size limit,
//! UTF-8 validity of text and the negotiated decode transforms. Nothing
//! leaves the assembler until the final fragment has been checked.
//!
//! Outbound, [`encode_message`] applies encode transforms and splits the
//! payload into [`OutboundFrame`]s for the frame encoder.

use bytes::{Bytes, BytesMut};

use crate::error::{ExtensionError, ProtocolError};
use crate::extension::NegotiatedExtensions;
use crate::frame::{Frame, OpCode};
use crate::utf8::{Utf8Validator, validate_utf8};

/// A complete WebSocket data message
///
/// Text payloads are kept as `Bytes`; inbound text has been validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Text message
    Text(Bytes),
    /// Binary message
    Binary(Bytes),
}

impl Message {
    /// Create a text message from a string
    #[inline]
    pub fn text(s: impl Into<String>) -> Self {
        Message::Text(Bytes::from(s.into()))
    }

    /// Create a binary message
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Message::Binary(data.into())
    }

    /// Check if this is a text message
    #[inline]
    pub fn is_text(&self) -> bool {
        matches!(self, Message::Text(_))
    }

    /// Check if this is a binary message
    #[inline]
    pub fn is_binary(&self) -> bool {
        matches!(self, Message::Binary(_))
    }

    /// Data opcode used for the first frame of this message
    #[inline]
    pub fn opcode(&self) -> OpCode {
        match self {
            Message::Text(_) => OpCode::Text,
            Message::Binary(_) => OpCode::Binary,
        }
    }

    /// Get message as text (None for binary or invalid UTF-8)
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Message::Text(b) => std::str::from_utf8(b).ok(),
            Message::Binary(_) => None,
        }
    }

    /// Get message payload
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }

    /// Payload length in bytes
    #[inline]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// True if the payload is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Convert into the payload
    pub fn into_bytes(self) -> Bytes {
        match self {
            Message::Text(b) | Message::Binary(b) => b,
        }
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Message::Text(Bytes::from(s))
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Message::Text(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<Vec<u8>> for Message {
    fn from(v: Vec<u8>) -> Self {
        Message::Binary(Bytes::from(v))
    }
}

impl From<Bytes> for Message {
    fn from(b: Bytes) -> Self {
        Message::Binary(b)
    }
}

impl From<&[u8]> for Message {
    fn from(b: &[u8]) -> Self {
        Message::Binary(Bytes::copy_from_slice(b))
    }
}

fn transform_error(e: ExtensionError) -> ProtocolError {
    match e {
        ExtensionError::PayloadTooBig => ProtocolError::MessageTooBig,
        other => ProtocolError::Extension(other.to_string()),
    }
}

/// Reassembles data frames into messages
#[derive(Debug)]
pub struct MessageAssembler {
    max_message_size: usize,
    /// Opcode of the message in progress
    opcode: Option<OpCode>,
    /// Per-message RSV bits from the first frame
    rsv: u8,
    /// Whether the message needs a per-message decode on completion
    transformed: bool,
    buf: BytesMut,
    utf8: Utf8Validator,
}

impl MessageAssembler {
    /// Create an assembler with the given message size limit
    pub fn new(max_message_size: usize) -> Self {
        Self {
            max_message_size,
            opcode: None,
            rsv: 0,
            transformed: false,
            buf: BytesMut::new(),
            utf8: Utf8Validator::new(),
        }
    }

    /// True while a fragmented message is in progress
    #[inline]
    pub fn in_progress(&self) -> bool {
        self.opcode.is_some()
    }

    /// Bytes buffered for the message in progress
    #[inline]
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drop the message in progress and release its buffer
    pub fn reset(&mut self) {
        self.opcode = None;
        self.rsv = 0;
        self.transformed = false;
        self.buf = BytesMut::new();
        self.utf8.reset();
    }

    /// Feed one data frame
    ///
    /// Returns the message once its final fragment arrives. On error the
    /// partial message is discarded.
    pub fn push(
        &mut self,
        frame: Frame,
        extensions: &mut NegotiatedExtensions,
    ) -> Result<Option<Message>, ProtocolError> {
        let result = self.push_inner(frame, extensions);
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn push_inner(
        &mut self,
        frame: Frame,
        extensions: &mut NegotiatedExtensions,
    ) -> Result<Option<Message>, ProtocolError> {
        let header = &frame.header;
        let rsv = header.rsv();
        let fin = header.fin;

        match header.opcode {
            op if op.is_control() => {
                return Err(if fin {
                    ProtocolError::InvalidOpcode(op as u8)
                } else {
                    ProtocolError::FragmentedControl
                });
            }
            OpCode::Continuation => {
                if self.opcode.is_none() {
                    return Err(ProtocolError::UnexpectedContinuation);
                }
                // Per-message bits belong to the first frame only
                if rsv & extensions.message_reserved_bits() != 0 {
                    return Err(ProtocolError::ReservedBits);
                }
            }
            op => {
                if self.opcode.is_some() {
                    return Err(ProtocolError::ExpectedContinuation);
                }
                self.opcode = Some(op);
                self.rsv = rsv & extensions.message_reserved_bits();
                self.transformed = extensions.decodes_message(self.rsv);
                self.utf8.reset();
            }
        }

        let budget = self.max_message_size.saturating_sub(self.buf.len());
        let payload = extensions
            .decode_frame(frame.payload, rsv, budget)
            .map_err(transform_error)?;
        if payload.len() > budget {
            return Err(ProtocolError::MessageTooBig);
        }

        let is_text = self.opcode == Some(OpCode::Text);
        if is_text && !self.transformed {
            self.utf8.feed(&payload)?;
        }

        let data = if fin && self.buf.is_empty() {
            payload
        } else {
            self.buf.extend_from_slice(&payload);
            if !fin {
                return Ok(None);
            }
            self.buf.split().freeze()
        };

        let opcode = self.opcode.take();
        let data = if self.transformed {
            let data = extensions
                .decode_message(data, self.rsv, self.max_message_size)
                .map_err(transform_error)?;
            if data.len() > self.max_message_size {
                return Err(ProtocolError::MessageTooBig);
            }
            data
        } else {
            data
        };
        let transformed = std::mem::take(&mut self.transformed);
        self.rsv = 0;

        match opcode {
            Some(OpCode::Text) => {
                if transformed {
                    if !validate_utf8(&data) {
                        return Err(ProtocolError::InvalidUtf8);
                    }
                } else {
                    self.utf8.finish()?;
                }
                Ok(Some(Message::Text(data)))
            }
            _ => Ok(Some(Message::Binary(data))),
        }
    }
}

/// One frame of an outgoing message, before framing and masking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundFrame {
    /// Data opcode for the first frame, continuation afterwards
    pub opcode: OpCode,
    /// Final fragment flag
    pub fin: bool,
    /// Reserved bits set by extensions
    pub rsv: u8,
    /// Transformed payload
    pub payload: Bytes,
}

/// Prepare a message for sending
///
/// Per-message encode transforms run first, then the payload is split into
/// fragments of at most `fragment_size` bytes (no split when `None`), and
/// per-frame transforms run on each fragment.
pub fn encode_message(
    message: &Message,
    extensions: &mut NegotiatedExtensions,
    fragment_size: Option<usize>,
) -> Result<Vec<OutboundFrame>, ExtensionError> {
    let opcode = message.opcode();
    let payload = match message {
        Message::Text(b) | Message::Binary(b) => b.clone(),
    };
    let (payload, message_rsv) = extensions.encode_message(payload)?;

    let size = fragment_size.unwrap_or(usize::MAX).max(1);
    let mut frames = Vec::with_capacity(payload.len().div_ceil(size).max(1));
    let mut offset: usize = 0;

    loop {
        let end = payload.len().min(offset.saturating_add(size));
        let chunk = payload.slice(offset..end);
        let first = offset == 0;
        let fin = end == payload.len();

        let (chunk, frame_rsv) = extensions.encode_frame(chunk)?;
        frames.push(OutboundFrame {
            opcode: if first { opcode } else { OpCode::Continuation },
            fin,
            rsv: if first { message_rsv | frame_rsv } else { frame_rsv },
            payload: chunk,
        });

        if fin {
            return Ok(frames);
        }
        offset = end;
    }
}
