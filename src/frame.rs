//! WebSocket frame parsing and serialization
//!
//! This module implements RFC 6455 section 5 framing:
//! - Incremental parsing that resumes across partial reads
//! - Minimal length encoding in three tiers (7-bit, 16-bit, 64-bit)
//! - Role-based masking rules for both directions
//! - Fragmentation of outgoing payloads into continuation sequences
//!
//! The codec knows nothing about messages; reassembly lives in
//! [`crate::assembler`].

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{CloseReason, ProtocolError};
use crate::mask::{apply_mask, generate_mask};
use crate::{MAX_CONTROL_PAYLOAD, MAX_FRAME_HEADER_SIZE, MEDIUM_MESSAGE_THRESHOLD, SMALL_MESSAGE_THRESHOLD};

/// RSV1 bit in the first header byte
pub const RSV1: u8 = 0x40;
/// RSV2 bit in the first header byte
pub const RSV2: u8 = 0x20;
/// RSV3 bit in the first header byte
pub const RSV3: u8 = 0x10;
/// All reserved bits
pub const RSV_MASK: u8 = RSV1 | RSV2 | RSV3;

/// WebSocket endpoint role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Client (must mask frames)
    Client,
    /// Server (must not mask frames)
    Server,
}

impl Role {
    /// Whether frames received by this role must carry a mask
    #[inline]
    pub fn expects_masked(self) -> bool {
        self == Role::Server
    }

    /// Mask key for an outgoing frame: fresh for clients, none for servers
    #[inline]
    pub fn outgoing_mask(self) -> Option<[u8; 4]> {
        match self {
            Role::Client => Some(generate_mask()),
            Role::Server => None,
        }
    }
}

/// WebSocket opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OpCode {
    /// Continuation frame
    Continuation = 0x0,
    /// Text frame
    Text = 0x1,
    /// Binary frame
    Binary = 0x2,
    /// Connection close
    Close = 0x8,
    /// Ping
    Ping = 0x9,
    /// Pong
    Pong = 0xA,
}

impl OpCode {
    /// Parse opcode from the low nibble of the first header byte
    #[inline]
    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0x0 => Some(OpCode::Continuation),
            0x1 => Some(OpCode::Text),
            0x2 => Some(OpCode::Binary),
            0x8 => Some(OpCode::Close),
            0x9 => Some(OpCode::Ping),
            0xA => Some(OpCode::Pong),
            _ => None,
        }
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        (*self as u8) >= 0x8
    }

    /// Check if this is a data frame (including continuation)
    #[inline]
    pub fn is_data(&self) -> bool {
        (*self as u8) <= 0x2
    }
}

/// A parsed WebSocket frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    /// Final fragment flag
    pub fin: bool,
    /// RSV1 (claimed by per-message compression)
    pub rsv1: bool,
    /// RSV2 (reserved)
    pub rsv2: bool,
    /// RSV3 (reserved)
    pub rsv3: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Mask flag (must be true for client->server)
    pub masked: bool,
    /// Payload length
    pub payload_len: u64,
    /// Masking key (if masked)
    pub mask: Option<[u8; 4]>,
}

impl FrameHeader {
    /// Reserved bits in their first-byte positions
    #[inline]
    pub fn rsv(&self) -> u8 {
        let mut bits = 0;
        if self.rsv1 {
            bits |= RSV1;
        }
        if self.rsv2 {
            bits |= RSV2;
        }
        if self.rsv3 {
            bits |= RSV3;
        }
        bits
    }

    /// Get the total header size in bytes
    #[inline]
    pub fn header_size(&self) -> usize {
        header_size(self.payload_len as usize, self.masked)
    }
}

#[inline]
fn header_size(payload_len: usize, masked: bool) -> usize {
    let len_bytes = if payload_len > MEDIUM_MESSAGE_THRESHOLD {
        8
    } else if payload_len > SMALL_MESSAGE_THRESHOLD {
        2
    } else {
        0
    };
    2 + len_bytes + if masked { 4 } else { 0 }
}

/// A complete WebSocket frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame header
    pub header: FrameHeader,
    /// Frame payload (already unmasked)
    pub payload: Bytes,
}

impl Frame {
    /// Create a new unmasked frame
    pub fn new(opcode: OpCode, payload: Bytes, fin: bool) -> Self {
        Self {
            header: FrameHeader {
                fin,
                rsv1: false,
                rsv2: false,
                rsv3: false,
                opcode,
                masked: false,
                payload_len: payload.len() as u64,
                mask: None,
            },
            payload,
        }
    }

    /// Create a text frame
    #[inline]
    pub fn text(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Text, data.into(), true)
    }

    /// Create a binary frame
    #[inline]
    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Binary, data.into(), true)
    }

    /// Create a ping frame
    #[inline]
    pub fn ping(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Ping, data.into(), true)
    }

    /// Create a pong frame
    #[inline]
    pub fn pong(data: impl Into<Bytes>) -> Self {
        Self::new(OpCode::Pong, data.into(), true)
    }

    /// Create a close frame
    #[inline]
    pub fn close(code: u16, reason: &str) -> Self {
        let payload = CloseReason::new(code, reason).to_payload();
        Self::new(OpCode::Close, Bytes::from(payload), true)
    }

    /// Create an empty close frame
    #[inline]
    pub fn close_empty() -> Self {
        Self::new(OpCode::Close, Bytes::new(), true)
    }

    /// Attach a mask key; the payload stays in plaintext until encoded
    pub fn with_mask(mut self, mask: [u8; 4]) -> Self {
        self.header.masked = true;
        self.header.mask = Some(mask);
        self
    }

    /// Check if this is a control frame
    #[inline]
    pub fn is_control(&self) -> bool {
        self.header.opcode.is_control()
    }

    /// Check if this is the final fragment
    #[inline]
    pub fn is_final(&self) -> bool {
        self.header.fin
    }

    /// Parse close frame payload
    pub fn parse_close(&self) -> Result<Option<CloseReason>, ProtocolError> {
        CloseReason::parse(&self.payload)
    }

    /// Serialize this frame with its own flags and mask key
    pub fn encode(&self, buf: &mut BytesMut) {
        encode_frame_with_rsv(
            buf,
            self.header.opcode,
            &self.payload,
            self.header.fin,
            self.header.mask,
            self.header.rsv(),
        );
    }
}

/// Frame parser state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ParseState {
    /// Collecting header bytes (base, extended length, mask)
    Header,
    /// Header complete, waiting for the whole payload
    Payload,
}

/// Incremental frame parser
///
/// Header bytes are moved out of the caller's buffer into the parser as they
/// arrive, so a header split over any number of reads is reassembled here.
/// Payload bytes stay in the caller's buffer until the full payload is
/// present.
#[derive(Debug)]
pub struct FrameParser {
    state: ParseState,
    header_buf: [u8; MAX_FRAME_HEADER_SIZE],
    header_len: usize,
    header: Option<FrameHeader>,
    max_frame_size: usize,
    expect_masked: bool,
    /// RSV bits claimed by negotiated extensions
    allowed_rsv: u8,
}

impl FrameParser {
    /// Create a new frame parser
    pub fn new(max_frame_size: usize, expect_masked: bool) -> Self {
        Self {
            state: ParseState::Header,
            header_buf: [0; MAX_FRAME_HEADER_SIZE],
            header_len: 0,
            header: None,
            max_frame_size,
            expect_masked,
            allowed_rsv: 0,
        }
    }

    /// Allow the given RSV bits (negotiated extensions claim them)
    pub fn set_reserved_bits(&mut self, bits: u8) {
        self.allowed_rsv = bits & RSV_MASK;
    }

    /// True when no frame is partially parsed
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.state == ParseState::Header && self.header_len == 0
    }

    /// Header of a frame whose payload is still incomplete
    #[inline]
    pub fn pending_header(&self) -> Option<&FrameHeader> {
        self.header.as_ref()
    }

    #[inline]
    fn reset(&mut self) {
        self.state = ParseState::Header;
        self.header_len = 0;
        self.header = None;
    }

    /// Parse a frame from the buffer
    ///
    /// Returns:
    /// - `Ok(Some(frame))` if a complete frame was parsed
    /// - `Ok(None)` if more data is needed; consumed bytes are kept internally
    /// - `Err(e)` if the peer violated the framing rules
    pub fn parse(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        loop {
            match self.state {
                ParseState::Header => {
                    if self.header_len < 2 {
                        self.fill_header(buf, 2);
                        if self.header_len < 2 {
                            return Ok(None);
                        }
                        self.check_base_header()?;
                    }

                    let b1 = self.header_buf[1];
                    let masked = b1 & 0x80 != 0;
                    let len_bytes = match b1 & 0x7F {
                        126 => 2,
                        127 => 8,
                        _ => 0,
                    };
                    let target = 2 + len_bytes + if masked { 4 } else { 0 };

                    self.fill_header(buf, target);
                    if self.header_len < target {
                        return Ok(None);
                    }

                    self.header = Some(self.finish_header(len_bytes, masked)?);
                    self.state = ParseState::Payload;
                }

                ParseState::Payload => {
                    let Some(header) = self.header.as_ref() else {
                        self.reset();
                        continue;
                    };
                    let payload_len = header.payload_len as usize;
                    if buf.len() < payload_len {
                        return Ok(None);
                    }

                    let mut payload = buf.split_to(payload_len);
                    if let Some(mask) = header.mask {
                        apply_mask(&mut payload, mask);
                    }

                    let frame = self.header.take().map(|header| Frame {
                        header,
                        payload: payload.freeze(),
                    });
                    self.reset();
                    return Ok(frame);
                }
            }
        }
    }

    /// Move bytes from `buf` into the header buffer until it holds `target`
    #[inline]
    fn fill_header(&mut self, buf: &mut BytesMut, target: usize) {
        let needed = target.saturating_sub(self.header_len);
        let take = needed.min(buf.len());
        if take > 0 {
            self.header_buf[self.header_len..self.header_len + take]
                .copy_from_slice(&buf[..take]);
            self.header_len += take;
            buf.advance(take);
        }
    }

    /// Validate everything knowable from the first two bytes
    fn check_base_header(&self) -> Result<(), ProtocolError> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];

        if b0 & RSV_MASK & !self.allowed_rsv != 0 {
            return Err(ProtocolError::ReservedBits);
        }

        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(ProtocolError::InvalidOpcode(b0 & 0x0F))?;
        let fin = b0 & 0x80 != 0;
        if opcode.is_control() {
            // Extensions only claim RSV bits on data frames
            if b0 & RSV_MASK != 0 {
                return Err(ProtocolError::ReservedBits);
            }
            if !fin {
                return Err(ProtocolError::FragmentedControl);
            }
            if (b1 & 0x7F) as usize > MAX_CONTROL_PAYLOAD {
                return Err(ProtocolError::ControlFrameTooLarge);
            }
        }

        let masked = b1 & 0x80 != 0;
        if self.expect_masked && !masked {
            return Err(ProtocolError::UnmaskedFrame);
        }
        if !self.expect_masked && masked {
            return Err(ProtocolError::MaskedFrame);
        }

        Ok(())
    }

    /// Decode length and mask from a complete header buffer
    fn finish_header(&self, len_bytes: usize, masked: bool) -> Result<FrameHeader, ProtocolError> {
        let b0 = self.header_buf[0];
        let b1 = self.header_buf[1];

        let payload_len = match len_bytes {
            0 => (b1 & 0x7F) as u64,
            2 => {
                let len = u16::from_be_bytes([self.header_buf[2], self.header_buf[3]]) as u64;
                if len <= SMALL_MESSAGE_THRESHOLD as u64 {
                    return Err(ProtocolError::NonMinimalLength);
                }
                len
            }
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&self.header_buf[2..10]);
                let len = u64::from_be_bytes(raw);
                if len >> 63 != 0 {
                    return Err(ProtocolError::LengthOverflow);
                }
                if len <= MEDIUM_MESSAGE_THRESHOLD as u64 {
                    return Err(ProtocolError::NonMinimalLength);
                }
                len
            }
        };

        if payload_len > self.max_frame_size as u64 {
            return Err(ProtocolError::MessageTooBig);
        }

        let mask = masked.then(|| {
            let at = 2 + len_bytes;
            [
                self.header_buf[at],
                self.header_buf[at + 1],
                self.header_buf[at + 2],
                self.header_buf[at + 3],
            ]
        });

        // check_base_header already rejected unknown opcodes
        let opcode = OpCode::from_u8(b0 & 0x0F).ok_or(ProtocolError::InvalidOpcode(b0 & 0x0F))?;

        Ok(FrameHeader {
            fin: b0 & 0x80 != 0,
            rsv1: b0 & RSV1 != 0,
            rsv2: b0 & RSV2 != 0,
            rsv3: b0 & RSV3 != 0,
            opcode,
            masked,
            payload_len,
            mask,
        })
    }
}

/// Encode a frame into a buffer
///
/// For masked frames (client mode) the payload is copied and masked in the
/// output buffer; the caller's slice is untouched.
#[inline]
pub fn encode_frame(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
) {
    encode_frame_with_rsv(buf, opcode, payload, fin, mask, 0)
}

/// Encode a frame with explicit reserved bits (`RSV1 | RSV2 | RSV3` positions)
pub fn encode_frame_with_rsv(
    buf: &mut BytesMut,
    opcode: OpCode,
    payload: &[u8],
    fin: bool,
    mask: Option<[u8; 4]>,
    rsv: u8,
) {
    let payload_len = payload.len();
    buf.reserve(header_size(payload_len, mask.is_some()) + payload_len);

    let mut b0 = opcode as u8 | (rsv & RSV_MASK);
    if fin {
        b0 |= 0x80;
    }
    buf.put_u8(b0);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload_len <= SMALL_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | payload_len as u8);
    } else if payload_len <= MEDIUM_MESSAGE_THRESHOLD {
        buf.put_u8(mask_bit | 126);
        buf.put_u16(payload_len as u16);
    } else {
        buf.put_u8(mask_bit | 127);
        buf.put_u64(payload_len as u64);
    }

    if let Some(m) = mask {
        buf.put_slice(&m);
        let start = buf.len();
        buf.put_slice(payload);
        apply_mask(&mut buf[start..], m);
    } else {
        buf.put_slice(payload);
    }
}

/// Role-aware frame codec
///
/// Wraps a [`FrameParser`] configured for the peer's masking rule and
/// encodes outgoing frames with the masking rule of `role`.
#[derive(Debug)]
pub struct FrameCodec {
    role: Role,
    parser: FrameParser,
}

impl FrameCodec {
    /// Create a codec for an endpoint of the given role
    pub fn new(role: Role, max_frame_size: usize) -> Self {
        Self {
            role,
            parser: FrameParser::new(max_frame_size, role.expects_masked()),
        }
    }

    /// Endpoint role
    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    /// Allow RSV bits claimed by negotiated extensions
    pub fn set_reserved_bits(&mut self, bits: u8) {
        self.parser.set_reserved_bits(bits);
    }

    /// True when no inbound frame is partially parsed
    pub fn is_idle(&self) -> bool {
        self.parser.is_idle()
    }

    /// Header of a frame still waiting for its payload
    pub fn pending_header(&self) -> Option<&FrameHeader> {
        self.parser.pending_header()
    }

    /// Decode the next frame; `Ok(None)` means more data is needed
    #[inline]
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        self.parser.parse(buf)
    }

    /// Encode one frame with this endpoint's masking rule
    #[inline]
    pub fn encode(&self, opcode: OpCode, payload: &[u8], fin: bool, buf: &mut BytesMut) {
        encode_frame(buf, opcode, payload, fin, self.role.outgoing_mask());
    }

    /// Encode one frame with reserved bits set
    #[inline]
    pub fn encode_with_rsv(
        &self,
        opcode: OpCode,
        payload: &[u8],
        fin: bool,
        rsv: u8,
        buf: &mut BytesMut,
    ) {
        encode_frame_with_rsv(buf, opcode, payload, fin, self.role.outgoing_mask(), rsv);
    }

    /// Encode a data payload as a sequence of at most `max_fragment` byte frames
    ///
    /// The first frame carries `opcode` and `rsv`, the rest are continuation
    /// frames, and only the last has FIN set. Returns the number of frames.
    pub fn encode_fragmented(
        &self,
        opcode: OpCode,
        payload: &[u8],
        rsv: u8,
        max_fragment: usize,
        buf: &mut BytesMut,
    ) -> usize {
        debug_assert!(opcode.is_data() && opcode != OpCode::Continuation);
        let max_fragment = max_fragment.max(1);

        if payload.len() <= max_fragment {
            self.encode_with_rsv(opcode, payload, true, rsv, buf);
            return 1;
        }

        let mut count = 0;
        let mut chunks = payload.chunks(max_fragment).peekable();
        while let Some(chunk) = chunks.next() {
            let fin = chunks.peek().is_none();
            if count == 0 {
                self.encode_with_rsv(opcode, chunk, fin, rsv, buf);
            } else {
                self.encode(OpCode::Continuation, chunk, fin, buf);
            }
            count += 1;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut FrameParser, bytes: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = parser.parse(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn test_opcode() {
        assert!(OpCode::Ping.is_control());
        assert!(OpCode::Pong.is_control());
        assert!(OpCode::Close.is_control());
        assert!(!OpCode::Text.is_control());
        assert!(OpCode::Continuation.is_data());
        assert_eq!(OpCode::from_u8(0x3), None);
        assert_eq!(OpCode::from_u8(0xB), None);
    }

    #[test]
    fn test_parse_small_unmasked() {
        let mut parser = FrameParser::new(1024 * 1024, false);
        let mut buf = BytesMut::from(&[0x81, 0x05, b'h', b'e', b'l', b'l', b'o'][..]);

        let frame = parser.parse(&mut buf).unwrap().unwrap();
        assert!(frame.header.fin);
        assert_eq!(frame.header.opcode, OpCode::Text);
        assert_eq!(frame.payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_parse_small_masked() {
        let mut parser = FrameParser::new(1024 * 1024, true);
        let mask = [0x37, 0xfa, 0x21, 0x3d];

        // RFC 6455 section 5.7 example: masked "Hello"
        let bytes = [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58];
        let frame = parse_all(&mut parser, &bytes).unwrap().remove(0);
        assert_eq!(frame.payload.as_ref(), b"Hello");
        assert_eq!(frame.header.mask, Some(mask));
    }

    #[test]
    fn test_parse_byte_at_a_time() {
        let mut encoded = BytesMut::new();
        let payload = vec![0x42u8; 300];
        encode_frame(&mut encoded, OpCode::Binary, &payload, true, Some([1, 2, 3, 4]));

        let mut parser = FrameParser::new(1024 * 1024, true);
        let mut buf = BytesMut::new();
        let mut result = None;
        for (i, byte) in encoded.iter().enumerate() {
            buf.put_u8(*byte);
            match parser.parse(&mut buf).unwrap() {
                Some(frame) => {
                    assert_eq!(i, encoded.len() - 1, "frame completed early");
                    result = Some(frame);
                }
                None => assert!(i < encoded.len() - 1),
            }
        }
        let frame = result.unwrap();
        assert_eq!(frame.payload.as_ref(), &payload[..]);
    }

    #[test]
    fn test_length_tiers_round_trip() {
        for len in [0usize, 1, 125, 126, 127, 65535, 65536, 70000] {
            for role in [Role::Client, Role::Server] {
                let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                let mut frame = Frame::binary(payload);
                if let Some(mask) = role.outgoing_mask() {
                    frame = frame.with_mask(mask);
                }

                let mut buf = BytesMut::new();
                frame.encode(&mut buf);
                assert_eq!(buf.len(), frame.header.header_size() + len);

                // Decoded by the opposite role
                let mut parser = FrameParser::new(usize::MAX, role == Role::Client);
                let decoded = parser.parse(&mut buf).unwrap().unwrap();
                assert_eq!(decoded, frame, "len {len} role {role:?}");
            }
        }
    }

    #[test]
    fn test_header_tier_boundaries() {
        let mut buf = BytesMut::new();
        encode_frame(&mut buf, OpCode::Binary, &[0u8; 125], true, None);
        assert_eq!(buf[1], 125);

        buf.clear();
        encode_frame(&mut buf, OpCode::Binary, &[0u8; 126], true, None);
        assert_eq!(buf[1], 126);
        assert_eq!(&buf[2..4], &126u16.to_be_bytes());

        buf.clear();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; 65535], true, None);
        assert_eq!(buf[1], 126);

        buf.clear();
        encode_frame(&mut buf, OpCode::Binary, &vec![0u8; 65536], true, None);
        assert_eq!(buf[1], 127);
        assert_eq!(&buf[2..10], &65536u64.to_be_bytes());
    }

    #[test]
    fn test_non_minimal_lengths_rejected() {
        let mut parser = FrameParser::new(usize::MAX, false);
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&125u16.to_be_bytes());
        assert_eq!(parse_all(&mut parser, &bytes), Err(ProtocolError::NonMinimalLength));

        let mut parser = FrameParser::new(usize::MAX, false);
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&65535u64.to_be_bytes());
        assert_eq!(parse_all(&mut parser, &bytes), Err(ProtocolError::NonMinimalLength));
    }

    #[test]
    fn test_length_msb_rejected() {
        let mut parser = FrameParser::new(usize::MAX, false);
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());
        assert_eq!(parse_all(&mut parser, &bytes), Err(ProtocolError::LengthOverflow));
    }

    #[test]
    fn test_masking_rules() {
        let mut server = FrameParser::new(1024, true);
        assert_eq!(
            parse_all(&mut server, &[0x81, 0x00]),
            Err(ProtocolError::UnmaskedFrame)
        );

        let mut client = FrameParser::new(1024, false);
        assert_eq!(
            parse_all(&mut client, &[0x81, 0x80, 0, 0, 0, 0]),
            Err(ProtocolError::MaskedFrame)
        );
    }

    #[test]
    fn test_codec_masks_by_role() {
        let mut buf = BytesMut::new();
        FrameCodec::new(Role::Client, 1024).encode(OpCode::Text, b"hi", true, &mut buf);
        assert_eq!(buf[1] & 0x80, 0x80);

        buf.clear();
        FrameCodec::new(Role::Server, 1024).encode(OpCode::Text, b"hi", true, &mut buf);
        assert_eq!(buf[1] & 0x80, 0);
    }

    #[test]
    fn test_reserved_bits() {
        let mut parser = FrameParser::new(1024, false);
        assert_eq!(
            parse_all(&mut parser, &[0xC1, 0x00]),
            Err(ProtocolError::ReservedBits)
        );

        let mut parser = FrameParser::new(1024, false);
        parser.set_reserved_bits(RSV1);
        let frame = parse_all(&mut parser, &[0xC1, 0x00]).unwrap().remove(0);
        assert!(frame.header.rsv1);

        // RSV2 still not claimed
        let mut parser = FrameParser::new(1024, false);
        parser.set_reserved_bits(RSV1);
        assert_eq!(
            parse_all(&mut parser, &[0xA1, 0x00]),
            Err(ProtocolError::ReservedBits)
        );
    }

    #[test]
    fn test_control_frames_never_carry_rsv() {
        for byte0 in [0xC9u8, 0xCA, 0xC8] {
            let mut parser = FrameParser::new(1024, false);
            parser.set_reserved_bits(RSV1);
            assert_eq!(
                parse_all(&mut parser, &[byte0, 0x00]),
                Err(ProtocolError::ReservedBits),
                "first byte {byte0:#x}"
            );
        }

        // The same claim is fine on a data frame
        let mut parser = FrameParser::new(1024, false);
        parser.set_reserved_bits(RSV1);
        assert!(parse_all(&mut parser, &[0xC2, 0x00]).is_ok());
    }

    #[test]
    fn test_pending_header_exposed_before_payload() {
        let mut parser = FrameParser::new(1024, false);
        let mut buf = BytesMut::from(&[0x82u8, 126, 0x00, 0xC8][..]);
        buf.extend_from_slice(&[7u8; 50]);

        assert!(parser.parse(&mut buf).unwrap().is_none());
        let header = parser.pending_header().unwrap();
        assert_eq!(header.payload_len, 200);
        assert_eq!(header.opcode, OpCode::Binary);

        buf.extend_from_slice(&[7u8; 150]);
        assert_eq!(parser.parse(&mut buf).unwrap().unwrap().payload.len(), 200);
        assert!(parser.pending_header().is_none());
    }

    #[test]
    fn test_invalid_opcode() {
        let mut parser = FrameParser::new(1024, false);
        assert_eq!(
            parse_all(&mut parser, &[0x83, 0x00]),
            Err(ProtocolError::InvalidOpcode(0x3))
        );
    }

    #[test]
    fn test_control_frame_rules() {
        let mut parser = FrameParser::new(1024, false);
        assert_eq!(
            parse_all(&mut parser, &[0x09, 0x00]),
            Err(ProtocolError::FragmentedControl)
        );

        let mut parser = FrameParser::new(1024, false);
        let mut bytes = vec![0x89, 126];
        bytes.extend_from_slice(&126u16.to_be_bytes());
        assert_eq!(
            parse_all(&mut parser, &bytes),
            Err(ProtocolError::ControlFrameTooLarge)
        );
    }

    #[test]
    fn test_frame_too_large() {
        let mut parser = FrameParser::new(100, false);
        let mut bytes = vec![0x82, 126];
        bytes.extend_from_slice(&200u16.to_be_bytes());
        assert_eq!(parse_all(&mut parser, &bytes), Err(ProtocolError::MessageTooBig));
    }

    #[test]
    fn test_encode_fragmented() {
        let codec = FrameCodec::new(Role::Server, 1024);
        let mut buf = BytesMut::new();
        let count = codec.encode_fragmented(OpCode::Text, b"hello world", RSV1, 4, &mut buf);
        assert_eq!(count, 3);

        let mut parser = FrameParser::new(1024, false);
        parser.set_reserved_bits(RSV1);
        let frames = parse_all(&mut parser, &buf).unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].header.opcode, OpCode::Text);
        assert!(frames[0].header.rsv1 && !frames[0].header.fin);
        assert_eq!(frames[1].header.opcode, OpCode::Continuation);
        assert!(!frames[1].header.rsv1 && !frames[1].header.fin);
        assert_eq!(frames[2].header.opcode, OpCode::Continuation);
        assert!(frames[2].header.fin);
        let joined: Vec<u8> = frames.iter().flat_map(|f| f.payload.to_vec()).collect();
        assert_eq!(joined, b"hello world");
    }

    #[test]
    fn test_encode_fragmented_empty_payload() {
        let codec = FrameCodec::new(Role::Server, 1024);
        let mut buf = BytesMut::new();
        assert_eq!(codec.encode_fragmented(OpCode::Binary, b"", 0, 4, &mut buf), 1);
        assert_eq!(&buf[..], &[0x82, 0x00]);
    }

    #[test]
    fn test_close_frame() {
        let frame = Frame::close(1000, "goodbye");
        assert_eq!(frame.header.opcode, OpCode::Close);

        let close = frame.parse_close().unwrap().unwrap();
        assert_eq!(close.code, 1000);
        assert_eq!(close.reason, "goodbye");
    }
}
