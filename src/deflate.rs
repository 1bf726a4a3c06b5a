//! Per-Message Deflate Extension (RFC 7692)
//!
//! Negotiation policy and payload transform for `permessage-deflate`. The
//! DEFLATE stream itself is produced by `flate2`; this module owns the
//! parameter rules, the `00 00 ff ff` trailer handling and the decompression
//! bound.
//!
//! Compression always uses the full 32KB window, so offers that ask us to
//! compress with a smaller window are declined.

use std::collections::HashSet;

use bytes::Bytes;
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::ExtensionError;
use crate::extension::{Accepted, Extension, ExtensionOffer, ExtensionParam, Granularity, Transform};
use crate::frame::RSV1;

/// Extension token
pub const EXTENSION_NAME: &str = "permessage-deflate";

/// Trailer removed after compression and restored before decompression
const DEFLATE_TRAILER: [u8; 4] = [0x00, 0x00, 0xff, 0xff];

/// Minimum LZ77 window size (256 bytes = 2^8)
pub const MIN_WINDOW_BITS: u8 = 8;

/// Maximum LZ77 window size (32KB = 2^15)
pub const MAX_WINDOW_BITS: u8 = 15;

/// Local preferences for permessage-deflate
#[derive(Debug, Clone)]
pub struct DeflateConfig {
    /// Server resets its compression context after each message
    pub server_no_context_takeover: bool,
    /// Client resets its compression context after each message
    pub client_no_context_takeover: bool,
    /// Compression level (0-9)
    pub compression_level: u32,
    /// Messages shorter than this are sent uncompressed
    pub compression_threshold: usize,
    /// Fail the handshake if the peer does not agree to compression
    pub mandatory: bool,
}

impl Default for DeflateConfig {
    fn default() -> Self {
        Self {
            server_no_context_takeover: false,
            client_no_context_takeover: false,
            compression_level: 6,
            compression_threshold: 32,
            mandatory: false,
        }
    }
}

impl DeflateConfig {
    /// Small footprint: no retained context on either side, fast level
    pub fn low_memory() -> Self {
        Self {
            server_no_context_takeover: true,
            client_no_context_takeover: true,
            compression_level: 1,
            compression_threshold: 64,
            mandatory: false,
        }
    }
}

/// Parameters agreed for one connection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeflateParams {
    pub server_no_context_takeover: bool,
    pub client_no_context_takeover: bool,
    /// Largest window the server may compress with
    pub server_max_window_bits: Option<u8>,
    /// `Some(None)` when present without a value
    pub client_max_window_bits: Option<Option<u8>>,
}

fn invalid(param: &str) -> ExtensionError {
    ExtensionError::InvalidParameter {
        extension: EXTENSION_NAME.into(),
        param: param.into(),
    }
}

fn window_bits(param: &ExtensionParam) -> Result<u8, ExtensionError> {
    let value = param.value.as_deref().ok_or_else(|| invalid(&param.name))?;
    // RFC 7692 forbids leading zeros and signs
    if value.starts_with('0') || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid(&param.name));
    }
    match value.parse::<u8>() {
        Ok(bits) if (MIN_WINDOW_BITS..=MAX_WINDOW_BITS).contains(&bits) => Ok(bits),
        _ => Err(invalid(&param.name)),
    }
}

impl DeflateParams {
    /// Validate an offer or response parameter list
    pub fn parse(offer: &ExtensionOffer) -> Result<Self, ExtensionError> {
        let mut params = Self::default();
        let mut seen = HashSet::new();

        for p in &offer.params {
            if !seen.insert(p.name.as_str()) {
                return Err(ExtensionError::DuplicateParameter {
                    extension: EXTENSION_NAME.into(),
                    param: p.name.clone(),
                });
            }
            match p.name.as_str() {
                "server_no_context_takeover" | "client_no_context_takeover" if p.value.is_some() => {
                    return Err(invalid(&p.name));
                }
                "server_no_context_takeover" => params.server_no_context_takeover = true,
                "client_no_context_takeover" => params.client_no_context_takeover = true,
                "server_max_window_bits" => params.server_max_window_bits = Some(window_bits(p)?),
                "client_max_window_bits" => {
                    params.client_max_window_bits = match p.value {
                        Some(_) => Some(Some(window_bits(p)?)),
                        None => Some(None),
                    };
                }
                _ => {
                    return Err(ExtensionError::UnknownParameter {
                        extension: EXTENSION_NAME.into(),
                        param: p.name.clone(),
                    });
                }
            }
        }

        Ok(params)
    }

    fn to_params(&self) -> Vec<ExtensionParam> {
        let mut out = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            out.push(ExtensionParam {
                name: name.into(),
                value,
            })
        };
        if self.server_no_context_takeover {
            push("server_no_context_takeover", None);
        }
        if self.client_no_context_takeover {
            push("client_no_context_takeover", None);
        }
        if let Some(bits) = self.server_max_window_bits {
            push("server_max_window_bits", Some(bits.to_string()));
        }
        if let Some(bits) = self.client_max_window_bits {
            push("client_max_window_bits", bits.map(|b| b.to_string()));
        }
        out
    }
}

/// The permessage-deflate extension policy
#[derive(Debug, Clone, Default)]
pub struct PerMessageDeflate {
    config: DeflateConfig,
}

impl PerMessageDeflate {
    /// Create the policy with the given preferences
    pub fn new(config: DeflateConfig) -> Self {
        Self { config }
    }

    fn transform(&self, compress_reset: bool, decompress_reset: bool) -> Box<dyn Transform> {
        Box::new(DeflateTransform {
            encoder: DeflateEncoder::new(
                self.config.compression_level,
                compress_reset,
                self.config.compression_threshold,
            ),
            decoder: DeflateDecoder::new(decompress_reset),
        })
    }
}

impl Extension for PerMessageDeflate {
    fn name(&self) -> &str {
        EXTENSION_NAME
    }

    fn reserved_bits(&self) -> u8 {
        RSV1
    }

    fn granularity(&self) -> Granularity {
        Granularity::PerMessage
    }

    fn mandatory(&self) -> bool {
        self.config.mandatory
    }

    fn accept_offer(&self, offer: &ExtensionOffer) -> Result<Option<Accepted>, ExtensionError> {
        let requested = DeflateParams::parse(offer)?;

        // We cannot compress with a window below 2^15
        if matches!(requested.server_max_window_bits, Some(bits) if bits < MAX_WINDOW_BITS) {
            return Ok(None);
        }

        let agreed = DeflateParams {
            server_no_context_takeover: requested.server_no_context_takeover
                || self.config.server_no_context_takeover,
            client_no_context_takeover: requested.client_no_context_takeover
                || self.config.client_no_context_takeover,
            server_max_window_bits: requested.server_max_window_bits,
            client_max_window_bits: None,
        };

        Ok(Some(Accepted {
            params: agreed.to_params(),
            transform: self.transform(
                agreed.server_no_context_takeover,
                agreed.client_no_context_takeover,
            ),
        }))
    }

    fn offer(&self) -> ExtensionOffer {
        let params = DeflateParams {
            server_no_context_takeover: self.config.server_no_context_takeover,
            client_no_context_takeover: self.config.client_no_context_takeover,
            ..Default::default()
        };
        ExtensionOffer {
            name: EXTENSION_NAME.into(),
            params: params.to_params(),
        }
    }

    fn accept_response(&self, response: &ExtensionOffer) -> Result<Accepted, ExtensionError> {
        let agreed = DeflateParams::parse(response)?;

        // Not offered, and we cannot honor a smaller window
        if agreed.client_max_window_bits.is_some() {
            return Err(invalid("client_max_window_bits"));
        }

        Ok(Accepted {
            params: agreed.to_params(),
            transform: self.transform(
                agreed.client_no_context_takeover,
                agreed.server_no_context_takeover,
            ),
        })
    }
}

fn flate_error(e: impl std::fmt::Display) -> ExtensionError {
    ExtensionError::Transform(e.to_string())
}

/// Deflate compressor for outgoing messages
pub struct DeflateEncoder {
    deflate: Compress,
    no_context_takeover: bool,
    threshold: usize,
}

impl DeflateEncoder {
    /// Create a raw-deflate encoder
    pub fn new(level: u32, no_context_takeover: bool, threshold: usize) -> Self {
        Self {
            deflate: Compress::new(Compression::new(level), false),
            no_context_takeover,
            threshold,
        }
    }

    /// Compress a message payload
    ///
    /// Returns `None` when the message is sent uncompressed.
    pub fn compress(&mut self, data: &[u8]) -> Result<Option<Bytes>, ExtensionError> {
        if data.len() < self.threshold {
            return Ok(None);
        }

        let mut output = Vec::with_capacity(data.len() / 2 + 64);
        let mut offset = 0;

        loop {
            if output.len() == output.capacity() {
                output.reserve(output.capacity().max(4096));
            }

            let before_in = self.deflate.total_in();
            let before_out = output.len();
            self.deflate
                .compress_vec(&data[offset..], &mut output, FlushCompress::Sync)
                .map_err(flate_error)?;
            offset += (self.deflate.total_in() - before_in) as usize;

            // A sync flush is complete once input is drained with room to spare
            if offset >= data.len() && output.len() < output.capacity() {
                break;
            }
            if output.len() == before_out && output.len() < output.capacity() {
                return Err(ExtensionError::Transform("deflate made no progress".into()));
            }
        }

        if output.ends_with(&DEFLATE_TRAILER) {
            output.truncate(output.len() - DEFLATE_TRAILER.len());
        }

        if self.no_context_takeover {
            self.deflate.reset();
            // Without shared history an uncompressed send is always safe
            if output.len() >= data.len() {
                return Ok(None);
            }
        }

        Ok(Some(Bytes::from(output)))
    }
}

/// Deflate decompressor for incoming messages
pub struct DeflateDecoder {
    inflate: Decompress,
    no_context_takeover: bool,
}

impl DeflateDecoder {
    /// Create a raw-deflate decoder
    pub fn new(no_context_takeover: bool) -> Self {
        Self {
            inflate: Decompress::new(false),
            no_context_takeover,
        }
    }

    /// Decompress a message payload, producing at most `max_size` bytes
    pub fn decompress(&mut self, data: &[u8], max_size: usize) -> Result<Bytes, ExtensionError> {
        let mut input = Vec::with_capacity(data.len() + DEFLATE_TRAILER.len());
        input.extend_from_slice(data);
        input.extend_from_slice(&DEFLATE_TRAILER);

        let initial = data.len().saturating_mul(4).max(1024).min(max_size.saturating_add(1));
        let mut output = Vec::with_capacity(initial);
        let mut offset = 0;

        loop {
            if output.len() == output.capacity() {
                let room = max_size.saturating_add(1).saturating_sub(output.len()).max(1);
                output.reserve(output.capacity().max(4096).min(room));
            }

            let before_in = self.inflate.total_in();
            let before_out = output.len();
            let status = self
                .inflate
                .decompress_vec(&input[offset..], &mut output, FlushDecompress::Sync)
                .map_err(flate_error)?;
            offset += (self.inflate.total_in() - before_in) as usize;

            if output.len() > max_size {
                return Err(ExtensionError::PayloadTooBig);
            }

            let has_room = output.len() < output.capacity();
            match status {
                Status::StreamEnd => break,
                _ if offset >= input.len() && has_room => break,
                _ if output.len() == before_out && offset >= input.len() => break,
                _ if output.len() == before_out && has_room => {
                    return Err(ExtensionError::Transform("inflate made no progress".into()));
                }
                _ => {}
            }
        }

        if self.no_context_takeover {
            self.inflate.reset(false);
        }

        Ok(Bytes::from(output))
    }
}

struct DeflateTransform {
    encoder: DeflateEncoder,
    decoder: DeflateDecoder,
}

impl Transform for DeflateTransform {
    fn encode(&mut self, payload: Bytes) -> Result<Option<Bytes>, ExtensionError> {
        self.encoder.compress(&payload)
    }

    fn decode(&mut self, payload: Bytes, max_size: usize) -> Result<Bytes, ExtensionError> {
        self.decoder.decompress(&payload, max_size)
    }
}
