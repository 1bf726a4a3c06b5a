//! UTF-8 validation for text payloads
//!
//! Whole-buffer checks use `simdutf8`. Text messages arriving in fragments
//! go through [`Utf8Validator`], which validates each fragment as it lands
//! and carries at most three bytes of an unfinished code point to the next
//! one, so an invalid sequence is reported without buffering the message.

use simdutf8::compat::from_utf8 as from_utf8_compat;

use crate::error::ProtocolError;

/// Validate that the input is valid UTF-8
#[inline]
pub fn validate_utf8(data: &[u8]) -> bool {
    simdutf8::basic::from_utf8(data).is_ok()
}

/// Encoded width of the sequence introduced by `lead`, 0 if `lead` cannot start one
#[inline]
fn sequence_len(lead: u8) -> usize {
    match lead {
        0x00..=0x7F => 1,
        0xC2..=0xDF => 2,
        0xE0..=0xEF => 3,
        0xF0..=0xF4 => 4,
        _ => 0,
    }
}

/// Ok if `bytes` is valid UTF-8 or a valid prefix of it
#[inline]
fn check_prefix(bytes: &[u8]) -> Result<(), ProtocolError> {
    match from_utf8_compat(bytes) {
        Ok(_) => Ok(()),
        Err(e) if e.error_len().is_none() => Ok(()),
        Err(_) => Err(ProtocolError::InvalidUtf8),
    }
}

/// Streaming UTF-8 validator, resumable across frame boundaries
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    /// Create a validator positioned at a code point boundary
    pub fn new() -> Self {
        Self::default()
    }

    /// True when no partial code point is carried over
    #[inline]
    pub fn is_boundary(&self) -> bool {
        self.pending_len == 0
    }

    /// Validate the next chunk of a text payload
    ///
    /// Fails as soon as the bytes seen so far cannot be extended into valid
    /// UTF-8, including truncated sequences that are already impossible
    /// (`0xF5`, `0xE0 0x80`, ...).
    pub fn feed(&mut self, mut chunk: &[u8]) -> Result<(), ProtocolError> {
        if self.pending_len > 0 {
            // pending[0] passed check_prefix, so it is a multi-byte lead
            let width = sequence_len(self.pending[0]);
            let take = (width - self.pending_len).min(chunk.len());
            self.pending[self.pending_len..self.pending_len + take]
                .copy_from_slice(&chunk[..take]);
            self.pending_len += take;
            chunk = &chunk[take..];

            check_prefix(&self.pending[..self.pending_len])?;
            if self.pending_len < width {
                return Ok(());
            }
            self.pending_len = 0;
        }

        match from_utf8_compat(chunk) {
            Ok(_) => Ok(()),
            Err(e) if e.error_len().is_none() => {
                let tail = &chunk[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                Ok(())
            }
            Err(_) => Err(ProtocolError::InvalidUtf8),
        }
    }

    /// Finish the message; fails if it ended inside a code point
    pub fn finish(&mut self) -> Result<(), ProtocolError> {
        let complete = self.pending_len == 0;
        self.reset();
        if complete {
            Ok(())
        } else {
            Err(ProtocolError::InvalidUtf8)
        }
    }

    /// Drop any carried bytes
    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}
