//! Incremental UTF-8 validation for text payloads and close reasons.
//!
//! Text messages stream through the reader in chunks, so a multi-byte
//! sequence can straddle a chunk (or frame) boundary. The validator
//! carries the incomplete tail over to the next chunk.

use crate::error::{Error, Result};

/// Incremental UTF-8 validator.
#[derive(Debug, Clone, Default)]
pub struct Utf8Validator {
    /// Incomplete multi-byte sequence carried over from the last chunk.
    incomplete: [u8; 4],
    incomplete_len: usize,
}

impl Utf8Validator {
    /// Create a new validator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the next chunk of a text payload.
    ///
    /// For non-final chunks an incomplete multi-byte sequence at the end
    /// is saved and checked against the following chunk. A final chunk
    /// must complete every sequence.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUtf8` on any invalid sequence.
    pub fn validate(&mut self, data: &[u8], is_final: bool) -> Result<()> {
        let check: Vec<u8> = if self.incomplete_len > 0 {
            let mut combined = Vec::with_capacity(self.incomplete_len + data.len());
            combined.extend_from_slice(&self.incomplete[..self.incomplete_len]);
            combined.extend_from_slice(data);
            combined
        } else if data.is_empty() {
            return Ok(());
        } else {
            data.to_vec()
        };
        self.incomplete_len = 0;

        match std::str::from_utf8(&check) {
            Ok(_) => Ok(()),
            Err(e) => {
                // error_len() is None only for an incomplete sequence at
                // the very end, which a later chunk may still complete.
                if !is_final && e.error_len().is_none() {
                    let tail = &check[e.valid_up_to()..];
                    if tail.len() <= 4 {
                        self.incomplete[..tail.len()].copy_from_slice(tail);
                        self.incomplete_len = tail.len();
                        return Ok(());
                    }
                }
                Err(Error::InvalidUtf8)
            }
        }
    }

    /// Whether an incomplete sequence is pending.
    #[must_use]
    pub fn has_incomplete(&self) -> bool {
        self.incomplete_len > 0
    }

    /// Discard any pending incomplete sequence.
    pub fn reset(&mut self) {
        self.incomplete_len = 0;
    }
}

/// Length of the longest prefix of `data` that does not end in the
/// middle of a multi-byte sequence.
///
/// Used when a text message is cut at a byte limit: the cut is moved
/// back so no partial character is delivered.
#[must_use]
pub fn floor_char_boundary(data: &[u8]) -> usize {
    let mut end = data.len();
    // A continuation byte is 0b10xxxxxx; at most 3 can trail a lead byte.
    let mut back = 0;
    while end > 0 && back < 4 {
        let b = data[end - 1];
        if b & 0x80 == 0 {
            return end;
        }
        if b & 0xC0 == 0xC0 {
            // Lead byte: keep it only if its sequence is complete.
            let needed = if b & 0xF8 == 0xF0 {
                4
            } else if b & 0xF0 == 0xE0 {
                3
            } else {
                2
            };
            return if back + 1 == needed { end + back } else { end - 1 };
        }
        end -= 1;
        back += 1;
    }
    data.len().saturating_sub(back)
}
