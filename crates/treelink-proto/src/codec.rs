//! Line codec for tokio.
//!
//! Splits inbound bytes on CR, LF or CRLF and appends CRLF on the way out.
//! Lines are handed over as raw text: transport decoding (AES) happens one
//! layer up because it can be switched on between two lines of one read.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, Result};

/// Default limit for a single wire line, ciphertext included.
pub const DEFAULT_MAX_LINE: usize = 4096;

/// CR/LF-tolerant line codec.
#[derive(Debug, Clone)]
pub struct LineCodec {
    /// Index of the next byte to check for a terminator.
    next_index: usize,
    /// Maximum line length, terminator excluded.
    max_len: usize,
}

impl Default for LineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl LineCodec {
    /// Codec with [`DEFAULT_MAX_LINE`].
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_LINE)
    }

    /// Codec with a custom line length limit.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            next_index: 0,
            max_len,
        }
    }
}

impl Decoder for LineCodec {
    type Item = String;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>> {
        loop {
            let Some(offset) = src[self.next_index..]
                .iter()
                .position(|b| *b == b'\n' || *b == b'\r')
            else {
                self.next_index = src.len();
                if src.len() > self.max_len {
                    return Err(ProtocolError::LineTooLong {
                        actual: src.len(),
                        limit: self.max_len,
                    });
                }
                return Ok(None);
            };

            let end = self.next_index + offset;
            self.next_index = 0;
            let line = src.split_to(end);
            // Swallow the terminator; a bare CR counts as one.
            let crlf = src.len() >= 2 && src[0] == b'\r' && src[1] == b'\n';
            src.advance(if crlf { 2 } else { 1 });

            if line.is_empty() {
                continue;
            }
            if line.len() > self.max_len {
                return Err(ProtocolError::LineTooLong {
                    actual: line.len(),
                    limit: self.max_len,
                });
            }
            let text = String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)?;
            return Ok(Some(text));
        }
    }
}

impl Encoder<String> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<()> {
        let line = line.trim_end_matches(['\r', '\n']);
        dst.reserve(line.len() + 2);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
