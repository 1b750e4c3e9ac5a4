//! Per-link line transports.
//!
//! A transport turns a plaintext protocol line into the text written on the
//! wire and back. Links without a key send lines unchanged; keyed links use
//! [`AesTransport`], whose framing is:
//!
//! 1. pad the line with [`PAD_BYTE`] up to a multiple of 16 bytes
//! 2. encrypt block by block, chaining from a zero IV (reset per line)
//! 3. base64-encode the ciphertext; that text is the wire line
//!
//! `CAPAB` and `AES` lines are never encrypted so the handshake can
//! bootstrap. Inbound, those two and `ERROR` may arrive in plaintext; any
//! other plaintext line on a keyed link is refused.

use aes_gcm::aes::cipher::generic_array::GenericArray;
use aes_gcm::aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes_gcm::aes::{Aes128, Aes192, Aes256};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::{ProtocolError, Result};

/// Cipher block size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// Byte used to pad plaintext to a whole number of blocks.
pub const PAD_BYTE: u8 = 0x07;

/// Encode/decode capability selected per link.
pub trait LineTransport: Send {
    /// Plaintext line to wire text.
    fn encode(&mut self, line: &str) -> String;

    /// Wire text to plaintext line.
    fn decode(&mut self, wire: &str) -> Result<String>;
}

/// Command word of a plaintext line, skipping any `:prefix`.
fn command_word(line: &str) -> &str {
    let mut words = line.split(' ').filter(|w| !w.is_empty());
    match words.next() {
        Some(w) if w.starts_with(':') => words.next().unwrap_or_default(),
        Some(w) => w,
        None => "",
    }
}

/// Whether an outbound line must go out unencrypted.
pub fn is_bootstrap_line(line: &str) -> bool {
    let command = command_word(line);
    command.eq_ignore_ascii_case("CAPAB") || command.eq_ignore_ascii_case("AES")
}

/// Whether an inbound wire line may be accepted in plaintext on a keyed link.
pub fn is_cleartext_line(wire: &str) -> bool {
    is_bootstrap_line(wire) || command_word(wire).eq_ignore_ascii_case("ERROR")
}

enum BlockCipher {
    Aes128(Box<Aes128>),
    Aes192(Box<Aes192>),
    Aes256(Box<Aes256>),
}

impl BlockCipher {
    fn encrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.encrypt_block(block),
            BlockCipher::Aes192(c) => c.encrypt_block(block),
            BlockCipher::Aes256(c) => c.encrypt_block(block),
        }
    }

    fn decrypt(&self, block: &mut [u8]) {
        let block = GenericArray::from_mut_slice(block);
        match self {
            BlockCipher::Aes128(c) => c.decrypt_block(block),
            BlockCipher::Aes192(c) => c.decrypt_block(block),
            BlockCipher::Aes256(c) => c.decrypt_block(block),
        }
    }
}

/// AES line transport keyed from a link's `encryptionkey`.
pub struct AesTransport {
    cipher: BlockCipher,
}

impl std::fmt::Debug for AesTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let bits = match self.cipher {
            BlockCipher::Aes128(_) => 128,
            BlockCipher::Aes192(_) => 192,
            BlockCipher::Aes256(_) => 256,
        };
        f.debug_struct("AesTransport").field("bits", &bits).finish()
    }
}

impl AesTransport {
    /// Build from a 16, 24 or 32 byte key.
    pub fn new(key: &[u8]) -> Result<Self> {
        let cipher = match key.len() {
            16 => BlockCipher::Aes128(Box::new(Aes128::new(GenericArray::from_slice(key)))),
            24 => BlockCipher::Aes192(Box::new(Aes192::new(GenericArray::from_slice(key)))),
            32 => BlockCipher::Aes256(Box::new(Aes256::new(GenericArray::from_slice(key)))),
            n => return Err(ProtocolError::InvalidKeyLength(n)),
        };
        Ok(Self { cipher })
    }
}

impl LineTransport for AesTransport {
    fn encode(&mut self, line: &str) -> String {
        if is_bootstrap_line(line) {
            return line.to_string();
        }
        let mut buf = line.as_bytes().to_vec();
        let padded = buf.len().div_ceil(BLOCK_SIZE).max(1) * BLOCK_SIZE;
        buf.resize(padded, PAD_BYTE);

        let mut chain = [0u8; BLOCK_SIZE];
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            self.cipher.encrypt(block);
            chain.copy_from_slice(block);
        }
        STANDARD.encode(buf)
    }

    fn decode(&mut self, wire: &str) -> Result<String> {
        if is_cleartext_line(wire) {
            return Ok(wire.to_string());
        }
        if wire.trim().contains(' ') {
            return Err(ProtocolError::Cleartext(command_word(wire).to_string()));
        }
        let mut buf = STANDARD.decode(wire.trim())?;
        if buf.is_empty() || !buf.chunks_exact(BLOCK_SIZE).remainder().is_empty() {
            return Err(ProtocolError::BadBlockLength(buf.len()));
        }

        let mut chain = [0u8; BLOCK_SIZE];
        for block in buf.chunks_exact_mut(BLOCK_SIZE) {
            let mut next = [0u8; BLOCK_SIZE];
            next.copy_from_slice(block);
            self.cipher.decrypt(block);
            for (b, c) in block.iter_mut().zip(chain.iter()) {
                *b ^= c;
            }
            chain = next;
        }
        while buf.last() == Some(&PAD_BYTE) {
            buf.pop();
        }
        String::from_utf8(buf).map_err(|_| ProtocolError::InvalidUtf8)
    }
}
