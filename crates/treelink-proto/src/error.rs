//! Error types for the wire layer.

use thiserror::Error;

/// Convenience type alias for Results using [`ProtocolError`].
pub type Result<T, E = ProtocolError> = std::result::Result<T, E>;

/// Wire-level failures: tokenizing, parameter counts, framing and
/// transport decoding.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProtocolError {
    /// I/O error surfaced through the codec.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A line was empty after stripping the terminator.
    #[error("empty line")]
    EmptyLine,

    /// A prefix was present but no command followed it.
    #[error("missing command")]
    MissingCommand,

    /// The command token contained characters other than ASCII alphanumerics.
    #[error("invalid command token {0:?}")]
    InvalidCommand(String),

    /// A command arrived with fewer parameters than its grammar requires.
    #[error("{command} needs {expected} parameters, got {got}")]
    NeedMoreParams {
        /// Command name.
        command: String,
        /// Minimum parameter count.
        expected: usize,
        /// Parameters actually present.
        got: usize,
    },

    /// A numeric parameter did not parse.
    #[error("{command}: invalid numeric parameter {value:?}")]
    InvalidNumber {
        /// Command name.
        command: String,
        /// Offending value.
        value: String,
    },

    /// A line exceeded the codec's length limit.
    #[error("line too long ({actual} bytes, limit {limit})")]
    LineTooLong {
        /// Observed length.
        actual: usize,
        /// Configured limit.
        limit: usize,
    },

    /// Bytes on the wire were not valid UTF-8.
    #[error("invalid utf-8 on the wire")]
    InvalidUtf8,

    /// A transport key had an unsupported length.
    #[error("encryption key must be 16, 24 or 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Base64 decoding of a transport line failed.
    #[error("transport decode failed: {0}")]
    Base64(#[from] base64::DecodeError),

    /// A plaintext line other than CAPAB, AES or ERROR on a keyed link.
    #[error("plaintext {0} on an encrypted link")]
    Cleartext(String),

    /// Ciphertext length was not a whole number of cipher blocks.
    #[error("ciphertext length {0} is not a multiple of the block size")]
    BadBlockLength(usize),
}
