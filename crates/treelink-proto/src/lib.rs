//! # treelink-proto
//!
//! Wire-level building blocks for the spanning-tree server-to-server
//! protocol spoken by `treelinkd`.
//!
//! ## Features
//!
//! - Line tokenizer and serializer ([`Message`]) with bit-exact
//!   `:prefix COMMAND param :trailing` framing
//! - Typed view over the server protocol commands ([`Command`])
//! - Channel and user mode-string parsing ([`mode`])
//! - RFC 1459 case mapping ([`casemap`]) and `*`/`?` mask matching
//! - Optional Tokio line codec tolerating CR, LF and CRLF terminators
//! - Pluggable per-link line transports, including the AES block/base64
//!   framing ([`transport`])
//!
//! ## Quick Start
//!
//! ```rust
//! use treelink_proto::{Command, Message};
//!
//! let msg: Message = ":hub.example.net SQUIT leaf.example.net :Ping timeout"
//!     .parse()
//!     .expect("valid line");
//! assert_eq!(msg.command, "SQUIT");
//!
//! let cmd = Command::parse(&msg).expect("well-formed SQUIT");
//! let back = cmd.to_message(msg.prefix.as_deref());
//! assert_eq!(back.to_string(), ":hub.example.net SQUIT leaf.example.net :Ping timeout");
//! ```

#![deny(clippy::all)]
#![warn(missing_docs)]

pub mod casemap;
#[cfg(feature = "tokio")]
pub mod codec;
pub mod command;
pub mod error;
pub mod message;
pub mod mode;
pub mod transport;
pub mod wildcard;

pub use self::casemap::{irc_eq, irc_lower_char, irc_to_lower};
#[cfg(feature = "tokio")]
pub use self::codec::LineCodec;
pub use self::command::{Command, NickIntro};
pub use self::error::{ProtocolError, Result};
pub use self::message::Message;
pub use self::mode::{ModeChange, ModeKind};
pub use self::transport::{AesTransport, LineTransport};
pub use self::wildcard::wildcard_match;
