//! Line tokenizer and serializer.
//!
//! A line is `[:prefix] COMMAND [param ...] [:trailing]`. The serializer is
//! the interoperability contract: every line the daemon emits goes through
//! [`Message`]'s `Display` impl so the framing is identical everywhere.

use std::fmt;
use std::str::FromStr;

use crate::error::{ProtocolError, Result};

/// One protocol line, split into its fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Origin of the line (server name or nick), without the leading `:`.
    pub prefix: Option<String>,
    /// Command token, upper-cased on parse.
    pub command: String,
    /// Parameters in order. The trailing parameter, if any, is the last one.
    pub params: Vec<String>,
    /// Whether the last parameter is written in `:trailing` form.
    pub trailing: bool,
}

impl Message {
    /// Start a line with the given command and no parameters.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            prefix: None,
            command: command.into(),
            params: Vec::new(),
            trailing: false,
        }
    }

    /// Set the origin prefix.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    /// Set or clear the origin prefix.
    pub fn with_optional_prefix(mut self, prefix: Option<&str>) -> Self {
        self.prefix = prefix.map(str::to_string);
        self
    }

    /// Append a middle parameter.
    pub fn param(mut self, p: impl Into<String>) -> Self {
        self.params.push(p.into());
        self.trailing = false;
        self
    }

    /// Append several middle parameters.
    pub fn params<I, S>(mut self, ps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params.extend(ps.into_iter().map(Into::into));
        self.trailing = false;
        self
    }

    /// Append the trailing parameter. It is always written with a colon.
    pub fn trailing_param(mut self, p: impl Into<String>) -> Self {
        self.params.push(p.into());
        self.trailing = true;
        self
    }

    /// Parameter at `idx`.
    pub fn arg(&self, idx: usize) -> Option<&str> {
        self.params.get(idx).map(String::as_str)
    }

    /// Whether the command token equals `name` (ASCII case-insensitive).
    pub fn is(&self, name: &str) -> bool {
        self.command.eq_ignore_ascii_case(name)
    }
}

impl FromStr for Message {
    type Err = ProtocolError;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\r', '\n']);
        let mut rest = line.trim_start_matches(' ');
        if rest.is_empty() {
            return Err(ProtocolError::EmptyLine);
        }

        let prefix = if let Some(stripped) = rest.strip_prefix(':') {
            let (p, tail) = stripped
                .split_once(' ')
                .ok_or(ProtocolError::MissingCommand)?;
            rest = tail.trim_start_matches(' ');
            Some(p.to_string())
        } else {
            None
        };

        let (command, mut tail) = match rest.split_once(' ') {
            Some((c, t)) => (c, t),
            None => (rest, ""),
        };
        if command.is_empty() {
            return Err(ProtocolError::MissingCommand);
        }
        if !command.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(ProtocolError::InvalidCommand(command.to_string()));
        }

        let mut params = Vec::new();
        let mut trailing = false;
        loop {
            tail = tail.trim_start_matches(' ');
            if tail.is_empty() {
                break;
            }
            if let Some(t) = tail.strip_prefix(':') {
                params.push(t.to_string());
                trailing = true;
                break;
            }
            match tail.split_once(' ') {
                Some((p, t)) => {
                    params.push(p.to_string());
                    tail = t;
                }
                None => {
                    params.push(tail.to_string());
                    break;
                }
            }
        }

        Ok(Self {
            prefix,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        })
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(prefix) = &self.prefix {
            write!(f, ":{} ", prefix)?;
        }
        f.write_str(&self.command)?;
        let Some((last, middle)) = self.params.split_last() else {
            return Ok(());
        };
        for p in middle {
            write!(f, " {}", p)?;
        }
        if self.trailing || last.is_empty() || last.contains(' ') || last.starts_with(':') {
            write!(f, " :{}", last)
        } else {
            write!(f, " {}", last)
        }
    }
}
