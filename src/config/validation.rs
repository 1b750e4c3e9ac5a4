//! Configuration validation.
//!
//! Validates configuration at startup and on rehash to catch mistakes that
//! would otherwise surface as handshake failures.

use super::Config;
use std::collections::HashSet;
use thiserror::Error;
use treelink_proto::irc_to_lower;

/// Validation errors for configuration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("server.name is required")]
    MissingServerName,
    #[error("server.name must contain a '.', got '{0}'")]
    InvalidServerName(String),
    #[error("link '{0}' is defined more than once")]
    DuplicateLink(String),
    #[error("link '{0}' has the same name as this server")]
    LinkToSelf(String),
    #[error("link '{name}' encryptionkey must be 16, 24 or 32 bytes, got {len}")]
    InvalidKeyLength { name: String, len: usize },
    #[error("bind {address} has unsupported type '{kind}'")]
    UnsupportedBindType { address: String, kind: String },
    #[error("protocol.max_modes must be at least 1")]
    ZeroMaxModes,
    #[error("protocol.line_budget ({budget}) must exceed protocol.nick_max ({nick_max})")]
    LineBudgetTooSmall { budget: usize, nick_max: usize },
}

/// Validate a configuration, returning all errors found.
pub fn validate(config: &Config) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    let name = &config.server.name;
    if name.is_empty() {
        errors.push(ValidationError::MissingServerName);
    } else if !name.contains('.') {
        errors.push(ValidationError::InvalidServerName(name.clone()));
    }

    let ours = irc_to_lower(name);
    let mut seen = HashSet::new();
    for link in &config.link {
        let key = irc_to_lower(&link.name);
        if key == ours {
            errors.push(ValidationError::LinkToSelf(link.name.clone()));
        }
        if !seen.insert(key) {
            errors.push(ValidationError::DuplicateLink(link.name.clone()));
        }
        if let Some(k) = link.key()
            && !matches!(k.len(), 16 | 24 | 32)
        {
            errors.push(ValidationError::InvalidKeyLength {
                name: link.name.clone(),
                len: k.len(),
            });
        }
    }

    for bind in &config.bind {
        if !bind.is_servers() {
            errors.push(ValidationError::UnsupportedBindType {
                address: bind.address.to_string(),
                kind: bind.kind.clone(),
            });
        }
    }

    if config.protocol.max_modes == 0 {
        errors.push(ValidationError::ZeroMaxModes);
    }
    if config.protocol.line_budget <= config.protocol.nick_max {
        errors.push(ValidationError::LineBudgetTooSmall {
            budget: config.protocol.line_budget,
            nick_max: config.protocol.nick_max,
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
