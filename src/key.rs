//! Canonical block keys.
//!
//! Census sources carry block identifiers in two shapes: the P.L. geo-header
//! prefixes them with a summary-level/component carrier (`7500000US`), while
//! TIGER shapefiles store the bare 15-digit GEOID. Both normalize to the same
//! canonical key, which is what geometry and population are joined on.

use thiserror::Error;

/// Carrier prefix on block GEOIDs in the 2020 P.L. 94-171 geo-header.
pub const DEFAULT_KEY_PREFIX: &str = "7500000US";

/// Digits in a block GEOID: state (2) + county (3) + tract (6) + block (4).
pub const BLOCK_KEY_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum KeyError {
    #[error("identifier '{raw}' does not start with prefix '{prefix}'")]
    PrefixMismatch { raw: String, prefix: String },

    #[error("'{key}' is not a {expected_len}-digit block key")]
    Malformed { key: String, expected_len: usize },
}

/// Turns raw identifiers into canonical keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyNormalizer {
    prefix: String,
    key_len: usize,
}

impl Default for KeyNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_PREFIX)
    }
}

impl KeyNormalizer {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            key_len: BLOCK_KEY_LEN,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Strip the carrier prefix, which must be present verbatim.
    pub fn strip_prefix<'a>(&self, raw: &'a str) -> Result<&'a str, KeyError> {
        let key = raw
            .trim()
            .strip_prefix(self.prefix.as_str())
            .ok_or_else(|| KeyError::PrefixMismatch {
                raw: raw.to_string(),
                prefix: self.prefix.clone(),
            })?;
        self.check_shape(key)
    }

    /// Accept either a prefixed identifier or an already canonical key.
    ///
    /// Anything else is rejected as malformed.
    pub fn canonical<'a>(&self, raw: &'a str) -> Result<&'a str, KeyError> {
        let raw = raw.trim();
        match raw.strip_prefix(self.prefix.as_str()) {
            Some(key) => self.check_shape(key),
            None => self.check_shape(raw),
        }
    }

    fn check_shape<'a>(&self, key: &'a str) -> Result<&'a str, KeyError> {
        if key.len() == self.key_len && key.bytes().all(|b| b.is_ascii_digit()) {
            Ok(key)
        } else {
            Err(KeyError::Malformed {
                key: key.to_string(),
                expected_len: self.key_len,
            })
        }
    }
}
