//! 256-bit names for logs and servers
//!
//! Printable form is URL-safe base64 without padding (43 characters).
//! Parsing also accepts a 64-character hex string; anything else is taken
//! as a human-readable name and hashed with SHA-256.

use crate::{Error, Result};
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Length of a name in bytes
pub const NAME_LEN: usize = 32;

/// Length of the printable (base64) form
pub const PNAME_LEN: usize = 43;

/// Identity of a log or a log server
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GclName([u8; NAME_LEN]);

impl GclName {
    /// Wrap raw bytes
    pub const fn from_bytes(bytes: [u8; NAME_LEN]) -> Self {
        Self(bytes)
    }

    /// Derive a name from a human-readable string
    pub fn from_human(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        let mut bytes = [0u8; NAME_LEN];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Parse a printable, hex, or human-readable name
    pub fn parse(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidName("empty name".into()));
        }

        if s.len() == PNAME_LEN {
            if let Ok(decoded) = URL_SAFE_NO_PAD.decode(s) {
                if let Ok(bytes) = <[u8; NAME_LEN]>::try_from(decoded.as_slice()) {
                    return Ok(Self(bytes));
                }
            }
        }

        if s.len() == NAME_LEN * 2 {
            let mut bytes = [0u8; NAME_LEN];
            if hex::decode_to_slice(s, &mut bytes).is_ok() {
                return Ok(Self(bytes));
            }
        }

        Ok(Self::from_human(s))
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; NAME_LEN] {
        &self.0
    }

    /// Printable form
    pub fn printable(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0)
    }

    /// True unless every byte is zero
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl FromStr for GclName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for GclName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.printable())
    }
}

impl fmt::Debug for GclName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // first 8 printable chars are enough to tell servers apart in logs
        write!(f, "GclName({}..)", &self.printable()[..8])
    }
}
