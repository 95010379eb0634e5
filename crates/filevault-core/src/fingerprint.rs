//! Content fingerprinting.
//!
//! A [`Fingerprint`] is the lowercase hex SHA-256 of a byte sequence and is
//! the primary identity of stored content. Equal fingerprints are treated as
//! equal content; collisions are not handled specially.
//!
//! Hashing streams the input in [`HASH_BLOCK_BYTES`] blocks so large uploads
//! never need a second in-memory copy.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::io::{self, Read};

use crate::error::VaultError;

/// Read size used when hashing from a reader.
pub const HASH_BLOCK_BYTES: usize = 64 * 1024;

const HEX_LEN: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an in-memory byte slice.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        for block in bytes.chunks(HASH_BLOCK_BYTES) {
            hasher.update(block);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Fingerprint everything readable from `reader`.
    pub fn of_reader<R: Read>(mut reader: R) -> io::Result<Self> {
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; HASH_BLOCK_BYTES];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Self(format!("{:x}", hasher.finalize())))
    }

    /// Parse a stored hex fingerprint, rejecting anything that is not
    /// 64 lowercase hex digits.
    pub fn parse(hex: &str) -> Result<Self, VaultError> {
        let valid = hex.len() == HEX_LEN
            && hex
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(VaultError::Validation(format!(
                "malformed fingerprint: {:?}",
                hex
            )));
        }
        Ok(Self(hex.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Relative storage path, sharded on the first two byte pairs:
    /// `ab/cd/abcd…`.
    pub fn shard_path(&self) -> String {
        format!("{}/{}/{}", &self.0[0..2], &self.0[2..4], self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
