//! Content digests and the storage keys derived from them.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Prefix under which every blob is stored.
pub const BLOB_KEY_PREFIX: &str = "blobs/";

/// A SHA-256 digest of a file's full content, its content-addressed identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentDigest([u8; 32]);

impl ContentDigest {
    /// Create a new digest from raw bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Compute the SHA-256 digest of data.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Create an incremental hasher.
    pub fn hasher() -> DigestHasher {
        DigestHasher(Sha256::new())
    }

    /// Parse from a 64 character hex string (either case).
    pub fn from_hex(s: &str) -> crate::Result<Self> {
        if s.len() != 64 {
            return Err(crate::Error::InvalidDigest(format!(
                "expected 64 hex chars, got {}",
                s.len()
            )));
        }
        let mut bytes = [0u8; 32];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hex_str =
                std::str::from_utf8(pair).map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
            bytes[i] = u8::from_str_radix(hex_str, 16)
                .map_err(|e| crate::Error::InvalidDigest(e.to_string()))?;
        }
        Ok(Self(bytes))
    }

    /// Encode as lowercase hex string.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Object key under which the content is stored: `blobs/ab/cd/abcd...`.
    ///
    /// Two levels of fan-out keep filesystem directories small.
    pub fn storage_key(&self) -> String {
        let hex = self.to_hex();
        format!("{BLOB_KEY_PREFIX}{}/{}/{}", &hex[..2], &hex[2..4], hex)
    }

    /// Recover the digest from a storage key produced by [`storage_key`](Self::storage_key).
    ///
    /// Keys that do not follow the layout exactly are rejected, so foreign
    /// objects sharing the bucket are never mistaken for blobs.
    pub fn from_storage_key(key: &str) -> crate::Result<Self> {
        let rest = key
            .strip_prefix(BLOB_KEY_PREFIX)
            .ok_or_else(|| crate::Error::InvalidStorageKey(key.to_string()))?;
        let mut parts = rest.split('/');
        let (Some(a), Some(b), Some(hex), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(crate::Error::InvalidStorageKey(key.to_string()));
        };
        if hex.len() != 64 || !hex.bytes().all(|c| c.is_ascii_hexdigit()) {
            return Err(crate::Error::InvalidStorageKey(key.to_string()));
        }
        let hex = hex.to_ascii_lowercase();
        if a != &hex[..2] || b != &hex[2..4] {
            return Err(crate::Error::InvalidStorageKey(key.to_string()));
        }
        Self::from_hex(&hex)
    }
}

impl fmt::Debug for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentDigest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-256 hasher.
pub struct DigestHasher(Sha256);

impl DigestHasher {
    /// Update the hasher with data.
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finalize and return the digest.
    pub fn finalize(self) -> ContentDigest {
        ContentDigest(self.0.finalize().into())
    }
}
