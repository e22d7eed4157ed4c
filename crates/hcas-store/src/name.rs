//! Content-addressed object names.
//!
//! A [`Name`] is the 32-byte SHA-256 digest of an object's dependency list
//! and content: a 4-byte big-endian dependency count, each dependency's raw
//! bytes in ascending byte order, then the content bytes.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::StoreError;

/// 32-byte content identifier for a stored object.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name([u8; 32]);

impl Name {
    pub const LEN: usize = 32;

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw: [u8; 32] = bytes.try_into().map_err(|_| StoreError::InvalidName)?;
        Ok(Name(raw))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase 64-character hex form.
    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{:02x}", b)).collect()
    }

    /// Parse a lowercase 64-character hex string.
    pub fn from_hex(hex: &str) -> Result<Self, StoreError> {
        if hex.len() != 64 {
            return Err(StoreError::InvalidName);
        }
        let mut raw = [0u8; 32];
        for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
            raw[i] = hex_nibble(chunk[0])? << 4 | hex_nibble(chunk[1])?;
        }
        Ok(Name(raw))
    }

    /// Compute the name of a fully buffered object.
    pub fn compute(data: &[u8], deps: &[Name]) -> Self {
        let mut sorted = deps.to_vec();
        sorted.sort();
        let mut hasher = NameHasher::new(&sorted);
        hasher.update(data);
        hasher.finalize()
    }
}

fn hex_nibble(ch: u8) -> Result<u8, StoreError> {
    match ch {
        b'0'..=b'9' => Ok(ch - b'0'),
        b'a'..=b'f' => Ok(ch - b'a' + 10),
        _ => Err(StoreError::InvalidName),
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self.to_hex())
    }
}

/// Incremental name computation for streamed content.
///
/// The dependency list must already be sorted ascending; the writer owns
/// that canonicalisation.
pub struct NameHasher {
    inner: Sha256,
}

impl NameHasher {
    pub fn new(sorted_deps: &[Name]) -> Self {
        let mut inner = Sha256::new();
        inner.update((sorted_deps.len() as u32).to_be_bytes());
        for dep in sorted_deps {
            inner.update(dep.as_bytes());
        }
        NameHasher { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> Name {
        Name(self.inner.finalize().into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let name = Name::compute(b"test data", &[]);
        let hex = name.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(Name::from_hex(&hex).unwrap(), name);
    }

    #[test]
    fn from_hex_rejects_bad_input() {
        assert!(matches!(Name::from_hex("abc"), Err(StoreError::InvalidName)));
        let upper = "A".repeat(64);
        assert!(matches!(Name::from_hex(&upper), Err(StoreError::InvalidName)));
        let bad = "zz".repeat(32);
        assert!(matches!(Name::from_hex(&bad), Err(StoreError::InvalidName)));
    }

    #[test]
    fn dependency_order_is_canonical() {
        let a = Name::compute(b"a", &[]);
        let b = Name::compute(b"b", &[]);
        assert_eq!(
            Name::compute(b"parent", &[a, b]),
            Name::compute(b"parent", &[b, a]),
        );
    }

    #[test]
    fn dependencies_change_the_name() {
        let dep = Name::compute(b"dep", &[]);
        assert_ne!(Name::compute(b"data", &[]), Name::compute(b"data", &[dep]));
    }

    #[test]
    fn duplicate_dependencies_are_counted() {
        let dep = Name::compute(b"dep", &[]);
        assert_ne!(
            Name::compute(b"data", &[dep]),
            Name::compute(b"data", &[dep, dep]),
        );
    }

    #[test]
    fn streaming_matches_buffered() {
        let dep = Name::compute(b"dep", &[]);
        let mut hasher = NameHasher::new(&[dep]);
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.finalize(), Name::compute(b"hello world", &[dep]));
    }
}
