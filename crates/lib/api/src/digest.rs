//! Digest computation and rendering.

use std::fmt;

use prost::Message;
use sha2::{Digest as _, Sha256};

use crate::messages::Digest;

/// Digest of an Action blob; keys the action cache.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ActionKey(pub Digest);

impl ActionKey {
    pub fn digest(&self) -> &Digest {
        &self.0
    }
}

impl From<Digest> for ActionKey {
    fn from(digest: Digest) -> Self {
        ActionKey(digest)
    }
}

impl Digest {
    /// Stable key form, also the CAS file name stem: `<hash>_<size>`.
    pub fn to_key(&self) -> String {
        format!("{}_{}", self.hash, self.size_bytes)
    }

    /// Parse a `<hash>_<size>` key. Returns `None` for malformed input.
    pub fn parse_key(key: &str) -> Option<Digest> {
        let (hash, size) = key.rsplit_once('_')?;
        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let size_bytes = size.parse::<i64>().ok()?;
        if size_bytes < 0 {
            return None;
        }
        Some(Digest {
            hash: hash.to_ascii_lowercase(),
            size_bytes,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.hash, self.size_bytes)
    }
}

/// Computes content digests. One instance per process; the hash function is
/// part of the deployment contract.
#[derive(Clone, Copy, Debug, Default)]
pub struct DigestUtil;

impl DigestUtil {
    pub fn compute(&self, blob: &[u8]) -> Digest {
        let mut hasher = Sha256::new();
        hasher.update(blob);
        Digest {
            hash: hex::encode(hasher.finalize()),
            size_bytes: blob.len() as i64,
        }
    }

    pub fn compute_message<M: Message>(&self, message: &M) -> Digest {
        self.compute(&message.encode_to_vec())
    }

    pub fn empty(&self) -> Digest {
        self.compute(&[])
    }

    pub fn action_key(&self, action_digest: Digest) -> ActionKey {
        ActionKey(action_digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_sha256() {
        let digest = DigestUtil.compute(b"granary");
        assert_eq!(digest.size_bytes, 7);
        assert_eq!(digest.hash.len(), 64);
        assert_eq!(DigestUtil.compute(b"granary"), digest);
        assert_ne!(DigestUtil.compute(b"granaries"), digest);
    }

    #[test]
    fn key_round_trip() {
        let digest = DigestUtil.compute(b"contents");
        let parsed = Digest::parse_key(&digest.to_key()).expect("parse");
        assert_eq!(parsed, digest);
    }

    #[test]
    fn parse_key_rejects_malformed() {
        assert_eq!(Digest::parse_key("nounderscore"), None);
        assert_eq!(Digest::parse_key("abc_notasize"), None);
        assert_eq!(Digest::parse_key("zzzz_12"), None);
        assert_eq!(Digest::parse_key("_12"), None);
        assert_eq!(Digest::parse_key("ab12_-4"), None);
    }

    #[test]
    fn message_digest_tracks_encoding() {
        let directory = crate::messages::Directory::default();
        let digest = DigestUtil.compute_message(&directory);
        assert_eq!(digest, DigestUtil.compute(&[]));
    }
}
