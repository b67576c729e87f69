//! Content digests
//!
//! Digests normally arrive with the work request. Inputs without one are
//! hashed here with BLAKE3, in parallel with Rayon.

use blake3::Hasher as Blake3Hasher;
use rayon::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs;
use std::path::PathBuf;

use crate::error::{BuildError, Result};

/// Opaque content hash of a file, rendered as lowercase hex
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Digest(Vec<u8>);

impl Digest {
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// BLAKE3 digest of `content`
    pub fn of(content: &[u8]) -> Self {
        Self(blake3::hash(content).as_bytes().to_vec())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Accepts either case; `to_hex` always renders lowercase
    pub fn from_hex(text: &str) -> Option<Self> {
        hex::decode(text).ok().map(Self)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex())
    }
}

impl Serialize for Digest {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Digest {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let hex = String::deserialize(deserializer)?;
        Digest::from_hex(&hex)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid digest: {hex}")))
    }
}

/// Hash files in parallel. Output order matches `paths`.
pub fn hash_files(paths: &[PathBuf]) -> Result<Vec<Digest>> {
    paths
        .par_iter()
        .map(|path| {
            fs::read(path)
                .map(|content| Digest::of(&content))
                .map_err(|e| BuildError::io(path, e))
        })
        .collect()
}

/// 64-bit digest over a sequence of parts, used for configuration digests.
/// Each part is length-prefixed so `["ab", "c"]` and `["a", "bc"]` differ.
pub fn digest64<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> u64 {
    let mut hasher = Blake3Hasher::new();
    for part in parts {
        hasher.update(&(part.len() as u64).to_le_bytes());
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    u64::from_le_bytes(prefix)
}
