//! Digest values and streaming hashers
//!
//! Artifacts are addressed by two digests: SHA-1 per piece and MD5 for the
//! whole file. Both are carried as opaque hex-comparable values.

use crate::error::{DownloadError, ProtocolErrorKind, Result};
use md5::{Digest as _, Md5};
use serde::{Deserialize, Serialize};
use sha1::Sha1;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    /// MD5 (128-bit), used for whole files
    Md5,
    /// SHA-1 (160-bit), used for pieces
    Sha1,
}

impl DigestAlgorithm {
    /// Digest length in bytes
    pub fn byte_len(self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
        }
    }
}

impl std::fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Md5 => write!(f, "MD5"),
            Self::Sha1 => write!(f, "SHA1"),
        }
    }
}

/// An immutable digest value with its algorithm tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Digest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl Digest {
    /// Parse a hex-encoded digest, validating its length against the algorithm
    pub fn from_hex(algorithm: DigestAlgorithm, hex_value: &str) -> Result<Self> {
        let bytes = hex::decode(hex_value.trim()).map_err(|e| {
            DownloadError::protocol(
                ProtocolErrorKind::InvalidMetadata,
                format!("bad {algorithm} digest '{hex_value}': {e}"),
            )
        })?;
        if bytes.len() != algorithm.byte_len() {
            return Err(DownloadError::protocol(
                ProtocolErrorKind::InvalidMetadata,
                format!(
                    "bad {algorithm} digest length: {} bytes, want {}",
                    bytes.len(),
                    algorithm.byte_len()
                ),
            ));
        }
        Ok(Self { algorithm, bytes })
    }

    pub(crate) fn from_bytes(algorithm: DigestAlgorithm, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), algorithm.byte_len());
        Self { algorithm, bytes }
    }

    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Compare against another digest; false when the algorithms differ
    pub fn matches(&self, other: &Digest) -> bool {
        self.algorithm == other.algorithm && self.bytes == other.bytes
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl std::fmt::Display for Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental hasher producing a [`Digest`]
pub struct DigestState {
    inner: HasherInner,
}

enum HasherInner {
    Md5(Md5),
    Sha1(Sha1),
}

impl DigestState {
    pub fn new(algorithm: DigestAlgorithm) -> Self {
        let inner = match algorithm {
            DigestAlgorithm::Md5 => HasherInner::Md5(Md5::new()),
            DigestAlgorithm::Sha1 => HasherInner::Sha1(Sha1::new()),
        };
        Self { inner }
    }

    pub fn update(&mut self, data: &[u8]) {
        match &mut self.inner {
            HasherInner::Md5(h) => h.update(data),
            HasherInner::Sha1(h) => h.update(data),
        }
    }

    pub fn finalize(self) -> Digest {
        match self.inner {
            HasherInner::Md5(h) => {
                Digest::from_bytes(DigestAlgorithm::Md5, h.finalize().to_vec())
            }
            HasherInner::Sha1(h) => {
                Digest::from_bytes(DigestAlgorithm::Sha1, h.finalize().to_vec())
            }
        }
    }
}

/// Hash a byte slice in one shot
pub fn digest_of(algorithm: DigestAlgorithm, data: &[u8]) -> Digest {
    let mut state = DigestState::new(algorithm);
    state.update(data);
    state.finalize()
}
