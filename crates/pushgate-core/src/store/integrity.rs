//! Artifact digests: hex SHA-256 for identity of content, SRI strings
//! (`sha512-<base64>`) for clients that verify downloads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Hash algorithms accepted in SRI strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl HashAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha256" => Some(HashAlgorithm::Sha256),
            "sha384" => Some(HashAlgorithm::Sha384),
            "sha512" => Some(HashAlgorithm::Sha512),
            _ => None,
        }
    }

    /// Base64 digest of `content`.
    pub fn compute(&self, content: &[u8]) -> String {
        match self {
            HashAlgorithm::Sha256 => BASE64.encode(Sha256::digest(content)),
            HashAlgorithm::Sha384 => BASE64.encode(Sha384::digest(content)),
            HashAlgorithm::Sha512 => BASE64.encode(Sha512::digest(content)),
        }
    }
}

/// Parsed SRI integrity string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IntegrityHash {
    pub algorithm: HashAlgorithm,
    /// Base64 digest
    pub hash: String,
}

impl IntegrityHash {
    /// Parse `"<alg>-<base64>"`. Only the first of several space-separated values is used.
    pub fn parse(sri: &str) -> Option<Self> {
        let first = sri.split_whitespace().next()?;
        let (alg, hash) = first.split_once('-')?;
        if hash.is_empty() {
            return None;
        }
        Some(Self {
            algorithm: HashAlgorithm::from_name(alg)?,
            hash: hash.to_string(),
        })
    }

    pub fn verify(&self, content: &[u8]) -> bool {
        self.algorithm.compute(content) == self.hash
    }

    pub fn to_sri(&self) -> String {
        format!("{}-{}", self.algorithm.name(), self.hash)
    }
}

/// True if any of the space-separated SRI values matches `content`.
pub fn verify_integrity(content: &[u8], expected: &str) -> bool {
    expected
        .split_whitespace()
        .filter_map(IntegrityHash::parse)
        .any(|i| i.verify(content))
}

/// Hex SHA-256 of `content`.
pub fn sha256_hex(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

/// Incremental hasher fed while an upload streams to disk.
#[derive(Default)]
pub struct UploadDigest {
    sha256: Sha256,
    sha512: Sha512,
    size: u64,
}

impl UploadDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.sha256.update(chunk);
        self.sha512.update(chunk);
        self.size += chunk.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Returns `(sha256 hex, sha512 SRI, size)`.
    pub fn finish(self) -> (String, String, u64) {
        let sha256 = format!("{:x}", self.sha256.finalize());
        let sri = IntegrityHash {
            algorithm: HashAlgorithm::Sha512,
            hash: BASE64.encode(self.sha512.finalize()),
        };
        (sha256, sri.to_sri(), self.size)
    }
}
