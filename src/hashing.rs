use std::{fmt, str::FromStr};

use anyhow::anyhow;
use sha2::{Digest, Sha256, Sha512};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha512,
    Md5,
    Blake3,
}

impl HashAlgorithm {
    pub fn as_str(self) -> &'static str {
        match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha512 => "sha512",
            HashAlgorithm::Md5 => "md5",
            HashAlgorithm::Blake3 => "blake3",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha512" => Ok(HashAlgorithm::Sha512),
            "md5" => Ok(HashAlgorithm::Md5),
            "blake3" => Ok(HashAlgorithm::Blake3),
            other => Err(anyhow!("unsupported hash algorithm '{other}'")),
        }
    }
}

/// Deterministic lowercase-hex digest of file contents.
#[derive(Clone, Copy, Debug, Default)]
pub struct ContentHasher {
    algorithm: HashAlgorithm,
}

impl ContentHasher {
    pub fn new(algorithm: HashAlgorithm) -> Self {
        Self { algorithm }
    }

    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    pub fn digest(&self, bytes: &[u8]) -> String {
        match self.algorithm {
            HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
            HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
            HashAlgorithm::Md5 => format!("{:x}", md5::compute(bytes)),
            HashAlgorithm::Blake3 => blake3::hash(bytes).to_hex().to_string(),
        }
    }
}
