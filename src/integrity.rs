// Content checksums - full-file digests streamed in fixed-size chunks

use crate::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

const CHUNK_SIZE: usize = 64 * 1024;

/// Digest algorithm used for artifact checksums
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// SHA-256, 64 hex characters
    #[default]
    Sha256,
    /// SHA-512, 128 hex characters
    Sha512,
}

impl ChecksumAlgorithm {
    /// Length of the hex-encoded digest
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Sha512 => 128,
        }
    }
}

async fn digest_file<D: Digest + Send>(path: &Path) -> Result<String> {
    let mut file = File::open(path).await?;
    let mut hasher = D::new();
    let mut buf = vec![0u8; CHUNK_SIZE];

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(to_hex(&hasher.finalize()))
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the hex digest of a whole file
pub async fn checksum_file(path: &Path, algorithm: ChecksumAlgorithm) -> Result<String> {
    match algorithm {
        ChecksumAlgorithm::Sha256 => digest_file::<Sha256>(path).await,
        ChecksumAlgorithm::Sha512 => digest_file::<Sha512>(path).await,
    }
}

/// SHA-256 of a whole file
pub async fn sha256_file(path: &Path) -> Result<String> {
    checksum_file(path, ChecksumAlgorithm::Sha256).await
}
