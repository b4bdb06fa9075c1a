use sha2::{Digest, Sha256};
use std::path::Path;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, BufReader};

#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Chunk size for streaming hashes. Bounds memory regardless of artifact
/// size; model files run to hundreds of megabytes.
const HASH_CHUNK_SIZE: usize = 64 * 1024;

/// Compute the SHA-256 digest of a file as lowercase hex, streaming in
/// fixed-size chunks.
pub async fn sha256_sum(path: &Path) -> Result<String, IntegrityError> {
    let file = File::open(path).await?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected SHA-256 digest. Comparison is
/// case-insensitive so callers may supply uppercase hex.
pub async fn verify(path: &Path, expected: &str) -> Result<bool, IntegrityError> {
    let actual = sha256_sum(path).await?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let sum = sha256_sum(&path).await.unwrap();
        assert_eq!(
            sum,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn verify_accepts_uppercase_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        assert!(verify(
            &path,
            "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9"
        )
        .await
        .unwrap());
    }

    #[tokio::test]
    async fn verify_rejects_wrong_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        assert!(!verify(&path, &"0".repeat(64)).await.unwrap());
    }

    #[tokio::test]
    async fn hashing_spans_multiple_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("big.bin");
        // Three full chunks plus a tail.
        let data = vec![0xabu8; HASH_CHUNK_SIZE * 3 + 17];
        tokio::fs::write(&path, &data).await.unwrap();

        let mut hasher = Sha256::new();
        hasher.update(&data);
        let expected = format!("{:x}", hasher.finalize());
        assert_eq!(sha256_sum(&path).await.unwrap(), expected);
    }
}
