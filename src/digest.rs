//! SHA-256 digest utilities for manifests and blobs.
//!
//! Every digest in the engine is a `sha256:<hex>` content identifier, over
//! the exact bytes of a blob or manifest document.

use sha2::Digest as _;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};

pub const EMPTY_LAYER_DIGEST: &str =
    "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// Compute the `sha256:<hex>` digest of an in-memory buffer.
pub fn compute(data: &[u8]) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(data);
    format!("sha256:{:x}", hasher.finalize())
}

/// Compute the `sha256:<hex>` digest of an async stream, without buffering
/// the whole thing in memory. Used to verify a completed blob file.
pub async fn compute_stream<R: AsyncRead + Unpin>(mut reader: R) -> Result<String> {
    let mut hasher = sha2::Sha256::new();
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }
    Ok(format!("sha256:{:x}", hasher.finalize()))
}

pub fn is_valid_sha256_hex(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

pub fn is_valid_digest(digest: &str) -> bool {
    digest
        .strip_prefix("sha256:")
        .is_some_and(is_valid_sha256_hex)
}

pub fn require_valid(digest: &str) -> Result<()> {
    if is_valid_digest(digest) {
        Ok(())
    } else {
        Err(Error::ProtocolViolation(format!("malformed digest: {digest}")))
    }
}

/// Verify that `data` hashes to `expected_digest`.
pub fn verify(data: &[u8], expected_digest: &str) -> Result<()> {
    let computed = compute(data);
    if computed != expected_digest {
        return Err(Error::ProtocolViolation(format!(
            "digest mismatch: expected {expected_digest}, computed {computed}"
        )));
    }
    Ok(())
}

/// Map a digest to a filesystem-portable file name: `:` and `/` become `_`.
pub fn safe_filename(digest: &str) -> String {
    digest.replace([':', '/'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_vector() {
        let digest = compute(b"hello world");
        assert_eq!(
            digest,
            "sha256:b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn empty_input_matches_empty_layer_digest() {
        assert_eq!(compute(b""), EMPTY_LAYER_DIGEST);
    }

    #[test]
    fn verify_rejects_mismatch() {
        let err = verify(b"hello world", EMPTY_LAYER_DIGEST).unwrap_err();
        assert_eq!(err.kind(), "ProtocolViolation");
    }

    #[test]
    fn safe_filename_replaces_colon_and_slash() {
        assert_eq!(
            safe_filename("sha256:abc/def"),
            "sha256_abc_def"
        );
    }

    #[tokio::test]
    async fn compute_stream_matches_compute() {
        let data = b"streamed content for digesting";
        let expected = compute(data);
        let actual = compute_stream(&data[..]).await.unwrap();
        assert_eq!(actual, expected);
    }
}
