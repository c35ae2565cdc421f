//! Integrity: SHA-256 digest carried with replicated file content, verified on receive.

use sha2::{Digest, Sha256};

/// Hash file content. Returns 32-byte digest.
pub fn digest(content: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hasher.finalize().into()
}

/// Verify content against the digest the primary computed.
pub fn verify(content: &[u8], expected: &[u8; 32]) -> bool {
    digest(content) == *expected
}
