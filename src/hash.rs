use sha2::{Digest, Sha256};

/// Content digest used for duplicate detection.
pub type ContentDigest = [u8; 32];

pub fn content_digest(text: &str) -> ContentDigest {
    Sha256::digest(text.as_bytes()).into()
}
