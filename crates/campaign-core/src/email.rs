//! Email address normalization and the two content-addressed hashes used
//! as cross-tenant identity in the suppression hub and engagement layer
//! (§3, §4.2): a SHA-256 hash used going forward, and an MD5 hash kept
//! alongside it so suppression lists imported from legacy systems that
//! only ever recorded an MD5 continue to match.
use data_encoding::HEXLOWER;
use md5::{Digest, Md5};
use sha2::Sha256;

/// Lower-cases and trims an email address the way every hash and lookup
/// in this crate expects it to have been normalized.
pub fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct EmailHash {
    pub sha256_hex: [u8; 64],
    pub md5_hex: [u8; 32],
}

impl EmailHash {
    pub fn compute(email: &str) -> Self {
        let normalized = normalize(email);

        let sha256_digest = Sha256::digest(normalized.as_bytes());
        let mut sha256_hex = [0u8; 64];
        HEXLOWER.encode_mut(&sha256_digest, &mut sha256_hex);

        let md5_digest = Md5::digest(normalized.as_bytes());
        let mut md5_hex = [0u8; 32];
        HEXLOWER.encode_mut(&md5_digest, &mut md5_hex);

        Self {
            sha256_hex,
            md5_hex,
        }
    }

    pub fn sha256(&self) -> &str {
        std::str::from_utf8(&self.sha256_hex).expect("hex is always valid utf8")
    }

    pub fn md5(&self) -> &str {
        std::str::from_utf8(&self.md5_hex).expect("hex is always valid utf8")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn normalizes_before_hashing() {
        let a = EmailHash::compute("  User@Example.com ");
        let b = EmailHash::compute("user@example.com");
        assert_eq!(a.sha256(), b.sha256());
        assert_eq!(a.md5(), b.md5());
    }

    #[test]
    fn sha256_and_md5_differ() {
        let h = EmailHash::compute("user@example.com");
        assert_ne!(h.sha256(), h.md5());
        assert_eq!(h.sha256().len(), 64);
        assert_eq!(h.md5().len(), 32);
    }
}
