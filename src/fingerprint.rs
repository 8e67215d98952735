use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Canonical SHA256 fingerprint of a public key wire blob.
///
/// The blob is hashed as-is, independent of the key algorithm. An empty
/// blob yields an empty fingerprint, which every lookup rejects.
pub fn key_fingerprint(blob: &[u8]) -> String {
    if blob.is_empty() {
        return String::new();
    }

    let digest = Sha256::digest(blob);
    format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
}

#[cfg(test)]
mod tests {
    use rand::rngs::OsRng;
    use russh::keys::{Algorithm, HashAlg, PrivateKey, PublicKeyBase64};

    use super::key_fingerprint;

    #[test]
    fn empty_blob_yields_empty_fingerprint() {
        assert_eq!(key_fingerprint(b""), "");
    }

    #[test]
    fn fingerprint_is_prefixed_and_unpadded() {
        let fingerprint = key_fingerprint(b"some public key blob");
        assert!(fingerprint.starts_with("SHA256:"));
        assert!(!fingerprint.contains('='));
        // SHA256 digest is 32 bytes, 43 base64 characters without padding.
        assert_eq!(fingerprint.len(), "SHA256:".len() + 43);
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(key_fingerprint(b"blob"), key_fingerprint(b"blob"));
        assert_ne!(key_fingerprint(b"blob"), key_fingerprint(b"other blob"));
    }

    #[test]
    fn matches_openssh_fingerprint_of_real_key() {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        let blob = key.public_key_bytes();

        let expected = key.public_key().fingerprint(HashAlg::Sha256).to_string();
        assert_eq!(key_fingerprint(&blob), expected);
    }
}
