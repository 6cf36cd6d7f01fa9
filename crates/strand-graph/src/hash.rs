//! One-way hashed props.
//!
//! A `hash` prop stores a base64 ed25519 signature over the BLAKE3 digest of
//! a secret. Matching a candidate plaintext re-digests it and verifies the
//! signature with a named public key, so the secret is never stored or
//! compared directly.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// BLAKE3 digest of a plaintext secret.
pub fn digest(plaintext: &str) -> blake3::Hash {
    blake3::hash(plaintext.as_bytes())
}

/// Produce the stored value for a `hash` prop from a 32-byte signing seed.
pub fn sign(secret_key: &[u8; 32], plaintext: &str) -> String {
    let signing = SigningKey::from_bytes(secret_key);
    let signature = signing.sign(digest(plaintext).as_bytes());
    STANDARD.encode(signature.to_bytes())
}

/// Base64 public key matching a 32-byte signing seed.
pub fn public_key(secret_key: &[u8; 32]) -> String {
    STANDARD.encode(SigningKey::from_bytes(secret_key).verifying_key().to_bytes())
}

/// Whether `signature_b64` is a valid signature over `digest(plaintext)`.
///
/// Malformed keys or signatures verify as false.
pub fn verify(public_key_b64: &str, signature_b64: &str, plaintext: &str) -> bool {
    let Some(key) = decode_fixed::<32>(public_key_b64) else {
        return false;
    };
    let Ok(key) = VerifyingKey::from_bytes(&key) else {
        return false;
    };
    let Some(signature) = decode_fixed::<64>(signature_b64) else {
        return false;
    };
    let signature = Signature::from_bytes(&signature);

    key.verify(digest(plaintext).as_bytes(), &signature).is_ok()
}

fn decode_fixed<const N: usize>(b64: &str) -> Option<[u8; N]> {
    STANDARD.decode(b64).ok()?.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEED: [u8; 32] = [7u8; 32];

    #[test]
    fn signature_round_trip() {
        let stored = sign(&SEED, "hunter2");
        let key = public_key(&SEED);
        assert!(verify(&key, &stored, "hunter2"));
        assert!(!verify(&key, &stored, "hunter3"));
    }

    #[test]
    fn wrong_key_fails() {
        let stored = sign(&SEED, "hunter2");
        let other = public_key(&[9u8; 32]);
        assert!(!verify(&other, &stored, "hunter2"));
    }

    #[test]
    fn malformed_inputs_fail_closed() {
        let key = public_key(&SEED);
        assert!(!verify(&key, "not base64!", "x"));
        assert!(!verify("AAAA", &sign(&SEED, "x"), "x"));
        assert!(!verify(&key, &STANDARD.encode([0u8; 10]), "x"));
    }

    #[test]
    fn digest_is_deterministic() {
        assert_eq!(digest("abc"), digest("abc"));
        assert_ne!(digest("abc"), digest("abd"));
    }
}
