//! # Digital Signatures
//!
//! Ed25519 signatures over identity-owned data: the signed pre-key's public
//! bytes and every envelope's `AAD ‖ iv ‖ ciphertext`.
//!
//! Verification is total: malformed keys or signatures simply fail to
//! verify. Callers decide whether a failed signature is an error.

use ed25519_dalek::{Signature as Ed25519Signature, Signer, Verifier};

use crate::crypto::{PublicKey, SigningKeyPair};

/// Size of an Ed25519 signature in bytes
pub const SIGNATURE_SIZE: usize = 64;

/// Sign a message with the identity's Ed25519 key
///
/// Ed25519 is deterministic: the same key and message always produce the
/// same signature.
pub fn sign(keypair: &SigningKeyPair, message: &[u8]) -> Vec<u8> {
    keypair.signing_key().sign(message).to_bytes().to_vec()
}

/// Verify an Ed25519 signature against a public key
pub fn verify(public_key: &PublicKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(verifying_key) = public_key.verifying_key() else {
        return false;
    };
    let Ok(bytes) = <[u8; SIGNATURE_SIZE]>::try_from(signature) else {
        return false;
    };

    let sig = Ed25519Signature::from_bytes(&bytes);
    verifying_key.verify(message, &sig).is_ok()
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;

    #[test]
    fn test_sign_and_verify() {
        let keypair = KeyPair::generate();
        let message = b"X3DHv1 transcript";

        let signature = sign(&keypair.signing, message);
        assert_eq!(signature.len(), SIGNATURE_SIZE);
        assert!(verify(&keypair.public_keys(), message, &signature));
    }

    #[test]
    fn test_wrong_message_fails() {
        let keypair = KeyPair::generate();
        let signature = sign(&keypair.signing, b"original");

        assert!(!verify(&keypair.public_keys(), b"tampered", &signature));
    }

    #[test]
    fn test_wrong_key_fails() {
        let alice = KeyPair::generate();
        let bob = KeyPair::generate();
        let signature = sign(&alice.signing, b"hello");

        assert!(!verify(&bob.public_keys(), b"hello", &signature));
    }

    #[test]
    fn test_malformed_signature_is_false() {
        let keypair = KeyPair::generate();
        assert!(!verify(&keypair.public_keys(), b"hello", &[0u8; 10]));
    }

    #[test]
    fn test_deterministic_signatures() {
        let keypair = KeyPair::generate();
        assert_eq!(sign(&keypair.signing, b"same"), sign(&keypair.signing, b"same"));
    }
}
