//! Pluggable crypto engine.
//!
//! The engine is selected once at start-up with [`select_provider`] and
//! handed to every component as an `Arc<dyn CryptoProvider>`. There is no
//! global registry.

use std::sync::Arc;

use rand::RngCore;
use sha2::{Digest, Sha256};

use super::encryption::{self, CipherSuite};
use super::kdf::DIGEST_SIZE;
use super::{signing, KeyPair, PublicKey};
use crate::config::{CryptoConfig, DEFAULT_ENGINE};
use crate::error::{Error, Result};

/// Algorithm capability set used by the handshake and session codec
pub trait CryptoProvider: Send + Sync {
    /// Engine name, as written in configuration
    fn name(&self) -> &str;

    /// Generate a fresh key pair
    fn generate_keypair(&self) -> Result<KeyPair>;

    /// Sign `data` with the signing half of `signer`
    fn sign(&self, signer: &KeyPair, data: &[u8]) -> Vec<u8>;

    /// Verify a signature; malformed inputs yield `false`
    fn verify(&self, public: &PublicKey, data: &[u8], signature: &[u8]) -> bool;

    /// Raw Diffie-Hellman agreement
    fn agree(&self, own: &KeyPair, peer: &PublicKey) -> [u8; 32];

    /// Hash used by the KDF and fingerprints
    fn digest(&self, data: &[u8]) -> [u8; DIGEST_SIZE];

    /// Fill `buf` from a cryptographic RNG
    fn fill_random(&self, buf: &mut [u8]) -> Result<()>;

    /// Whether `suite` may be used by this engine
    fn cipher_available(&self, suite: CipherSuite) -> bool;

    /// Encrypt or decrypt `data` in place with `suite`
    fn apply_keystream(&self, suite: CipherSuite, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()>;
}

/// Ed25519 / X25519 / SHA-256 engine backed by the dalek and RustCrypto crates
#[derive(Debug, Clone)]
pub struct DalekProvider {
    primary_cipher: bool,
}

impl DalekProvider {
    /// Create the engine; `primary_cipher == false` disables AES-256-CTR
    pub fn new(primary_cipher: bool) -> Self {
        Self { primary_cipher }
    }
}

impl Default for DalekProvider {
    fn default() -> Self {
        Self::new(true)
    }
}

impl CryptoProvider for DalekProvider {
    fn name(&self) -> &str {
        DEFAULT_ENGINE
    }

    fn generate_keypair(&self) -> Result<KeyPair> {
        let mut seed = [0u8; 64];
        self.fill_random(&mut seed)?;
        let keypair = KeyPair::from_private_raw(&seed);
        zeroize::Zeroize::zeroize(&mut seed);
        keypair
    }

    fn sign(&self, signer: &KeyPair, data: &[u8]) -> Vec<u8> {
        signing::sign(&signer.signing, data)
    }

    fn verify(&self, public: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
        signing::verify(public, data, signature)
    }

    fn agree(&self, own: &KeyPair, peer: &PublicKey) -> [u8; 32] {
        own.encryption.diffie_hellman(&peer.encryption)
    }

    fn digest(&self, data: &[u8]) -> [u8; DIGEST_SIZE] {
        Sha256::digest(data).into()
    }

    fn fill_random(&self, buf: &mut [u8]) -> Result<()> {
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|e| Error::EngineUnavailable(format!("OS RNG failed: {}", e)))
    }

    fn cipher_available(&self, suite: CipherSuite) -> bool {
        match suite {
            CipherSuite::Aes256Ctr => self.primary_cipher,
            CipherSuite::ChaCha20 => true,
        }
    }

    fn apply_keystream(&self, suite: CipherSuite, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
        encryption::apply_keystream(suite, key, iv, data)
    }
}

/// Resolve the configured engine
///
/// Unknown engine names fail with `EngineUnavailable`.
pub fn select_provider(config: &CryptoConfig) -> Result<Arc<dyn CryptoProvider>> {
    match config.engine.as_str() {
        DEFAULT_ENGINE => {
            tracing::info!(
                engine = DEFAULT_ENGINE,
                primary_cipher = config.primary_cipher,
                "Crypto engine selected"
            );
            Ok(Arc::new(DalekProvider::new(config.primary_cipher)))
        }
        other => {
            tracing::warn!(engine = other, "Requested crypto engine is not available");
            Err(Error::EngineUnavailable(format!("Unknown crypto engine '{}'", other)))
        }
    }
}
