//! # Cryptography Module
//!
//! Primitive wrappers used by the X3DH handshake and the session codec.
//!
//! ## Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    CRYPTOGRAPHIC ARCHITECTURE                           │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │   SecretChatConfig.crypto                                              │
//! │            │                                                           │
//! │            ▼                                                           │
//! │   select_provider() ──► Arc<dyn CryptoProvider>                        │
//! │                                   │                                    │
//! │                                   ▼                                    │
//! │                           Primitives (facade)                          │
//! │   ┌──────────────┬──────────────┬───────────────┬──────────────────┐   │
//! │   │ key pairs    │ sign/verify  │ salted DH     │ counter-mode KDF │   │
//! │   │ raw import   │ Ed25519      │ X25519 + HKDF │ digest SHA-256   │   │
//! │   └──────────────┴──────────────┴───────────────┴──────────────────┘   │
//! │   ┌──────────────────────────────────────────────────────────────┐     │
//! │   │ encrypt / decrypt: AES-256-CTR, ChaCha20 fallback            │     │
//! │   └──────────────────────────────────────────────────────────────┘     │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Algorithm Choices
//!
//! | Algorithm | Purpose |
//! |-----------|---------|
//! | Ed25519 | Identity signatures over pre-keys and envelopes |
//! | X25519 | The four X3DH agreements |
//! | HKDF-SHA256 | Salting each agreement with the session "ukm" |
//! | SHA-256 counter KDF | Session key and message key derivation |
//! | AES-256-CTR / ChaCha20 | Payload encryption |
//!
//! All randomness comes from the provider (`OsRng` for the built-in engine).

mod encryption;
mod kdf;
mod keys;
mod provider;
mod signing;

use std::sync::Arc;

pub use encryption::{CipherSuite, KEY_SIZE, PRIMARY_IV_SIZE, SECONDARY_IV_SIZE};
pub use kdf::{domain, DIGEST_SIZE};
pub use keys::{
    EncryptionKeyPair, KeyPair, PublicKey, SessionKey, SigningKeyPair, PRIVATE_KEY_RAW_SIZE,
    PUBLIC_KEY_RAW_SIZE, SESSION_KEY_SIZE,
};
pub use provider::{select_provider, CryptoProvider, DalekProvider};
pub use signing::SIGNATURE_SIZE;

pub(crate) use keys::hex_vec;

use crate::error::{Error, Result};

/// A signed pre-key: fresh key pair plus the identity's signature over its
/// raw public bytes
#[derive(Debug, Clone)]
pub struct SignedPreKey {
    /// The pre-key pair
    pub keypair: KeyPair,
    /// Identity signature over `keypair.public_keys().to_raw()`
    pub signature: Vec<u8>,
}

/// Output of [`Primitives::encrypt`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    /// IV / nonce; its length identifies the cipher
    pub iv: Vec<u8>,
    /// Ciphertext, same length as the plaintext
    pub ciphertext: Vec<u8>,
}

/// Facade over the injected [`CryptoProvider`]
///
/// Cheap to clone; every clone shares the same engine.
#[derive(Clone)]
pub struct Primitives {
    provider: Arc<dyn CryptoProvider>,
}

impl std::fmt::Debug for Primitives {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Primitives")
            .field("engine", &self.provider.name())
            .finish()
    }
}

impl Primitives {
    /// Wrap an already selected provider
    pub fn new(provider: Arc<dyn CryptoProvider>) -> Self {
        Self { provider }
    }

    /// The underlying engine
    pub fn provider(&self) -> &Arc<dyn CryptoProvider> {
        &self.provider
    }

    // ------------------------------------------------------------------------
    // Keys
    // ------------------------------------------------------------------------

    /// Generate a long-term identity key pair
    pub fn generate_identity_keypair(&self) -> Result<KeyPair> {
        self.provider.generate_keypair()
    }

    /// Generate a signed pre-key authenticated by `identity`
    pub fn generate_signed_prekey(&self, identity: &KeyPair) -> Result<SignedPreKey> {
        let keypair = self.provider.generate_keypair()?;
        let signature = self.sign(identity, &keypair.public_keys().to_raw());
        Ok(SignedPreKey { keypair, signature })
    }

    /// Generate `count` one-time pre-keys
    pub fn generate_one_time_prekeys(&self, count: usize) -> Result<Vec<KeyPair>> {
        (0..count).map(|_| self.provider.generate_keypair()).collect()
    }

    /// Import a public key from its raw encoding
    pub fn import_public_raw(&self, bytes: &[u8]) -> Result<PublicKey> {
        PublicKey::from_raw(bytes)
    }

    /// Import a key pair from its raw private encoding
    pub fn import_private_raw(&self, bytes: &[u8]) -> Result<KeyPair> {
        KeyPair::from_private_raw(bytes)
    }

    // ------------------------------------------------------------------------
    // Signatures
    // ------------------------------------------------------------------------

    /// Sign `data` with the identity key
    pub fn sign(&self, signer: &KeyPair, data: &[u8]) -> Vec<u8> {
        self.provider.sign(signer, data)
    }

    /// Verify a signature; never errors
    pub fn verify(&self, public: &PublicKey, data: &[u8], signature: &[u8]) -> bool {
        self.provider.verify(public, data, signature)
    }

    // ------------------------------------------------------------------------
    // Derivation
    // ------------------------------------------------------------------------

    /// Salted Diffie-Hellman: `derive(a, B, s) == derive(b, A, s)`
    pub fn derive_shared_secret(&self, own: &KeyPair, peer_public_raw: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
        let peer = self.import_public_raw(peer_public_raw)?;
        let raw = self.provider.agree(own, &peer);
        kdf::salted_agreement(&raw, salt)
    }

    /// Counter-mode KDF (see [`domain`] for the labels in use)
    pub fn kdf(
        &self,
        ikm: &[u8],
        info: Option<&[u8]>,
        out_len: usize,
        salt: Option<&[u8]>,
        label: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        kdf::counter_kdf(|data| self.provider.digest(data), ikm, info, out_len, salt, label)
    }

    /// Hash arbitrary data
    pub fn digest(&self, data: &[u8]) -> [u8; DIGEST_SIZE] {
        self.provider.digest(data)
    }

    /// Draw `len` random bytes
    pub fn random_bytes(&self, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.provider.fill_random(&mut out)?;
        Ok(out)
    }

    // ------------------------------------------------------------------------
    // Symmetric encryption
    // ------------------------------------------------------------------------

    /// Encrypt with the primary cipher, or the secondary one when the
    /// primary is unavailable in this engine
    pub fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Sealed> {
        let suite = if self.provider.cipher_available(CipherSuite::Aes256Ctr) {
            CipherSuite::Aes256Ctr
        } else if self.provider.cipher_available(CipherSuite::ChaCha20) {
            tracing::debug!("Primary cipher unavailable, using ChaCha20");
            CipherSuite::ChaCha20
        } else {
            return Err(Error::EngineUnavailable("No symmetric cipher available".into()));
        };

        let iv = self.random_bytes(suite.iv_len())?;
        let mut ciphertext = plaintext.to_vec();
        self.provider.apply_keystream(suite, key, &iv, &mut ciphertext)?;

        Ok(Sealed { iv, ciphertext })
    }

    /// Decrypt, choosing the cipher from the IV length
    pub fn decrypt(&self, key: &[u8], iv: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let suite = CipherSuite::from_iv_len(iv.len())?;
        if !self.provider.cipher_available(suite) {
            return Err(Error::EngineUnavailable(format!("{:?} is not available", suite)));
        }

        let mut plaintext = ciphertext.to_vec();
        self.provider
            .apply_keystream(suite, key, iv, &mut plaintext)
            .map_err(|e| match e {
                Error::EncryptionFailed(msg) => Error::DecryptionFailed(msg),
                other => other,
            })?;
        Ok(plaintext)
    }
}

// ============================================================================
// TESTS
// ============================================================================
