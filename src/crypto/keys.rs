//! # Key Management
//!
//! Key types shared by the handshake and the session codec.
//!
//! ## Key Types
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          KEY TYPES                                      │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  KeyPair = SigningKeyPair (Ed25519) + EncryptionKeyPair (X25519)       │
//! │                                                                         │
//! │  Every X3DH role (identity, signed pre-key, one-time pre-key,          │
//! │  ephemeral) is a full KeyPair. Only the identity key ever signs;       │
//! │  the other roles only use the X25519 half.                             │
//! │                                                                         │
//! │  Raw encodings                                                         │
//! │  ─────────────                                                          │
//! │  public  (64 bytes) = ed25519_public ‖ x25519_public                   │
//! │  private (64 bytes) = ed25519_seed   ‖ x25519_secret                   │
//! │                                                                         │
//! │  SessionKey (32 bytes)                                                 │
//! │  Output of the handshake KDF, persisted per chat.                      │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Length of a raw public key (signing ‖ encryption)
pub const PUBLIC_KEY_RAW_SIZE: usize = 64;

/// Length of a raw private key (signing seed ‖ encryption secret)
pub const PRIVATE_KEY_RAW_SIZE: usize = 64;

/// Length of a session key
pub const SESSION_KEY_SIZE: usize = 32;

/// Combined keypair containing both signing and encryption keys
///
/// Private halves are zeroized on drop.
#[derive(Clone, ZeroizeOnDrop)]
pub struct KeyPair {
    /// Ed25519 keypair for signing
    pub signing: SigningKeyPair,
    /// X25519 keypair for agreement
    pub encryption: EncryptionKeyPair,
}

impl KeyPair {
    /// Generate a new random keypair from the OS RNG
    pub fn generate() -> Self {
        Self {
            signing: SigningKeyPair::generate(),
            encryption: EncryptionKeyPair::generate(),
        }
    }

    /// Import a keypair from its 64-byte raw private encoding
    pub fn from_private_raw(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PRIVATE_KEY_RAW_SIZE {
            return Err(Error::InvalidKeyEncoding(format!(
                "Private key must be {} bytes, got {}",
                PRIVATE_KEY_RAW_SIZE,
                bytes.len()
            )));
        }

        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);

        let keypair = Self {
            signing: SigningKeyPair::from_bytes(&signing),
            encryption: EncryptionKeyPair::from_bytes(&encryption),
        };

        signing.zeroize();
        encryption.zeroize();
        Ok(keypair)
    }

    /// Export the 64-byte raw private encoding
    ///
    /// Only for local persistence. Never log or transmit these bytes.
    pub fn private_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PRIVATE_KEY_RAW_SIZE);
        out.extend_from_slice(&self.signing.secret_bytes());
        out.extend_from_slice(&self.encryption.secret_bytes());
        out
    }

    /// Get the public keys for sharing with others
    pub fn public_keys(&self) -> PublicKey {
        PublicKey {
            signing: self.signing.public_bytes(),
            encryption: self.encryption.public_bytes(),
        }
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_keys().to_hex())
            .finish_non_exhaustive()
    }
}

/// Ed25519 signing keypair
#[derive(Clone, ZeroizeOnDrop)]
pub struct SigningKeyPair {
    #[zeroize(skip)] // ed25519_dalek::SigningKey handles its own zeroization
    secret: SigningKey,
}

impl SigningKeyPair {
    /// Generate a new random signing keypair
    pub fn generate() -> Self {
        Self {
            secret: SigningKey::generate(&mut OsRng),
        }
    }

    /// Create from the 32-byte seed
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            secret: SigningKey::from_bytes(bytes),
        }
    }

    /// Get the secret seed bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.secret.verifying_key().to_bytes()
    }

    pub(crate) fn signing_key(&self) -> &SigningKey {
        &self.secret
    }
}

/// X25519 keypair for Diffie-Hellman agreement
#[derive(Clone, ZeroizeOnDrop)]
pub struct EncryptionKeyPair {
    #[zeroize(skip)] // x25519_dalek handles its own zeroization
    secret: StaticSecret,
    #[zeroize(skip)]
    public: X25519PublicKey,
}

impl EncryptionKeyPair {
    /// Generate a new random encryption keypair
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Create from raw secret bytes
    pub fn from_bytes(bytes: &[u8; 32]) -> Self {
        let secret = StaticSecret::from(*bytes);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Get the secret key bytes
    pub fn secret_bytes(&self) -> [u8; 32] {
        self.secret.to_bytes()
    }

    /// Get the public key bytes
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Raw X25519 agreement with a peer public key
    pub fn diffie_hellman(&self, their_public: &[u8; 32]) -> [u8; 32] {
        let their_public = X25519PublicKey::from(*their_public);
        self.secret.diffie_hellman(&their_public).to_bytes()
    }
}

/// Public keys that can be safely shared with others
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PublicKey {
    /// Ed25519 public key for signature verification (32 bytes)
    #[serde(with = "hex_bytes")]
    pub signing: [u8; 32],

    /// X25519 public key for agreement (32 bytes)
    #[serde(with = "hex_bytes")]
    pub encryption: [u8; 32],
}

impl PublicKey {
    /// Import from the 64-byte raw encoding
    ///
    /// Rejects wrong lengths and signing halves that are not valid
    /// Ed25519 points.
    pub fn from_raw(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PUBLIC_KEY_RAW_SIZE {
            return Err(Error::InvalidKeyEncoding(format!(
                "Public key must be {} bytes, got {}",
                PUBLIC_KEY_RAW_SIZE,
                bytes.len()
            )));
        }

        let mut signing = [0u8; 32];
        let mut encryption = [0u8; 32];
        signing.copy_from_slice(&bytes[..32]);
        encryption.copy_from_slice(&bytes[32..]);

        VerifyingKey::from_bytes(&signing)
            .map_err(|e| Error::InvalidKeyEncoding(format!("Invalid signing public key: {}", e)))?;

        Ok(Self { signing, encryption })
    }

    /// Export the 64-byte raw encoding
    pub fn to_raw(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(PUBLIC_KEY_RAW_SIZE);
        out.extend_from_slice(&self.signing);
        out.extend_from_slice(&self.encryption);
        out
    }

    /// Get the verifying key for signature verification
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        VerifyingKey::from_bytes(&self.signing)
            .map_err(|e| Error::InvalidKeyEncoding(format!("Invalid signing public key: {}", e)))
    }

    /// Encode as hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.to_raw())
    }

    /// Decode from hex string
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        Self::from_raw(&hex::decode(hex_str)?)
    }
}

/// Symmetric secret shared by both ends of an established chat
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_SIZE]);

impl SessionKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, rejecting any length but 32
    pub fn from_slice(slice: &[u8]) -> Result<Self> {
        let bytes: [u8; SESSION_KEY_SIZE] = slice.try_into().map_err(|_| {
            Error::InvalidKeyEncoding(format!(
                "Session key must be {} bytes, got {}",
                SESSION_KEY_SIZE,
                slice.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }

    /// Encode as hex (persistence only)
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Decode from hex
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        Self::from_slice(&hex::decode(hex_str)?)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Serde helper for serializing byte arrays as hex
pub(crate) mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        bytes.try_into().map_err(|_| serde::de::Error::custom("Invalid length"))
    }
}

/// Serde helper for variable-length byte strings encoded as hex
pub(crate) mod hex_vec {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        hex::decode(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// TESTS
// ============================================================================
