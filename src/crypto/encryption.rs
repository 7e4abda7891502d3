//! # Encryption Module
//!
//! Counter-mode symmetric encryption with two cipher suites.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        CIPHER SELECTION                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  encrypt:  primary available?  ── yes ──► AES-256-CTR   (16-byte IV)   │
//! │                                └─ no ───► ChaCha20      (12-byte IV)   │
//! │                                                                         │
//! │  decrypt:  iv.len() == 16 ──► AES-256-CTR                              │
//! │            iv.len() == 12 ──► ChaCha20                                 │
//! │            otherwise      ──► InvalidIv                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Neither suite authenticates: integrity comes from the identity signature
//! carried next to every ciphertext. Decrypting a tampered ciphertext yields
//! garbage, not an error.

use aes::Aes256;
use chacha20::ChaCha20;
use ctr::cipher::{KeyIvInit, StreamCipher};

use crate::error::{Error, Result};

/// Size of a symmetric key in bytes (256 bits)
pub const KEY_SIZE: usize = 32;

/// IV size of the primary cipher
pub const PRIMARY_IV_SIZE: usize = 16;

/// Nonce size of the secondary cipher
pub const SECONDARY_IV_SIZE: usize = 12;

type Aes256Ctr = ctr::Ctr128BE<Aes256>;

/// Symmetric cipher suites
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    /// AES-256 in 128-bit big-endian counter mode
    Aes256Ctr,
    /// ChaCha20 (IETF, 96-bit nonce)
    ChaCha20,
}

impl CipherSuite {
    /// IV length used by this suite
    pub fn iv_len(self) -> usize {
        match self {
            CipherSuite::Aes256Ctr => PRIMARY_IV_SIZE,
            CipherSuite::ChaCha20 => SECONDARY_IV_SIZE,
        }
    }

    /// Pick the suite a ciphertext was produced with from its IV length
    pub fn from_iv_len(len: usize) -> Result<Self> {
        match len {
            PRIMARY_IV_SIZE => Ok(CipherSuite::Aes256Ctr),
            SECONDARY_IV_SIZE => Ok(CipherSuite::ChaCha20),
            other => Err(Error::InvalidIv(other)),
        }
    }
}

/// XOR `data` in place with the keystream of `suite`
///
/// Encryption and decryption are the same operation.
pub fn apply_keystream(suite: CipherSuite, key: &[u8], iv: &[u8], data: &mut [u8]) -> Result<()> {
    if key.len() != KEY_SIZE {
        return Err(Error::InvalidKeyEncoding(format!(
            "Symmetric key must be {} bytes, got {}",
            KEY_SIZE,
            key.len()
        )));
    }
    if iv.len() != suite.iv_len() {
        return Err(Error::InvalidIv(iv.len()));
    }

    match suite {
        CipherSuite::Aes256Ctr => {
            let mut cipher = Aes256Ctr::new_from_slices(key, iv)
                .map_err(|e| Error::EncryptionFailed(format!("AES-CTR setup failed: {}", e)))?;
            cipher
                .try_apply_keystream(data)
                .map_err(|e| Error::EncryptionFailed(format!("AES-CTR keystream exhausted: {}", e)))
        }
        CipherSuite::ChaCha20 => {
            let mut cipher = ChaCha20::new_from_slices(key, iv)
                .map_err(|e| Error::EncryptionFailed(format!("ChaCha20 setup failed: {}", e)))?;
            cipher
                .try_apply_keystream(data)
                .map_err(|e| Error::EncryptionFailed(format!("ChaCha20 keystream exhausted: {}", e)))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
