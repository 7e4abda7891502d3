//! # Error Handling
//!
//! Error types for the secret chat core.
//!
//! ## Error Hierarchy
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           ERROR HIERARCHY                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  Error (top-level)                                                     │
//! │  │                                                                      │
//! │  ├── Engine Errors                                                     │
//! │  │   └── EngineUnavailable      - Crypto provider missing/disabled     │
//! │  │                                                                      │
//! │  ├── Crypto Errors                                                     │
//! │  │   ├── InvalidKeyEncoding     - Malformed raw/hex key material       │
//! │  │   ├── InvalidIv              - IV length matches no cipher          │
//! │  │   ├── EncryptionFailed       - Cipher setup or keystream failure    │
//! │  │   ├── DecryptionFailed       - Cipher setup or keystream failure    │
//! │  │   ├── KeyDerivationFailed    - KDF input/output out of range        │
//! │  │   └── SignatureVerification  - Peer signed pre-key rejected         │
//! │  │                                                                      │
//! │  ├── Chat Errors                                                       │
//! │  │   ├── MissingKeyMaterial     - No local bundle / no peer bundle     │
//! │  │   ├── RecipientUnresolved    - No single "other" chat member        │
//! │  │   ├── ChatNotFound           - No chat record on disk               │
//! │  │   └── EmptyMessage           - Nothing to send                      │
//! │  │                                                                      │
//! │  ├── Storage Errors                                                    │
//! │  │   ├── StorageReadError       - Failed to read chat files            │
//! │  │   ├── StorageWriteError      - Failed to write chat files           │
//! │  │   └── SerializationError     - JSON encode/decode failure           │
//! │  │                                                                      │
//! │  ├── Transport Errors                                                  │
//! │  │   └── TransportError         - Remote call failed                   │
//! │  │                                                                      │
//! │  └── Internal Errors                                                   │
//! │      ├── ActorClosed            - Chat actor task has stopped          │
//! │      └── Internal               - Should not happen                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Signature failures on *received* packets are not errors: they surface as
//! a `signature_ok == false` flag and the packet is dropped by the
//! orchestrator.

use thiserror::Error;

/// Result type alias for secret chat operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the secret chat core
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // Engine Errors (100-199)
    // ========================================================================

    /// The configured crypto provider is not available
    #[error("Crypto engine unavailable: {0}")]
    EngineUnavailable(String),

    // ========================================================================
    // Crypto Errors (200-299)
    // ========================================================================

    /// Raw or hex key material could not be imported
    #[error("Invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// IV length does not select any supported cipher
    #[error("Invalid IV length: {0} bytes")]
    InvalidIv(usize),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    /// Key derivation failed
    #[error("Failed to derive keys: {0}")]
    KeyDerivationFailed(String),

    /// A signature that must hold did not verify
    #[error("Signature verification failed: {0}")]
    SignatureVerificationFailed(String),

    // ========================================================================
    // Chat Errors (300-399)
    // ========================================================================

    /// Local or remote key material is missing or inconsistent
    #[error("Missing key material: {0}")]
    MissingKeyMaterial(String),

    /// The message recipient could not be determined from the chat members
    #[error("Recipient unresolved: {0}")]
    RecipientUnresolved(String),

    /// Chat record not found
    #[error("Secret chat not found: {0}")]
    ChatNotFound(String),

    /// Attempt to send an empty message
    #[error("Message text is empty")]
    EmptyMessage,

    // ========================================================================
    // Storage Errors (400-499)
    // ========================================================================

    /// Failed to read from storage
    #[error("Failed to read from storage: {0}")]
    StorageReadError(String),

    /// Failed to write to storage
    #[error("Failed to write to storage: {0}")]
    StorageWriteError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    // ========================================================================
    // Transport Errors (500-599)
    // ========================================================================

    /// Remote collaborator failed
    #[error("Transport error: {0}")]
    TransportError(String),

    // ========================================================================
    // Internal Errors (900-999)
    // ========================================================================

    /// The chat actor is no longer running
    #[error("Secret chat actor has stopped")]
    ActorClosed,

    /// Internal error (should not happen in normal operation)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Numeric error code, grouped by category:
    /// - 100-199: Engine
    /// - 200-299: Crypto
    /// - 300-399: Chat
    /// - 400-499: Storage
    /// - 500-599: Transport
    /// - 900-999: Internal
    pub fn code(&self) -> i32 {
        match self {
            Error::EngineUnavailable(_) => 100,

            Error::InvalidKeyEncoding(_) => 200,
            Error::InvalidIv(_) => 201,
            Error::EncryptionFailed(_) => 202,
            Error::DecryptionFailed(_) => 203,
            Error::KeyDerivationFailed(_) => 204,
            Error::SignatureVerificationFailed(_) => 205,

            Error::MissingKeyMaterial(_) => 300,
            Error::RecipientUnresolved(_) => 301,
            Error::ChatNotFound(_) => 302,
            Error::EmptyMessage => 303,

            Error::StorageReadError(_) => 400,
            Error::StorageWriteError(_) => 401,
            Error::SerializationError(_) => 402,

            Error::TransportError(_) => 500,

            Error::ActorClosed => 900,
            Error::Internal(_) => 901,
        }
    }

    /// Check if this error is recoverable
    ///
    /// Recoverable errors may go away on the next tick: the peer publishes
    /// a bundle, the disk frees up, the relay comes back.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingKeyMaterial(_)
                | Error::StorageReadError(_)
                | Error::StorageWriteError(_)
                | Error::TransportError(_)
        )
    }
}

// ============================================================================
// ERROR CONVERSIONS
// ============================================================================

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::StorageReadError(err.to_string())
    }
}

impl From<hex::FromHexError> for Error {
    fn from(err: hex::FromHexError) -> Self {
        Error::InvalidKeyEncoding(err.to_string())
    }
}

// ============================================================================
// TESTS
// ============================================================================
