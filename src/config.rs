//! Secret chat configuration.
//!
//! Defaults cover a desktop install; every field can be overridden from
//! environment variables via [`SecretChatConfig::from_env`] or deserialized
//! from the host application's own settings file.

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Default number of pending packets drained per receive tick.
pub const DEFAULT_PENDING_BATCH_LIMIT: usize = 10;

/// Default capacity of the per-chat processed-packet cache.
pub const DEFAULT_DEDUP_CAPACITY: usize = 1024;

/// Default number of one-time pre-keys generated per bundle.
pub const DEFAULT_ONE_TIME_PREKEYS: usize = 3;

/// Default background poll interval of a chat actor, in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 3000;

/// Name of the built-in crypto engine.
pub const DEFAULT_ENGINE: &str = "dalek";

/// Crypto provider selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CryptoConfig {
    /// Engine name looked up once at start-up.
    pub engine: String,
    /// Whether the primary (AES) cipher may be used for new ciphertexts.
    /// When disabled, encryption falls back to the secondary cipher.
    pub primary_cipher: bool,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            engine: DEFAULT_ENGINE.to_string(),
            primary_cipher: true,
        }
    }
}

/// Top-level configuration for secret chats.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SecretChatConfig {
    /// Base directory holding `pre-keys.json` and the per-chat folders.
    pub storage_root: PathBuf,
    /// Crypto engine settings.
    pub crypto: CryptoConfig,
    /// Pending packets pulled per receive tick.
    pub pending_batch_limit: usize,
    /// Processed-packet cache capacity per open chat.
    pub dedup_capacity: usize,
    /// One-time pre-keys generated with each new bundle.
    pub one_time_prekey_count: usize,
    /// Interval between background receive ticks; `0` disables polling.
    pub poll_interval_ms: u64,
}

impl Default for SecretChatConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("secret-chats"),
            crypto: CryptoConfig::default(),
            pending_batch_limit: DEFAULT_PENDING_BATCH_LIMIT,
            dedup_capacity: DEFAULT_DEDUP_CAPACITY,
            one_time_prekey_count: DEFAULT_ONE_TIME_PREKEYS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl SecretChatConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `SECRET_CHAT_STORAGE_ROOT` | `storage_root` |
    /// | `SECRET_CHAT_CRYPTO_ENGINE` | `crypto.engine` |
    /// | `SECRET_CHAT_PRIMARY_CIPHER` | `crypto.primary_cipher` |
    /// | `SECRET_CHAT_PENDING_BATCH` | `pending_batch_limit` |
    /// | `SECRET_CHAT_DEDUP_CAPACITY` | `dedup_capacity` |
    /// | `SECRET_CHAT_ONE_TIME_KEYS` | `one_time_prekey_count` |
    /// | `SECRET_CHAT_POLL_INTERVAL_MS` | `poll_interval_ms` |
    ///
    /// Unset or unparsable values keep their defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let parse_usize = |key: &str, fallback: usize| {
            lookup(key)
                .and_then(|v| v.trim().parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(fallback)
        };

        Self {
            storage_root: lookup("SECRET_CHAT_STORAGE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_root),
            crypto: CryptoConfig {
                engine: lookup("SECRET_CHAT_CRYPTO_ENGINE")
                    .unwrap_or(defaults.crypto.engine),
                primary_cipher: lookup("SECRET_CHAT_PRIMARY_CIPHER")
                    .map(|v| !matches!(v.trim().to_ascii_lowercase().as_str(), "0" | "false" | "off" | "no"))
                    .unwrap_or(defaults.crypto.primary_cipher),
            },
            pending_batch_limit: parse_usize("SECRET_CHAT_PENDING_BATCH", defaults.pending_batch_limit),
            dedup_capacity: parse_usize("SECRET_CHAT_DEDUP_CAPACITY", defaults.dedup_capacity),
            one_time_prekey_count: parse_usize("SECRET_CHAT_ONE_TIME_KEYS", defaults.one_time_prekey_count),
            poll_interval_ms: lookup("SECRET_CHAT_POLL_INTERVAL_MS")
                .and_then(|v| v.trim().parse::<u64>().ok())
                .unwrap_or(defaults.poll_interval_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SecretChatConfig::default();
        assert_eq!(config.pending_batch_limit, 10);
        assert_eq!(config.one_time_prekey_count, 3);
        assert_eq!(config.crypto.engine, "dalek");
        assert!(config.crypto.primary_cipher);
    }

    #[test]
    fn test_from_lookup_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SECRET_CHAT_STORAGE_ROOT", "/tmp/chats"),
            ("SECRET_CHAT_PRIMARY_CIPHER", "off"),
            ("SECRET_CHAT_PENDING_BATCH", "25"),
            ("SECRET_CHAT_DEDUP_CAPACITY", "not-a-number"),
            ("SECRET_CHAT_POLL_INTERVAL_MS", "0"),
        ]
        .into_iter()
        .collect();

        let config = SecretChatConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));

        assert_eq!(config.storage_root, PathBuf::from("/tmp/chats"));
        assert!(!config.crypto.primary_cipher);
        assert_eq!(config.pending_batch_limit, 25);
        assert_eq!(config.dedup_capacity, DEFAULT_DEDUP_CAPACITY);
        assert_eq!(config.poll_interval_ms, 0);
    }

    #[test]
    fn test_zero_batch_keeps_default() {
        let config = SecretChatConfig::from_lookup(|k| {
            (k == "SECRET_CHAT_PENDING_BATCH").then(|| "0".to_string())
        });
        assert_eq!(config.pending_batch_limit, DEFAULT_PENDING_BATCH_LIMIT);
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: SecretChatConfig =
            serde_json::from_str(r#"{"storageRoot":"/data","crypto":{"engine":"dalek"}}"#).unwrap();
        assert_eq!(config.storage_root, PathBuf::from("/data"));
        assert!(config.crypto.primary_cipher);
        assert_eq!(config.dedup_capacity, DEFAULT_DEDUP_CAPACITY);
    }
}
