//! # Key Derivation Functions
//!
//! ## Counter-mode KDF
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      COUNTER-MODE KDF                                   │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  context = salt ‖ info          (absent parts are empty)               │
//! │  L       = out_len * 8          (u32, big endian)                      │
//! │                                                                         │
//! │  block_i = H( i ‖ ikm ‖ label ‖ 0x00 ‖ context ‖ L )   i = 1, 2, ...   │
//! │                                                                         │
//! │  output  = (block_1 ‖ block_2 ‖ ...)[..out_len]                        │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Both peers must reproduce this byte-for-byte; it is the only thing that
//! turns the four X3DH agreements into a session key.
//!
//! ## Salted agreement
//!
//! Raw X25519 output is expanded with HKDF-SHA256 using the per-session salt
//! ("ukm"), so two sessions between the same static keys never share DH
//! output.

use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{Error, Result};

/// Output size of the digest driving the KDF
pub const DIGEST_SIZE: usize = 32;

/// Labels and info strings for domain separation
pub mod domain {
    /// Label used when the caller gives none
    pub const DEFAULT_LABEL: &[u8] = b"E2EE";

    /// Label for the X3DH session key
    pub const X3DH_LABEL: &[u8] = b"X3DH";

    /// Info for the X3DH session key
    pub const SESSION_INFO: &[u8] = b"X3DH-SESSION";

    /// Label for message keys derived from a session key
    pub const MESSAGE_LABEL: &[u8] = b"X3DH-MSG";

    /// Info for message keys derived from a session key
    pub const MESSAGE_KEYS_INFO: &[u8] = b"MSG-KEYS";

    /// HKDF info for salted agreement output
    pub const AGREEMENT_INFO: &[u8] = b"secret-chat-agreement-v1";
}

/// Counter-mode KDF over an arbitrary 32-byte digest
///
/// `digest` is supplied by the crypto provider so both ends hash with the
/// same engine.
pub fn counter_kdf<D>(
    digest: D,
    ikm: &[u8],
    info: Option<&[u8]>,
    out_len: usize,
    salt: Option<&[u8]>,
    label: Option<&[u8]>,
) -> Result<Vec<u8>>
where
    D: Fn(&[u8]) -> [u8; DIGEST_SIZE],
{
    let bits = out_len
        .checked_mul(8)
        .and_then(|b| u32::try_from(b).ok())
        .ok_or_else(|| Error::KeyDerivationFailed(format!("Output length {} too large", out_len)))?;

    let blocks = out_len.div_ceil(DIGEST_SIZE);
    u32::try_from(blocks)
        .map_err(|_| Error::KeyDerivationFailed("Counter overflow".into()))?;

    let label = label.unwrap_or(domain::DEFAULT_LABEL);
    let salt = salt.unwrap_or_default();
    let info = info.unwrap_or_default();

    let mut input = Vec::with_capacity(4 + ikm.len() + label.len() + 1 + salt.len() + info.len() + 4);
    let mut output = Vec::with_capacity(blocks * DIGEST_SIZE);

    for counter in 1..=blocks as u32 {
        input.clear();
        input.extend_from_slice(&counter.to_be_bytes());
        input.extend_from_slice(ikm);
        input.extend_from_slice(label);
        input.push(0x00);
        input.extend_from_slice(salt);
        input.extend_from_slice(info);
        input.extend_from_slice(&bits.to_be_bytes());

        output.extend_from_slice(&digest(&input));
    }

    output.truncate(out_len);
    Ok(output)
}

/// Expand a raw agreement output with the session salt
pub fn salted_agreement(dh_output: &[u8; 32], salt: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt), dh_output);

    let mut key = [0u8; 32];
    hkdf.expand(domain::AGREEMENT_INFO, &mut key)
        .map_err(|_| Error::KeyDerivationFailed("Failed to expand agreement".into()))?;

    Ok(key)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::Digest;

    fn sha256(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    #[test]
    fn test_single_block_layout() {
        let out = counter_kdf(sha256, b"ikm", Some(b"info"), 32, Some(b"salt"), None).unwrap();

        let mut expected_input = Vec::new();
        expected_input.extend_from_slice(&1u32.to_be_bytes());
        expected_input.extend_from_slice(b"ikm");
        expected_input.extend_from_slice(b"E2EE");
        expected_input.push(0);
        expected_input.extend_from_slice(b"saltinfo");
        expected_input.extend_from_slice(&256u32.to_be_bytes());

        assert_eq!(out, sha256(&expected_input).to_vec());
    }

    #[test]
    fn test_multi_block_truncation() {
        let long = counter_kdf(sha256, b"ikm", None, 64, None, Some(b"X3DH-MSG")).unwrap();
        let short = counter_kdf(sha256, b"ikm", None, 40, None, Some(b"X3DH-MSG")).unwrap();

        assert_eq!(long.len(), 64);
        assert_eq!(short.len(), 40);
        // L is part of every block, so a shorter request is not a prefix
        assert_ne!(&long[..32], &short[..32]);
    }

    #[test]
    fn test_deterministic() {
        let a = counter_kdf(sha256, b"secret", Some(b"X3DH-SESSION"), 32, Some(b"ukm"), Some(b"X3DH")).unwrap();
        let b = counter_kdf(sha256, b"secret", Some(b"X3DH-SESSION"), 32, Some(b"ukm"), Some(b"X3DH")).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_inputs_separate_outputs() {
        let base = counter_kdf(sha256, b"secret", Some(b"A"), 32, None, None).unwrap();
        let other_info = counter_kdf(sha256, b"secret", Some(b"B"), 32, None, None).unwrap();
        let other_label = counter_kdf(sha256, b"secret", Some(b"A"), 32, None, Some(b"L")).unwrap();
        let salted = counter_kdf(sha256, b"secret", Some(b"A"), 32, Some(b"s"), None).unwrap();

        assert_ne!(base, other_info);
        assert_ne!(base, other_label);
        assert_ne!(base, salted);
    }

    #[test]
    fn test_zero_length_output() {
        let out = counter_kdf(sha256, b"ikm", None, 0, None, None).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_oversized_output_rejected() {
        let err = counter_kdf(sha256, b"ikm", None, usize::MAX, None, None).unwrap_err();
        assert!(matches!(err, Error::KeyDerivationFailed(_)));
    }

    #[test]
    fn test_salted_agreement_depends_on_salt() {
        let dh = [9u8; 32];
        let a = salted_agreement(&dh, b"salt-one").unwrap();
        let b = salted_agreement(&dh, b"salt-two").unwrap();
        assert_ne!(a, b);
        assert_eq!(a, salted_agreement(&dh, b"salt-one").unwrap());
    }
}
