//! Post-handshake message codec.
//!
//! Every message in a chat is encrypted under the same message key,
//! `KDF(session_key, info="MSG-KEYS", 64, no salt, "X3DH-MSG")[..32]`;
//! freshness comes from the random IV alone. Signatures cover
//! `"MSGv1" ‖ iv ‖ ct` and are made with the sender's identity key.

use crate::crypto::{KeyPair, Primitives, PublicKey, SessionKey};
use crate::envelope::{session_signed_bytes, SessionMsgEnvelope};
use crate::error::Result;
use crate::x3dh::message_key;

/// Plaintext recovered from a session envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Opened {
    /// Lossily decoded UTF-8 text
    pub plaintext: String,
    /// Whether the sender signature verified
    pub signature_ok: bool,
}

/// Encrypt and sign one message
pub fn encrypt_message(
    crypto: &Primitives,
    session_key: &SessionKey,
    plaintext: &str,
    signer: &KeyPair,
) -> Result<SessionMsgEnvelope> {
    let key = message_key(crypto, session_key, None)?;
    let sealed = crypto.encrypt(key.as_slice(), plaintext.as_bytes())?;
    let sig = crypto.sign(signer, &session_signed_bytes(&sealed.iv, &sealed.ciphertext));

    Ok(SessionMsgEnvelope {
        iv: sealed.iv,
        ct: sealed.ciphertext,
        sig,
    })
}

/// Verify and decrypt one message
///
/// Decryption runs whatever the signature outcome; callers must not show
/// text whose `signature_ok` is false.
pub fn decrypt_message(
    crypto: &Primitives,
    session_key: &SessionKey,
    envelope: &SessionMsgEnvelope,
    sender: &PublicKey,
) -> Result<Opened> {
    let signature_ok = crypto.verify(sender, &envelope.signed_bytes(), &envelope.sig);

    let key = message_key(crypto, session_key, None)?;
    let plaintext = crypto.decrypt(key.as_slice(), &envelope.iv, &envelope.ct)?;

    Ok(Opened {
        plaintext: String::from_utf8_lossy(&plaintext).into_owned(),
        signature_ok,
    })
}
