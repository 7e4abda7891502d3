//! # X3DH Handshake
//!
//! Offline key agreement between an initiator (Alice) and a responder (Bob)
//! who has published a pre-key bundle.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         X3DH AGREEMENTS                                 │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │        Alice (initiator)                     Bob (responder)            │
//! │        ─────────────────                     ───────────────            │
//! │  DH1 = IK_A  × SPK_B                  =  SPK_B × IK_A                   │
//! │  DH2 = EK_A  × IK_B                   =  IK_B  × EK_A                   │
//! │  DH3 = EK_A  × SPK_B                  =  SPK_B × EK_A                   │
//! │  DH4 = EK_A  × OPK_B   (or empty)     =  OPK_B × EK_A                   │
//! │                                                                         │
//! │  every DH is salted with the session "ukm" (8 random bytes)            │
//! │                                                                         │
//! │  SK  = KDF(DH1‖DH2‖DH3‖DH4, info="X3DH-SESSION", 32, ukm, "X3DH")      │
//! │  MK  = KDF(SK, info="MSG-KEYS", 64, ukm, "X3DH-MSG")[..32]             │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Neither side aborts here. [`establish_session`] and [`build_init_envelope`]
//! report whether the responder's signed pre-key verified in
//! `peer_signature_valid`, and callers must not send when it is `false`; the
//! orchestrator refuses. The responder always decrypts and reports
//! `signature_ok`; the orchestrator drops the packet when it is false.

mod bundle;

pub use bundle::{
    bundle_fingerprint, generate_prekey_bundle, LocalBundle, OneTimePrivate, OneTimePublic,
    PeerBundle, PublishedBundle,
};
pub(crate) use bundle::ensure_owner;

use zeroize::Zeroizing;

use crate::crypto::{domain, KeyPair, Primitives, SessionKey, KEY_SIZE, SESSION_KEY_SIZE};
use crate::envelope::{init_signed_bytes, InitEnvelope};
use crate::error::{Error, Result};

/// Length of the per-session salt
pub const UKM_SIZE: usize = 8;

/// Output of [`establish_session`]
#[derive(Debug, Clone)]
pub struct EstablishedSession {
    /// Derived session key
    pub session_key: SessionKey,
    /// Salt actually used
    pub salt: Vec<u8>,
    /// Whether the peer's signed pre-key verified
    pub peer_signature_valid: bool,
}

/// Output of [`build_init_envelope`]
#[derive(Debug, Clone)]
pub struct InitOutcome {
    /// Envelope to deliver to the responder
    pub envelope: InitEnvelope,
    /// Session key to persist locally
    pub session_key: SessionKey,
    /// Whether the peer's signed pre-key verified
    pub peer_signature_valid: bool,
}

/// Output of [`finalize_from_envelope`]
#[derive(Debug, Clone)]
pub struct Finalized {
    /// Session key derived by the responder
    pub session_key: SessionKey,
    /// Whether the initiator's envelope signature verified
    pub signature_ok: bool,
    /// First message, lossily decoded as UTF-8
    pub plaintext: String,
}

/// Initiator side: derive the session key against a peer bundle
pub fn establish_session(
    crypto: &Primitives,
    identity: &KeyPair,
    ephemeral: &KeyPair,
    peer: &PeerBundle,
    salt: Option<&[u8]>,
) -> Result<EstablishedSession> {
    let salt = match salt {
        Some(salt) => salt.to_vec(),
        None => crypto.random_bytes(UKM_SIZE)?,
    };

    let peer_signature_valid = crypto.verify(
        &peer.identity,
        &peer.signed_prekey.to_raw(),
        &peer.signed_prekey_sig,
    );
    if !peer_signature_valid {
        tracing::warn!("Peer signed pre-key failed verification");
    }

    let spk_raw = peer.signed_prekey.to_raw();
    let dh1 = crypto.derive_shared_secret(identity, &spk_raw, &salt)?;
    let dh2 = crypto.derive_shared_secret(ephemeral, &peer.identity.to_raw(), &salt)?;
    let dh3 = crypto.derive_shared_secret(ephemeral, &spk_raw, &salt)?;
    let dh4 = peer
        .one_time
        .as_ref()
        .map(|(_, opk)| crypto.derive_shared_secret(ephemeral, &opk.to_raw(), &salt))
        .transpose()?;

    let session_key = session_key_from_agreements(crypto, [dh1, dh2, dh3], dh4, &salt)?;

    Ok(EstablishedSession {
        session_key,
        salt,
        peer_signature_valid,
    })
}

/// Initiator side: derive the session key and encrypt the first message
pub fn build_init_envelope(
    crypto: &Primitives,
    identity: &KeyPair,
    peer: &PeerBundle,
    plaintext: &str,
    salt: Option<&[u8]>,
) -> Result<InitOutcome> {
    let ephemeral = crypto.generate_identity_keypair()?;
    let established = establish_session(crypto, identity, &ephemeral, peer, salt)?;

    let message_key = message_key(crypto, &established.session_key, Some(&established.salt))?;
    let sealed = crypto.encrypt(message_key.as_slice(), plaintext.as_bytes())?;

    let ik_a_pub = identity.public_keys().to_raw();
    let ek_a_pub = ephemeral.public_keys().to_raw();
    let sig = crypto.sign(
        identity,
        &init_signed_bytes(&ik_a_pub, &ek_a_pub, &sealed.iv, &sealed.ciphertext),
    );

    Ok(InitOutcome {
        envelope: InitEnvelope {
            ik_a_pub,
            ek_a_pub,
            used_opk: peer.one_time.as_ref().map(|(id, _)| id.clone()),
            ukm: established.salt,
            iv: sealed.iv,
            ct: sealed.ciphertext,
            sig,
        },
        session_key: established.session_key,
        peer_signature_valid: established.peer_signature_valid,
    })
}

/// Responder side: recompute the session key and decrypt the first message
///
/// Deterministic in its inputs, so finalizing the same envelope twice
/// yields the same key.
pub fn finalize_from_envelope(
    crypto: &Primitives,
    identity: &KeyPair,
    signed_prekey: &KeyPair,
    one_time: Option<&KeyPair>,
    envelope: &InitEnvelope,
) -> Result<Finalized> {
    if envelope.used_opk.is_some() && one_time.is_none() {
        return Err(Error::MissingKeyMaterial(format!(
            "One-time pre-key {:?} is not in the local bundle",
            envelope.used_opk
        )));
    }

    let salt = envelope.ukm.as_slice();
    let dh1 = crypto.derive_shared_secret(signed_prekey, &envelope.ik_a_pub, salt)?;
    let dh2 = crypto.derive_shared_secret(identity, &envelope.ek_a_pub, salt)?;
    let dh3 = crypto.derive_shared_secret(signed_prekey, &envelope.ek_a_pub, salt)?;
    let dh4 = match (envelope.used_opk.as_ref(), one_time) {
        (Some(_), Some(opk)) => Some(crypto.derive_shared_secret(opk, &envelope.ek_a_pub, salt)?),
        _ => None,
    };

    let session_key = session_key_from_agreements(crypto, [dh1, dh2, dh3], dh4, salt)?;

    let initiator = crypto.import_public_raw(&envelope.ik_a_pub)?;
    let signature_ok = crypto.verify(&initiator, &envelope.signed_bytes(), &envelope.sig);

    let message_key = message_key(crypto, &session_key, Some(salt))?;
    let plaintext = crypto.decrypt(message_key.as_slice(), &envelope.iv, &envelope.ct)?;

    Ok(Finalized {
        session_key,
        signature_ok,
        plaintext: String::from_utf8_lossy(&plaintext).into_owned(),
    })
}

fn session_key_from_agreements(
    crypto: &Primitives,
    dh: [[u8; 32]; 3],
    dh4: Option<[u8; 32]>,
    salt: &[u8],
) -> Result<SessionKey> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(32 * 4));
    for part in dh.iter().chain(dh4.iter()) {
        ikm.extend_from_slice(part);
    }

    let okm = Zeroizing::new(crypto.kdf(
        &ikm,
        Some(domain::SESSION_INFO),
        SESSION_KEY_SIZE,
        Some(salt),
        Some(domain::X3DH_LABEL),
    )?);
    SessionKey::from_slice(&okm)
}

/// Symmetric key used to encrypt messages under `session_key`
///
/// The handshake passes the session salt; the session codec passes none.
pub(crate) fn message_key(
    crypto: &Primitives,
    session_key: &SessionKey,
    salt: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>> {
    let mut okm = Zeroizing::new(crypto.kdf(
        session_key.as_bytes(),
        Some(domain::MESSAGE_KEYS_INFO),
        2 * KEY_SIZE,
        salt,
        Some(domain::MESSAGE_LABEL),
    )?);
    okm.truncate(KEY_SIZE);
    Ok(okm)
}

// ============================================================================
// TESTS
// ============================================================================
