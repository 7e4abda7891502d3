//! Pre-key bundles.
//!
//! A user publishes a [`PublishedBundle`] to the relay and keeps the matching
//! [`LocalBundle`] (private halves) on the device. The two are tied together
//! by [`bundle_fingerprint`].

use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::{hex_vec, KeyPair, Primitives, PublicKey};
use crate::error::{Error, Result};

/// Public half of a one-time pre-key, as held by the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OneTimePublic {
    /// Stable id, echoed back in `usedOpk`
    pub id: String,
    /// Raw public key
    #[serde(with = "hex_vec")]
    pub key: Vec<u8>,
}

/// What a user publishes: public material only
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishedBundle {
    /// Owner
    pub user_id: String,
    /// Identity public key (raw)
    #[serde(with = "hex_vec")]
    pub ik_pub: Vec<u8>,
    /// Signed pre-key public key (raw)
    #[serde(with = "hex_vec")]
    pub spk_pub: Vec<u8>,
    /// Identity signature over `spk_pub`
    #[serde(with = "hex_vec")]
    pub spk_sig: Vec<u8>,
    /// Remaining one-time pre-keys
    #[serde(default)]
    pub opk_pubs: Vec<OneTimePublic>,
}

impl PublishedBundle {
    /// Fingerprint of the identity and signed pre-key
    pub fn fingerprint(&self, crypto: &Primitives) -> String {
        bundle_fingerprint(crypto, &self.ik_pub, &self.spk_pub)
    }
}

/// Private half of a one-time pre-key
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct OneTimePrivate {
    /// Same id as the published half
    pub id: String,
    /// Raw private key
    #[serde(with = "hex_vec")]
    pub key: Vec<u8>,
}

/// Device-local private bundle, persisted as `pre-keys.json`
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(rename_all = "camelCase")]
pub struct LocalBundle {
    /// Owner
    #[zeroize(skip)]
    pub user_id: String,
    /// Identity private key (raw)
    #[serde(with = "hex_vec")]
    pub ik_priv: Vec<u8>,
    /// Signed pre-key private key (raw)
    #[serde(with = "hex_vec")]
    pub spk_priv: Vec<u8>,
    /// One-time pre-key private keys
    #[serde(default)]
    pub opk_privs: Vec<OneTimePrivate>,
}

impl std::fmt::Debug for LocalBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBundle")
            .field("user_id", &self.user_id)
            .field("one_time_keys", &self.opk_privs.len())
            .finish_non_exhaustive()
    }
}

impl LocalBundle {
    /// Identity key pair
    pub fn identity(&self, crypto: &Primitives) -> Result<KeyPair> {
        crypto.import_private_raw(&self.ik_priv)
    }

    /// Signed pre-key pair
    pub fn signed_prekey(&self, crypto: &Primitives) -> Result<KeyPair> {
        crypto.import_private_raw(&self.spk_priv)
    }

    /// Look up the private half of a one-time pre-key by id
    pub fn one_time_private(&self, crypto: &Primitives, id: &str) -> Result<Option<KeyPair>> {
        self.opk_privs
            .iter()
            .find(|opk| opk.id == id)
            .map(|opk| crypto.import_private_raw(&opk.key))
            .transpose()
    }

    /// Fingerprint computed from the private halves
    pub fn fingerprint(&self, crypto: &Primitives) -> Result<String> {
        let ik = self.identity(crypto)?.public_keys().to_raw();
        let spk = self.signed_prekey(crypto)?.public_keys().to_raw();
        Ok(bundle_fingerprint(crypto, &ik, &spk))
    }

    /// Whether `published` is the public counterpart of this bundle
    pub fn matches_published(&self, crypto: &Primitives, published: &PublishedBundle) -> Result<bool> {
        Ok(self.user_id == published.user_id && self.fingerprint(crypto)? == published.fingerprint(crypto))
    }
}

/// `hex(digest(identity_pub ‖ spk_pub))`
pub fn bundle_fingerprint(crypto: &Primitives, identity_pub: &[u8], spk_pub: &[u8]) -> String {
    hex::encode(crypto.digest(&[identity_pub, spk_pub].concat()))
}

/// Generate a fresh identity, signed pre-key and `one_time_count` one-time
/// pre-keys for `user_id`
pub fn generate_prekey_bundle(
    crypto: &Primitives,
    user_id: &str,
    one_time_count: usize,
) -> Result<(PublishedBundle, LocalBundle)> {
    let identity = crypto.generate_identity_keypair()?;
    let spk = crypto.generate_signed_prekey(&identity)?;
    let one_time = crypto.generate_one_time_prekeys(one_time_count)?;

    let mut opk_pubs = Vec::with_capacity(one_time.len());
    let mut opk_privs = Vec::with_capacity(one_time.len());
    for keypair in &one_time {
        let id = uuid::Uuid::new_v4().to_string();
        opk_pubs.push(OneTimePublic {
            id: id.clone(),
            key: keypair.public_keys().to_raw(),
        });
        opk_privs.push(OneTimePrivate {
            id,
            key: keypair.private_raw(),
        });
    }

    let published = PublishedBundle {
        user_id: user_id.to_string(),
        ik_pub: identity.public_keys().to_raw(),
        spk_pub: spk.keypair.public_keys().to_raw(),
        spk_sig: spk.signature.clone(),
        opk_pubs,
    };
    let local = LocalBundle {
        user_id: user_id.to_string(),
        ik_priv: identity.private_raw(),
        spk_priv: spk.keypair.private_raw(),
        opk_privs,
    };

    tracing::info!(
        user_id = user_id,
        one_time_keys = one_time_count,
        "Generated pre-key bundle"
    );
    Ok((published, local))
}

/// A peer's bundle after import, ready for [`super::establish_session`]
#[derive(Debug, Clone)]
pub struct PeerBundle {
    /// Peer identity key
    pub identity: PublicKey,
    /// Peer signed pre-key
    pub signed_prekey: PublicKey,
    /// Signature over the signed pre-key's raw bytes
    pub signed_prekey_sig: Vec<u8>,
    /// One-time pre-key issued for this session, if the pool was not empty
    pub one_time: Option<(String, PublicKey)>,
}

impl PeerBundle {
    /// Import a published bundle plus the one-time key claimed from the relay
    pub fn from_published(
        crypto: &Primitives,
        published: &PublishedBundle,
        one_time: Option<&OneTimePublic>,
    ) -> Result<Self> {
        let one_time = one_time
            .map(|opk| crypto.import_public_raw(&opk.key).map(|key| (opk.id.clone(), key)))
            .transpose()?;

        Ok(Self {
            identity: crypto.import_public_raw(&published.ik_pub)?,
            signed_prekey: crypto.import_public_raw(&published.spk_pub)?,
            signed_prekey_sig: published.spk_sig.clone(),
            one_time,
        })
    }
}

/// Reject a local bundle whose owner is not `user_id`
pub(crate) fn ensure_owner(local: &LocalBundle, user_id: &str) -> Result<()> {
    if local.user_id != user_id {
        return Err(Error::MissingKeyMaterial(format!(
            "Local pre-keys belong to '{}', not '{}'",
            local.user_id, user_id
        )));
    }
    Ok(())
}
