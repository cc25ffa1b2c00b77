//! Key agreement behind the internal handshake messages.
//!
//! The connection machinery only moves opaque byte blobs; asymmetric crypto is
//!  consumed through the `KeyExchange` capability. The default implementation is
//!  ephemeral x25519 Diffie-Hellman with SHA-256 key derivation, producing the
//!  AES and HMAC session keys both sides need.

use crate::crypto::{SessionKeys, AES_KEY_LEN, HMAC_KEY_LEN};
use anyhow::{anyhow, bail};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};

pub trait KeyExchange: Send + Sync + 'static {
    /// initiator side: produce the offer blob and the state needed to finish the
    ///  exchange once the peer's accept blob arrives
    fn start(&self) -> anyhow::Result<(Vec<u8>, Box<dyn PendingKeyExchange>)>;

    /// responder side: consume an offer blob, producing the accept blob to send
    ///  back and the established session keys
    fn respond(&self, offer: &[u8]) -> anyhow::Result<(Vec<u8>, SessionKeys)>;
}

pub trait PendingKeyExchange: Send {
    fn complete(self: Box<Self>, accept: &[u8]) -> anyhow::Result<SessionKeys>;
}

pub struct X25519KeyExchange;

struct PendingX25519 {
    secret: EphemeralSecret,
}

impl KeyExchange for X25519KeyExchange {
    fn start(&self) -> anyhow::Result<(Vec<u8>, Box<dyn PendingKeyExchange>)> {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Ok((public.as_bytes().to_vec(), Box::new(PendingX25519 { secret })))
    }

    fn respond(&self, offer: &[u8]) -> anyhow::Result<(Vec<u8>, SessionKeys)> {
        let peer_public = parse_public(offer)?;
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        let shared = secret.diffie_hellman(&peer_public);
        Ok((public.as_bytes().to_vec(), derive_session_keys(shared.as_bytes())))
    }
}

impl PendingKeyExchange for PendingX25519 {
    fn complete(self: Box<Self>, accept: &[u8]) -> anyhow::Result<SessionKeys> {
        let peer_public = parse_public(accept)?;
        let shared = self.secret.diffie_hellman(&peer_public);
        Ok(derive_session_keys(shared.as_bytes()))
    }
}

fn parse_public(blob: &[u8]) -> anyhow::Result<PublicKey> {
    let raw: [u8; 32] = blob
        .try_into()
        .map_err(|_| anyhow!("x25519 public key must be 32 bytes, got {}", blob.len()))?;
    if raw == [0u8; 32] {
        bail!("all-zero x25519 public key");
    }
    Ok(PublicKey::from(raw))
}

/// Derive both session keys from the shared secret with domain separation, so
///  the AES and HMAC keys are independent.
fn derive_session_keys(shared: &[u8]) -> SessionKeys {
    let mut aes_key = [0u8; AES_KEY_LEN];
    aes_key.copy_from_slice(&Sha256::new().chain_update(b"tempest.aes").chain_update(shared).finalize());

    let mut hmac_key = [0u8; HMAC_KEY_LEN];
    hmac_key.copy_from_slice(&Sha256::new().chain_update(b"tempest.hmac").chain_update(shared).finalize());

    SessionKeys { aes_key, hmac_key }
}
