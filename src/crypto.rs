//! Symmetric crypto envelope for message payloads: AES-256-CBC with a fresh
//!  random IV per message, and an HMAC trailing tag over the ciphertext.
//!
//! The payload region is zero-padded to the 16-byte AES block size before
//!  encryption (the declared payload structure tells the decoder where the real
//!  data ends). Tag verification is constant-time.

use crate::buffers::wire::WireWriter;
use crate::config::SigningHashAlgorithm;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use anyhow::{anyhow, bail};
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Sha256, Sha384};
use std::sync::Mutex;
use subtle::ConstantTimeEq;

pub const AES_BLOCK_LEN: usize = 16;
pub const AES_KEY_LEN: usize = 32;
pub const HMAC_KEY_LEN: usize = 32;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Symmetric keys established by the handshake.
#[derive(Clone)]
pub struct SessionKeys {
    pub aes_key: [u8; AES_KEY_LEN],
    pub hmac_key: [u8; HMAC_KEY_LEN],
}

pub trait MessageCrypto: Send + Sync {
    /// whether session keys are established, i.e. whether encrypted / authenticated
    ///  messages can be processed at all
    fn ready(&self) -> bool;

    fn iv_len(&self) -> usize;

    fn tag_len(&self) -> usize;

    /// pad the region `[header_len .. end)` to the block size, encrypt it in place
    ///  and insert the freshly generated IV at `header_len`
    fn encrypt(&self, w: &mut WireWriter, header_len: usize) -> anyhow::Result<()>;

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn sign(&self, data: &[u8]) -> anyhow::Result<Vec<u8>>;

    fn verify(&self, data: &[u8], tag: &[u8]) -> bool;
}

/// Crypto state of a connection before (or without) a handshake. Any attempt to
///  actually use it fails, which in turn fails the frame.
pub struct NoCrypto;

impl MessageCrypto for NoCrypto {
    fn ready(&self) -> bool {
        false
    }

    fn iv_len(&self) -> usize {
        AES_BLOCK_LEN
    }

    fn tag_len(&self) -> usize {
        SigningHashAlgorithm::Sha256.tag_len()
    }

    fn encrypt(&self, _w: &mut WireWriter, _header_len: usize) -> anyhow::Result<()> {
        bail!("no session keys established")
    }

    fn decrypt(&self, _iv: &[u8], _ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("no session keys established")
    }

    fn sign(&self, _data: &[u8]) -> anyhow::Result<Vec<u8>> {
        bail!("no session keys established")
    }

    fn verify(&self, _data: &[u8], _tag: &[u8]) -> bool {
        false
    }
}

pub struct AesHmacCrypto {
    keys: SessionKeys,
    signing: SigningHashAlgorithm,
    /// guards IV generation and encryptor setup so exactly one send touches IV
    ///  state at a time
    iv_state: Mutex<()>,
}

impl AesHmacCrypto {
    pub fn new(keys: SessionKeys, signing: SigningHashAlgorithm) -> AesHmacCrypto {
        AesHmacCrypto {
            keys,
            signing,
            iv_state: Mutex::new(()),
        }
    }
}

impl MessageCrypto for AesHmacCrypto {
    fn ready(&self) -> bool {
        true
    }

    fn iv_len(&self) -> usize {
        AES_BLOCK_LEN
    }

    fn tag_len(&self) -> usize {
        self.signing.tag_len()
    }

    fn encrypt(&self, w: &mut WireWriter, header_len: usize) -> anyhow::Result<()> {
        let payload_len = w.len() - header_len;
        let padded_len = payload_len.div_ceil(AES_BLOCK_LEN) * AES_BLOCK_LEN;
        w.pad(padded_len - payload_len);

        let (iv, encryptor) = {
            let _iv_guard = self.iv_state.lock().unwrap();
            let mut iv = [0u8; AES_BLOCK_LEN];
            OsRng.fill_bytes(&mut iv);
            let encryptor = Aes256CbcEnc::new_from_slices(&self.keys.aes_key, &iv)
                .map_err(|e| anyhow!("invalid AES key/IV length: {}", e))?;
            (iv, encryptor)
        };

        let region = &mut w.as_mut()[header_len..];
        let region_len = region.len();
        encryptor
            .encrypt_padded_mut::<NoPadding>(region, region_len)
            .map_err(|e| anyhow!("payload encryption failed: {}", e))?;

        w.insert_bytes(header_len, &iv);
        Ok(())
    }

    fn decrypt(&self, iv: &[u8], ciphertext: &[u8]) -> anyhow::Result<Vec<u8>> {
        if ciphertext.len() % AES_BLOCK_LEN != 0 {
            bail!("ciphertext length {} is not a multiple of the AES block size", ciphertext.len());
        }
        let decryptor = Aes256CbcDec::new_from_slices(&self.keys.aes_key, iv)
            .map_err(|e| anyhow!("invalid AES key/IV length: {}", e))?;

        let mut plaintext = ciphertext.to_vec();
        decryptor
            .decrypt_padded_mut::<NoPadding>(&mut plaintext)
            .map_err(|e| anyhow!("payload decryption failed: {}", e))?;
        Ok(plaintext)
    }

    fn sign(&self, data: &[u8]) -> anyhow::Result<Vec<u8>> {
        match self.signing {
            SigningHashAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(&self.keys.hmac_key)
                    .map_err(|e| anyhow!("invalid HMAC key length: {}", e))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            SigningHashAlgorithm::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(&self.keys.hmac_key)
                    .map_err(|e| anyhow!("invalid HMAC key length: {}", e))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    fn verify(&self, data: &[u8], tag: &[u8]) -> bool {
        if tag.len() != self.tag_len() {
            return false;
        }
        let expected = match self.sign(data) {
            Ok(expected) => expected,
            Err(_) => return false,
        };
        // constant-time comparison without an early exit on the first mismatch
        bool::from(expected.as_slice().ct_eq(tag))
    }
}
