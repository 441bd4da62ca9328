//! Session crypto shared by the TCP control and UDP bulk legs.
//!
//! The transcription protocol bootstraps an AES-256-CFB session over an
//! RSA-OAEP(SHA-256) handshake: the server sends its public key as PEM, the
//! client generates `iv ‖ key`, seals them with OAEP and sends them back.
//! Every subsequent record (both directions, and UDP datagrams) is a fresh
//! CFB stream under the *same* key and IV. The IV reuse is part of the
//! observed wire protocol and must be reproduced byte-for-byte for
//! interoperability; it is not something this crate can fix unilaterally.

use aes::Aes256;
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPublicKey};
use sha2::Sha256;

use crate::error::{BotError, BotResult};

pub const AES_KEY_LEN: usize = 32;
pub const AES_IV_LEN: usize = 16;

/// Symmetric session material negotiated once per control-link connect and
/// shared with the bulk link. Immutable after the handshake.
#[derive(Clone, Copy)]
pub struct CryptoSession {
    key: [u8; AES_KEY_LEN],
    iv: [u8; AES_IV_LEN],
}

impl CryptoSession {
    /// Generate fresh key material from the system RNG.
    pub fn generate() -> Self {
        let mut key = [0u8; AES_KEY_LEN];
        let mut iv = [0u8; AES_IV_LEN];
        OsRng.fill_bytes(&mut key);
        OsRng.fill_bytes(&mut iv);
        Self { key, iv }
    }

    #[cfg(test)]
    pub fn from_parts(key: [u8; AES_KEY_LEN], iv: [u8; AES_IV_LEN]) -> Self {
        Self { key, iv }
    }

    /// Seal `iv ‖ key` for the server with RSA-OAEP(SHA-256).
    ///
    /// `server_public_key_pem` is the PEM-encoded SubjectPublicKeyInfo
    /// received as the first record of the handshake.
    pub fn seal(&self, server_public_key_pem: &str) -> BotResult<Vec<u8>> {
        let public_key = RsaPublicKey::from_public_key_pem(server_public_key_pem)
            .map_err(|e| BotError::HandshakeFailed(format!("invalid server public key: {e}")))?;

        let mut plaintext = Vec::with_capacity(AES_IV_LEN + AES_KEY_LEN);
        plaintext.extend_from_slice(&self.iv);
        plaintext.extend_from_slice(&self.key);

        public_key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), &plaintext)
            .map_err(|e| BotError::HandshakeFailed(format!("RSA-OAEP seal failed: {e}")))
    }

    /// Encrypt one record. A fresh CFB stream is keyed per record, always
    /// with the handshake IV (wire-protocol requirement, see module docs).
    pub fn encrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        Encryptor::<Aes256>::new(&self.key.into(), &self.iv.into()).encrypt(&mut buf);
        buf
    }

    /// Decrypt one record (the inverse of [`CryptoSession::encrypt`]).
    pub fn decrypt(&self, data: &[u8]) -> Vec<u8> {
        let mut buf = data.to_vec();
        Decryptor::<Aes256>::new(&self.key.into(), &self.iv.into()).decrypt(&mut buf);
        buf
    }
}

impl std::fmt::Debug for CryptoSession {
    // Key material stays out of logs.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoSession").finish_non_exhaustive()
    }
}
