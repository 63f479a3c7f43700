//! Content encryption for squeaks.
//!
//! Every squeak carries an X25519 public key. The matching secret is the
//! squeak's [`DecryptionKey`]: it derives the ChaCha20-Poly1305 key the
//! content was sealed with, and it opens [`SealedBox`] challenges addressed
//! to the public half.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};

use crate::error::CoreError;

const CONTENT_KEY_CONTEXT: &str = "squeaknode-v0-content";
const SEALED_BOX_CONTEXT: &str = "squeaknode-v0-sealed-box";

/// A 96-bit nonce for ChaCha20-Poly1305.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionNonce(pub [u8; 12]);

impl EncryptionNonce {
    /// Generate a new random nonce.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 12]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }
}

impl TryFrom<&[u8]> for EncryptionNonce {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into()?))
    }
}

/// A 256-bit symmetric key for ChaCha20-Poly1305.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 32]);

impl SymmetricKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Derive a key with Blake3 in derive-key mode.
    pub fn derive(context: &str, material: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(context);
        for part in material {
            hasher.update(part);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn encrypt(&self, plaintext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>, CoreError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))?;
        cipher
            .encrypt(Nonce::from_slice(&nonce.0), plaintext)
            .map_err(|e| CoreError::EncryptionError(e.to_string()))
    }

    /// Decrypt and authenticate. A wrong key fails on the AEAD tag.
    pub fn decrypt(&self, ciphertext: &[u8], nonce: &EncryptionNonce) -> Result<Vec<u8>, CoreError> {
        let cipher = ChaCha20Poly1305::new_from_slice(&self.0)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))?;
        cipher
            .decrypt(Nonce::from_slice(&nonce.0), ciphertext)
            .map_err(|e| CoreError::DecryptionError(e.to_string()))
    }
}

impl fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// The X25519 public key published in a squeak.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EncryptionPublicKey(pub [u8; 32]);

impl EncryptionPublicKey {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    fn to_dalek(self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for EncryptionPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EncryptionPublicKey({})", &hex::encode(self.0)[..16])
    }
}

/// The X25519 secret that unlocks a squeak.
///
/// Never part of the hash or the signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionKey(pub [u8; 32]);

impl DecryptionKey {
    /// Generate a new random secret.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn public_key(&self) -> EncryptionPublicKey {
        let secret = StaticSecret::from(self.0);
        EncryptionPublicKey(*PublicKey::from(&secret).as_bytes())
    }

    /// The symmetric key the squeak content is encrypted under.
    pub fn content_key(&self) -> SymmetricKey {
        SymmetricKey::derive(CONTENT_KEY_CONTEXT, &[&self.0])
    }

    fn diffie_hellman(&self, peer: &EncryptionPublicKey) -> [u8; 32] {
        let secret = StaticSecret::from(self.0);
        *secret.diffie_hellman(&peer.to_dalek()).as_bytes()
    }
}

impl fmt::Debug for DecryptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DecryptionKey(..)")
    }
}

/// Plaintext encrypted to an [`EncryptionPublicKey`] with an ephemeral
/// X25519 key. Only the holder of the matching [`DecryptionKey`] can open it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedBox {
    pub ephemeral_public: EncryptionPublicKey,
    pub nonce: EncryptionNonce,
    pub ciphertext: Vec<u8>,
}

impl SealedBox {
    pub fn seal(plaintext: &[u8], recipient: &EncryptionPublicKey) -> Result<Self, CoreError> {
        let ephemeral = EphemeralSecret::random_from_rng(rand::thread_rng());
        let ephemeral_public = EncryptionPublicKey(*PublicKey::from(&ephemeral).as_bytes());
        let shared = ephemeral.diffie_hellman(&recipient.to_dalek());

        let key = SymmetricKey::derive(
            SEALED_BOX_CONTEXT,
            &[shared.as_bytes(), &ephemeral_public.0, &recipient.0],
        );
        let nonce = EncryptionNonce::generate();
        let ciphertext = key.encrypt(plaintext, &nonce)?;

        Ok(Self {
            ephemeral_public,
            nonce,
            ciphertext,
        })
    }

    pub fn open(&self, key: &DecryptionKey) -> Result<Vec<u8>, CoreError> {
        let shared = key.diffie_hellman(&self.ephemeral_public);
        let recipient = key.public_key();
        let wrap = SymmetricKey::derive(
            SEALED_BOX_CONTEXT,
            &[&shared, &self.ephemeral_public.0, &recipient.0],
        );
        wrap.decrypt(&self.ciphertext, &self.nonce)
    }
}
