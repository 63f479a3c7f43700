//! Squeak: a signed, hash-addressed post with encrypted content.
//!
//! A squeak is immutable once signed. Its identity is the hash of the
//! locked form, so a copy carrying the decryption key and one without it
//! are the same squeak.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_header_bytes, canonical_locked_bytes};
use crate::cipher::{DecryptionKey, EncryptionNonce, EncryptionPublicKey};
use crate::crypto::{Address, Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
use crate::error::{CoreError, ValidationError};
use crate::types::{BlockHash, SqueakHash};

/// The current squeak schema version.
pub const SQUEAK_VERSION: u8 = 0;

/// Maximum plaintext content length in bytes.
pub const MAX_CONTENT_LENGTH: usize = 1120;

/// Poly1305 tag appended to every ciphertext.
pub const CONTENT_TAG_LENGTH: usize = 16;

/// Everything the author signs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqueakHeader {
    /// Schema version (currently 0).
    pub version: u8,

    /// The author's signing key.
    pub author: Ed25519PublicKey,

    /// Height of the block the squeak is anchored to.
    pub block_height: u64,

    /// Hash of that block.
    pub block_hash: BlockHash,

    /// Block timestamp (Unix seconds).
    pub block_time: i64,

    /// Author-claimed creation time (Unix milliseconds). Untrusted.
    pub created_at: i64,

    /// The squeak this one replies to.
    pub reply_to: Option<SqueakHash>,

    /// IV used for the content ciphertext.
    pub content_nonce: EncryptionNonce,

    /// Blake3 hash of the ciphertext.
    pub content_hash: Blake3Hash,

    /// Public half of the decryption key.
    pub encryption_key: EncryptionPublicKey,
}

/// A complete squeak: header, ciphertext, signature and maybe the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Squeak {
    pub header: SqueakHeader,

    /// ChaCha20-Poly1305 ciphertext of the UTF-8 content.
    pub encrypted_content: Bytes,

    /// Ed25519 signature over the canonical header.
    pub signature: Ed25519Signature,

    /// Present only on unlocked copies.
    pub decryption_key: Option<DecryptionKey>,
}

impl Squeak {
    /// Compute the squeak hash (Blake3 of the canonical locked bytes).
    pub fn compute_hash(&self) -> SqueakHash {
        SqueakHash(Blake3Hash::hash(&canonical_locked_bytes(self)).0)
    }

    pub fn author(&self) -> &Ed25519PublicKey {
        &self.header.author
    }

    pub fn address(&self) -> Address {
        self.header.author.address()
    }

    pub fn block_height(&self) -> u64 {
        self.header.block_height
    }

    pub fn reply_to(&self) -> Option<&SqueakHash> {
        self.header.reply_to.as_ref()
    }

    pub fn is_unlocked(&self) -> bool {
        self.decryption_key.is_some()
    }

    /// The same squeak with the decryption key stripped.
    pub fn locked(&self) -> Squeak {
        Squeak {
            decryption_key: None,
            ..self.clone()
        }
    }

    /// Attach a decryption key after checking it opens the content.
    pub fn unlock(&self, key: DecryptionKey) -> Result<Squeak, ValidationError> {
        check_decryption_key(&self.header, &self.encrypted_content, &key)?;
        Ok(Squeak {
            decryption_key: Some(key),
            ..self.clone()
        })
    }

    /// Decrypt the content. Fails with [`CoreError::Locked`] without a key.
    pub fn decrypt_content(&self) -> Result<String, CoreError> {
        let key = self.decryption_key.as_ref().ok_or(CoreError::Locked)?;
        let plaintext = key
            .content_key()
            .decrypt(&self.encrypted_content, &self.header.content_nonce)?;
        String::from_utf8(plaintext).map_err(|_| CoreError::ContentNotUtf8)
    }

    /// Serialize to CBOR, including the decryption key if present.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CoreError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CoreError::EncodingError(e.to_string()))?;
        Ok(buf)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CoreError> {
        ciborium::from_reader(bytes).map_err(|e| CoreError::DecodingError(e.to_string()))
    }
}

/// Check that `key` belongs to the header's encryption key and opens the
/// ciphertext.
pub(crate) fn check_decryption_key(
    header: &SqueakHeader,
    encrypted_content: &[u8],
    key: &DecryptionKey,
) -> Result<(), ValidationError> {
    if key.public_key() != header.encryption_key {
        return Err(ValidationError::DecryptionKeyMismatch);
    }
    key.content_key()
        .decrypt(encrypted_content, &header.content_nonce)
        .map_err(|_| ValidationError::DecryptionFailed)?;
    Ok(())
}

/// Builder for creating squeaks.
pub struct SqueakBuilder {
    block_height: u64,
    block_hash: BlockHash,
    block_time: i64,
    created_at: i64,
    reply_to: Option<SqueakHash>,
    content: String,
}

impl SqueakBuilder {
    /// Start building a squeak anchored at the given block.
    pub fn new(block_height: u64, block_hash: BlockHash) -> Self {
        Self {
            block_height,
            block_hash,
            block_time: 0,
            created_at: 0,
            reply_to: None,
            content: String::new(),
        }
    }

    pub fn block_time(mut self, block_time: i64) -> Self {
        self.block_time = block_time;
        self
    }

    pub fn created_at(mut self, ts: i64) -> Self {
        self.created_at = ts;
        self
    }

    pub fn reply_to(mut self, hash: SqueakHash) -> Self {
        self.reply_to = Some(hash);
        self
    }

    pub fn content(mut self, text: impl Into<String>) -> Self {
        self.content = text.into();
        self
    }

    /// Encrypt under a fresh key and sign.
    ///
    /// The returned squeak is unlocked.
    pub fn sign(self, keypair: &Keypair) -> Result<Squeak, CoreError> {
        if self.content.len() > MAX_CONTENT_LENGTH {
            return Err(CoreError::ContentTooLong {
                len: self.content.len(),
                max: MAX_CONTENT_LENGTH,
            });
        }

        let decryption_key = DecryptionKey::generate();
        let content_nonce = EncryptionNonce::generate();
        let ciphertext = decryption_key
            .content_key()
            .encrypt(self.content.as_bytes(), &content_nonce)?;

        let header = SqueakHeader {
            version: SQUEAK_VERSION,
            author: keypair.public_key(),
            block_height: self.block_height,
            block_hash: self.block_hash,
            block_time: self.block_time,
            created_at: self.created_at,
            reply_to: self.reply_to,
            content_nonce,
            content_hash: Blake3Hash::hash(&ciphertext),
            encryption_key: decryption_key.public_key(),
        };
        let signature = keypair.sign(&canonical_header_bytes(&header));

        Ok(Squeak {
            header,
            encrypted_content: Bytes::from(ciphertext),
            signature,
            decryption_key: Some(decryption_key),
        })
    }
}
