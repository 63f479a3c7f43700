//! Offers and payments: the records that sell access to a squeak.
//!
//! A seller encrypts a squeak's decryption key under a key derived from a
//! payment preimage and asks the buyer to pay an invoice for that preimage.
//! Paying reveals the preimage, which reveals the key.

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::cipher::EncryptionNonce;
use crate::peer::PeerAddress;
use crate::types::{decode_hex_32, SqueakHash};

/// The secret an invoice settles on.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preimage(pub [u8; 32]);

impl Preimage {
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

    pub fn payment_hash(&self) -> PaymentHash {
        let mut hasher = blake3::Hasher::new_derive_key("squeaknode-v0-payment-hash");
        hasher.update(&self.0);
        PaymentHash(*hasher.finalize().as_bytes())
    }
}

impl fmt::Debug for Preimage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Preimage(..)")
    }
}

/// Hash of a [`Preimage`]; identifies an invoice.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PaymentHash(pub [u8; 32]);

impl PaymentHash {
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        Ok(Self(decode_hex_32(s)?))
    }
}

impl fmt::Debug for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentHash({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for PaymentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex()[..16])
    }
}

/// The random value a buyer seals into a challenge. Only a holder of the
/// decryption key can open it and echo it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof(pub [u8; 32]);

impl Proof {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<&[u8]> for Proof {
    type Error = std::array::TryFromSliceError;

    fn try_from(slice: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self(slice.try_into()?))
    }
}

/// An offer as sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferPacket {
    pub squeak_hash: SqueakHash,
    pub nonce: EncryptionNonce,
    pub encrypted_decryption_key: Vec<u8>,
    pub proof: Proof,
    pub payment_request: String,
    pub price_msat: u64,
    /// Invoice creation time (Unix seconds).
    pub invoice_timestamp: i64,
    /// Invoice lifetime in seconds.
    pub invoice_expiry: i64,
    /// Where the seller accepts connections.
    pub seller: PeerAddress,
}

/// Seller side: an offer made to one counterparty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentOffer {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub squeak_hash: SqueakHash,
    pub payment_hash: PaymentHash,
    pub nonce: EncryptionNonce,
    pub encrypted_decryption_key: Vec<u8>,
    pub price_msat: u64,
    pub payment_request: String,
    pub invoice_timestamp: i64,
    pub invoice_expiry: i64,
    pub counterparty: PeerAddress,
}

impl SentOffer {
    pub fn expires_at(&self) -> i64 {
        self.invoice_timestamp.saturating_add(self.invoice_expiry)
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs > self.expires_at()
    }
}

/// Buyer side: an offer received from a seller, proof already checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedOffer {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub squeak_hash: SqueakHash,
    pub payment_hash: PaymentHash,
    pub nonce: EncryptionNonce,
    pub encrypted_decryption_key: Vec<u8>,
    pub price_msat: u64,
    pub payment_request: String,
    pub invoice_timestamp: i64,
    pub invoice_expiry: i64,
    pub seller: PeerAddress,
    pub proof: Proof,
    pub paid: bool,
}

impl ReceivedOffer {
    pub fn expires_at(&self) -> i64 {
        self.invoice_timestamp.saturating_add(self.invoice_expiry)
    }

    pub fn is_expired(&self, now_secs: i64) -> bool {
        now_secs > self.expires_at()
    }
}

/// A payment this node made for a squeak.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentPayment {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub squeak_hash: SqueakHash,
    pub payment_hash: PaymentHash,
    pub preimage: Preimage,
    pub price_msat: u64,
    pub seller: PeerAddress,
    /// Unix milliseconds.
    pub created_at: i64,
    /// False when the revealed key did not open the content.
    pub valid: bool,
}

/// A settled invoice for one of this node's offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedPayment {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub squeak_hash: SqueakHash,
    pub payment_hash: PaymentHash,
    pub price_msat: u64,
    pub settle_index: u64,
    pub buyer: PeerAddress,
    /// Unix milliseconds.
    pub created_at: i64,
}
