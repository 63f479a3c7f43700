//! # Squeaknode Core
//!
//! Pure primitives for squeaknode: squeaks, canonical encoding, content
//! encryption and interest filters.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`Squeak`] - A signed post with encrypted content
//! - [`SqueakHash`] - Content address over the locked form (Blake3)
//! - [`DecryptionKey`] - The secret that unlocks a squeak
//! - [`Interest`] - A filter over author, block range and reply-to
//!
//! ## Canonicalization
//!
//! Squeak headers are encoded as deterministic CBOR. See [`canonical`].

pub mod canonical;
pub mod cipher;
pub mod crypto;
pub mod error;
pub mod interest;
pub mod offer;
pub mod peer;
pub mod profile;
pub mod squeak;
pub mod types;
pub mod validation;

pub use canonical::{canonical_header_bytes, canonical_locked_bytes};
pub use cipher::{DecryptionKey, EncryptionNonce, EncryptionPublicKey, SealedBox, SymmetricKey};
pub use crypto::{Address, Blake3Hash, Ed25519PublicKey, Ed25519Signature, Keypair};
pub use error::{CoreError, ValidationError};
pub use interest::Interest;
pub use offer::{
    OfferPacket, PaymentHash, Preimage, Proof, ReceivedOffer, ReceivedPayment, SentOffer,
    SentPayment,
};
pub use peer::{Peer, PeerAddress};
pub use profile::{Profile, ProfileKind};
pub use squeak::{Squeak, SqueakBuilder, SqueakHeader, MAX_CONTENT_LENGTH, SQUEAK_VERSION};
pub use types::{now_millis, now_secs, BlockHash, SqueakHash};
pub use validation::{validate_squeak, validate_squeak_structure};
