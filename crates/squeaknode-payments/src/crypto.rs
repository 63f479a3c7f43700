//! Offer cryptography.
//!
//! Two constructions live here:
//!
//! 1. **Offer key**: the seller encrypts a squeak's decryption key under a
//!    symmetric key derived from the invoice preimage and a nonce. The
//!    ciphertext is useless until the buyer pays and learns the preimage.
//! 2. **Challenge**: the buyer seals a random [`Proof`] to the squeak's
//!    public encryption key. Only a holder of the decryption key can open
//!    it and echo the proof back inside the offer.

use squeaknode_core::{
    CoreError, DecryptionKey, EncryptionNonce, EncryptionPublicKey, Preimage, Proof, SealedBox,
    SymmetricKey,
};

/// Blake3 derive-key context for offer keys.
pub const OFFER_KEY_CONTEXT: &str = "squeaknode-v0-offer";

/// Derive the key that wraps a decryption key for one offer.
pub fn offer_key(preimage: &Preimage, nonce: &EncryptionNonce) -> SymmetricKey {
    SymmetricKey::derive(
        OFFER_KEY_CONTEXT,
        &[preimage.as_bytes().as_slice(), nonce.as_bytes().as_slice()],
    )
}

/// Encrypt a decryption key for an offer.
pub fn encrypt_decryption_key(
    key: &DecryptionKey,
    preimage: &Preimage,
    nonce: &EncryptionNonce,
) -> Result<Vec<u8>, CoreError> {
    offer_key(preimage, nonce).encrypt(key.as_bytes(), nonce)
}

/// Recover a decryption key once the preimage is known.
///
/// Fails if the preimage or nonce is wrong or the ciphertext was altered.
pub fn decrypt_decryption_key(
    encrypted: &[u8],
    preimage: &Preimage,
    nonce: &EncryptionNonce,
) -> Result<DecryptionKey, CoreError> {
    let bytes = offer_key(preimage, nonce).decrypt(encrypted, nonce)?;
    let bytes: [u8; 32] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| CoreError::DecryptionError("decryption key length".into()))?;
    Ok(DecryptionKey::from_bytes(bytes))
}

/// Create a challenge for a squeak's encryption key.
///
/// Returns the sealed challenge to send and the proof to expect back.
pub fn create_challenge(encryption_key: &EncryptionPublicKey) -> Result<(SealedBox, Proof), CoreError> {
    let proof = Proof::generate();
    let challenge = SealedBox::seal(proof.as_bytes(), encryption_key)?;
    Ok((challenge, proof))
}

/// Open a challenge with the squeak's decryption key.
pub fn solve_challenge(challenge: &SealedBox, key: &DecryptionKey) -> Result<Proof, CoreError> {
    let bytes = challenge.open(key)?;
    Proof::try_from(bytes.as_slice())
        .map_err(|_| CoreError::DecryptionError("challenge is not a proof".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_offer_key_roundtrip() {
        let key = DecryptionKey::generate();
        let preimage = Preimage::generate();
        let nonce = EncryptionNonce::generate();

        let encrypted = encrypt_decryption_key(&key, &preimage, &nonce).unwrap();
        let recovered = decrypt_decryption_key(&encrypted, &preimage, &nonce).unwrap();
        assert_eq!(recovered, key);
    }

    #[test]
    fn test_offer_key_wrong_nonce() {
        let key = DecryptionKey::generate();
        let preimage = Preimage::generate();
        let nonce = EncryptionNonce::generate();

        let encrypted = encrypt_decryption_key(&key, &preimage, &nonce).unwrap();
        let other = EncryptionNonce::generate();
        assert!(decrypt_decryption_key(&encrypted, &preimage, &other).is_err());
    }

    #[test]
    fn test_challenge_solved_by_owner() {
        let key = DecryptionKey::generate();
        let (challenge, proof) = create_challenge(&key.public_key()).unwrap();
        assert_eq!(solve_challenge(&challenge, &key).unwrap(), proof);
    }

    #[test]
    fn test_challenge_rejects_other_key() {
        let key = DecryptionKey::generate();
        let (challenge, _) = create_challenge(&key.public_key()).unwrap();
        assert!(solve_challenge(&challenge, &DecryptionKey::generate()).is_err());
    }

    proptest! {
        #[test]
        fn test_wrong_preimage_never_recovers(a in any::<[u8; 32]>(), b in any::<[u8; 32]>()) {
            prop_assume!(a != b);
            let key = DecryptionKey::generate();
            let nonce = EncryptionNonce::from_bytes([1; 12]);
            let encrypted = encrypt_decryption_key(&key, &Preimage::from_bytes(a), &nonce).unwrap();
            prop_assert!(decrypt_decryption_key(&encrypted, &Preimage::from_bytes(b), &nonce).is_err());
        }
    }
}
