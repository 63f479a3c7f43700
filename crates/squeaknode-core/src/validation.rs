//! Squeak validation: structural checks, signature and key integrity.

use crate::canonical::canonical_header_bytes;
use crate::crypto::Blake3Hash;
use crate::error::ValidationError;
use crate::squeak::{
    check_decryption_key, Squeak, CONTENT_TAG_LENGTH, MAX_CONTENT_LENGTH, SQUEAK_VERSION,
};

/// Validate a squeak in isolation.
///
/// This performs:
/// - Version check
/// - Content size check
/// - Content hash verification
/// - Signature verification
/// - Decryption key integrity, when a key is attached
///
/// Block anchoring is not checked here; that needs a chain view.
pub fn validate_squeak(squeak: &Squeak) -> Result<(), ValidationError> {
    validate_squeak_structure(squeak)?;

    let message = canonical_header_bytes(&squeak.header);
    squeak
        .header
        .author
        .verify(&message, &squeak.signature)
        .map_err(|_| ValidationError::SignatureFailed)?;

    if let Some(key) = &squeak.decryption_key {
        check_decryption_key(&squeak.header, &squeak.encrypted_content, key)?;
    }

    Ok(())
}

/// Validate everything except the signature and the decryption key.
pub fn validate_squeak_structure(squeak: &Squeak) -> Result<(), ValidationError> {
    if squeak.header.version != SQUEAK_VERSION {
        return Err(ValidationError::UnsupportedVersion(squeak.header.version));
    }

    let max = MAX_CONTENT_LENGTH + CONTENT_TAG_LENGTH;
    if squeak.encrypted_content.len() > max {
        return Err(ValidationError::ContentTooLong {
            len: squeak.encrypted_content.len(),
            max,
        });
    }

    if Blake3Hash::hash(&squeak.encrypted_content) != squeak.header.content_hash {
        return Err(ValidationError::ContentHashMismatch);
    }

    Ok(())
}
