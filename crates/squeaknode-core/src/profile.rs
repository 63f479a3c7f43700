//! Profiles: the local identities and contacts a node knows about.

use crate::crypto::{Address, Keypair};

/// Whether a profile can sign.
#[derive(Debug, Clone)]
pub enum ProfileKind {
    /// A local identity that authors squeaks.
    Signing { keypair: Keypair },
    /// Someone else's address. Never holds a key.
    Contact,
}

#[derive(Debug, Clone)]
pub struct Profile {
    /// Store-assigned id (0 until inserted).
    pub id: i64,
    pub name: String,
    pub address: Address,
    pub kind: ProfileKind,
    pub following: bool,
    pub sharing: bool,
    pub whitelisted: bool,
}

impl Profile {
    /// A new signing profile. Signing profiles follow themselves.
    pub fn signing(name: impl Into<String>, keypair: Keypair) -> Self {
        Self {
            id: 0,
            name: name.into(),
            address: keypair.address(),
            kind: ProfileKind::Signing { keypair },
            following: true,
            sharing: true,
            whitelisted: true,
        }
    }

    pub fn contact(name: impl Into<String>, address: Address) -> Self {
        Self {
            id: 0,
            name: name.into(),
            address,
            kind: ProfileKind::Contact,
            following: false,
            sharing: false,
            whitelisted: false,
        }
    }

    pub fn keypair(&self) -> Option<&Keypair> {
        match &self.kind {
            ProfileKind::Signing { keypair } => Some(keypair),
            ProfileKind::Contact => None,
        }
    }

    pub fn is_signing(&self) -> bool {
        matches!(self.kind, ProfileKind::Signing { .. })
    }
}
