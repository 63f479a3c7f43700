//! Interest filters used to subscribe to and look up squeaks.

use serde::{Deserialize, Serialize};

use crate::crypto::Address;
use crate::squeak::Squeak;
use crate::types::SqueakHash;

/// A subscription filter over author, block range and reply-to.
///
/// An empty author list matches any author; a `None` bound is unbounded.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interest {
    pub authors: Vec<Address>,
    pub min_block: Option<u64>,
    pub max_block: Option<u64>,
    pub reply_to: Option<SqueakHash>,
}

impl Interest {
    /// An interest that matches every squeak.
    pub fn any() -> Self {
        Self::default()
    }

    /// Every squeak by one author.
    pub fn author(address: Address) -> Self {
        Self {
            authors: vec![address],
            ..Self::default()
        }
    }

    pub fn with_min_block(mut self, height: u64) -> Self {
        self.min_block = Some(height);
        self
    }

    pub fn with_max_block(mut self, height: u64) -> Self {
        self.max_block = Some(height);
        self
    }

    pub fn with_reply_to(mut self, hash: SqueakHash) -> Self {
        self.reply_to = Some(hash);
        self
    }

    /// Test the filter against the fields it constrains.
    pub fn matches_parts(
        &self,
        author: &Address,
        block_height: u64,
        reply_to: Option<&SqueakHash>,
    ) -> bool {
        if !self.authors.is_empty() && !self.authors.contains(author) {
            return false;
        }
        if self.min_block.is_some_and(|min| block_height < min) {
            return false;
        }
        if self.max_block.is_some_and(|max| block_height > max) {
            return false;
        }
        match &self.reply_to {
            Some(wanted) => reply_to == Some(wanted),
            None => true,
        }
    }

    pub fn matches(&self, squeak: &Squeak) -> bool {
        self.matches_parts(&squeak.address(), squeak.block_height(), squeak.reply_to())
    }
}
