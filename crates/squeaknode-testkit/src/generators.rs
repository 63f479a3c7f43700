//! Proptest generators for property-based testing.

use proptest::prelude::*;

use squeaknode_core::{Address, BlockHash, Interest, Keypair, Squeak, SqueakBuilder, SqueakHash};

/// Generate a random keypair.
pub fn keypair() -> impl Strategy<Value = Keypair> {
    any::<[u8; 32]>().prop_map(|seed| Keypair::from_seed(&seed))
}

/// Generate a random address.
pub fn address() -> impl Strategy<Value = Address> {
    any::<[u8; 20]>().prop_map(Address)
}

pub fn squeak_hash() -> impl Strategy<Value = SqueakHash> {
    any::<[u8; 32]>().prop_map(SqueakHash::from_bytes)
}

pub fn block_hash() -> impl Strategy<Value = BlockHash> {
    any::<[u8; 32]>().prop_map(BlockHash::from_bytes)
}

/// Generate a plausible block height.
pub fn block_height() -> impl Strategy<Value = u64> {
    0u64..=1_000_000
}

/// Generate squeak text well under the content limit.
pub fn content() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9 .,!?]{0,200}".prop_map(String::from)
}

/// Generate an interest over a subset of `authors`.
pub fn interest(authors: Vec<Address>) -> impl Strategy<Value = Interest> {
    let len = authors.len();
    (
        proptest::sample::subsequence(authors, 0..=len),
        proptest::option::of(block_height()),
        proptest::option::of(block_height()),
        proptest::option::of(squeak_hash()),
    )
        .prop_map(|(authors, min_block, max_block, reply_to)| Interest {
            authors,
            min_block,
            max_block,
            reply_to,
        })
}

/// Parameters for generating a squeak.
#[derive(Debug, Clone)]
pub struct SqueakParams {
    pub keypair: Keypair,
    pub block_height: u64,
    pub block_hash: BlockHash,
    pub created_at: i64,
    pub reply_to: Option<SqueakHash>,
    pub content: String,
}

impl Arbitrary for SqueakParams {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_: Self::Parameters) -> Self::Strategy {
        (
            keypair(),
            block_height(),
            block_hash(),
            0i64..=1_700_000_000_000i64, // created_at
            proptest::option::of(squeak_hash()),
            content(),
        )
            .prop_map(
                |(keypair, block_height, block_hash, created_at, reply_to, content)| SqueakParams {
                    keypair,
                    block_height,
                    block_hash,
                    created_at,
                    reply_to,
                    content,
                },
            )
            .boxed()
    }
}

/// Generate an unlocked squeak from parameters.
pub fn squeak_from_params(params: &SqueakParams) -> Squeak {
    let mut builder = SqueakBuilder::new(params.block_height, params.block_hash)
        .created_at(params.created_at)
        .content(params.content.clone());
    if let Some(parent) = params.reply_to {
        builder = builder.reply_to(parent);
    }
    builder
        .sign(&params.keypair)
        .expect("generated content fits")
}
