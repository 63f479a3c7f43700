//! Canonical CBOR encoding of squeak headers.
//!
//! The header is a map with small integer keys written in ascending order,
//! integers in their shortest form and definite lengths only. The same
//! squeak always yields the same bytes, and therefore the same hash, on
//! every platform.

use crate::squeak::{Squeak, SqueakHeader};

/// Header field keys.
///
/// Keys 0-23 encode as single bytes in CBOR.
mod keys {
    pub const VERSION: u64 = 0;
    pub const AUTHOR: u64 = 1;
    pub const BLOCK_HEIGHT: u64 = 2;
    pub const BLOCK_HASH: u64 = 3;
    pub const BLOCK_TIME: u64 = 4;
    pub const CREATED_AT: u64 = 5;
    pub const REPLY_TO: u64 = 6;
    pub const CONTENT_NONCE: u64 = 7;
    pub const CONTENT_HASH: u64 = 8;
    pub const ENCRYPTION_KEY: u64 = 9;
}

/// The subset of CBOR a squeak header needs.
enum Field<'a> {
    Uint(u64),
    Int(i64),
    Bytes(&'a [u8]),
    Null,
}

/// Encode a squeak header to canonical CBOR bytes.
pub fn canonical_header_bytes(header: &SqueakHeader) -> Vec<u8> {
    let reply_to = match &header.reply_to {
        Some(hash) => Field::Bytes(hash.as_bytes()),
        None => Field::Null,
    };

    // Already in ascending key order.
    let entries = [
        (keys::VERSION, Field::Uint(header.version.into())),
        (keys::AUTHOR, Field::Bytes(header.author.as_bytes())),
        (keys::BLOCK_HEIGHT, Field::Uint(header.block_height)),
        (keys::BLOCK_HASH, Field::Bytes(header.block_hash.as_bytes())),
        (keys::BLOCK_TIME, Field::Int(header.block_time)),
        (keys::CREATED_AT, Field::Int(header.created_at)),
        (keys::REPLY_TO, reply_to),
        (keys::CONTENT_NONCE, Field::Bytes(header.content_nonce.as_bytes())),
        (keys::CONTENT_HASH, Field::Bytes(header.content_hash.as_bytes())),
        (keys::ENCRYPTION_KEY, Field::Bytes(header.encryption_key.as_bytes())),
    ];

    let mut buf = Vec::with_capacity(256);
    encode_uint(&mut buf, 5, entries.len() as u64);
    for (key, field) in &entries {
        encode_uint(&mut buf, 0, *key);
        encode_field(&mut buf, field);
    }
    buf
}

/// Canonical locked bytes: header || ciphertext || signature.
///
/// Never includes the decryption key.
pub fn canonical_locked_bytes(squeak: &Squeak) -> Vec<u8> {
    let mut buf = canonical_header_bytes(&squeak.header);
    buf.extend_from_slice(&squeak.encrypted_content);
    buf.extend_from_slice(squeak.signature.as_bytes());
    buf
}

fn encode_field(buf: &mut Vec<u8>, field: &Field<'_>) {
    match field {
        Field::Uint(n) => encode_uint(buf, 0, *n),
        Field::Int(n) if *n >= 0 => encode_uint(buf, 0, *n as u64),
        // CBOR encodes -1 as 0, -2 as 1, etc.
        Field::Int(n) => encode_uint(buf, 1, (-1 - *n) as u64),
        Field::Bytes(b) => {
            encode_uint(buf, 2, b.len() as u64);
            buf.extend_from_slice(b);
        }
        Field::Null => buf.push(0xf6),
    }
}

/// Write a head byte for `major` with argument `n` in its shortest form.
fn encode_uint(buf: &mut Vec<u8>, major: u8, n: u64) {
    let mt = major << 5;
    if n < 24 {
        buf.push(mt | (n as u8));
    } else if n <= 0xff {
        buf.push(mt | 24);
        buf.push(n as u8);
    } else if n <= 0xffff {
        buf.push(mt | 25);
        buf.extend_from_slice(&(n as u16).to_be_bytes());
    } else if n <= 0xffff_ffff {
        buf.push(mt | 26);
        buf.extend_from_slice(&(n as u32).to_be_bytes());
    } else {
        buf.push(mt | 27);
        buf.extend_from_slice(&n.to_be_bytes());
    }
}
