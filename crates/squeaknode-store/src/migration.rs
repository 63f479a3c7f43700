//! Database schema migrations for SQLite.
//!
//! We use a simple versioned migration system. Each migration is a SQL string
//! that transforms the schema from version N to N+1.

use rusqlite::Connection;
use squeaknode_core::now_millis;

use crate::error::{Result, StoreError};

/// Current schema version.
pub const CURRENT_VERSION: u32 = 2;

/// Initialize or migrate the database schema.
///
/// This function is idempotent - it can be called multiple times safely.
pub fn migrate(conn: &mut Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
        [],
    )?;

    let current: u32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
        [],
        |row| row.get(0),
    )?;

    if current < CURRENT_VERSION {
        let tx = conn.transaction()?;

        for version in (current + 1)..=CURRENT_VERSION {
            apply_migration(&tx, version)?;

            tx.execute(
                "INSERT INTO schema_migrations (version, applied_at) VALUES (?1, ?2)",
                rusqlite::params![version, now_millis()],
            )?;
            tracing::debug!(version, "applied schema migration");
        }

        tx.commit()?;
    }

    Ok(())
}

fn apply_migration(conn: &Connection, version: u32) -> Result<()> {
    match version {
        1 => apply_v1(conn),
        2 => apply_v2(conn),
        _ => Err(StoreError::Migration(format!(
            "unknown migration version: {}",
            version
        ))),
    }
}

/// Migration v1: Initial schema.
fn apply_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Squeaks, stored in locked form; the key lives in its own column.
        CREATE TABLE squeaks (
            hash BLOB PRIMARY KEY,            -- 32 bytes, Blake3 of canonical locked bytes
            author_address TEXT NOT NULL,     -- "sq" + hex
            block_height INTEGER NOT NULL,
            block_hash BLOB NOT NULL,
            reply_to BLOB,                    -- 32 bytes, nullable
            created_at INTEGER NOT NULL,      -- author-claimed (Unix ms)
            squeak_bytes BLOB NOT NULL,       -- CBOR of the locked squeak
            decryption_key BLOB,              -- 32 bytes, nullable
            inserted_at INTEGER NOT NULL
        );

        CREATE TABLE profiles (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            address TEXT NOT NULL UNIQUE,
            signing_seed BLOB,                -- 32 bytes, NULL for contacts
            following INTEGER NOT NULL DEFAULT 0,
            sharing INTEGER NOT NULL DEFAULT 0,
            whitelisted INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL
        );

        CREATE TABLE peers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            host TEXT NOT NULL,
            port INTEGER NOT NULL,
            uploading INTEGER NOT NULL DEFAULT 0,
            downloading INTEGER NOT NULL DEFAULT 0,
            autoconnect INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            UNIQUE(host, port)
        );

        CREATE TABLE sent_offers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            squeak_hash BLOB NOT NULL,
            payment_hash BLOB NOT NULL UNIQUE,
            nonce BLOB NOT NULL,              -- 12 bytes
            encrypted_key BLOB NOT NULL,
            price_msat INTEGER NOT NULL,
            payment_request TEXT NOT NULL,
            invoice_timestamp INTEGER NOT NULL,   -- Unix seconds
            invoice_expiry INTEGER NOT NULL,      -- seconds
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL,
            UNIQUE(squeak_hash, peer_host, peer_port)
        );

        CREATE TABLE received_offers (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            squeak_hash BLOB NOT NULL,
            payment_hash BLOB NOT NULL,
            nonce BLOB NOT NULL,
            encrypted_key BLOB NOT NULL,
            price_msat INTEGER NOT NULL,
            payment_request TEXT NOT NULL,
            invoice_timestamp INTEGER NOT NULL,
            invoice_expiry INTEGER NOT NULL,
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL,
            proof BLOB NOT NULL,
            paid INTEGER NOT NULL DEFAULT 0,
            UNIQUE(squeak_hash, peer_host, peer_port)
        );

        CREATE TABLE sent_payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            squeak_hash BLOB NOT NULL,
            payment_hash BLOB NOT NULL UNIQUE,
            preimage BLOB NOT NULL,
            price_msat INTEGER NOT NULL,
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            valid INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE received_payments (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            squeak_hash BLOB NOT NULL,
            payment_hash BLOB NOT NULL UNIQUE,
            price_msat INTEGER NOT NULL,
            settle_index INTEGER NOT NULL,
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        );

        CREATE INDEX idx_squeaks_author_height ON squeaks(author_address, block_height);
        CREATE INDEX idx_squeaks_height ON squeaks(block_height);
        CREATE INDEX idx_squeaks_reply_to ON squeaks(reply_to);
        CREATE INDEX idx_received_offers_squeak ON received_offers(squeak_hash);
        CREATE INDEX idx_received_payments_settle ON received_payments(settle_index);
        "#,
    )?;

    Ok(())
}

/// An expired sent offer stays until its retention ends so a late
/// settlement still resolves, beside the live offer reissued for the same
/// (squeak, peer). The store keeps that pair to one live offer.
fn apply_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE sent_offers_v2 (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            squeak_hash BLOB NOT NULL,
            payment_hash BLOB NOT NULL UNIQUE,
            nonce BLOB NOT NULL,
            encrypted_key BLOB NOT NULL,
            price_msat INTEGER NOT NULL,
            payment_request TEXT NOT NULL,
            invoice_timestamp INTEGER NOT NULL,
            invoice_expiry INTEGER NOT NULL,
            peer_host TEXT NOT NULL,
            peer_port INTEGER NOT NULL
        );

        INSERT INTO sent_offers_v2 (
            id, squeak_hash, payment_hash, nonce, encrypted_key, price_msat,
            payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port
        )
        SELECT
            id, squeak_hash, payment_hash, nonce, encrypted_key, price_msat,
            payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port
        FROM sent_offers;

        DROP TABLE sent_offers;
        ALTER TABLE sent_offers_v2 RENAME TO sent_offers;

        CREATE INDEX idx_sent_offers_squeak_peer
            ON sent_offers(squeak_hash, peer_host, peer_port);
        "#,
    )?;

    Ok(())
}
