//! SQLite implementation of the Store trait.
//!
//! This is the primary storage backend for squeaknode. It uses rusqlite with
//! bundled SQLite, wrapped in async via tokio::spawn_blocking.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::types::{Type, Value};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

use squeaknode_core::{
    Address, DecryptionKey, EncryptionNonce, Interest, Keypair, PaymentHash, Peer, PeerAddress,
    Preimage, Profile, ProfileKind, Proof, ReceivedOffer, ReceivedPayment, SentOffer, SentPayment,
    Squeak, SqueakHash,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{InsertResult, PeerFlag, ProfileFlag, Store};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut conn = Connection::open(path)?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory SQLite database.
    pub fn open_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        migration::migrate(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn call<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn
                .lock()
                .map_err(|e| StoreError::Unavailable(format!("mutex poisoned: {}", e)))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Unavailable(format!("spawn_blocking failed: {}", e)))?
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row helpers
// ─────────────────────────────────────────────────────────────────────────────

fn blob<const N: usize>(row: &Row<'_>, idx: usize) -> rusqlite::Result<[u8; N]> {
    let bytes: Vec<u8> = row.get(idx)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Blob, Box::new(e)))
}

fn address(row: &Row<'_>, idx: usize) -> rusqlite::Result<Address> {
    let text: String = row.get(idx)?;
    text.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn peer_address(row: &Row<'_>, host_idx: usize) -> rusqlite::Result<PeerAddress> {
    Ok(PeerAddress::new(
        row.get::<_, String>(host_idx)?,
        row.get::<_, u16>(host_idx + 1)?,
    ))
}

/// Map a unique-constraint failure to `Duplicate`.
fn unique_violation(what: &str) -> impl FnOnce(rusqlite::Error) -> StoreError + '_ {
    move |e| match e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate(what.to_string())
        }
        other => StoreError::Database(other),
    }
}

fn inserted(conn: &Connection, changed: usize) -> InsertResult {
    if changed == 0 {
        InsertResult::AlreadyExists
    } else {
        InsertResult::Inserted {
            id: conn.last_insert_rowid(),
        }
    }
}

const PROFILE_COLUMNS: &str =
    "id, name, address, signing_seed, following, sharing, whitelisted";

fn row_to_profile(row: &Row<'_>) -> rusqlite::Result<Profile> {
    let seed: Option<Vec<u8>> = row.get(3)?;
    let kind = match seed {
        Some(seed) => {
            let seed: [u8; 32] = seed.as_slice().try_into().map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(3, Type::Blob, Box::new(e))
            })?;
            ProfileKind::Signing {
                keypair: Keypair::from_seed(&seed),
            }
        }
        None => ProfileKind::Contact,
    };
    Ok(Profile {
        id: row.get(0)?,
        name: row.get(1)?,
        address: address(row, 2)?,
        kind,
        following: row.get(4)?,
        sharing: row.get(5)?,
        whitelisted: row.get(6)?,
    })
}

const PEER_COLUMNS: &str = "id, name, host, port, uploading, downloading, autoconnect";

fn row_to_peer(row: &Row<'_>) -> rusqlite::Result<Peer> {
    Ok(Peer {
        id: row.get(0)?,
        name: row.get(1)?,
        address: peer_address(row, 2)?,
        uploading: row.get(4)?,
        downloading: row.get(5)?,
        autoconnect: row.get(6)?,
    })
}

const SENT_OFFER_COLUMNS: &str = "id, squeak_hash, payment_hash, nonce, encrypted_key, price_msat,
     payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port";

fn row_to_sent_offer(row: &Row<'_>) -> rusqlite::Result<SentOffer> {
    Ok(SentOffer {
        id: row.get(0)?,
        squeak_hash: SqueakHash(blob(row, 1)?),
        payment_hash: PaymentHash(blob(row, 2)?),
        nonce: EncryptionNonce(blob(row, 3)?),
        encrypted_decryption_key: row.get(4)?,
        price_msat: row.get::<_, i64>(5)? as u64,
        payment_request: row.get(6)?,
        invoice_timestamp: row.get(7)?,
        invoice_expiry: row.get(8)?,
        counterparty: peer_address(row, 9)?,
    })
}

const RECEIVED_OFFER_COLUMNS: &str = "id, squeak_hash, payment_hash, nonce, encrypted_key,
     price_msat, payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port,
     proof, paid";

fn row_to_received_offer(row: &Row<'_>) -> rusqlite::Result<ReceivedOffer> {
    Ok(ReceivedOffer {
        id: row.get(0)?,
        squeak_hash: SqueakHash(blob(row, 1)?),
        payment_hash: PaymentHash(blob(row, 2)?),
        nonce: EncryptionNonce(blob(row, 3)?),
        encrypted_decryption_key: row.get(4)?,
        price_msat: row.get::<_, i64>(5)? as u64,
        payment_request: row.get(6)?,
        invoice_timestamp: row.get(7)?,
        invoice_expiry: row.get(8)?,
        seller: peer_address(row, 9)?,
        proof: Proof(blob(row, 11)?),
        paid: row.get(12)?,
    })
}

const SENT_PAYMENT_COLUMNS: &str =
    "id, squeak_hash, payment_hash, preimage, price_msat, peer_host, peer_port, created_at, valid";

fn row_to_sent_payment(row: &Row<'_>) -> rusqlite::Result<SentPayment> {
    Ok(SentPayment {
        id: row.get(0)?,
        squeak_hash: SqueakHash(blob(row, 1)?),
        payment_hash: PaymentHash(blob(row, 2)?),
        preimage: Preimage(blob(row, 3)?),
        price_msat: row.get::<_, i64>(4)? as u64,
        seller: peer_address(row, 5)?,
        created_at: row.get(7)?,
        valid: row.get(8)?,
    })
}

const RECEIVED_PAYMENT_COLUMNS: &str =
    "id, squeak_hash, payment_hash, price_msat, settle_index, peer_host, peer_port, created_at";

fn row_to_received_payment(row: &Row<'_>) -> rusqlite::Result<ReceivedPayment> {
    Ok(ReceivedPayment {
        id: row.get(0)?,
        squeak_hash: SqueakHash(blob(row, 1)?),
        payment_hash: PaymentHash(blob(row, 2)?),
        price_msat: row.get::<_, i64>(3)? as u64,
        settle_index: row.get::<_, i64>(4)? as u64,
        buyer: peer_address(row, 5)?,
        created_at: row.get(7)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    // ─────────────────────────────────────────────────────────────────────────
    // Squeaks
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_squeak(&self, squeak: &Squeak) -> Result<InsertResult> {
        let hash = squeak.compute_hash();
        let locked_bytes = squeak.locked().to_bytes()?;
        let key = squeak.decryption_key.as_ref().map(|k| k.0);
        let author = squeak.address().to_string();
        let height = squeak.block_height() as i64;
        let block_hash = squeak.header.block_hash.0;
        let reply_to = squeak.header.reply_to.map(|h| h.0);
        let created_at = squeak.header.created_at;

        self.call(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO squeaks (
                    hash, author_address, block_height, block_hash, reply_to,
                    created_at, squeak_bytes, decryption_key, inserted_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    hash.0.as_slice(),
                    author,
                    height,
                    block_hash.as_slice(),
                    reply_to.as_ref().map(|h| h.as_slice()),
                    created_at,
                    locked_bytes,
                    key.as_ref().map(|k| k.as_slice()),
                    squeaknode_core::now_millis(),
                ],
            )?;
            Ok(inserted(conn, changed))
        })
        .await
    }

    async fn get_squeak(&self, hash: &SqueakHash) -> Result<Option<Squeak>> {
        let hash = *hash;
        let row: Option<(Vec<u8>, Option<Vec<u8>>)> = self
            .call(move |conn| {
                conn.query_row(
                    "SELECT squeak_bytes, decryption_key FROM squeaks WHERE hash = ?1",
                    params![hash.0.as_slice()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StoreError::from)
            })
            .await?;

        let Some((bytes, key)) = row else {
            return Ok(None);
        };
        let mut squeak = Squeak::from_bytes(&bytes)?;
        if let Some(key) = key {
            let key: [u8; 32] = key
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::InvalidData("decryption key length".into()))?;
            squeak.decryption_key = Some(DecryptionKey::from_bytes(key));
        }
        Ok(Some(squeak))
    }

    async fn has_squeak(&self, hash: &SqueakHash) -> Result<bool> {
        let hash = *hash;
        self.call(move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM squeaks WHERE hash = ?1)",
                params![hash.0.as_slice()],
                |row| row.get(0),
            )?)
        })
        .await
    }

    async fn set_decryption_key(&self, hash: &SqueakHash, key: &DecryptionKey) -> Result<bool> {
        let hash = *hash;
        let key = key.0;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE squeaks SET decryption_key = ?2 WHERE hash = ?1",
                params![hash.0.as_slice(), key.as_slice()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn count_squeaks(&self) -> Result<u64> {
        self.call(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM squeaks", [], |row| row.get(0))?;
            Ok(n as u64)
        })
        .await
    }

    async fn count_squeaks_by_author_at_height(
        &self,
        author: &Address,
        block_height: u64,
    ) -> Result<u64> {
        let author = author.to_string();
        self.call(move |conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM squeaks WHERE author_address = ?1 AND block_height = ?2",
                params![author, block_height as i64],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn lookup_squeaks(&self, interest: &Interest) -> Result<Vec<SqueakHash>> {
        let mut sql = String::from("SELECT hash FROM squeaks WHERE 1 = 1");
        let mut args: Vec<Value> = Vec::new();

        if !interest.authors.is_empty() {
            let placeholders = vec!["?"; interest.authors.len()].join(", ");
            sql.push_str(&format!(" AND author_address IN ({})", placeholders));
            args.extend(interest.authors.iter().map(|a| Value::Text(a.to_string())));
        }
        // Heights are stored as INTEGER; a bound past i64::MAX either
        // excludes every row (min) or none (max).
        if let Some(min) = interest.min_block {
            let Ok(min) = i64::try_from(min) else {
                return Ok(Vec::new());
            };
            sql.push_str(" AND block_height >= ?");
            args.push(Value::Integer(min));
        }
        if let Some(max) = interest.max_block.and_then(|max| i64::try_from(max).ok()) {
            sql.push_str(" AND block_height <= ?");
            args.push(Value::Integer(max));
        }
        if let Some(reply_to) = interest.reply_to {
            sql.push_str(" AND reply_to = ?");
            args.push(Value::Blob(reply_to.0.to_vec()));
        }
        sql.push_str(" ORDER BY block_height, hash");

        self.call(move |conn| {
            let mut stmt = conn.prepare(&sql)?;
            let hashes = stmt
                .query_map(params_from_iter(args.iter()), |row| {
                    Ok(SqueakHash(blob(row, 0)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(hashes)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Profiles
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_profile(&self, profile: &Profile) -> Result<i64> {
        let name = profile.name.clone();
        let address = profile.address.to_string();
        let seed = profile.keypair().map(|k| k.seed());
        let flags = (profile.following, profile.sharing, profile.whitelisted);

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO profiles (
                    name, address, signing_seed, following, sharing, whitelisted, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    name,
                    address,
                    seed.as_ref().map(|s| s.as_slice()),
                    flags.0,
                    flags.1,
                    flags.2,
                    squeaknode_core::now_millis(),
                ],
            )
            .map_err(unique_violation("profile name or address"))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_profile(&self, id: i64) -> Result<Option<Profile>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM profiles WHERE id = ?1", PROFILE_COLUMNS),
                params![id],
                row_to_profile,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_profile_by_address(&self, address: &Address) -> Result<Option<Profile>> {
        let address = address.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM profiles WHERE address = ?1", PROFILE_COLUMNS),
                params![address],
                row_to_profile,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_profile_by_name(&self, name: &str) -> Result<Option<Profile>> {
        let name = name.to_string();
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM profiles WHERE name = ?1", PROFILE_COLUMNS),
                params![name],
                row_to_profile,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_profiles(&self) -> Result<Vec<Profile>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {} FROM profiles ORDER BY id", PROFILE_COLUMNS))?;
            let profiles = stmt
                .query_map([], row_to_profile)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(profiles)
        })
        .await
    }

    async fn delete_profile(&self, id: i64) -> Result<bool> {
        self.call(move |conn| Ok(conn.execute("DELETE FROM profiles WHERE id = ?1", params![id])? > 0))
            .await
    }

    async fn set_profile_flag(&self, id: i64, flag: ProfileFlag, value: bool) -> Result<bool> {
        let column = match flag {
            ProfileFlag::Following => "following",
            ProfileFlag::Sharing => "sharing",
            ProfileFlag::Whitelisted => "whitelisted",
        };
        self.call(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE profiles SET {} = ?2 WHERE id = ?1", column),
                params![id, value],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn followed_addresses(&self) -> Result<Vec<Address>> {
        self.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT address FROM profiles WHERE following = 1 ORDER BY id")?;
            let addresses = stmt
                .query_map([], |row| address(row, 0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(addresses)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Peers
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_peer(&self, peer: &Peer) -> Result<i64> {
        let peer = peer.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO peers (
                    name, host, port, uploading, downloading, autoconnect, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    peer.name,
                    peer.address.host,
                    peer.address.port,
                    peer.uploading,
                    peer.downloading,
                    peer.autoconnect,
                    squeaknode_core::now_millis(),
                ],
            )
            .map_err(unique_violation("peer address"))?;
            Ok(conn.last_insert_rowid())
        })
        .await
    }

    async fn get_peer(&self, id: i64) -> Result<Option<Peer>> {
        self.call(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM peers WHERE id = ?1", PEER_COLUMNS),
                params![id],
                row_to_peer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_peer_by_address(&self, address: &PeerAddress) -> Result<Option<Peer>> {
        let address = address.clone();
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM peers WHERE host = ?1 AND port = ?2",
                    PEER_COLUMNS
                ),
                params![address.host, address.port],
                row_to_peer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_peers(&self) -> Result<Vec<Peer>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM peers ORDER BY id", PEER_COLUMNS))?;
            let peers = stmt
                .query_map([], row_to_peer)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(peers)
        })
        .await
    }

    async fn delete_peer(&self, id: i64) -> Result<bool> {
        self.call(move |conn| Ok(conn.execute("DELETE FROM peers WHERE id = ?1", params![id])? > 0))
            .await
    }

    async fn set_peer_flag(&self, id: i64, flag: PeerFlag, value: bool) -> Result<bool> {
        let column = match flag {
            PeerFlag::Uploading => "uploading",
            PeerFlag::Downloading => "downloading",
            PeerFlag::Autoconnect => "autoconnect",
        };
        self.call(move |conn| {
            let changed = conn.execute(
                &format!("UPDATE peers SET {} = ?2 WHERE id = ?1", column),
                params![id, value],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Offers
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_sent_offer(&self, offer: &SentOffer) -> Result<InsertResult> {
        let offer = offer.clone();
        self.call(move |conn| {
            // Refused while an earlier offer for the pair is still live at
            // this offer's invoice timestamp.
            let changed = conn.execute(
                "INSERT OR IGNORE INTO sent_offers (
                    squeak_hash, payment_hash, nonce, encrypted_key, price_msat,
                    payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port
                )
                SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10
                WHERE NOT EXISTS (
                    SELECT 1 FROM sent_offers
                    WHERE squeak_hash = ?1 AND peer_host = ?9 AND peer_port = ?10
                      AND invoice_timestamp + invoice_expiry >= ?7
                )",
                params![
                    offer.squeak_hash.0.as_slice(),
                    offer.payment_hash.0.as_slice(),
                    offer.nonce.0.as_slice(),
                    offer.encrypted_decryption_key,
                    offer.price_msat as i64,
                    offer.payment_request,
                    offer.invoice_timestamp,
                    offer.invoice_expiry,
                    offer.counterparty.host,
                    offer.counterparty.port,
                ],
            )?;
            Ok(inserted(conn, changed))
        })
        .await
    }

    async fn get_sent_offer(
        &self,
        squeak_hash: &SqueakHash,
        counterparty: &PeerAddress,
    ) -> Result<Option<SentOffer>> {
        let hash = *squeak_hash;
        let counterparty = counterparty.clone();
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sent_offers
                     WHERE squeak_hash = ?1 AND peer_host = ?2 AND peer_port = ?3
                     ORDER BY id DESC LIMIT 1",
                    SENT_OFFER_COLUMNS
                ),
                params![hash.0.as_slice(), counterparty.host, counterparty.port],
                row_to_sent_offer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn get_sent_offer_by_payment_hash(
        &self,
        payment_hash: &PaymentHash,
    ) -> Result<Option<SentOffer>> {
        let payment_hash = *payment_hash;
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sent_offers WHERE payment_hash = ?1",
                    SENT_OFFER_COLUMNS
                ),
                params![payment_hash.0.as_slice()],
                row_to_sent_offer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn delete_expired_sent_offers(&self, now_secs: i64) -> Result<u64> {
        self.call(move |conn| {
            let n = conn.execute(
                "DELETE FROM sent_offers WHERE invoice_timestamp + invoice_expiry < ?1",
                params![now_secs],
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn upsert_received_offer(&self, offer: &ReceivedOffer) -> Result<i64> {
        let offer = offer.clone();
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO received_offers (
                    squeak_hash, payment_hash, nonce, encrypted_key, price_msat,
                    payment_request, invoice_timestamp, invoice_expiry, peer_host, peer_port,
                    proof, paid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0)
                ON CONFLICT(squeak_hash, peer_host, peer_port) DO UPDATE SET
                    payment_hash = excluded.payment_hash,
                    nonce = excluded.nonce,
                    encrypted_key = excluded.encrypted_key,
                    price_msat = excluded.price_msat,
                    payment_request = excluded.payment_request,
                    invoice_timestamp = excluded.invoice_timestamp,
                    invoice_expiry = excluded.invoice_expiry,
                    proof = excluded.proof
                WHERE received_offers.paid = 0",
                params![
                    offer.squeak_hash.0.as_slice(),
                    offer.payment_hash.0.as_slice(),
                    offer.nonce.0.as_slice(),
                    offer.encrypted_decryption_key,
                    offer.price_msat as i64,
                    offer.payment_request,
                    offer.invoice_timestamp,
                    offer.invoice_expiry,
                    offer.seller.host,
                    offer.seller.port,
                    offer.proof.0.as_slice(),
                ],
            )?;
            let id: i64 = tx.query_row(
                "SELECT id FROM received_offers
                 WHERE squeak_hash = ?1 AND peer_host = ?2 AND peer_port = ?3",
                params![
                    offer.squeak_hash.0.as_slice(),
                    offer.seller.host,
                    offer.seller.port
                ],
                |row| row.get(0),
            )?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn get_received_offer(&self, id: i64) -> Result<Option<ReceivedOffer>> {
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM received_offers WHERE id = ?1",
                    RECEIVED_OFFER_COLUMNS
                ),
                params![id],
                row_to_received_offer,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn list_received_offers(
        &self,
        squeak_hash: Option<&SqueakHash>,
    ) -> Result<Vec<ReceivedOffer>> {
        let hash = squeak_hash.copied();
        self.call(move |conn| {
            let offers = match hash {
                Some(hash) => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM received_offers WHERE squeak_hash = ?1 ORDER BY id",
                        RECEIVED_OFFER_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map(params![hash.0.as_slice()], row_to_received_offer)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
                None => {
                    let mut stmt = conn.prepare(&format!(
                        "SELECT {} FROM received_offers ORDER BY id",
                        RECEIVED_OFFER_COLUMNS
                    ))?;
                    let rows = stmt
                        .query_map([], row_to_received_offer)?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                }
            };
            Ok(offers)
        })
        .await
    }

    async fn mark_received_offer_paid(&self, id: i64) -> Result<bool> {
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE received_offers SET paid = 1 WHERE id = ?1 AND paid = 0",
                params![id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn delete_expired_received_offers(&self, now_secs: i64) -> Result<u64> {
        self.call(move |conn| {
            let n = conn.execute(
                "DELETE FROM received_offers
                 WHERE paid = 0 AND invoice_timestamp + invoice_expiry < ?1",
                params![now_secs],
            )?;
            Ok(n as u64)
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Payments
    // ─────────────────────────────────────────────────────────────────────────

    async fn insert_sent_payment(&self, payment: &SentPayment) -> Result<InsertResult> {
        let payment = payment.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO sent_payments (
                    squeak_hash, payment_hash, preimage, price_msat, peer_host, peer_port,
                    created_at, valid
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    payment.squeak_hash.0.as_slice(),
                    payment.payment_hash.0.as_slice(),
                    payment.preimage.0.as_slice(),
                    payment.price_msat as i64,
                    payment.seller.host,
                    payment.seller.port,
                    payment.created_at,
                    payment.valid,
                ],
            )?;
            Ok(inserted(conn, changed))
        })
        .await
    }

    async fn get_sent_payment(&self, payment_hash: &PaymentHash) -> Result<Option<SentPayment>> {
        let payment_hash = *payment_hash;
        self.call(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM sent_payments WHERE payment_hash = ?1",
                    SENT_PAYMENT_COLUMNS
                ),
                params![payment_hash.0.as_slice()],
                row_to_sent_payment,
            )
            .optional()
            .map_err(StoreError::from)
        })
        .await
    }

    async fn set_sent_payment_valid(
        &self,
        payment_hash: &PaymentHash,
        valid: bool,
    ) -> Result<bool> {
        let payment_hash = *payment_hash;
        self.call(move |conn| {
            let changed = conn.execute(
                "UPDATE sent_payments SET valid = ?2 WHERE payment_hash = ?1",
                params![payment_hash.0.as_slice(), valid],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_sent_payments(&self) -> Result<Vec<SentPayment>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM sent_payments ORDER BY id",
                SENT_PAYMENT_COLUMNS
            ))?;
            let payments = stmt
                .query_map([], row_to_sent_payment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(payments)
        })
        .await
    }

    async fn insert_received_payment(&self, payment: &ReceivedPayment) -> Result<InsertResult> {
        let payment = payment.clone();
        self.call(move |conn| {
            let changed = conn.execute(
                "INSERT OR IGNORE INTO received_payments (
                    squeak_hash, payment_hash, price_msat, settle_index, peer_host, peer_port,
                    created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    payment.squeak_hash.0.as_slice(),
                    payment.payment_hash.0.as_slice(),
                    payment.price_msat as i64,
                    payment.settle_index as i64,
                    payment.buyer.host,
                    payment.buyer.port,
                    payment.created_at,
                ],
            )?;
            Ok(inserted(conn, changed))
        })
        .await
    }

    async fn list_received_payments(&self) -> Result<Vec<ReceivedPayment>> {
        self.call(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM received_payments ORDER BY settle_index",
                RECEIVED_PAYMENT_COLUMNS
            ))?;
            let payments = stmt
                .query_map([], row_to_received_payment)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(payments)
        })
        .await
    }

    async fn latest_settle_index(&self) -> Result<u64> {
        self.call(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COALESCE(MAX(settle_index), 0) FROM received_payments",
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }

    async fn total_received_msat(&self) -> Result<u64> {
        self.call(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COALESCE(SUM(price_msat), 0) FROM received_payments",
                [],
                |row| row.get(0),
            )?;
            Ok(n as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::StoreExt;
    use squeaknode_core::{BlockHash, SqueakBuilder};

    fn make_squeak(keypair: &Keypair, height: u64, content: &str) -> Squeak {
        SqueakBuilder::new(height, BlockHash::from_bytes([height as u8; 32]))
            .created_at(1_736_870_400_000)
            .content(content)
            .sign(keypair)
            .unwrap()
    }

    fn make_sent_offer(hash: SqueakHash, counterparty: PeerAddress, ts: i64) -> SentOffer {
        let preimage = Preimage::generate();
        SentOffer {
            id: 0,
            squeak_hash: hash,
            payment_hash: preimage.payment_hash(),
            nonce: EncryptionNonce::generate(),
            encrypted_decryption_key: vec![1, 2, 3],
            price_msat: 1000,
            payment_request: "lnmem1".into(),
            invoice_timestamp: ts,
            invoice_expiry: 3600,
            counterparty,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_squeak() {
        let store = SqliteStore::open_memory().unwrap();
        let keypair = Keypair::generate();
        let squeak = make_squeak(&keypair, 100, "hello");
        let hash = squeak.compute_hash();

        let result = store.insert_squeak(&squeak).await.unwrap();
        assert!(result.is_inserted());

        let stored = store.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(stored, squeak);
        assert_eq!(stored.decrypt_content().unwrap(), "hello");
        assert!(store.has_squeak(&hash).await.unwrap());
    }

    #[tokio::test]
    async fn test_idempotent_insert() {
        let store = SqliteStore::open_memory().unwrap();
        let squeak = make_squeak(&Keypair::generate(), 1, "x");

        assert!(store.insert_squeak(&squeak).await.unwrap().is_inserted());
        assert_eq!(
            store.insert_squeak(&squeak).await.unwrap(),
            InsertResult::AlreadyExists
        );
        assert_eq!(store.count_squeaks().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_locked_then_key_attached() {
        let store = SqliteStore::open_memory().unwrap();
        let squeak = make_squeak(&Keypair::generate(), 1, "secret");
        let hash = squeak.compute_hash();

        store.insert_squeak(&squeak.locked()).await.unwrap();
        assert!(!store.get_squeak(&hash).await.unwrap().unwrap().is_unlocked());

        let key = squeak.decryption_key.clone().unwrap();
        assert!(store.set_decryption_key(&hash, &key).await.unwrap());
        let stored = store.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(stored.decrypt_content().unwrap(), "secret");
    }

    #[tokio::test]
    async fn test_count_by_author_at_height() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = Keypair::generate();
        let bob = Keypair::generate();

        for i in 0..3 {
            store
                .insert_squeak(&make_squeak(&alice, 10, &format!("a{}", i)))
                .await
                .unwrap();
        }
        store.insert_squeak(&make_squeak(&alice, 11, "later")).await.unwrap();
        store.insert_squeak(&make_squeak(&bob, 10, "bob")).await.unwrap();

        assert_eq!(
            store
                .count_squeaks_by_author_at_height(&alice.address(), 10)
                .await
                .unwrap(),
            3
        );
        assert_eq!(
            store
                .count_squeaks_by_author_at_height(&bob.address(), 10)
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_lookup_by_interest() {
        let store = SqliteStore::open_memory().unwrap();
        let alice = Keypair::generate();
        let bob = Keypair::generate();
        let a5 = make_squeak(&alice, 5, "a5");
        let a9 = make_squeak(&alice, 9, "a9");
        let b7 = make_squeak(&bob, 7, "b7");
        for s in [&a5, &a9, &b7] {
            store.insert_squeak(s).await.unwrap();
        }

        let all = store.lookup_squeaks(&Interest::any()).await.unwrap();
        assert_eq!(all, vec![a5.compute_hash(), b7.compute_hash(), a9.compute_hash()]);

        let alice_only = store
            .lookup_squeaks(&Interest::author(alice.address()).with_min_block(6))
            .await
            .unwrap();
        assert_eq!(alice_only, vec![a9.compute_hash()]);

        let union = store
            .lookup_squeaks_any(&[
                Interest::author(bob.address()),
                Interest::any().with_max_block(7),
            ])
            .await
            .unwrap();
        assert_eq!(union.len(), 2);
    }

    #[tokio::test]
    async fn test_lookup_bounds_past_i64_agree_with_memory() {
        let sqlite = SqliteStore::open_memory().unwrap();
        let memory = crate::memory::MemoryStore::new();
        let squeak = make_squeak(&Keypair::generate(), 100, "tall");
        sqlite.insert_squeak(&squeak).await.unwrap();
        memory.insert_squeak(&squeak).await.unwrap();

        let cases = [
            (Interest::any().with_min_block(u64::MAX), 0),
            (Interest::any().with_min_block(i64::MAX as u64 + 1), 0),
            (Interest::any().with_max_block(u64::MAX), 1),
            (Interest::any().with_min_block(50).with_max_block(u64::MAX), 1),
        ];
        for (interest, expected) in cases {
            let from_sqlite = sqlite.lookup_squeaks(&interest).await.unwrap();
            let from_memory = memory.lookup_squeaks(&interest).await.unwrap();
            assert_eq!(from_sqlite.len(), expected, "{:?}", interest);
            assert_eq!(from_sqlite, from_memory, "{:?}", interest);
        }
    }

    #[tokio::test]
    async fn test_lookup_by_reply_to() {
        let store = SqliteStore::open_memory().unwrap();
        let keypair = Keypair::generate();
        let parent = make_squeak(&keypair, 1, "parent");
        let reply = SqueakBuilder::new(2, BlockHash::from_bytes([2; 32]))
            .reply_to(parent.compute_hash())
            .content("reply")
            .sign(&keypair)
            .unwrap();
        store.insert_squeak(&parent).await.unwrap();
        store.insert_squeak(&reply).await.unwrap();

        let replies = store
            .lookup_squeaks(&Interest::any().with_reply_to(parent.compute_hash()))
            .await
            .unwrap();
        assert_eq!(replies, vec![reply.compute_hash()]);
    }

    #[tokio::test]
    async fn test_profile_uniqueness() {
        let store = SqliteStore::open_memory().unwrap();
        let keypair = Keypair::generate();
        let id = store
            .insert_profile(&Profile::signing("alice", keypair.clone()))
            .await
            .unwrap();

        let stored = store.get_profile(id).await.unwrap().unwrap();
        assert!(stored.is_signing());
        assert_eq!(stored.keypair().unwrap().public_key(), keypair.public_key());

        let dup_name = store
            .insert_profile(&Profile::contact("alice", Keypair::generate().address()))
            .await;
        assert!(matches!(dup_name, Err(StoreError::Duplicate(_))));

        let dup_address = store
            .insert_profile(&Profile::contact("other", keypair.address()))
            .await;
        assert!(matches!(dup_address, Err(StoreError::Duplicate(_))));
    }

    #[tokio::test]
    async fn test_profile_flags_and_following() {
        let store = SqliteStore::open_memory().unwrap();
        let contact = Keypair::generate().address();
        let id = store
            .insert_profile(&Profile::contact("bob", contact))
            .await
            .unwrap();
        assert!(store.followed_addresses().await.unwrap().is_empty());
        assert!(!store.is_whitelisted(&contact).await.unwrap());

        store.set_profile_flag(id, ProfileFlag::Following, true).await.unwrap();
        store.set_profile_flag(id, ProfileFlag::Whitelisted, true).await.unwrap();
        assert_eq!(store.followed_addresses().await.unwrap(), vec![contact]);
        assert!(store.is_whitelisted(&contact).await.unwrap());

        assert!(store.delete_profile(id).await.unwrap());
        assert!(store.get_profile_by_name("bob").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_peer_crud() {
        let store = SqliteStore::open_memory().unwrap();
        let address = PeerAddress::new("10.0.0.1", 8555);
        let id = store.insert_peer(&Peer::new("p", address.clone())).await.unwrap();

        let dup = store.insert_peer(&Peer::new("q", address.clone())).await;
        assert!(matches!(dup, Err(StoreError::Duplicate(_))));

        store.set_peer_flag(id, PeerFlag::Autoconnect, true).await.unwrap();
        let peer = store.get_peer_by_address(&address).await.unwrap().unwrap();
        assert!(peer.autoconnect);
        assert_eq!(store.list_peers().await.unwrap().len(), 1);
        assert!(store.delete_peer(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sent_offer_live_per_counterparty() {
        let store = SqliteStore::open_memory().unwrap();
        let hash = SqueakHash::from_bytes([1; 32]);
        let peer = PeerAddress::new("buyer", 1);

        let first = make_sent_offer(hash, peer.clone(), 1_000);
        assert!(store.insert_sent_offer(&first).await.unwrap().is_inserted());
        // One live offer per pair.
        let rival = make_sent_offer(hash, peer.clone(), 1_500);
        assert_eq!(
            store.insert_sent_offer(&rival).await.unwrap(),
            InsertResult::AlreadyExists
        );
        // Once the first has expired, a reissue sits beside it.
        let second = make_sent_offer(hash, peer.clone(), 1_000 + 3_600 + 1);
        assert!(store.insert_sent_offer(&second).await.unwrap().is_inserted());

        let other = make_sent_offer(hash, PeerAddress::new("buyer", 2), 1_000);
        assert!(store.insert_sent_offer(&other).await.unwrap().is_inserted());

        // Newest offer for the pair wins; older ones still resolve by payment hash.
        let stored = store.get_sent_offer(&hash, &peer).await.unwrap().unwrap();
        assert_eq!(stored.payment_hash, second.payment_hash);
        let by_payment = store
            .get_sent_offer_by_payment_hash(&first.payment_hash)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_payment.counterparty, peer);
    }

    #[tokio::test]
    async fn test_expired_sent_offers_swept() {
        let store = SqliteStore::open_memory().unwrap();
        let hash = SqueakHash::from_bytes([1; 32]);
        store
            .insert_sent_offer(&make_sent_offer(hash, PeerAddress::new("a", 1), 0))
            .await
            .unwrap();
        store
            .insert_sent_offer(&make_sent_offer(hash, PeerAddress::new("b", 1), 10_000))
            .await
            .unwrap();

        assert_eq!(store.delete_expired_sent_offers(3_600).await.unwrap(), 0);
        assert_eq!(store.delete_expired_sent_offers(3_601).await.unwrap(), 1);
        assert!(store
            .get_sent_offer(&hash, &PeerAddress::new("b", 1))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_received_offer_upsert_keeps_paid() {
        let store = SqliteStore::open_memory().unwrap();
        let hash = SqueakHash::from_bytes([4; 32]);
        let seller = PeerAddress::new("seller", 1);
        let sent = make_sent_offer(hash, seller.clone(), 1_000);
        let mut offer = ReceivedOffer {
            id: 0,
            squeak_hash: hash,
            payment_hash: sent.payment_hash,
            nonce: sent.nonce,
            encrypted_decryption_key: sent.encrypted_decryption_key.clone(),
            price_msat: 1000,
            payment_request: "first".into(),
            invoice_timestamp: 1_000,
            invoice_expiry: 3600,
            seller: seller.clone(),
            proof: Proof([7; 32]),
            paid: false,
        };

        let id = store.upsert_received_offer(&offer).await.unwrap();
        offer.payment_request = "second".into();
        assert_eq!(store.upsert_received_offer(&offer).await.unwrap(), id);
        assert_eq!(
            store.get_received_offer(id).await.unwrap().unwrap().payment_request,
            "second"
        );

        assert!(store.mark_received_offer_paid(id).await.unwrap());
        assert!(!store.mark_received_offer_paid(id).await.unwrap());
        offer.payment_request = "third".into();
        store.upsert_received_offer(&offer).await.unwrap();
        let stored = store.get_received_offer(id).await.unwrap().unwrap();
        assert!(stored.paid);
        assert_eq!(stored.payment_request, "second");
        assert_eq!(store.list_received_offers(Some(&hash)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_payment_hash_unique() {
        let store = SqliteStore::open_memory().unwrap();
        let preimage = Preimage::generate();
        let payment = ReceivedPayment {
            id: 0,
            squeak_hash: SqueakHash::from_bytes([1; 32]),
            payment_hash: preimage.payment_hash(),
            price_msat: 1000,
            settle_index: 7,
            buyer: PeerAddress::new("buyer", 1),
            created_at: 0,
        };
        assert!(store.insert_received_payment(&payment).await.unwrap().is_inserted());
        assert_eq!(
            store.insert_received_payment(&payment).await.unwrap(),
            InsertResult::AlreadyExists
        );
        assert_eq!(store.latest_settle_index().await.unwrap(), 7);
        assert_eq!(store.total_received_msat().await.unwrap(), 1000);

        let sent = SentPayment {
            id: 0,
            squeak_hash: payment.squeak_hash,
            payment_hash: payment.payment_hash,
            preimage,
            price_msat: 1000,
            seller: PeerAddress::new("seller", 1),
            created_at: 0,
            valid: true,
        };
        assert!(store.insert_sent_payment(&sent).await.unwrap().is_inserted());
        assert!(!store.insert_sent_payment(&sent).await.unwrap().is_inserted());
        store
            .set_sent_payment_valid(&sent.payment_hash, false)
            .await
            .unwrap();
        assert!(!store.get_sent_payment(&sent.payment_hash).await.unwrap().unwrap().valid);
    }

    #[tokio::test]
    async fn test_reopen_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("squeaknode.db");
        let squeak = make_squeak(&Keypair::generate(), 3, "persisted");
        let hash = squeak.compute_hash();

        {
            let store = SqliteStore::open(&path).unwrap();
            store.insert_squeak(&squeak).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let stored = store.get_squeak(&hash).await.unwrap().unwrap();
        assert_eq!(stored.decrypt_content().unwrap(), "persisted");
    }
}
