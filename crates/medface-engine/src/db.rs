//! SQLite-backed enrollment store with optional AES-256-GCM sealing of
//! descriptors at rest.
//!
//! All records are loaded into an in-memory cache at open; writes go to
//! SQLite first and then to the cache while the connection lock is held, so
//! the two never disagree about a single identity.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use chrono::{DateTime, Utc};
use medface_core::store::check_dimension;
use medface_core::{
    EnrollmentRecord, EnrollmentStore, FaceDescriptor, IdentityKey, MemoryStore, Snapshot,
    StoreError,
};
use rand::{rngs::OsRng, RngCore};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const NONCE_LEN: usize = 12;
const DIM_META_KEY: &str = "descriptor_dim";

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS meta (
        key   TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );
    CREATE TABLE IF NOT EXISTS enrollments (
        identity_key TEXT PRIMARY KEY,
        descriptor   BLOB NOT NULL,
        nonce        BLOB,
        enrolled_at  TEXT NOT NULL
    );
";

#[derive(Error, Debug)]
pub enum DbError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("failed to create {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("meta entry {key} is corrupt: {message}")]
    Meta { key: String, message: String },
    #[error("record {identity} is corrupt: {message}")]
    Corrupt { identity: String, message: String },
    #[error("record {identity} is encrypted but no store key is configured")]
    KeyRequired { identity: String },
    #[error("record {identity} could not be decrypted (wrong store key?)")]
    Decrypt { identity: String },
    #[error("descriptor encryption failed")]
    Encrypt,
}

impl From<DbError> for StoreError {
    fn from(err: DbError) -> Self {
        StoreError::backend(err)
    }
}

fn sql(err: rusqlite::Error) -> StoreError {
    DbError::Sqlite(err).into()
}

/// Row as stored, before decoding.
struct RawRow {
    identity_key: String,
    descriptor: Vec<u8>,
    nonce: Option<Vec<u8>>,
    enrolled_at: String,
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
    cipher: Option<Aes256Gcm>,
    cache: MemoryStore,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    ///
    /// Fails with [`StoreError::DimensionMismatch`] if the database was
    /// created for a different descriptor length.
    pub fn open(
        path: &Path,
        dimension: usize,
        store_key: Option<&str>,
    ) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| DbError::CreateDir {
                path: parent.display().to_string(),
                source,
            })?;
        }
        let conn = Connection::open(path).map_err(sql)?;
        let store = Self::with_connection(conn, dimension, store_key)?;
        tracing::info!(
            path = %path.display(),
            dimension,
            enrolled = store.cache.len()?,
            encrypted = store.is_encrypted(),
            "enrollment database opened"
        );
        Ok(store)
    }

    pub fn open_in_memory(dimension: usize, store_key: Option<&str>) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(sql)?;
        Self::with_connection(conn, dimension, store_key)
    }

    fn with_connection(
        mut conn: Connection,
        dimension: usize,
        store_key: Option<&str>,
    ) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA).map_err(sql)?;
        check_or_record_dimension(&conn, dimension)?;

        let cipher = store_key.map(cipher_for_passphrase).transpose()?;
        let cache = MemoryStore::new(dimension);
        let mut plaintext = Vec::new();

        {
            let mut stmt = conn
                .prepare("SELECT identity_key, descriptor, nonce, enrolled_at FROM enrollments")
                .map_err(sql)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(RawRow {
                        identity_key: row.get(0)?,
                        descriptor: row.get(1)?,
                        nonce: row.get(2)?,
                        enrolled_at: row.get(3)?,
                    })
                })
                .map_err(sql)?;
            for row in rows {
                let row = row.map_err(sql)?;
                let sealed = row.nonce.is_some();
                let record = decode_row(row, cipher.as_ref())?;
                if !sealed && cipher.is_some() {
                    plaintext.push(record.clone());
                }
                cache.restore(record)?;
            }
        }

        if let Some(cipher) = &cipher {
            if !plaintext.is_empty() {
                reseal(&mut conn, cipher, &plaintext)?;
            }
        }

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
            cache,
        })
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Serialize a descriptor, sealing it when a key is configured.
    fn seal(&self, record: &EnrollmentRecord) -> Result<(Vec<u8>, Option<Vec<u8>>), DbError> {
        match &self.cipher {
            Some(cipher) => {
                let (sealed, nonce) = seal_with(cipher, record)?;
                Ok((sealed, Some(nonce)))
            }
            None => Ok((encode_descriptor(&record.descriptor), None)),
        }
    }
}

fn seal_with(
    cipher: &Aes256Gcm,
    record: &EnrollmentRecord,
) -> Result<(Vec<u8>, Vec<u8>), DbError> {
    let plain = encode_descriptor(&record.descriptor);
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: &plain,
                aad: record.identity_key.as_str().as_bytes(),
            },
        )
        .map_err(|_| DbError::Encrypt)?;
    Ok((sealed, nonce.to_vec()))
}

/// Encrypt rows written before a store key was configured.
fn reseal(
    conn: &mut Connection,
    cipher: &Aes256Gcm,
    records: &[EnrollmentRecord],
) -> Result<(), StoreError> {
    let tx = conn.transaction().map_err(sql)?;
    for record in records {
        let (blob, nonce) = seal_with(cipher, record)?;
        tx.execute(
            "UPDATE enrollments SET descriptor = ?1, nonce = ?2 WHERE identity_key = ?3",
            params![blob, nonce, record.identity_key.as_str()],
        )
        .map_err(sql)?;
    }
    tx.commit().map_err(sql)?;
    tracing::warn!(
        rows = records.len(),
        "encrypted enrollment rows that were stored in plaintext"
    );
    Ok(())
}

impl EnrollmentStore for SqliteStore {
    fn dimension(&self) -> usize {
        self.cache.dimension()
    }

    fn put(
        &self,
        key: IdentityKey,
        descriptor: FaceDescriptor,
    ) -> Result<EnrollmentRecord, StoreError> {
        check_dimension(self.dimension(), &descriptor)?;
        let record = EnrollmentRecord {
            identity_key: key,
            descriptor,
            enrolled_at: Utc::now(),
        };
        let (blob, nonce) = self.seal(&record)?;

        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        conn.execute(
            "INSERT INTO enrollments (identity_key, descriptor, nonce, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identity_key) DO UPDATE SET
                descriptor = excluded.descriptor,
                nonce = excluded.nonce,
                enrolled_at = excluded.enrolled_at",
            params![
                record.identity_key.as_str(),
                blob,
                nonce,
                record.enrolled_at.to_rfc3339()
            ],
        )
        .map_err(sql)?;
        self.cache.restore(record.clone())?;
        Ok(record)
    }

    fn get(&self, key: &IdentityKey) -> Result<Option<EnrollmentRecord>, StoreError> {
        self.cache.get(key)
    }

    fn snapshot(&self) -> Result<Snapshot, StoreError> {
        self.cache.snapshot()
    }

    fn remove(&self, key: &IdentityKey) -> Result<bool, StoreError> {
        let conn = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        let deleted = conn
            .execute(
                "DELETE FROM enrollments WHERE identity_key = ?1",
                params![key.as_str()],
            )
            .map_err(sql)?;
        self.cache.remove(key)?;
        Ok(deleted > 0)
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.cache.len()
    }
}

fn check_or_record_dimension(conn: &Connection, dimension: usize) -> Result<(), StoreError> {
    let stored: Option<String> = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![DIM_META_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(sql)?;

    match stored {
        Some(value) => {
            let actual: usize = value.parse().map_err(|_| DbError::Meta {
                key: DIM_META_KEY.to_string(),
                message: format!("non-numeric dimension '{value}'"),
            })?;
            if actual != dimension {
                return Err(StoreError::DimensionMismatch {
                    expected: dimension,
                    actual,
                });
            }
        }
        None => {
            conn.execute(
                "INSERT INTO meta (key, value) VALUES (?1, ?2)",
                params![DIM_META_KEY, dimension.to_string()],
            )
            .map_err(sql)?;
        }
    }
    Ok(())
}

fn cipher_for_passphrase(passphrase: &str) -> Result<Aes256Gcm, StoreError> {
    let key = Sha256::digest(passphrase.as_bytes());
    Aes256Gcm::new_from_slice(&key).map_err(|_| DbError::Encrypt.into())
}

fn encode_descriptor(descriptor: &FaceDescriptor) -> Vec<u8> {
    descriptor
        .values()
        .iter()
        .flat_map(|v| v.to_le_bytes())
        .collect()
}

fn decode_descriptor(identity: &str, bytes: &[u8]) -> Result<FaceDescriptor, DbError> {
    if bytes.len() % 4 != 0 {
        return Err(DbError::Corrupt {
            identity: identity.to_string(),
            message: format!("descriptor blob of {} bytes", bytes.len()),
        });
    }
    let values = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(FaceDescriptor::new(values))
}

fn decode_row(row: RawRow, cipher: Option<&Aes256Gcm>) -> Result<EnrollmentRecord, DbError> {
    let identity = row.identity_key;

    let plain = match (row.nonce, cipher) {
        (None, _) => row.descriptor,
        (Some(_), None) => return Err(DbError::KeyRequired { identity }),
        (Some(nonce), Some(cipher)) => {
            if nonce.len() != NONCE_LEN {
                return Err(DbError::Corrupt {
                    identity,
                    message: format!("nonce of {} bytes", nonce.len()),
                });
            }
            cipher
                .decrypt(
                    Nonce::from_slice(&nonce),
                    Payload {
                        msg: &row.descriptor,
                        aad: identity.as_bytes(),
                    },
                )
                .map_err(|_| DbError::Decrypt {
                    identity: identity.clone(),
                })?
        }
    };

    let descriptor = decode_descriptor(&identity, &plain)?;
    let enrolled_at = DateTime::parse_from_rfc3339(&row.enrolled_at)
        .map_err(|e| DbError::Corrupt {
            identity: identity.clone(),
            message: format!("enrolled_at: {e}"),
        })?
        .with_timezone(&Utc);

    Ok(EnrollmentRecord {
        identity_key: IdentityKey::new(identity),
        descriptor,
        enrolled_at,
    })
}
