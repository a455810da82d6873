use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

use rollcall_core::{
    AttendanceRecord, AttendanceStore, FaceEmbedding, RecordOutcome, StorageError, EMBEDDING_DIM,
};

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

const EMBEDDING_BYTE_LEN: usize = EMBEDDING_DIM * 4;

const SCHEMA: &str = "PRAGMA journal_mode = WAL;
     PRAGMA foreign_keys = ON;
     CREATE TABLE IF NOT EXISTS identities (
         id TEXT PRIMARY KEY,
         name TEXT NOT NULL,
         reference TEXT NOT NULL UNIQUE,
         embedding BLOB NOT NULL,
         created_at TEXT NOT NULL
     );
     CREATE TABLE IF NOT EXISTS attendance (
         id TEXT PRIMARY KEY,
         identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
         date TEXT NOT NULL,
         time TEXT NOT NULL,
         confidence REAL NOT NULL,
         UNIQUE (identity_id, date)
     );
     CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("identity already enrolled: {0}")]
    AlreadyEnrolled(String),
    #[error("unknown identity: {0}")]
    UnknownIdentity(String),
    #[error("embedding encryption failed")]
    EncryptionFailed,
    #[error("embedding decryption failed — key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid embedding blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid embedding dimension: {0} (expected {EMBEDDING_DIM})")]
    InvalidEmbeddingDim(usize),
    #[error("invalid embedding value (NaN/Inf)")]
    InvalidEmbeddingValue,
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
    #[error("failed to create data directory {path}: {source}")]
    DataDir {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// SQLite-backed identity and attendance storage with AES-256-GCM encryption
/// of the stored embeddings.
///
/// Embeddings are encrypted before storage and decrypted on retrieval.
/// A per-installation 32-byte key is generated at first use and stored at
/// `{db_dir}/.key` (mode 0600, owner-readable only).
#[derive(Clone, Debug)]
pub struct RollcallStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl RollcallStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::DataDir {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let enc_key = if db_path == Path::new(":memory:") {
            // In-memory DB (tests): use a fixed all-zeros key
            [0u8; 32]
        } else {
            let key_path = db_path
                .parent()
                .unwrap_or(Path::new("/var/lib/rollcall"))
                .join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn, enc_key })
    }

    /// The installation's embedding encryption key, shared with the engine
    /// thread's synchronous connection.
    pub fn encryption_key(&self) -> [u8; 32] {
        self.enc_key
    }

    /// Enroll a new identity. Returns the generated UUID.
    ///
    /// `reference` is the external identifier attendance is keyed on (a roll
    /// number or badge ID); re-enrolling an existing reference is rejected.
    pub async fn enroll(
        &self,
        name: &str,
        reference: &str,
        embedding: &FaceEmbedding,
    ) -> Result<String, StoreError> {
        let id = uuid::Uuid::new_v4().to_string();
        let created_at = chrono::Utc::now().to_rfc3339();
        let blob = encrypt_embedding(&self.enc_key, embedding.values())?;

        let id_clone = id.clone();
        let name = name.to_string();
        let reference_owned = reference.to_string();

        let result = self
            .conn
            .call(move |conn| {
                Ok(conn.execute(
                    "INSERT INTO identities (id, name, reference, embedding, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    rusqlite::params![id_clone, name, reference_owned, blob, created_at],
                ))
            })
            .await?;

        match result {
            Ok(_) => Ok(id),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::AlreadyEnrolled(reference.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The enrolled embedding for a reference, if any.
    pub async fn embedding_for(
        &self,
        reference: &str,
    ) -> Result<Option<FaceEmbedding>, StoreError> {
        let reference = reference.to_string();
        let blob: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                use rusqlite::OptionalExtension;
                Ok(conn
                    .query_row(
                        "SELECT embedding FROM identities WHERE reference = ?1",
                        [&reference],
                        |row| row.get(0),
                    )
                    .optional()?)
            })
            .await?;

        match blob {
            Some(blob) => {
                let values = decrypt_embedding(&self.enc_key, &blob)?;
                Ok(Some(embedding_from_values(values)?))
            }
            None => Ok(None),
        }
    }

    /// Attendance history for a reference, most recent first.
    pub async fn history(
        &self,
        reference: &str,
        limit: u32,
    ) -> Result<Vec<AttendanceEntry>, StoreError> {
        let reference = reference.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT a.date, a.time, a.confidence
                     FROM attendance a JOIN identities i ON a.identity_id = i.id
                     WHERE i.reference = ?1
                     ORDER BY a.date DESC, a.time DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![reference, limit], |row| {
                    Ok(AttendanceEntry {
                        date: row.get(0)?,
                        time: row.get(1)?,
                        confidence: row.get(2)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Everyone who attended on a given date, earliest first.
    pub async fn daily_report(&self, date: &str) -> Result<Vec<ReportEntry>, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT i.name, i.reference, a.time, a.confidence
                     FROM attendance a JOIN identities i ON a.identity_id = i.id
                     WHERE a.date = ?1
                     ORDER BY a.time",
                )?;
                let rows = stmt.query_map([&date], |row| {
                    Ok(ReportEntry {
                        name: row.get(0)?,
                        reference: row.get(1)?,
                        time: row.get(2)?,
                        confidence: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// List enrolled identities (metadata only, no embeddings).
    pub async fn list_identities(&self) -> Result<Vec<IdentityInfo>, StoreError> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, name, reference, created_at
                     FROM identities ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok(IdentityInfo {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        reference: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Remove an identity and (via cascade) its attendance history.
    pub async fn remove_identity(&self, reference: &str) -> Result<bool, StoreError> {
        let reference = reference.to_string();
        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "DELETE FROM identities WHERE reference = ?1",
                    [&reference],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count enrolled identities.
    pub async fn count_identities(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }

    /// Count attendance events on a given date.
    pub async fn count_attendance_on(&self, date: &str) -> Result<u64, StoreError> {
        let date = date.to_string();
        self.conn
            .call(move |conn| {
                let count: u64 = conn.query_row(
                    "SELECT COUNT(*) FROM attendance WHERE date = ?1",
                    [&date],
                    |row| row.get(0),
                )?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

/// Synchronous view of the same database for the engine thread, which runs
/// the verification pipeline without an async runtime. Opens its own
/// connection; WAL makes the concurrent readers/writer mix safe.
pub struct SyncStore {
    conn: rusqlite::Connection,
    enc_key: [u8; 32],
}

impl SyncStore {
    pub fn open(db_path: &Path, enc_key: [u8; 32]) -> Result<Self, StoreError> {
        let conn = rusqlite::Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        Ok(Self { conn, enc_key })
    }
}

impl AttendanceStore for SyncStore {
    fn stored_embedding(&self, identity: &str) -> Result<Option<FaceEmbedding>, StorageError> {
        use rusqlite::OptionalExtension;
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT embedding FROM identities WHERE reference = ?1",
                [identity],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::new)?;

        match blob {
            Some(blob) => {
                let values =
                    decrypt_embedding(&self.enc_key, &blob).map_err(StorageError::new)?;
                let embedding = embedding_from_values(values).map_err(StorageError::new)?;
                Ok(Some(embedding))
            }
            None => Ok(None),
        }
    }

    fn has_attendance_on(
        &self,
        identity: &str,
        date: chrono::NaiveDate,
    ) -> Result<bool, StorageError> {
        let count: u64 = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM attendance a
                 JOIN identities i ON a.identity_id = i.id
                 WHERE i.reference = ?1 AND a.date = ?2",
                rusqlite::params![identity, date.to_string()],
                |row| row.get(0),
            )
            .map_err(StorageError::new)?;
        Ok(count > 0)
    }

    fn record_attendance(&self, record: &AttendanceRecord) -> Result<RecordOutcome, StorageError> {
        use rusqlite::OptionalExtension;
        let identity_id: Option<String> = self
            .conn
            .query_row(
                "SELECT id FROM identities WHERE reference = ?1",
                [&record.identity],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::new)?;

        let Some(identity_id) = identity_id else {
            return Err(StorageError::new(StoreError::UnknownIdentity(
                record.identity.clone(),
            )));
        };

        let id = uuid::Uuid::new_v4().to_string();
        let result = self.conn.execute(
            "INSERT INTO attendance (id, identity_id, date, time, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                id,
                identity_id,
                record.date.to_string(),
                record.time.format("%H:%M:%S").to_string(),
                f64::from(record.confidence),
            ],
        );

        match result {
            Ok(_) => Ok(RecordOutcome::Inserted),
            // The UNIQUE (identity_id, date) constraint is authoritative for
            // one-per-day; losing a race is a duplicate, not an error.
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Ok(RecordOutcome::Duplicate)
            }
            Err(e) => Err(StorageError::new(e)),
        }
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        if bytes.len() != 32 {
            return Err(StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        tracing::debug!(path = %key_path.display(), "loaded encryption key");
        Ok(key)
    } else {
        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);

        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(key_path)
            .map_err(StoreError::KeyIo)?;
        f.write_all(&key).map_err(StoreError::KeyIo)?;

        tracing::info!(path = %key_path.display(), "generated new AES-256 encryption key");
        Ok(key)
    }
}

// ── Encryption helpers ────────────────────────────────────────────────────────

/// Encrypt embedding values with AES-256-GCM.
///
/// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
fn encrypt_embedding(enc_key: &[u8; 32], values: &[f32]) -> Result<Vec<u8>, StoreError> {
    validate_embedding_values(values)?;
    let plaintext = embedding_to_bytes(values);

    let mut nonce_bytes = [0u8; 12];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let key = Key::<Aes256Gcm>::from_slice(enc_key);
    let cipher = Aes256Gcm::new(key);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_slice())
        .map_err(|_| StoreError::EncryptionFailed)?;

    let mut blob = Vec::with_capacity(12 + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(blob)
}

/// Decrypt an embedding blob (12-byte nonce + ciphertext + 16-byte GCM tag).
fn decrypt_embedding(enc_key: &[u8; 32], blob: &[u8]) -> Result<Vec<f32>, StoreError> {
    const NONCE_LEN: usize = 12;

    if blob.len() <= NONCE_LEN {
        return Err(StoreError::InvalidBlob(blob.len()));
    }

    let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let key = Key::<Aes256Gcm>::from_slice(enc_key);
    let cipher = Aes256Gcm::new(key);

    let plaintext = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| StoreError::DecryptionFailed)?;

    bytes_to_embedding_strict(&plaintext)
}

// ── Serialization helpers ─────────────────────────────────────────────────────

fn embedding_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for &v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

fn bytes_to_embedding_strict(bytes: &[u8]) -> Result<Vec<f32>, StoreError> {
    if bytes.len() != EMBEDDING_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }

    let mut values = Vec::with_capacity(EMBEDDING_DIM);
    for chunk in bytes.chunks_exact(4) {
        let arr: [u8; 4] = chunk
            .try_into()
            .map_err(|_| StoreError::InvalidBlob(bytes.len()))?;
        let v = f32::from_le_bytes(arr);
        if !v.is_finite() {
            return Err(StoreError::InvalidEmbeddingValue);
        }
        values.push(v);
    }

    Ok(values)
}

fn validate_embedding_values(values: &[f32]) -> Result<(), StoreError> {
    if values.len() != EMBEDDING_DIM {
        return Err(StoreError::InvalidEmbeddingDim(values.len()));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(StoreError::InvalidEmbeddingValue);
    }
    Ok(())
}

fn embedding_from_values(values: Vec<f32>) -> Result<FaceEmbedding, StoreError> {
    FaceEmbedding::new(values).map_err(|e| match e {
        rollcall_core::EmbeddingError::InvalidDimension(d) => StoreError::InvalidEmbeddingDim(d),
        rollcall_core::EmbeddingError::NonFiniteValue => StoreError::InvalidEmbeddingValue,
    })
}

// ── Public types ──────────────────────────────────────────────────────────────

/// One attendance event for an identity (no identity data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct AttendanceEntry {
    pub date: String,
    pub time: String,
    pub confidence: f64,
}

/// One row of a daily report.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReportEntry {
    pub name: String,
    pub reference: String,
    pub time: String,
    pub confidence: f64,
}

/// Metadata about an enrolled identity (no embedding data).
#[derive(Debug, Clone, serde::Serialize)]
pub struct IdentityInfo {
    pub id: String,
    pub name: String,
    pub reference: String,
    pub created_at: String,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
