use std::path::Path;

use async_trait::async_trait;
use bounty_core::{DescriptorError, FaceDescriptor, DESCRIPTOR_DIM};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::profile::{AccountInfo, AccountStatus, ProfileFields, ProfileUpdate, UserProfile};
use crate::repository::{FaceVectorStore, ProfileStore, StoredFaceRecord};

const DESCRIPTOR_BYTE_LEN: usize = DESCRIPTOR_DIM * 4;
const NONCE_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] tokio_rusqlite::Error),
    #[error("rusqlite error: {0}")]
    Rusqlite(#[from] rusqlite::Error),
    #[error("descriptor encryption failed")]
    EncryptionFailed,
    #[error("descriptor decryption failed: key mismatch or corrupted data")]
    DecryptionFailed,
    #[error("invalid descriptor blob size: {0} bytes")]
    InvalidBlob(usize),
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] DescriptorError),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("profile already exists for {0}")]
    AlreadyExists(Uuid),
    #[error("no profile for {0}")]
    NotFound(Uuid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("encryption key I/O error: {0}")]
    KeyIo(#[source] std::io::Error),
}

/// SQLite-backed face vector and profile storage.
///
/// Descriptors are biometric data and are encrypted with AES-256-GCM before
/// they reach disk. A per-installation 32-byte key is generated at first use
/// and stored at `{db_dir}/.key` (mode 0600).
#[derive(Clone)]
pub struct SqliteStore {
    conn: Connection,
    enc_key: [u8; 32],
}

impl SqliteStore {
    /// Open (or create) the database at the given path and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        let in_memory = db_path == Path::new(":memory:");

        let enc_key = if in_memory {
            [0u8; 32]
        } else {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(StoreError::KeyIo)?;
                }
            }
            let key_path = db_path.parent().unwrap_or(Path::new(".")).join(".key");
            load_or_generate_key(&key_path)?
        };

        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(
                "PRAGMA journal_mode = WAL;
                 CREATE TABLE IF NOT EXISTS face_vectors (
                     id TEXT PRIMARY KEY,
                     user_id TEXT NOT NULL,
                     descriptor BLOB NOT NULL,
                     created_at TEXT NOT NULL
                 );
                 CREATE INDEX IF NOT EXISTS idx_face_vectors_user ON face_vectors(user_id);
                 CREATE TABLE IF NOT EXISTS users (
                     user_id TEXT PRIMARY KEY,
                     full_name TEXT NOT NULL DEFAULT '',
                     email TEXT NOT NULL DEFAULT '',
                     phone TEXT NOT NULL DEFAULT '',
                     organization TEXT NOT NULL DEFAULT '',
                     role TEXT NOT NULL DEFAULT '',
                     location TEXT NOT NULL DEFAULT '',
                     status TEXT NOT NULL,
                     plan TEXT NOT NULL,
                     credits INTEGER NOT NULL,
                     account_created_at TEXT NOT NULL,
                     completed_at TEXT,
                     created_at TEXT NOT NULL,
                     updated_at TEXT NOT NULL
                 );",
            )?;
            Ok(())
        })
        .await?;

        tracing::debug!(path = %db_path.display(), "store opened");
        Ok(Self { conn, enc_key })
    }

    // ── Encryption helpers ────────────────────────────────────────────────────

    /// Output: 12-byte random nonce || ciphertext || 16-byte GCM tag.
    fn encrypt_descriptor(&self, descriptor: &FaceDescriptor) -> Result<Vec<u8>, StoreError> {
        let plaintext = descriptor_to_bytes(descriptor.values());

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_slice())
            .map_err(|_| StoreError::EncryptionFailed)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn decrypt_descriptor(&self, blob: &[u8]) -> Result<FaceDescriptor, StoreError> {
        if blob.len() <= NONCE_LEN {
            return Err(StoreError::InvalidBlob(blob.len()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let key = Key::<Aes256Gcm>::from_slice(&self.enc_key);
        let cipher = Aes256Gcm::new(key);

        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| StoreError::DecryptionFailed)?;

        bytes_to_descriptor(&plaintext)
    }
}

#[async_trait]
impl FaceVectorStore for SqliteStore {
    async fn insert(
        &self,
        descriptor: &FaceDescriptor,
        user_id: Uuid,
    ) -> Result<StoredFaceRecord, StoreError> {
        let record = StoredFaceRecord {
            id: Uuid::new_v4(),
            descriptor: descriptor.clone(),
            user_id,
            created_at: Utc::now(),
        };

        // Encrypt before entering the SQLite closure
        let blob = self.encrypt_descriptor(descriptor)?;
        let id = record.id.to_string();
        let user = user_id.to_string();
        let created_at = record.created_at.to_rfc3339();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO face_vectors (id, user_id, descriptor, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    rusqlite::params![id, user, blob, created_at],
                )?;
                Ok(())
            })
            .await?;

        tracing::debug!(%user_id, record_id = %record.id, "face vector stored");
        Ok(record)
    }

    async fn scan_all(&self) -> Result<Vec<StoredFaceRecord>, StoreError> {
        // Fetch raw rows; decrypt outside the blocking closure
        let rows: Vec<(String, String, Vec<u8>, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, descriptor, created_at
                     FROM face_vectors ORDER BY created_at",
                )?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                Ok(rows.collect::<Result<Vec<_>, _>>()?)
            })
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, user_id, blob, created_at) in rows {
            match self.decode_face_row(&id, &user_id, &blob, &created_at) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(record_id = %id, error = %e, "skipping unreadable face vector"),
            }
        }
        Ok(records)
    }

    async fn count_faces(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM face_vectors", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

impl SqliteStore {
    fn decode_face_row(
        &self,
        id: &str,
        user_id: &str,
        blob: &[u8],
        created_at: &str,
    ) -> Result<StoredFaceRecord, StoreError> {
        Ok(StoredFaceRecord {
            id: parse_uuid(id)?,
            descriptor: self.decrypt_descriptor(blob)?,
            user_id: parse_uuid(user_id)?,
            created_at: parse_timestamp(created_at)?,
        })
    }
}

/// Raw `users` row, in column order.
struct ProfileRow {
    user_id: String,
    fields: ProfileFields,
    status: String,
    plan: String,
    credits: u32,
    account_created_at: String,
    completed_at: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ProfileRow {
    fn into_profile(self) -> Result<UserProfile, StoreError> {
        let status: AccountStatus = self.status.parse().map_err(StoreError::Corrupt)?;
        Ok(UserProfile {
            user_id: parse_uuid(&self.user_id)?,
            profile: self.fields,
            account: AccountInfo {
                status,
                plan: self.plan,
                credits: self.credits,
                created_at: parse_timestamp(&self.account_created_at)?,
                completed_at: self
                    .completed_at
                    .as_deref()
                    .map(parse_timestamp)
                    .transpose()?,
            },
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[async_trait]
impl ProfileStore for SqliteStore {
    async fn get(&self, user_id: Uuid) -> Result<Option<UserProfile>, StoreError> {
        let key = user_id.to_string();
        let row: Option<ProfileRow> = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT user_id, full_name, email, phone, organization, role, location,
                            status, plan, credits, account_created_at, completed_at,
                            created_at, updated_at
                     FROM users WHERE user_id = ?1",
                )?;
                let mut rows = stmt.query_map([&key], |row| {
                    Ok(ProfileRow {
                        user_id: row.get(0)?,
                        fields: ProfileFields {
                            full_name: row.get(1)?,
                            email: row.get(2)?,
                            phone: row.get(3)?,
                            organization: row.get(4)?,
                            role: row.get(5)?,
                            location: row.get(6)?,
                        },
                        status: row.get(7)?,
                        plan: row.get(8)?,
                        credits: row.get(9)?,
                        account_created_at: row.get(10)?,
                        completed_at: row.get(11)?,
                        created_at: row.get(12)?,
                        updated_at: row.get(13)?,
                    })
                })?;
                Ok(rows.next().transpose()?)
            })
            .await?;

        row.map(ProfileRow::into_profile).transpose()
    }

    async fn create(&self, profile: &UserProfile) -> Result<(), StoreError> {
        let user_id = profile.user_id;
        let p = profile.clone();

        let inserted = self
            .conn
            .call(move |conn| {
                let affected = conn.execute(
                    "INSERT OR IGNORE INTO users (
                         user_id, full_name, email, phone, organization, role, location,
                         status, plan, credits, account_created_at, completed_at,
                         created_at, updated_at
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    rusqlite::params![
                        p.user_id.to_string(),
                        p.profile.full_name,
                        p.profile.email,
                        p.profile.phone,
                        p.profile.organization,
                        p.profile.role,
                        p.profile.location,
                        p.account.status.as_str(),
                        p.account.plan,
                        p.account.credits,
                        p.account.created_at.to_rfc3339(),
                        p.account.completed_at.map(|t| t.to_rfc3339()),
                        p.created_at.to_rfc3339(),
                        p.updated_at.to_rfc3339(),
                    ],
                )?;
                Ok(affected > 0)
            })
            .await?;

        if !inserted {
            return Err(StoreError::AlreadyExists(user_id));
        }
        tracing::debug!(%user_id, "profile row created");
        Ok(())
    }

    async fn update(&self, user_id: Uuid, update: &ProfileUpdate) -> Result<bool, StoreError> {
        let key = user_id.to_string();
        let u = update.clone();
        let updated_at = Utc::now().to_rfc3339();

        self.conn
            .call(move |conn| {
                let affected = conn.execute(
                    "UPDATE users SET
                         full_name = COALESCE(?2, full_name),
                         email = COALESCE(?3, email),
                         phone = COALESCE(?4, phone),
                         organization = COALESCE(?5, organization),
                         role = COALESCE(?6, role),
                         location = COALESCE(?7, location),
                         status = COALESCE(?8, status),
                         completed_at = COALESCE(?9, completed_at),
                         updated_at = ?10
                     WHERE user_id = ?1",
                    rusqlite::params![
                        key,
                        u.full_name,
                        u.email,
                        u.phone,
                        u.organization,
                        u.role,
                        u.location,
                        u.status.map(|s| s.as_str()),
                        u.completed_at.map(|t| t.to_rfc3339()),
                        updated_at,
                    ],
                )?;
                Ok(affected > 0)
            })
            .await
            .map_err(StoreError::from)
    }

    async fn count_profiles(&self) -> Result<u64, StoreError> {
        self.conn
            .call(|conn| {
                let count: u64 =
                    conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
                Ok(count)
            })
            .await
            .map_err(StoreError::from)
    }
}

// ── Key management ────────────────────────────────────────────────────────────

/// Load the encryption key from disk, or generate and persist a new one.
/// Written with mode 0600 (owner-readable only).
fn load_or_generate_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
    if key_path.exists() {
        let bytes = std::fs::read(key_path).map_err(StoreError::KeyIo)?;
        let key: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            StoreError::KeyIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "encryption key file has wrong length ({} bytes, expected 32)",
                    bytes.len()
                ),
            ))
        })?;
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

// ── Serialization helpers ─────────────────────────────────────────────────────

fn descriptor_to_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_to_descriptor(bytes: &[u8]) -> Result<FaceDescriptor, StoreError> {
    if bytes.len() != DESCRIPTOR_BYTE_LEN {
        return Err(StoreError::InvalidBlob(bytes.len()));
    }
    let values = bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();
    Ok(FaceDescriptor::new(values)?)
}

fn parse_uuid(raw: &str) -> Result<Uuid, StoreError> {
    Uuid::parse_str(raw).map_err(|e| StoreError::Corrupt(format!("uuid '{raw}': {e}")))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp '{raw}': {e}")))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
