//! SQLite-backed profile store.
//!
//! One row per enrolled identifier. Every write is committed immediately.

use crate::types::Profile;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS profiles (
    identifier           TEXT PRIMARY KEY,
    representative_image TEXT,
    embedding_count      INTEGER NOT NULL DEFAULT 0,
    enrolled_at          TEXT NOT NULL
);
";

const PROFILE_COLUMNS: &str = "identifier, representative_image, embedding_count, enrolled_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid value in column {column}: {value}")]
    InvalidValue { column: &'static str, value: String },
}

/// Durable identifier → profile mapping.
pub struct MetadataStore {
    conn: Connection,
}

impl MetadataStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Non-durable store, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Create or update a profile.
    ///
    /// A new row starts at `increment` embeddings with the current time as its
    /// enrollment timestamp. An existing row keeps its timestamp, gains
    /// `increment` embeddings, and only has its representative image replaced
    /// when `image` is `Some`.
    pub fn upsert_profile(
        &self,
        identifier: &str,
        image: Option<&Path>,
        increment: bool,
    ) -> Result<(), StoreError> {
        let image = image.map(|p| p.to_string_lossy().into_owned());
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        self.conn.execute(
            "INSERT INTO profiles (identifier, representative_image, embedding_count, enrolled_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(identifier) DO UPDATE SET
                 representative_image = COALESCE(excluded.representative_image, profiles.representative_image),
                 embedding_count = profiles.embedding_count + excluded.embedding_count",
            params![identifier, image, i64::from(increment), now],
        )?;
        tracing::debug!(identifier, increment, "profile upserted");
        Ok(())
    }

    /// All identifiers, lexicographically ordered.
    pub fn list_identifiers(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT identifier FROM profiles ORDER BY identifier")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn get_representative_image(&self, identifier: &str) -> Result<Option<PathBuf>, StoreError> {
        let image = self
            .conn
            .query_row(
                "SELECT representative_image FROM profiles WHERE identifier = ?1",
                [identifier],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(image.flatten().map(PathBuf::from))
    }

    pub fn get_profile(&self, identifier: &str) -> Result<Option<Profile>, StoreError> {
        let raw = self
            .conn
            .query_row(
                &format!("SELECT {PROFILE_COLUMNS} FROM profiles WHERE identifier = ?1"),
                [identifier],
                RawProfile::from_row,
            )
            .optional()?;
        raw.map(RawProfile::into_profile).transpose()
    }

    /// All profiles, ordered by identifier.
    pub fn list_profiles(&self) -> Result<Vec<Profile>, StoreError> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {PROFILE_COLUMNS} FROM profiles ORDER BY identifier"))?;
        let rows = stmt.query_map([], RawProfile::from_row)?;

        let mut profiles = Vec::new();
        for raw in rows {
            profiles.push(raw?.into_profile()?);
        }
        Ok(profiles)
    }

    /// Delete a profile. Returns whether a row existed.
    pub fn delete_profile(&self, identifier: &str) -> Result<bool, StoreError> {
        let deleted = self
            .conn
            .execute("DELETE FROM profiles WHERE identifier = ?1", [identifier])?;
        Ok(deleted > 0)
    }
}

/// Row as stored, before timestamp and count validation.
struct RawProfile {
    identifier: String,
    representative_image: Option<String>,
    embedding_count: i64,
    enrolled_at: String,
}

impl RawProfile {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            identifier: row.get(0)?,
            representative_image: row.get(1)?,
            embedding_count: row.get(2)?,
            enrolled_at: row.get(3)?,
        })
    }

    fn into_profile(self) -> Result<Profile, StoreError> {
        let embedding_count =
            u32::try_from(self.embedding_count).map_err(|_| StoreError::InvalidValue {
                column: "embedding_count",
                value: self.embedding_count.to_string(),
            })?;
        let enrolled_at = DateTime::parse_from_rfc3339(&self.enrolled_at)
            .map_err(|_| StoreError::InvalidValue {
                column: "enrolled_at",
                value: self.enrolled_at.clone(),
            })?
            .with_timezone(&Utc);

        Ok(Profile {
            identifier: self.identifier,
            representative_image: self.representative_image.map(PathBuf::from),
            embedding_count,
            enrolled_at,
        })
    }
}
