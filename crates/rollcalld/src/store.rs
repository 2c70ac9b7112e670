//! Read access to enrolled faces in SQLite.
//!
//! `students` holds display names; `face_embeddings` holds one row per
//! enrolled vector, stored as little-endian f32 bytes.

use rollcall_core::{EmbeddingBank, IdentityId, IdentityProfile, EMBEDDING_DIM};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database not found: {0}")]
    NotFound(String),
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Matching data for one session's roster.
#[derive(Debug, Default)]
pub struct Roster {
    pub bank: EmbeddingBank,
    pub profiles: HashMap<IdentityId, IdentityProfile>,
}

pub struct EmbeddingStore {
    conn: Connection,
    /// Expected vector length; rows of any other length are skipped.
    dimension: usize,
}

impl EmbeddingStore {
    /// Open an existing database read-only.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        tracing::debug!(path = %path.display(), "opened embedding store");
        Ok(Self { conn, dimension: EMBEDDING_DIM })
    }

    #[cfg(test)]
    fn in_memory(dimension: usize) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE students (
                student_id TEXT PRIMARY KEY,
                first_name TEXT NOT NULL DEFAULT '',
                last_name  TEXT NOT NULL DEFAULT ''
             );
             CREATE TABLE face_embeddings (
                id         INTEGER PRIMARY KEY AUTOINCREMENT,
                student_id TEXT NOT NULL,
                label      TEXT NOT NULL,
                embedding  BLOB NOT NULL
             );",
        )?;
        Ok(Self { conn, dimension })
    }

    /// Load the embedding bank and names for `roster`.
    ///
    /// Identities with no stored vectors are left out of the bank; malformed
    /// blobs and vectors of the wrong length are skipped with a warning.
    pub fn load_roster(&self, roster: &HashSet<IdentityId>) -> Result<Roster, StoreError> {
        let mut registered: HashMap<IdentityId, Vec<Vec<f32>>> = HashMap::new();

        let mut stmt = self
            .conn
            .prepare("SELECT student_id, label, embedding FROM face_embeddings ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Vec<u8>>(2)?,
            ))
        })?;

        for row in rows {
            let (identity, label, blob) = row?;
            if !roster.contains(&identity) {
                continue;
            }
            match decode_embedding(&blob, self.dimension) {
                Some(vector) => registered.entry(identity).or_default().push(vector),
                None => tracing::warn!(
                    identity = %identity,
                    label = %label,
                    bytes = blob.len(),
                    expected = self.dimension * 4,
                    "skipping malformed embedding blob"
                ),
            }
        }

        let bank = EmbeddingBank::build(registered, roster);

        let mut profiles = HashMap::new();
        for identity in bank.identities() {
            if let Some(profile) = self.lookup_identity(identity)? {
                profiles.insert(identity.clone(), profile);
            }
        }

        tracing::info!(
            roster = roster.len(),
            enrolled = bank.len(),
            embeddings = bank.embedding_count(),
            "roster loaded"
        );
        Ok(Roster { bank, profiles })
    }

    pub fn lookup_identity(&self, identity: &str) -> Result<Option<IdentityProfile>, StoreError> {
        let profile = self
            .conn
            .query_row(
                "SELECT first_name, last_name FROM students WHERE student_id = ?1",
                params![identity],
                |row| {
                    Ok(IdentityProfile {
                        first_name: row.get::<_, Option<String>>(0)?.unwrap_or_default(),
                        last_name: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

/// Little-endian f32 vector of exactly `dimension` values.
fn decode_embedding(blob: &[u8], dimension: usize) -> Option<Vec<f32>> {
    if dimension == 0 || blob.len() != dimension * 4 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(v: &[f32]) -> Vec<u8> {
        v.iter().flat_map(|x| x.to_le_bytes()).collect()
    }

    fn seeded() -> EmbeddingStore {
        let store = EmbeddingStore::in_memory(3).unwrap();
        store
            .conn
            .execute_batch(
                "INSERT INTO students VALUES ('S1', 'Ana', 'Cruz');
                 INSERT INTO students VALUES ('S2', 'Ben', 'Reyes');
                 INSERT INTO students VALUES ('S3', 'Cy', 'Lim');",
            )
            .unwrap();
        let rows: [(&str, &str, Vec<u8>); 6] = [
            ("S1", "front", encode(&[3.0, 4.0, 0.0])),
            ("S1", "left", encode(&[0.0, 1.0, 0.0])),
            ("S1", "short", encode(&[1.0])),
            ("S2", "front", encode(&[0.0, 0.0, 2.0])),
            ("S2", "broken", vec![1, 2, 3]),
            ("S3", "front", encode(&[1.0, 0.0, 0.0])),
        ];
        for (id, label, blob) in rows {
            store
                .conn
                .execute(
                    "INSERT INTO face_embeddings (student_id, label, embedding) VALUES (?1, ?2, ?3)",
                    params![id, label, blob],
                )
                .unwrap();
        }
        store
    }

    fn roster(ids: &[&str]) -> HashSet<IdentityId> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_load_roster_filters_to_roster() {
        let store = seeded();
        let loaded = store.load_roster(&roster(&["S1", "S2", "S9"])).unwrap();

        assert_eq!(loaded.bank.len(), 2);
        assert!(loaded.bank.contains("S1"));
        assert!(!loaded.bank.contains("S3"));
        assert!(!loaded.bank.contains("S9"));
        // S1 keeps two vectors (the short one is dropped); S2's broken blob is skipped.
        assert_eq!(loaded.bank.embedding_count(), 3);
        assert_eq!(loaded.profiles["S2"].first_name, "Ben");
        assert!(!loaded.profiles.contains_key("S3"));
    }

    #[test]
    fn test_load_roster_empty() {
        let loaded = seeded().load_roster(&HashSet::new()).unwrap();
        assert!(loaded.bank.is_empty());
        assert!(loaded.profiles.is_empty());
    }

    #[test]
    fn test_lookup_identity() {
        let store = seeded();
        let p = store.lookup_identity("S1").unwrap().unwrap();
        assert_eq!(p.display_name("S1"), "Ana Cruz");
        assert!(store.lookup_identity("nobody").unwrap().is_none());
    }

    #[test]
    fn test_decode_embedding() {
        assert_eq!(decode_embedding(&encode(&[1.5, -2.0]), 2), Some(vec![1.5, -2.0]));
        assert_eq!(decode_embedding(&[], 2), None);
        assert_eq!(decode_embedding(&[0, 0, 0], 2), None);
        // Whole f32s, wrong count.
        assert_eq!(decode_embedding(&encode(&[1.0, 2.0, 3.0]), 2), None);
        assert_eq!(decode_embedding(&encode(&[1.0]), 2), None);
    }

    #[test]
    fn test_open_missing_db() {
        let err = EmbeddingStore::open(Path::new("/nonexistent/faces.db")).err().unwrap();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
