//! Body blob repository.

use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::Result;
use crate::models::StoredBlob;

/// Repository for content-addressed bodies.
pub struct BlobsRepo;

impl BlobsRepo {
    /// Store a body and return its hash. Storing identical bytes again is a no-op.
    pub fn put(conn: &Connection, data: &[u8], mime_type: &str) -> Result<String> {
        let hash = hash_body(data);
        conn.execute(
            "INSERT OR IGNORE INTO body_blobs (hash, mime_type, size, data) VALUES (?1, ?2, ?3, ?4)",
            params![hash, mime_type, data.len() as i64, data],
        )?;
        Ok(hash)
    }

    /// Get a body by hash.
    pub fn get(conn: &Connection, hash: &str) -> Result<Option<StoredBlob>> {
        let blob = conn
            .query_row(
                "SELECT hash, mime_type, size, data FROM body_blobs WHERE hash = ?1",
                [hash],
                |row| {
                    Ok(StoredBlob {
                        hash: row.get(0)?,
                        mime_type: row.get(1)?,
                        size: row.get(2)?,
                        data: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(blob)
    }

    /// Count stored bodies.
    pub fn count(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM body_blobs", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Total bytes stored.
    pub fn total_size(conn: &Connection) -> Result<i64> {
        let size: i64 = conn.query_row(
            "SELECT COALESCE(SUM(size), 0) FROM body_blobs",
            [],
            |row| row.get(0),
        )?;
        Ok(size)
    }
}

/// Hex SHA-256 of a body.
pub fn hash_body(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}
