//! Persistent hash/embedding index.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::error::KnowledgeError;

/// SQL schema for the knowledge index.
pub const INDEX_SCHEMA: &str = r"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

-- Tombstoned rows keep their id and hash but lose their chunks
CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY NOT NULL,
    content_hash TEXT NOT NULL,
    chunk_count INTEGER NOT NULL DEFAULT 0,
    indexed_at TEXT NOT NULL,
    tombstoned_at TEXT
);

-- One embedding per chunk, stored as a JSON array
CREATE TABLE IF NOT EXISTS chunks (
    document_id TEXT NOT NULL REFERENCES documents(id) ON DELETE CASCADE,
    chunk_index INTEGER NOT NULL,
    content TEXT NOT NULL,
    embedding TEXT NOT NULL,
    PRIMARY KEY (document_id, chunk_index)
);

CREATE INDEX IF NOT EXISTS idx_documents_tombstoned ON documents(tombstoned_at);
";

/// One embedded slice of a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub content: String,
    pub embedding: Vec<f32>,
}

/// An indexed, retrievable document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeDocument {
    /// Source path relative to the source root.
    pub id: String,
    pub content_hash: String,
    /// Chunks in document order.
    pub chunks: Vec<DocumentChunk>,
    pub indexed_at: DateTime<Utc>,
}

/// A document that disappeared from the source tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    pub id: String,
    pub content_hash: String,
    pub tombstoned_at: DateTime<Utc>,
}

/// `SQLite` table of documents, accessed via `spawn_blocking`.
#[derive(Debug, Clone)]
pub struct KnowledgeIndex {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl KnowledgeIndex {
    /// Open an index at the specified path, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or the schema cannot be applied.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, KnowledgeError> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| KnowledgeError::CreateDir {
                        path: parent.to_path_buf(),
                        source,
                    })?;
            }
        }

        let path_clone = path.clone();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection, KnowledgeError> {
            let conn =
                Connection::open(&path_clone).map_err(|source| KnowledgeError::DatabaseOpen {
                    path: path_clone,
                    source,
                })?;
            conn.execute_batch(INDEX_SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| KnowledgeError::TaskCancelled)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path),
        })
    }

    /// Open an in-memory index for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub async fn open_in_memory() -> Result<Self, KnowledgeError> {
        let conn = tokio::task::spawn_blocking(|| -> Result<Connection, KnowledgeError> {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(INDEX_SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|_| KnowledgeError::TaskCancelled)??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// Returns the path to the database, if opened from a file.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Load every row, split into live documents and tombstones.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails or a row cannot be decoded.
    pub async fn load(&self) -> Result<(Vec<KnowledgeDocument>, Vec<Tombstone>), KnowledgeError> {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(Vec<KnowledgeDocument>, Vec<Tombstone>), KnowledgeError> {
            let conn = conn.blocking_lock();
            let mut stmt = conn.prepare(
                "SELECT id, content_hash, indexed_at, tombstoned_at FROM documents ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    let id: String = row.get(0)?;
                    let content_hash: String = row.get(1)?;
                    let indexed_at: DateTime<Utc> = row.get(2)?;
                    let tombstoned_at: Option<DateTime<Utc>> = row.get(3)?;
                    Ok((id, content_hash, indexed_at, tombstoned_at))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut chunk_stmt = conn.prepare(
                "SELECT content, embedding FROM chunks
                 WHERE document_id = ?1 ORDER BY chunk_index",
            )?;

            let mut live = Vec::new();
            let mut tombstones = Vec::new();
            for (id, content_hash, indexed_at, tombstoned_at) in rows {
                if let Some(tombstoned_at) = tombstoned_at {
                    tombstones.push(Tombstone {
                        id,
                        content_hash,
                        tombstoned_at,
                    });
                    continue;
                }
                let stored = chunk_stmt
                    .query_map(params![id], |row| {
                        let content: String = row.get(0)?;
                        let embedding: String = row.get(1)?;
                        Ok((content, embedding))
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                let chunks = stored
                    .into_iter()
                    .map(|(content, embedding)| {
                        Ok(DocumentChunk {
                            content,
                            embedding: serde_json::from_str(&embedding)?,
                        })
                    })
                    .collect::<Result<Vec<_>, KnowledgeError>>()?;
                live.push(KnowledgeDocument {
                    id,
                    content_hash,
                    chunks,
                    indexed_at,
                });
            }
            Ok((live, tombstones))
        })
        .await
        .map_err(|_| KnowledgeError::TaskCancelled)?
    }

    /// Insert or replace a live document and its chunks, clearing any tombstone.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be written.
    pub async fn upsert(&self, doc: &KnowledgeDocument) -> Result<(), KnowledgeError> {
        let id = doc.id.clone();
        let content_hash = doc.content_hash.clone();
        let indexed_at = doc.indexed_at;
        let chunks = doc
            .chunks
            .iter()
            .map(|c| Ok((c.content.clone(), serde_json::to_string(&c.embedding)?)))
            .collect::<Result<Vec<_>, KnowledgeError>>()?;

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KnowledgeError> {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO documents (id, content_hash, chunk_count, indexed_at, tombstoned_at)
                 VALUES (?1, ?2, ?3, ?4, NULL)
                 ON CONFLICT(id) DO UPDATE SET
                     content_hash = excluded.content_hash,
                     chunk_count = excluded.chunk_count,
                     indexed_at = excluded.indexed_at,
                     tombstoned_at = NULL",
                params![id, content_hash, chunks.len(), indexed_at],
            )?;
            tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![id])?;
            for (index, (content, embedding)) in chunks.iter().enumerate() {
                tx.execute(
                    "INSERT INTO chunks (document_id, chunk_index, content, embedding)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![id, index, content, embedding],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|_| KnowledgeError::TaskCancelled)?
    }

    /// Tombstone a document and drop its chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the rows cannot be updated.
    pub async fn tombstone(&self, id: &str, at: DateTime<Utc>) -> Result<(), KnowledgeError> {
        let id = id.to_string();

        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || -> Result<(), KnowledgeError> {
            let mut conn = conn.blocking_lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chunks WHERE document_id = ?1", params![id])?;
            tx.execute(
                "UPDATE documents SET chunk_count = 0, tombstoned_at = ?1 WHERE id = ?2",
                params![at, id],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
        .map_err(|_| KnowledgeError::TaskCancelled)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str, hash: &str) -> KnowledgeDocument {
        KnowledgeDocument {
            id: id.to_string(),
            content_hash: hash.to_string(),
            chunks: vec![
                DocumentChunk {
                    content: "first".to_string(),
                    embedding: vec![1.0, 0.0],
                },
                DocumentChunk {
                    content: "second".to_string(),
                    embedding: vec![0.0, 1.0],
                },
            ],
            indexed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let index = KnowledgeIndex::open_in_memory().await.unwrap();
        index.upsert(&doc("a.md", "h1")).await.unwrap();
        index.upsert(&doc("a.md", "h2")).await.unwrap();

        let (live, tombstones) = index.load().await.unwrap();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].content_hash, "h2");
        assert_eq!(live[0].chunks, doc("a.md", "h2").chunks);
        assert!(tombstones.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_replaces_chunks() {
        let index = KnowledgeIndex::open_in_memory().await.unwrap();
        index.upsert(&doc("a.md", "h1")).await.unwrap();

        let mut shorter = doc("a.md", "h2");
        shorter.chunks.truncate(1);
        index.upsert(&shorter).await.unwrap();

        let (live, _) = index.load().await.unwrap();
        assert_eq!(live[0].chunks.len(), 1);
        assert_eq!(live[0].chunks[0].content, "first");
    }

    #[tokio::test]
    async fn test_tombstone_drops_chunks() {
        let index = KnowledgeIndex::open_in_memory().await.unwrap();
        index.upsert(&doc("a.md", "h1")).await.unwrap();
        index.tombstone("a.md", Utc::now()).await.unwrap();

        let (live, tombstones) = index.load().await.unwrap();
        assert!(live.is_empty());
        assert_eq!(tombstones.len(), 1);
        assert_eq!(tombstones[0].id, "a.md");

        // Re-indexing revives the document.
        index.upsert(&doc("a.md", "h1")).await.unwrap();
        let (live, tombstones) = index.load().await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(tombstones.is_empty());
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rag").join("index.db");
        {
            let index = KnowledgeIndex::open(&path).await.unwrap();
            index.upsert(&doc("notes/b.txt", "h")).await.unwrap();
        }
        let index = KnowledgeIndex::open(&path).await.unwrap();
        let (live, _) = index.load().await.unwrap();
        assert_eq!(live[0].id, "notes/b.txt");
        assert_eq!(live[0].chunks[1].content, "second");
    }
}
