//! Knowledge store: content-hash based ingestion and vector retrieval.
//!
//! Source documents are hashed on every ingestion pass and only re-embedded
//! when their hash changes. Each document is embedded as overlapping chunks.
//! Documents that disappear from the source tree are tombstoned. A debounced file watcher drives ingestion in the background.

mod chunk;
mod embedder;
mod error;
mod hash;
mod index;
mod snapshot;
mod store;
mod watcher;

pub use chunk::*;
pub use embedder::*;
pub use error::{EmbeddingError, KnowledgeError};
pub use hash::content_hash;
pub use index::{DocumentChunk, KnowledgeDocument, KnowledgeIndex, Tombstone, INDEX_SCHEMA};
pub use snapshot::*;
pub use store::*;
pub use watcher::*;
