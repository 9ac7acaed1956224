//! Incremental ingestion and cosine-similarity retrieval.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};

use super::chunk::{split_text, ChunkConfig};
use super::embedder::EmbeddingProvider;
use super::error::{EmbeddingError, KnowledgeError};
use super::hash::content_hash;
use super::index::{DocumentChunk, KnowledgeDocument, KnowledgeIndex, Tombstone};
use super::snapshot::SourceDocument;

/// Outcome of one ingestion pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    /// Documents (re-)embedded in this pass.
    pub embedded: Vec<String>,
    /// Documents whose hash was unchanged.
    pub skipped_unchanged: usize,
    /// Documents no longer present in the source.
    pub tombstoned: Vec<String>,
    /// Documents whose embedding failed; their previous state is kept.
    pub failed: Vec<String>,
}

impl IngestReport {
    /// Whether the pass changed the index.
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.embedded.is_empty() || !self.tombstoned.is_empty()
    }
}

/// A ranked document, represented by its best-matching chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalHit {
    pub document_id: String,
    pub score: f32,
    /// Text of the best-matching chunk.
    pub content: String,
    pub chunk_index: usize,
}

/// Ranked documents for a query.
///
/// A provider failure is reported through `error` with no hits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievalHit>,
    pub error: Option<String>,
}

impl RetrievalResult {
    /// Empty result carrying an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            hits: Vec::new(),
            error: Some(error.into()),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }
}

/// Live and tombstoned document counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeStats {
    pub live: usize,
    pub tombstoned: usize,
}

#[derive(Debug, Default)]
struct IndexState {
    live: BTreeMap<String, KnowledgeDocument>,
    tombstones: BTreeMap<String, Tombstone>,
}

/// Cosine similarity; zero-norm vectors score 0.0.
#[must_use]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Hash/embedding index with an in-memory view for retrieval.
///
/// Ingestion is serialized by a single-writer lock; queries read the
/// in-memory view and may trail an in-progress ingestion.
pub struct KnowledgeStore {
    index: KnowledgeIndex,
    embedder: Arc<dyn EmbeddingProvider>,
    chunking: ChunkConfig,
    state: RwLock<IndexState>,
    writer: Mutex<()>,
}

impl KnowledgeStore {
    /// Open a store over `index`, loading existing documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the index cannot be read.
    pub async fn open(
        index: KnowledgeIndex,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> Result<Self, KnowledgeError> {
        let (live, tombstones) = index.load().await?;
        tracing::debug!(
            live = live.len(),
            tombstoned = tombstones.len(),
            "Loaded knowledge index"
        );
        let state = IndexState {
            live: live.into_iter().map(|d| (d.id.clone(), d)).collect(),
            tombstones: tombstones.into_iter().map(|t| (t.id.clone(), t)).collect(),
        };
        Ok(Self {
            index,
            embedder,
            chunking: ChunkConfig::default(),
            state: RwLock::new(state),
            writer: Mutex::new(()),
        })
    }

    /// Set chunk size and overlap for documents embedded from now on.
    #[must_use]
    pub fn with_chunking(mut self, chunking: ChunkConfig) -> Self {
        self.chunking = chunking;
        self
    }

    /// Open a store backed by an in-memory index.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub async fn in_memory(embedder: Arc<dyn EmbeddingProvider>) -> Result<Self, KnowledgeError> {
        Self::open(KnowledgeIndex::open_in_memory().await?, embedder).await
    }

    /// Bring the index in line with `snapshot`.
    ///
    /// New or changed documents are split into chunks and each chunk is
    /// embedded; unchanged ones are skipped and known documents missing from
    /// the snapshot tombstoned. A failed chunk embedding is logged and leaves
    /// that document as it was.
    ///
    /// # Errors
    ///
    /// Returns an error only if the index cannot be written.
    pub async fn ingest(&self, snapshot: &[SourceDocument]) -> Result<IngestReport, KnowledgeError> {
        let _guard = self.writer.lock().await;
        let mut report = IngestReport::default();

        for source in snapshot {
            let hash = content_hash(source.content.as_bytes());
            let unchanged = self
                .state
                .read()
                .await
                .live
                .get(&source.id)
                .is_some_and(|doc| doc.content_hash == hash);
            if unchanged {
                report.skipped_unchanged += 1;
                continue;
            }

            match self.embed_chunks(&source.content).await {
                Ok(chunks) => {
                    let doc = KnowledgeDocument {
                        id: source.id.clone(),
                        content_hash: hash,
                        chunks,
                        indexed_at: Utc::now(),
                    };
                    self.index.upsert(&doc).await?;
                    let mut state = self.state.write().await;
                    state.tombstones.remove(&doc.id);
                    state.live.insert(doc.id.clone(), doc);
                    report.embedded.push(source.id.clone());
                }
                Err(e) => {
                    tracing::warn!(document = %source.id, error = %e, "Failed to embed document");
                    report.failed.push(source.id.clone());
                }
            }
        }

        let present: HashSet<&str> = snapshot.iter().map(|d| d.id.as_str()).collect();
        let missing: Vec<String> = self
            .state
            .read()
            .await
            .live
            .keys()
            .filter(|id| !present.contains(id.as_str()))
            .cloned()
            .collect();

        for id in missing {
            let at = Utc::now();
            self.index.tombstone(&id, at).await?;
            let mut state = self.state.write().await;
            if let Some(doc) = state.live.remove(&id) {
                state.tombstones.insert(
                    id.clone(),
                    Tombstone {
                        id: id.clone(),
                        content_hash: doc.content_hash,
                        tombstoned_at: at,
                    },
                );
            }
            report.tombstoned.push(id);
        }

        tracing::info!(
            embedded = report.embedded.len(),
            unchanged = report.skipped_unchanged,
            tombstoned = report.tombstoned.len(),
            failed = report.failed.len(),
            "Ingestion pass finished"
        );
        Ok(report)
    }

    async fn embed_chunks(&self, content: &str) -> Result<Vec<DocumentChunk>, EmbeddingError> {
        let mut chunks = Vec::new();
        for text in split_text(content, self.chunking) {
            let embedding = self.embedder.embed(&text).await?;
            chunks.push(DocumentChunk {
                content: text,
                embedding,
            });
        }
        Ok(chunks)
    }

    /// Top-`k` live documents by cosine similarity to `text`.
    ///
    /// Each document scores as its best chunk. Scores descend; ties are
    /// broken by document id. A store with nothing embedded yields an empty
    /// result without calling the provider.
    pub async fn query(&self, text: &str, k: usize) -> RetrievalResult {
        let searchable = self
            .state
            .read()
            .await
            .live
            .values()
            .any(|doc| !doc.chunks.is_empty());
        if k == 0 || !searchable {
            return RetrievalResult::default();
        }

        let query = match self.embedder.embed(text).await {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!(error = %e, "Retrieval embedding failed");
                return RetrievalResult::failed(e.to_string());
            }
        };

        let state = self.state.read().await;
        let mut hits: Vec<RetrievalHit> = state
            .live
            .values()
            .filter_map(|doc| {
                doc.chunks
                    .iter()
                    .enumerate()
                    .map(|(i, chunk)| (i, chunk, cosine_similarity(&query, &chunk.embedding)))
                    .max_by(|a, b| a.2.total_cmp(&b.2).then_with(|| b.0.cmp(&a.0)))
                    .map(|(chunk_index, chunk, score)| RetrievalHit {
                        document_id: doc.id.clone(),
                        score,
                        content: chunk.content.clone(),
                        chunk_index,
                    })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.document_id.cmp(&b.document_id))
        });
        hits.truncate(k);

        RetrievalResult { hits, error: None }
    }

    /// Document counts for health reporting.
    pub async fn stats(&self) -> KnowledgeStats {
        let state = self.state.read().await;
        KnowledgeStats {
            live: state.live.len(),
            tombstoned: state.tombstones.len(),
        }
    }

    /// A live document by id.
    pub async fn document(&self, id: &str) -> Option<KnowledgeDocument> {
        self.state.read().await.live.get(id).cloned()
    }
}

impl std::fmt::Debug for KnowledgeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnowledgeStore")
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Embeds text as letter counts for `a`, `b` and `c`.
    #[derive(Default)]
    struct LetterEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for LetterEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text.contains("FAIL") {
                return Err(EmbeddingError::RequestFailed("boom".to_string()));
            }
            #[allow(clippy::cast_precision_loss)]
            let count = |ch| text.chars().filter(|c| *c == ch).count() as f32;
            Ok(vec![count('a'), count('b'), count('c')])
        }
    }

    #[test]
    fn test_cosine_similarity() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_failed_embedding_is_isolated() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder).await.unwrap();

        let report = store
            .ingest(&[
                SourceDocument::new("bad.md", "bad.md", "FAIL"),
                SourceDocument::new("good.md", "good.md", "aaa"),
            ])
            .await
            .unwrap();
        assert_eq!(report.failed, vec!["bad.md"]);
        assert_eq!(report.embedded, vec!["good.md"]);
        assert_eq!(store.stats().await.live, 1);
    }

    #[tokio::test]
    async fn test_missing_documents_tombstoned() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder.clone()).await.unwrap();
        store
            .ingest(&[
                SourceDocument::new("a.md", "a.md", "aaa"),
                SourceDocument::new("b.md", "b.md", "bbb"),
            ])
            .await
            .unwrap();

        let report = store
            .ingest(&[SourceDocument::new("a.md", "a.md", "aaa")])
            .await
            .unwrap();
        assert_eq!(report.tombstoned, vec!["b.md"]);
        assert_eq!(report.skipped_unchanged, 1);
        assert_eq!(
            store.stats().await,
            KnowledgeStats {
                live: 1,
                tombstoned: 1
            }
        );

        let result = store.query("bbb", 5).await;
        assert_eq!(result.hits.len(), 1);
        assert_eq!(result.hits[0].document_id, "a.md");
    }

    #[tokio::test]
    async fn test_reappearing_document_is_embedded_again() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder.clone()).await.unwrap();
        let doc = SourceDocument::new("a.md", "a.md", "aaa");

        store.ingest(std::slice::from_ref(&doc)).await.unwrap();
        store.ingest(&[]).await.unwrap();
        let report = store.ingest(std::slice::from_ref(&doc)).await.unwrap();

        assert_eq!(report.embedded, vec!["a.md"]);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(store.stats().await.tombstoned, 0);
    }

    #[tokio::test]
    async fn test_query_failure_returns_flagged_empty_result() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder).await.unwrap();
        store
            .ingest(&[SourceDocument::new("a.md", "a.md", "aaa")])
            .await
            .unwrap();

        let result = store.query("FAIL", 3).await;
        assert!(result.is_empty());
        assert!(result.error.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_ties_broken_by_id() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder).await.unwrap();
        store
            .ingest(&[
                SourceDocument::new("z.md", "z.md", "ab"),
                SourceDocument::new("m.md", "m.md", "ab"),
            ])
            .await
            .unwrap();

        let result = store.query("ab", 2).await;
        let ids: Vec<&str> = result.hits.iter().map(|h| h.document_id.as_str()).collect();
        assert_eq!(ids, vec!["m.md", "z.md"]);
    }

    #[tokio::test]
    async fn test_document_embedded_per_chunk() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder.clone())
            .await
            .unwrap()
            .with_chunking(ChunkConfig::new(12, 0));
        let doc = SourceDocument::new("a.md", "a.md", "aaaa aaaa\n\nbbbb bbbb\n\ncccc");

        store.ingest(std::slice::from_ref(&doc)).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
        let stored = store.document("a.md").await.unwrap();
        let texts: Vec<&str> = stored.chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(texts, vec!["aaaa aaaa", "bbbb bbbb", "cccc"]);

        store.ingest(std::slice::from_ref(&doc)).await.unwrap();
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_hit_carries_best_chunk() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder)
            .await
            .unwrap()
            .with_chunking(ChunkConfig::new(12, 0));
        store
            .ingest(&[
                SourceDocument::new("mixed.md", "mixed.md", "aaaa aaaa\n\ncccc cccc"),
                SourceDocument::new("plain.md", "plain.md", "abab"),
            ])
            .await
            .unwrap();

        let result = store.query("ccc", 2).await;
        assert_eq!(result.hits[0].document_id, "mixed.md");
        assert_eq!(result.hits[0].content, "cccc cccc");
        assert_eq!(result.hits[0].chunk_index, 1);
        assert!((result.hits[0].score - 1.0).abs() < 1e-6);
        assert_eq!(result.hits[1].document_id, "plain.md");
    }

    #[tokio::test]
    async fn test_failed_chunk_keeps_previous_state() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder)
            .await
            .unwrap()
            .with_chunking(ChunkConfig::new(12, 0));
        store
            .ingest(&[SourceDocument::new("a.md", "a.md", "aaaa")])
            .await
            .unwrap();

        let report = store
            .ingest(&[SourceDocument::new("a.md", "a.md", "bbbb bbbb\n\nFAIL")])
            .await
            .unwrap();
        assert_eq!(report.failed, vec!["a.md"]);
        let stored = store.document("a.md").await.unwrap();
        assert_eq!(stored.chunks.len(), 1);
        assert_eq!(stored.chunks[0].content, "aaaa");
    }

    #[tokio::test]
    async fn test_blank_document_is_tracked_but_not_searched() {
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::in_memory(embedder.clone()).await.unwrap();
        let report = store
            .ingest(&[SourceDocument::new("empty.md", "empty.md", "  \n")])
            .await
            .unwrap();
        assert_eq!(report.embedded, vec!["empty.md"]);
        assert_eq!(store.stats().await.live, 1);

        assert!(store.query("abc", 3).await.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reopen_keeps_hashes() {
        let index = KnowledgeIndex::open_in_memory().await.unwrap();
        let embedder = Arc::new(LetterEmbedder::default());
        let store = KnowledgeStore::open(index.clone(), embedder.clone()).await.unwrap();
        store
            .ingest(&[SourceDocument::new("a.md", "a.md", "abc")])
            .await
            .unwrap();

        let reopened = KnowledgeStore::open(index, embedder.clone()).await.unwrap();
        let report = reopened
            .ingest(&[SourceDocument::new("a.md", "a.md", "abc")])
            .await
            .unwrap();
        assert_eq!(report.skipped_unchanged, 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }
}
