//! Concept expansion and its read-through cache.
//!
//! A concept is a user-supplied term expanded by a chat model into a
//! definition plus related terms; the expansion is embedded once and the
//! whole record is cached against the full key tuple. Concurrent misses on
//! one key are not mutually excluded: both callers pay the external calls
//! and the upserts overwrite each other with equivalent content, which is
//! the accepted tradeoff here.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::Client;

use crate::embedding::QueryEmbedder;
use crate::llm::ConceptModel;
use crate::store::TableName;

/// Default chat model for concept expansion.
pub const DEFAULT_CHAT_MODEL: &str = "gpt-4o";
/// Default embedding model for concept embeddings.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-large";
/// Output dimensionality pinned for concept and chunk embeddings.
pub const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;

/// Cache scope of the series request path.
pub const SERIES_SCOPE: &str = "letters";
/// Cache scope of the topic-frequency path; distinct from the series scope
/// so the two consumers never collide on a key.
pub const TOPIC_SCOPE: &str = "letters_topic_frequency";

/// LLM-produced expansion of a concept term.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConceptExpansion {
    /// The term as the model restated it.
    pub term: String,
    /// One or two concrete sentences describing the concept.
    pub definition: String,
    /// Short phrases likely to appear near the concept in the corpus.
    #[serde(default)]
    pub related_terms: Vec<String>,
}

/// Full cache key: one tuple maps to at most one row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConceptKey {
    /// User-supplied concept term, trimmed.
    pub term: String,
    /// Consumer scope (series vs topic frequency).
    pub scope: String,
    /// Chat model that produced the expansion.
    pub chat_model: String,
    /// Embedding model that produced the query vector.
    pub embedding_model: String,
    /// Output dimensionality of the query vector.
    pub dimensions: i32,
}

/// Cached expansion record.
#[derive(Debug, Clone, PartialEq)]
pub struct ConceptRecord {
    /// The stored expansion.
    pub expansion: ConceptExpansion,
    /// Embedding of [`build_embedding_text`] over the expansion.
    pub query_embedding: Vec<f32>,
    /// The exact string that was embedded.
    pub embedding_text: String,
}

/// Result of resolving a concept, with provenance for callers that care
/// whether external calls were spent.
#[derive(Debug, Clone)]
pub struct ResolvedConcept {
    /// The expansion, stored or freshly produced.
    pub expansion: ConceptExpansion,
    /// The query embedding matching the expansion.
    pub query_embedding: Vec<f32>,
    /// Whether the record came out of the cache.
    pub cached: bool,
}

/// Explicit cache interface injected into the resolver: Postgres in
/// production, an in-memory map in tests.
pub trait ConceptCache {
    /// Looks up a record by its full key.
    fn get(
        &self,
        key: &ConceptKey,
    ) -> impl std::future::Future<Output = Result<Option<ConceptRecord>>> + Send;

    /// Upserts a record (insert-or-update, last write wins).
    fn put(
        &self,
        key: &ConceptKey,
        record: &ConceptRecord,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Drops a record, forcing the next resolve to recompute.
    fn invalidate(
        &self,
        key: &ConceptKey,
    ) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Deterministically renders the embedding input for an expansion. The
/// same expansion always embeds the same string, which is what makes the
/// cache row reproducible.
pub fn build_embedding_text(expansion: &ConceptExpansion) -> String {
    let mut lines = vec![
        format!("Term: {}", expansion.term),
        format!("Definition: {}", expansion.definition),
    ];
    if !expansion.related_terms.is_empty() {
        lines.push(format!(
            "Related terms: {}",
            expansion.related_terms.join(", ")
        ));
    }
    lines.join("\n")
}

/// Read-through resolve: cache hit returns the stored record unchanged; a
/// miss spends one chat call and one embedding call (sequential — the
/// embedding input depends on the expansion), then upserts the row.
///
/// A cache row with a missing or wrong-length embedding is treated as a
/// miss and recomputed transparently.
pub async fn resolve<C, M, E>(
    cache: &C,
    model: &Arc<M>,
    embedder: &Arc<E>,
    key: &ConceptKey,
) -> Result<ResolvedConcept>
where
    C: ConceptCache,
    M: ConceptModel + ?Sized + 'static,
    E: QueryEmbedder + ?Sized + 'static,
{
    if let Some(record) = cache.get(key).await? {
        if record.query_embedding.len() == key.dimensions as usize {
            return Ok(ResolvedConcept {
                expansion: record.expansion,
                query_embedding: record.query_embedding,
                cached: true,
            });
        }
    }

    let expand_model = Arc::clone(model);
    let term = key.term.clone();
    let expansion = tokio::task::spawn_blocking(move || expand_model.expand_concept(&term))
        .await
        .map_err(|err| anyhow!("expansion task join error: {err}"))??;

    let embedding_text = build_embedding_text(&expansion);
    let embed_client = Arc::clone(embedder);
    let embed_input = embedding_text.clone();
    let query_embedding = tokio::task::spawn_blocking(move || embed_client.embed_text(&embed_input))
        .await
        .map_err(|err| anyhow!("embedding task join error: {err}"))??;
    anyhow::ensure!(
        query_embedding.len() == key.dimensions as usize,
        "embedding service returned {} dims for a {}-dim concept key",
        query_embedding.len(),
        key.dimensions
    );

    let record = ConceptRecord {
        expansion: expansion.clone(),
        query_embedding: query_embedding.clone(),
        embedding_text,
    };
    cache.put(key, &record).await?;

    Ok(ResolvedConcept {
        expansion,
        query_embedding,
        cached: false,
    })
}

/// Postgres-backed concept cache.
pub struct PgConceptCache {
    client: Arc<Client>,
    table: TableName,
}

impl PgConceptCache {
    /// Wraps a shared connection and table identifier.
    pub fn new(client: Arc<Client>, table: TableName) -> Self {
        Self { client, table }
    }

    /// Creates the concept table when missing.
    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                term TEXT NOT NULL,
                scope TEXT NOT NULL,
                chat_model TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                dimensions INTEGER NOT NULL,
                definition TEXT NOT NULL,
                related_terms JSONB NOT NULL,
                embedding_text TEXT NOT NULL,
                query_embedding REAL[] NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (term, scope, chat_model, embedding_model, dimensions)
            )",
            self.table.qualified()
        );
        self.client
            .execute(&ddl, &[])
            .await
            .context("failed to create concept table")?;
        Ok(())
    }
}

impl ConceptCache for PgConceptCache {
    async fn get(&self, key: &ConceptKey) -> Result<Option<ConceptRecord>> {
        let sql = format!(
            "SELECT definition, related_terms, embedding_text, query_embedding \
             FROM {} \
             WHERE term = $1 AND scope = $2 AND chat_model = $3 \
               AND embedding_model = $4 AND dimensions = $5",
            self.table.qualified()
        );
        let row = self
            .client
            .query_opt(
                &sql,
                &[
                    &key.term,
                    &key.scope,
                    &key.chat_model,
                    &key.embedding_model,
                    &key.dimensions,
                ],
            )
            .await
            .context("failed to read concept cache")?;
        let Some(row) = row else {
            return Ok(None);
        };

        let related: Value = row.get("related_terms");
        let related_terms: Vec<String> =
            serde_json::from_value(related).unwrap_or_default();
        let query_embedding: Vec<f32> = row.get("query_embedding");
        if query_embedding.is_empty() {
            // Row exists but the embedding is gone; report a miss so the
            // resolver recomputes and heals the row.
            return Ok(None);
        }
        Ok(Some(ConceptRecord {
            expansion: ConceptExpansion {
                term: key.term.clone(),
                definition: row.get("definition"),
                related_terms,
            },
            query_embedding,
            embedding_text: row.get("embedding_text"),
        }))
    }

    async fn put(&self, key: &ConceptKey, record: &ConceptRecord) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} \
                (term, scope, chat_model, embedding_model, dimensions, \
                 definition, related_terms, embedding_text, query_embedding) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
             ON CONFLICT (term, scope, chat_model, embedding_model, dimensions) \
             DO UPDATE SET \
                definition = EXCLUDED.definition, \
                related_terms = EXCLUDED.related_terms, \
                embedding_text = EXCLUDED.embedding_text, \
                query_embedding = EXCLUDED.query_embedding, \
                updated_at = now()",
            self.table.qualified()
        );
        let related = serde_json::to_value(&record.expansion.related_terms)
            .context("failed to encode related terms")?;
        self.client
            .execute(
                &sql,
                &[
                    &key.term,
                    &key.scope,
                    &key.chat_model,
                    &key.embedding_model,
                    &key.dimensions,
                    &record.expansion.definition,
                    &related,
                    &record.embedding_text,
                    &record.query_embedding,
                ],
            )
            .await
            .context("failed to upsert concept cache row")?;
        Ok(())
    }

    async fn invalidate(&self, key: &ConceptKey) -> Result<()> {
        let sql = format!(
            "DELETE FROM {} \
             WHERE term = $1 AND scope = $2 AND chat_model = $3 \
               AND embedding_model = $4 AND dimensions = $5",
            self.table.qualified()
        );
        self.client
            .execute(
                &sql,
                &[
                    &key.term,
                    &key.scope,
                    &key.chat_model,
                    &key.embedding_model,
                    &key.dimensions,
                ],
            )
            .await
            .context("failed to invalidate concept cache row")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    struct MapCache {
        rows: Mutex<HashMap<ConceptKey, ConceptRecord>>,
    }

    impl MapCache {
        fn new() -> Self {
            Self {
                rows: Mutex::new(HashMap::new()),
            }
        }

        async fn seed(&self, key: &ConceptKey, record: ConceptRecord) {
            self.rows.lock().await.insert(key.clone(), record);
        }
    }

    impl ConceptCache for MapCache {
        async fn get(&self, key: &ConceptKey) -> Result<Option<ConceptRecord>> {
            Ok(self.rows.lock().await.get(key).cloned())
        }

        async fn put(&self, key: &ConceptKey, record: &ConceptRecord) -> Result<()> {
            self.rows.lock().await.insert(key.clone(), record.clone());
            Ok(())
        }

        async fn invalidate(&self, key: &ConceptKey) -> Result<()> {
            self.rows.lock().await.remove(key);
            Ok(())
        }
    }

    struct CountingModel {
        calls: AtomicUsize,
    }

    impl ConceptModel for CountingModel {
        fn expand_concept(&self, term: &str) -> Result<ConceptExpansion> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ConceptExpansion {
                term: term.to_string(),
                definition: format!("A feeling of {term}."),
                related_terms: vec!["unease".to_string(), "dread".to_string()],
            })
        }
    }

    struct CountingEmbedder {
        calls: AtomicUsize,
        dims: usize,
    }

    impl QueryEmbedder for CountingEmbedder {
        fn embed_text(&self, input: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seed = input.len() as f32;
            Ok((0..self.dims).map(|i| seed + i as f32).collect())
        }

        fn dimensions(&self) -> usize {
            self.dims
        }
    }

    fn key(term: &str) -> ConceptKey {
        ConceptKey {
            term: term.to_string(),
            scope: SERIES_SCOPE.to_string(),
            chat_model: DEFAULT_CHAT_MODEL.to_string(),
            embedding_model: DEFAULT_EMBEDDING_MODEL.to_string(),
            dimensions: 4,
        }
    }

    #[test]
    fn embedding_text_is_deterministic() {
        let expansion = ConceptExpansion {
            term: "political anxiety".to_string(),
            definition: "Worry about political events.".to_string(),
            related_terms: vec!["crisis".to_string(), "cabinet".to_string()],
        };
        let text = build_embedding_text(&expansion);
        assert_eq!(
            text,
            "Term: political anxiety\n\
             Definition: Worry about political events.\n\
             Related terms: crisis, cabinet"
        );
        assert_eq!(text, build_embedding_text(&expansion));
    }

    #[test]
    fn embedding_text_omits_empty_related_terms() {
        let expansion = ConceptExpansion {
            term: "dread".to_string(),
            definition: "A heavy sense of foreboding.".to_string(),
            related_terms: Vec::new(),
        };
        assert!(!build_embedding_text(&expansion).contains("Related terms"));
    }

    #[tokio::test]
    async fn second_resolve_hits_the_cache_with_no_external_calls() {
        let cache = MapCache::new();
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 4,
        });
        let key = key("political anxiety");

        let first = resolve(&cache, &model, &embedder, &key)
            .await
            .expect("first resolve");
        assert!(!first.cached);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);

        let second = resolve(&cache, &model, &embedder, &key)
            .await
            .expect("second resolve");
        assert!(second.cached);
        assert_eq!(second.expansion, first.expansion);
        assert_eq!(second.query_embedding, first.query_embedding);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn row_with_missing_embedding_is_recomputed() {
        let cache = MapCache::new();
        let key = key("dread");
        cache
            .seed(
                &key,
                ConceptRecord {
                    expansion: ConceptExpansion {
                        term: "dread".to_string(),
                        definition: "stale".to_string(),
                        related_terms: Vec::new(),
                    },
                    query_embedding: Vec::new(),
                    embedding_text: String::new(),
                },
            )
            .await;

        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 4,
        });

        let resolved = resolve(&cache, &model, &embedder, &key)
            .await
            .expect("resolve heals the row");
        assert!(!resolved.cached);
        assert_eq!(model.calls.load(Ordering::SeqCst), 1);
        assert_eq!(resolved.query_embedding.len(), 4);

        let healed = cache.get(&key).await.expect("get").expect("row present");
        assert_eq!(healed.query_embedding.len(), 4);
    }

    #[tokio::test]
    async fn distinct_scopes_resolve_to_distinct_rows() {
        let cache = MapCache::new();
        let model = Arc::new(CountingModel {
            calls: AtomicUsize::new(0),
        });
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
            dims: 4,
        });

        let series_key = key("war");
        let mut topic_key = key("war");
        topic_key.scope = TOPIC_SCOPE.to_string();

        resolve(&cache, &model, &embedder, &series_key)
            .await
            .expect("series resolve");
        resolve(&cache, &model, &embedder, &topic_key)
            .await
            .expect("topic resolve");
        assert_eq!(model.calls.load(Ordering::SeqCst), 2);
    }
}
