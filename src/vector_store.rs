use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::{Platform, Settings};
use crate::embedding::EmbeddingClient;
use crate::error::Result;
use crate::lite_store::LiteStore;
use crate::pg_store::PgStore;
use crate::qdrant_store::QdrantStore;
use crate::types::{Document, DocumentMeta};

pub const DEFAULT_TOP_K: usize = 5;
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.0;

/// The capability set every backend implements.
///
/// `upsert` expects all documents to share one `repo_id`; it replaces the
/// documents of every `file_id` present in the batch. `delete` and
/// `drop_repo` are no-ops when the collection does not exist.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Ensure the collection/table for the current embedding model exists.
    /// Idempotent; must run before any other operation.
    async fn init(&mut self) -> Result<()>;

    async fn create(&self, documents: &[Document]) -> Result<()>;

    async fn upsert(&self, documents: &[Document]) -> Result<()>;

    async fn all_meta(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>>;

    async fn drop_repo(&self, repo_id: Uuid) -> Result<()>;

    async fn delete(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()>;

    async fn search_by_vector(
        &self,
        repo_id: Uuid,
        file_ids: Option<&[Uuid]>,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<Document>>;
}

/// Collection/table name shared by every backend:
/// `we0_index_{embedding_model}_{dimension}` with `-` replaced by `_`.
pub fn collection_name(embedding_model: &str, dimension: usize) -> String {
    format!("we0_index_{embedding_model}_{dimension}").replace('-', "_")
}

/// L2-normalize a vector; zero vectors pass through unchanged.
pub fn normalize_l2(vector: &[f32]) -> Vec<f32> {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm == 0.0 {
        vector.to_vec()
    } else {
        vector.iter().map(|x| x / norm).collect()
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}

/// Facade over the configured backend. Every call logs adapter failures
/// before rethrowing so per-request handlers stay quiet about storage
/// internals.
pub struct Vector {
    runner: Box<dyn VectorStore>,
}

impl Vector {
    /// Build the adapter selected by `vector.platform` and initialize its
    /// collection for the configured embedding model.
    pub async fn init_app(settings: &Settings, embedder: Arc<dyn EmbeddingClient>) -> Result<Vector> {
        let mut runner: Box<dyn VectorStore> = match settings.vector.platform {
            Platform::Pgvector => Box::new(PgStore::connect(settings, embedder).await?),
            Platform::Qdrant => Box::new(QdrantStore::connect(settings, embedder)?),
            Platform::Lite => Box::new(LiteStore::open(settings, embedder)?),
        };
        runner.init().await?;
        Ok(Vector { runner })
    }

    /// Wrap an already-initialized store; used by tests.
    pub fn from_store(runner: Box<dyn VectorStore>) -> Vector {
        Vector { runner }
    }

    pub async fn create(&self, documents: &[Document]) -> Result<()> {
        self.runner.create(documents).await.inspect_err(log_err)
    }

    pub async fn upsert(&self, documents: &[Document]) -> Result<()> {
        self.runner.upsert(documents).await.inspect_err(log_err)
    }

    pub async fn all_meta(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>> {
        self.runner.all_meta(repo_id).await.inspect_err(log_err)
    }

    pub async fn drop_repo(&self, repo_id: Uuid) -> Result<()> {
        self.runner.drop_repo(repo_id).await.inspect_err(log_err)
    }

    pub async fn delete(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()> {
        self.runner.delete(repo_id, file_ids).await.inspect_err(log_err)
    }

    pub async fn search_by_vector(
        &self,
        repo_id: Uuid,
        file_ids: Option<&[Uuid]>,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<Document>> {
        self.runner
            .search_by_vector(repo_id, file_ids, query_vector, top_k, DEFAULT_SCORE_THRESHOLD)
            .await
            .inspect_err(log_err)
    }
}

fn log_err(e: &crate::error::IndexError) {
    tracing::error!(error = %e, "vector store operation failed");
}
