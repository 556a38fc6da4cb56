use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{LiteMode, Settings};
use crate::embedding::EmbeddingClient;
use crate::error::{IndexError, Result};
use crate::types::{Document, DocumentMeta};
use crate::vector_store::{collection_name, cosine_similarity, VectorStore};

/// Embedded store: one JSON file per collection, brute-force cosine search.
///
/// Scores are cosine similarity (higher = better), the same convention the
/// other adapters expose.
pub struct LiteStore {
    mode: LiteMode,
    dir: Option<PathBuf>,
    embedding_model: String,
    embedder: Arc<dyn EmbeddingClient>,
    collection_name: Option<String>,
    state: Mutex<Vec<StoredDoc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredDoc {
    meta: DocumentMeta,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    content: Option<String>,
    vector: Vec<f32>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LiteFile {
    documents: Vec<StoredDoc>,
}

impl LiteStore {
    pub fn open(settings: &Settings, embedder: Arc<dyn EmbeddingClient>) -> Result<Self> {
        let lite = settings
            .vector
            .lite
            .as_ref()
            .ok_or_else(|| IndexError::Config("vector.lite is missing".into()))?;
        let dir = match lite.mode {
            LiteMode::Memory => None,
            LiteMode::Disk => Some(lite.path.clone().ok_or_else(|| {
                IndexError::Config("vector.lite.path is required in disk mode".into())
            })?),
        };
        Ok(Self {
            mode: lite.mode,
            dir,
            embedding_model: settings.vector.embedding_model.clone(),
            embedder,
            collection_name: None,
            state: Mutex::new(Vec::new()),
        })
    }

    /// Ephemeral store; handy for tests and scratch indexing.
    pub fn memory(embedding_model: &str, embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self {
            mode: LiteMode::Memory,
            dir: None,
            embedding_model: embedding_model.to_string(),
            embedder,
            collection_name: None,
            state: Mutex::new(Vec::new()),
        }
    }

    fn index_path(&self) -> Option<PathBuf> {
        match (&self.dir, &self.collection_name) {
            (Some(dir), Some(name)) => Some(dir.join(format!("{name}.json"))),
            _ => None,
        }
    }

    fn save(&self, documents: &[StoredDoc]) -> Result<()> {
        if self.mode == LiteMode::Memory {
            return Ok(());
        }
        let Some(path) = self.index_path() else {
            return Ok(());
        };
        let file = LiteFile {
            documents: documents.to_vec(),
        };
        let text =
            serde_json::to_string(&file).map_err(|e| IndexError::VectorStore(e.to_string()))?;
        std::fs::write(&path, text)
            .map_err(|e| IndexError::VectorStore(format!("write {}: {e}", path.display())))
    }

    fn stored_doc(document: &Document) -> StoredDoc {
        StoredDoc {
            meta: document.meta.stored(),
            content: document.content.clone(),
            vector: document.vector.clone(),
        }
    }
}

#[async_trait]
impl VectorStore for LiteStore {
    async fn init(&mut self) -> Result<()> {
        let dimension = self.embedder.dimension().await?;
        self.collection_name = Some(collection_name(&self.embedding_model, dimension));

        if let Some(dir) = &self.dir {
            std::fs::create_dir_all(dir)
                .map_err(|e| IndexError::VectorStore(format!("create {}: {e}", dir.display())))?;
        }
        if let Some(path) = self.index_path() {
            if let Ok(text) = std::fs::read_to_string(&path) {
                match serde_json::from_str::<LiteFile>(&text) {
                    Ok(file) => *self.state.get_mut() = file.documents,
                    Err(e) => {
                        // Schema change or corruption: start over.
                        tracing::warn!(path = %path.display(), error = %e, "rebuilding lite index");
                        *self.state.get_mut() = Vec::new();
                    }
                }
            }
        }
        Ok(())
    }

    async fn create(&self, documents: &[Document]) -> Result<()> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        for doc in documents {
            let stored = Self::stored_doc(doc);
            match state
                .iter_mut()
                .find(|d| d.meta.segment_id == doc.meta.segment_id)
            {
                Some(existing) => *existing = stored,
                None => state.push(stored),
            }
        }
        self.save(&state)
    }

    async fn upsert(&self, documents: &[Document]) -> Result<()> {
        let Some(first) = documents.first() else {
            return Ok(());
        };
        let repo_id = first.meta.repo_id;
        let mut state = self.state.lock().await;
        state.retain(|d| {
            !(d.meta.repo_id == repo_id
                && documents.iter().any(|doc| doc.meta.file_id == d.meta.file_id))
        });
        for doc in documents {
            state.push(Self::stored_doc(doc));
        }
        self.save(&state)
    }

    async fn all_meta(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>> {
        let state = self.state.lock().await;
        Ok(state
            .iter()
            .filter(|d| d.meta.repo_id == repo_id)
            .map(|d| d.meta.clone())
            .collect())
    }

    async fn drop_repo(&self, repo_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().await;
        state.retain(|d| d.meta.repo_id != repo_id);
        self.save(&state)
    }

    async fn delete(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()> {
        let mut state = self.state.lock().await;
        state.retain(|d| !(d.meta.repo_id == repo_id && file_ids.contains(&d.meta.file_id)));
        self.save(&state)
    }

    async fn search_by_vector(
        &self,
        repo_id: Uuid,
        file_ids: Option<&[Uuid]>,
        query_vector: &[f32],
        top_k: usize,
        score_threshold: f32,
    ) -> Result<Vec<Document>> {
        let state = self.state.lock().await;
        let mut scored: Vec<(f32, &StoredDoc)> = state
            .iter()
            .filter(|d| d.meta.repo_id == repo_id)
            .filter(|d| file_ids.is_none_or(|ids| ids.contains(&d.meta.file_id)))
            .map(|d| (cosine_similarity(query_vector, &d.vector), d))
            .filter(|(score, _)| *score >= score_threshold)
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        Ok(scored
            .into_iter()
            .take(top_k)
            .map(|(score, d)| {
                let mut meta = d.meta.clone();
                meta.score = Some(score);
                meta.content = d.content.clone();
                Document {
                    vector: Vec::new(),
                    content: d.content.clone(),
                    meta,
                }
            })
            .collect())
    }
}
