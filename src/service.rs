use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use uuid::Uuid;

use crate::config::Settings;
use crate::embedding::{embedding_client, ChatClient, EmbeddingClient};
use crate::error::{IndexError, Result};
use crate::git::{self, GitCredentials};
use crate::pipeline;
use crate::types::{fixed_uuid, Blob, DocumentMeta, TaskContext};
use crate::vector_store::{Vector, DEFAULT_TOP_K};

/// Bounded per-file concurrency: at most this many files are in flight per
/// process, which also bounds resident file bodies and embedding batches.
pub const MAX_IN_FLIGHT_FILES: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct AddFileInfo {
    pub relative_path: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfoOutcome {
    pub file_id: Uuid,
    pub relative_path: String,
}

#[derive(Debug, Serialize)]
pub struct UpsertOutcome {
    pub repo_id: Uuid,
    pub file_infos: Vec<FileInfoOutcome>,
}

#[derive(Debug, Serialize)]
pub struct SingleFileOutcome {
    pub repo_id: Uuid,
    pub file_id: Uuid,
}

#[derive(Debug, Clone, Default)]
pub struct GitIndexOptions {
    pub uid: Option<String>,
    pub repo_url: String,
    pub credentials: GitCredentials,
}

/// Indexing and retrieval orchestrator over the configured vector store.
#[derive(Clone)]
pub struct IndexService {
    vector: Arc<Vector>,
    embedder: Arc<dyn EmbeddingClient>,
    chat: Option<Arc<ChatClient>>,
    gate: Arc<Semaphore>,
}

impl IndexService {
    /// Assemble the service from settings: shared embedding client, selected
    /// store adapter, optional code2desc chat model.
    pub async fn init(settings: &Settings) -> Result<Self> {
        let embedder = embedding_client(
            settings.vector.embedding_provider,
            &settings.vector.embedding_model,
        )?;
        let vector = Vector::init_app(settings, embedder.clone()).await?;
        let chat = if settings.vector.code2desc {
            Some(Arc::new(ChatClient::new(
                settings.vector.chat_provider,
                &settings.vector.chat_model,
            )?))
        } else {
            None
        };
        Ok(Self::from_parts(Arc::new(vector), embedder, chat))
    }

    pub fn from_parts(
        vector: Arc<Vector>,
        embedder: Arc<dyn EmbeddingClient>,
        chat: Option<Arc<ChatClient>>,
    ) -> Self {
        Self {
            vector,
            embedder,
            chat,
            gate: Arc::new(Semaphore::new(MAX_IN_FLIGHT_FILES)),
        }
    }

    pub fn vector(&self) -> &Vector {
        &self.vector
    }

    /// Segment, embed and upsert one file. Empty files leave no trace.
    async fn process_file(&self, ctx: TaskContext) -> Result<()> {
        let documents =
            pipeline::build_and_embed_segments(&ctx, self.embedder.clone(), self.chat.clone())
                .await?;
        if !documents.is_empty() {
            self.vector.upsert(&documents).await?;
        }
        Ok(())
    }

    /// Index an explicit set of files. Per-file failures are logged and
    /// dropped from the response; the batch itself keeps going.
    pub async fn upsert_index(
        &self,
        uid: &str,
        repo_abs_path: &str,
        file_infos: Vec<AddFileInfo>,
    ) -> Result<UpsertOutcome> {
        let repo_id = fixed_uuid(&format!("{uid}:{repo_abs_path}"));

        let mut tasks: JoinSet<Result<FileInfoOutcome>> = JoinSet::new();
        for file_info in file_infos {
            let service = self.clone();
            let uid = uid.to_string();
            let repo_abs_path = repo_abs_path.to_string();
            tasks.spawn(async move {
                let _permit = service
                    .gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| IndexError::Internal(e.to_string()))?;
                let file_id = fixed_uuid(&format!(
                    "{uid}:{repo_abs_path}:{}",
                    file_info.relative_path
                ));
                let ctx = TaskContext {
                    repo_id,
                    file_id,
                    relative_path: file_info.relative_path.clone(),
                    blob: Blob::from_data(file_info.content.into_bytes(), &file_info.relative_path),
                };
                service.process_file(ctx).await?;
                Ok(FileInfoOutcome {
                    file_id,
                    relative_path: file_info.relative_path,
                })
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| IndexError::Internal(e.to_string()))? {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(error = %e, "file indexing failed"),
            }
        }
        Ok(UpsertOutcome {
            repo_id,
            file_infos: outcomes,
        })
    }

    /// Index a single uploaded file; fails when the file yields no segments.
    pub async fn upsert_single_file(
        &self,
        uid: &str,
        repo_abs_path: &str,
        relative_path: &str,
        content: Vec<u8>,
    ) -> Result<SingleFileOutcome> {
        let repo_id = fixed_uuid(&format!("{uid}:{repo_abs_path}"));
        let file_id = fixed_uuid(&format!("{uid}:{repo_abs_path}:{relative_path}"));
        let ctx = TaskContext {
            repo_id,
            file_id,
            relative_path: relative_path.to_string(),
            blob: Blob::from_data(content, relative_path),
        };
        let documents =
            pipeline::build_and_embed_segments(&ctx, self.embedder.clone(), self.chat.clone())
                .await?;
        if documents.is_empty() {
            return Err(IndexError::Validation("no content".into()));
        }
        self.vector.upsert(&documents).await?;
        Ok(SingleFileOutcome { repo_id, file_id })
    }

    /// Clone a repository into a scoped temp directory and index every
    /// non-hidden file under the concurrency gate. The checkout is removed
    /// on all exit paths; in-flight tasks are aborted if the request dies.
    pub async fn clone_and_index(&self, options: GitIndexOptions) -> Result<UpsertOutcome> {
        let uid = options.uid.as_deref().unwrap_or("default_uid").to_string();
        let remote = git::parse_git_url(&options.repo_url)?;
        let repo_path = remote.repo_path();
        let repo_id = fixed_uuid(&format!("{uid}{repo_path}:"));

        let checkout = tempfile::tempdir().map_err(|e| IndexError::Git(e.to_string()))?;
        let url = git::clone_url(&options.repo_url, &remote, &options.credentials);
        git::clone_repo(&url, checkout.path()).await?;

        let files = git::walk_repo_files(checkout.path())?;
        tracing::info!(repo = %repo_path, files = files.len(), "cloned, indexing");

        let mut tasks: JoinSet<Result<FileInfoOutcome>> = JoinSet::new();
        for (abs_path, relative_path) in files {
            let service = self.clone();
            let uid = uid.clone();
            let repo_path = repo_path.clone();
            tasks.spawn(async move {
                let _permit = service
                    .gate
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|e| IndexError::Internal(e.to_string()))?;
                let content = tokio::fs::read(&abs_path)
                    .await
                    .map_err(|e| IndexError::Git(format!("read {relative_path}: {e}")))?;
                let file_id = fixed_uuid(&format!("{uid}:{repo_path}:{relative_path}"));
                let ctx = TaskContext {
                    repo_id,
                    file_id,
                    relative_path: relative_path.clone(),
                    blob: Blob::from_data(content, &relative_path),
                };
                service.process_file(ctx).await?;
                Ok(FileInfoOutcome {
                    file_id,
                    relative_path,
                })
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(|e| IndexError::Internal(e.to_string()))? {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => tracing::warn!(error = %e, "file indexing failed"),
            }
        }
        Ok(UpsertOutcome {
            repo_id,
            file_infos: outcomes,
        })
    }

    /// Embed the query and return the closest segment metadata.
    pub async fn retrieval(
        &self,
        repo_id: Uuid,
        file_ids: Option<Vec<Uuid>>,
        query: &str,
    ) -> Result<Vec<DocumentMeta>> {
        if query.trim().is_empty() {
            return Err(IndexError::Validation("query must not be empty".into()));
        }
        let vectors = self.embedder.embed(&[query.to_string()]).await?;
        let query_vector = vectors
            .into_iter()
            .next()
            .ok_or_else(|| IndexError::Embedding("empty query embedding".into()))?;
        let documents = self
            .vector
            .search_by_vector(repo_id, file_ids.as_deref(), &query_vector, DEFAULT_TOP_K)
            .await?;
        Ok(documents.into_iter().map(|d| d.meta).collect())
    }

    pub async fn all_index(&self, repo_id: Uuid) -> Result<Vec<DocumentMeta>> {
        self.vector.all_meta(repo_id).await
    }

    pub async fn delete_index(&self, repo_id: Uuid, file_ids: &[Uuid]) -> Result<()> {
        self.vector.delete(repo_id, file_ids).await
    }

    pub async fn drop_index(&self, repo_id: Uuid) -> Result<()> {
        self.vector.drop_repo(repo_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lite_store::LiteStore;
    use crate::vector_store::VectorStore;
    use async_trait::async_trait;

    struct HashEmbedder {
        dim: usize,
    }

    /// Deterministic direction per input so similarity is meaningful-ish.
    #[async_trait]
    impl EmbeddingClient for HashEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(inputs
                .iter()
                .map(|input| {
                    let mut v = vec![0.0f32; self.dim];
                    for (i, b) in input.bytes().enumerate() {
                        v[i % self.dim] += b as f32;
                    }
                    v
                })
                .collect())
        }
        async fn dimension(&self) -> Result<usize> {
            Ok(self.dim)
        }
    }

    async fn service() -> IndexService {
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbedder { dim: 8 });
        let mut store = LiteStore::memory("text-embedding-3-small", embedder.clone());
        store.init().await.unwrap();
        IndexService::from_parts(Arc::new(Vector::from_store(Box::new(store))), embedder, None)
    }

    #[tokio::test]
    async fn upsert_index_stores_documents_per_file() {
        let svc = service().await;
        let outcome = svc
            .upsert_index(
                "uid-1",
                "/work/repo",
                vec![
                    AddFileInfo {
                        relative_path: "a.py".into(),
                        content: "def a():\n    return 1\n".into(),
                    },
                    AddFileInfo {
                        relative_path: "b.py".into(),
                        content: "def b():\n    return 2\n".into(),
                    },
                ],
            )
            .await
            .unwrap();

        assert_eq!(outcome.repo_id, fixed_uuid("uid-1:/work/repo"));
        assert_eq!(outcome.file_infos.len(), 2);
        for info in &outcome.file_infos {
            assert_eq!(
                info.file_id,
                fixed_uuid(&format!("uid-1:/work/repo:{}", info.relative_path))
            );
        }
        let metas = svc.all_index(outcome.repo_id).await.unwrap();
        assert!(!metas.is_empty());
        assert!(metas.iter().all(|m| m.repo_id == outcome.repo_id));
    }

    #[tokio::test]
    async fn empty_files_are_skipped_quietly() {
        let svc = service().await;
        let outcome = svc
            .upsert_index(
                "uid-1",
                "/work/repo",
                vec![AddFileInfo {
                    relative_path: "empty.py".into(),
                    content: String::new(),
                }],
            )
            .await
            .unwrap();
        assert_eq!(outcome.file_infos.len(), 1);
        assert!(svc.all_index(outcome.repo_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn retrieval_requires_a_query() {
        let svc = service().await;
        let err = svc
            .retrieval(fixed_uuid("r"), None, "   ")
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }

    #[tokio::test]
    async fn retrieval_returns_scored_metas_for_the_repo() {
        let svc = service().await;
        let outcome = svc
            .upsert_index(
                "uid-1",
                "/work/repo",
                vec![AddFileInfo {
                    relative_path: "search.py".into(),
                    content: "def find_user(name):\n    return db.lookup(name)\n".into(),
                }],
            )
            .await
            .unwrap();

        let metas = svc
            .retrieval(outcome.repo_id, None, "find user by name")
            .await
            .unwrap();
        assert!(!metas.is_empty());
        for meta in &metas {
            assert_eq!(meta.repo_id, outcome.repo_id);
            assert!(meta.score.is_some());
        }
    }

    #[tokio::test]
    async fn single_file_without_content_is_a_validation_error() {
        let svc = service().await;
        let err = svc
            .upsert_single_file("uid", "/repo", "void.py", Vec::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IndexError::Validation(_)));
    }
}
