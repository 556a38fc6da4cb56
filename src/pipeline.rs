use std::sync::Arc;

use futures::future::join_all;
use uuid::Uuid;

use crate::embedding::{ChatClient, ChatMessage, EmbeddingClient};
use crate::error::{IndexError, Result};
use crate::loader;
use crate::tokenizer::{count_tokens, Encoding};
use crate::types::{Document, DocumentMeta, TaskContext};

/// System prompt for the optional code2desc step: one numbered Markdown list
/// item per natural sub-segment of the user-provided code block.
const ANALYZE_CODE_PROMPT: &str = r#"# Task Instructions
1. I will provide a code block wrapped in ```
2. Analyze the code with these steps:
   - Identify natural segments separated by empty lines, comment blocks, or logical sections
   - Generate technical descriptions for each segment
3. Output requirements:
   - Use numbered Markdown lists (1. 2. 3.)
   - Maximum 2 lines per item
   - Prioritize functional explanations, then implementation details
   - Preserve key technical terms/algorithms
   - Keep identical terminology with source code

# Output Example
1. Initializes Spring Boot application: Uses @SpringBootApplication to configure bootstrap class, sets base package for component scanning
2. Implements RESTful endpoint: Creates /user API through @RestController, defines base path with @RequestMapping
3. Handles file uploads: Leverages S3 SDK to transfer local file_infos to cloud storage

# Now analyze this code:*"#;

fn analyze_messages(code: &str) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system",
            content: ANALYZE_CODE_PROMPT.to_string(),
        },
        ChatMessage {
            role: "user",
            content: code.to_string(),
        },
    ]
}

/// Turn one file into embedded documents.
///
/// Decode or segmentation happens on the blocking pool; a decode failure
/// skips the file (empty result) rather than failing the batch. The whole
/// file is embedded with a single `embed` call so vectors align with
/// segments by index.
pub async fn build_and_embed_segments(
    ctx: &TaskContext,
    embedder: Arc<dyn EmbeddingClient>,
    chat: Option<Arc<ChatClient>>,
) -> Result<Vec<Document>> {
    // Segmentation, hashing and token counting are CPU-bound; keep them off
    // the cooperative scheduler.
    let task_ctx = ctx.clone();
    let built = tokio::task::spawn_blocking(move || -> crate::error::Result<Vec<Document>> {
        let segments = loader::load_blob(&task_ctx.blob)?;
        Ok(segments
            .into_iter()
            .map(|segment| Document {
                vector: Vec::new(),
                content: Some(segment.code.clone()),
                meta: DocumentMeta {
                    repo_id: task_ctx.repo_id,
                    file_id: task_ctx.file_id,
                    segment_id: Uuid::new_v4(),
                    relative_path: task_ctx.relative_path.clone(),
                    start_line: segment.start_line,
                    end_line: segment.end_line,
                    segment_block: segment.block,
                    segment_hash: crate::types::text_hash(&segment.code),
                    segment_cl100k_base_token: Some(count_tokens(
                        &segment.code,
                        Encoding::Cl100kBase,
                    )),
                    segment_o200k_base_token: Some(count_tokens(
                        &segment.code,
                        Encoding::O200kBase,
                    )),
                    description: None,
                    score: None,
                    content: None,
                },
            })
            .collect())
    })
    .await
    .map_err(|e| IndexError::Internal(format!("segmentation task failed: {e}")))?;

    let mut documents = match built {
        Ok(documents) => documents,
        Err(IndexError::Decode { path, reason }) => {
            tracing::warn!(%path, %reason, "skipping undecodable file");
            return Ok(Vec::new());
        }
        Err(e) => return Err(e),
    };

    if documents.is_empty() {
        return Ok(documents);
    }

    if let Some(chat) = chat {
        let futures: Vec<_> = documents
            .iter()
            .map(|doc| {
                let chat = chat.clone();
                let code = doc.content.clone().unwrap_or_default();
                async move { chat.complete(analyze_messages(&code)).await }
            })
            .collect();
        let described = join_all(futures).await;
        for (doc, described) in documents.iter_mut().zip(described) {
            match described {
                Ok(description) => doc.meta.description = Some(description),
                Err(e) => {
                    tracing::warn!(path = %doc.meta.relative_path, error = %e, "code2desc failed")
                }
            }
        }
    }

    let inputs: Vec<String> = documents
        .iter()
        .map(|doc| {
            let code = doc.content.as_deref().unwrap_or_default();
            match &doc.meta.description {
                Some(description) => {
                    format!("'{}'\n'{}'\n{}", doc.meta.relative_path, description, code)
                }
                None => format!("'{}'\n{}", doc.meta.relative_path, code),
            }
        })
        .collect();

    let vectors = embedder.embed(&inputs).await?;
    if vectors.len() != documents.len() {
        return Err(IndexError::Embedding(format!(
            "expected {} vectors, got {}",
            documents.len(),
            vectors.len()
        )));
    }
    for (doc, vector) in documents.iter_mut().zip(vectors) {
        doc.vector = vector;
    }

    Ok(documents)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{fixed_uuid, Blob};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct StubEmbedder {
        dim: usize,
        batches: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
            self.batches.lock().unwrap().push(inputs.len());
            Ok(inputs
                .iter()
                .enumerate()
                .map(|(i, _)| vec![i as f32; self.dim])
                .collect())
        }

        async fn dimension(&self) -> Result<usize> {
            Ok(self.dim)
        }
    }

    fn ctx(path: &str, content: &str) -> TaskContext {
        TaskContext {
            repo_id: fixed_uuid("uid:/tmp/repo"),
            file_id: fixed_uuid(&format!("uid:/tmp/repo:{path}")),
            relative_path: path.to_string(),
            blob: Blob::from_data(content.as_bytes().to_vec(), path),
        }
    }

    #[tokio::test]
    async fn documents_carry_ids_hashes_and_tokens() {
        let embedder = Arc::new(StubEmbedder {
            dim: 4,
            batches: Mutex::new(Vec::new()),
        });
        let context = ctx("src/app.py", "def main():\n    print('hi')\n");
        let docs = build_and_embed_segments(&context, embedder.clone(), None)
            .await
            .unwrap();

        assert!(!docs.is_empty());
        for doc in &docs {
            assert_eq!(doc.meta.repo_id, context.repo_id);
            assert_eq!(doc.meta.file_id, context.file_id);
            assert_eq!(doc.meta.segment_hash.len(), 64);
            assert!(doc.meta.segment_cl100k_base_token.is_some());
            assert!(doc.meta.segment_o200k_base_token.is_some());
            assert_eq!(doc.vector.len(), 4);
        }
        // One embed call for the whole file.
        assert_eq!(embedder.batches.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn segment_ids_are_unique_per_run() {
        let embedder = Arc::new(StubEmbedder {
            dim: 2,
            batches: Mutex::new(Vec::new()),
        });
        let context = ctx("a.py", "def a():\n    pass\n\ndef b():\n    pass\n");
        let docs = build_and_embed_segments(&context, embedder, None).await.unwrap();
        let mut ids: Vec<_> = docs.iter().map(|d| d.meta.segment_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), docs.len());
    }

    #[tokio::test]
    async fn empty_file_produces_no_documents() {
        let embedder = Arc::new(StubEmbedder {
            dim: 2,
            batches: Mutex::new(Vec::new()),
        });
        let context = ctx("empty.py", "");
        let docs = build_and_embed_segments(&context, embedder.clone(), None)
            .await
            .unwrap();
        assert!(docs.is_empty());
        assert!(embedder.batches.lock().unwrap().is_empty(), "no embed call");
    }

    #[tokio::test]
    async fn undecodable_file_is_skipped_not_fatal() {
        let embedder = Arc::new(StubEmbedder {
            dim: 2,
            batches: Mutex::new(Vec::new()),
        });
        let context = TaskContext {
            repo_id: fixed_uuid("r"),
            file_id: fixed_uuid("f"),
            relative_path: "bin.py".into(),
            blob: Blob::from_data(vec![0xc3, 0x28, 0xa0, 0xa1], "bin.py"),
        };
        let docs = build_and_embed_segments(&context, embedder, None).await.unwrap();
        assert!(docs.is_empty());
    }

    #[tokio::test]
    async fn broken_syntax_still_yields_documents_with_tokens() {
        let embedder = Arc::new(StubEmbedder {
            dim: 3,
            batches: Mutex::new(Vec::new()),
        });
        let context = ctx("broken.py", "x = 1\ny = 2\ndef foo(:\n    pass\n");
        let docs = build_and_embed_segments(&context, embedder, None).await.unwrap();
        assert!(!docs.is_empty());
        for doc in &docs {
            assert!(doc.meta.segment_cl100k_base_token.is_some());
        }
    }
}
