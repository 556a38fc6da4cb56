//! End-to-end: segmentation → pipeline → embedded store → retrieval,
//! using a deterministic in-process embedding client.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use we0_index::embedding::EmbeddingClient;
use we0_index::error::Result;
use we0_index::lite_store::LiteStore;
use we0_index::loader;
use we0_index::service::{AddFileInfo, IndexService};
use we0_index::types::{fixed_uuid, Blob};
use we0_index::vector_store::{Vector, VectorStore};

const DIM: usize = 16;

/// Deterministic embedder: direction derived from byte content, so equal
/// inputs get equal vectors and lexical overlap raises similarity a bit.
struct ByteEmbedder {
    batch_sizes: Mutex<Vec<usize>>,
}

impl ByteEmbedder {
    fn new() -> Self {
        Self {
            batch_sizes: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EmbeddingClient for ByteEmbedder {
    async fn embed(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        self.batch_sizes.lock().unwrap().push(inputs.len());
        Ok(inputs
            .iter()
            .map(|input| {
                let mut v = vec![0.0f32; DIM];
                for (i, b) in input.bytes().enumerate() {
                    v[(i + b as usize) % DIM] += (b % 31) as f32;
                }
                v
            })
            .collect())
    }

    async fn dimension(&self) -> Result<usize> {
        Ok(DIM)
    }
}

async fn make_service() -> (IndexService, Arc<ByteEmbedder>) {
    let embedder = Arc::new(ByteEmbedder::new());
    let mut store = LiteStore::memory("text-embedding-3-small", embedder.clone());
    store.init().await.unwrap();
    let service = IndexService::from_parts(
        Arc::new(Vector::from_store(Box::new(store))),
        embedder.clone(),
        None,
    );
    (service, embedder)
}

/// ~120-line Python file: two top-level functions plus a class with two
/// methods, behind an import header.
fn python_fixture() -> String {
    let mut s = String::new();
    s.push_str("import os\nimport sys\n\n\n");

    s.push_str("def load_settings(path):\n");
    for i in 0..24 {
        s.push_str(&format!("    option_{i} = {i}\n"));
    }
    s.push_str("    return path\n\n\n");

    s.push_str("def save_settings(path):\n");
    for i in 0..24 {
        s.push_str(&format!("    field_{i} = {i}\n"));
    }
    s.push_str("    return None\n\n\n");

    s.push_str("class Store:\n");
    s.push_str("    def put(self, key, value):\n");
    for i in 0..18 {
        s.push_str(&format!("        slot_{i} = value\n"));
    }
    s.push_str("        return key\n\n");
    s.push_str("    def get(self, key):\n");
    for i in 0..18 {
        s.push_str(&format!("        out_{i} = key\n"));
    }
    s.push_str("        return key\n");
    s
}

fn without_whitespace(text: &str) -> String {
    text.chars().filter(|c| !c.is_whitespace()).collect()
}

#[test]
fn python_fixture_segments_cover_the_file_within_bounds() {
    let source = python_fixture();
    assert!(source.lines().count() >= 110, "fixture should be sizeable");

    let blob = Blob::from_data(source.as_bytes().to_vec(), "pkg/settings.py");
    let segments = loader::load_blob(&blob).unwrap();

    // Two functions, two methods, plus gap chunks.
    assert!(segments.len() >= 4, "got {} segments", segments.len());
    assert_eq!(segments[0].start_line, 1, "header gap starts the sequence");
    assert!(segments[0].code.contains("import os"));

    let mut prev_start = 0;
    for s in &segments {
        assert!(s.start_line >= prev_start, "non-decreasing start lines");
        assert!(s.end_line - s.start_line + 1 <= 50, "line bound respected");
        prev_start = s.start_line;
    }

    // Coverage: concatenation reproduces the file modulo whitespace.
    let joined: String = segments.iter().map(|s| s.code.as_str()).collect();
    assert_eq!(without_whitespace(&joined), without_whitespace(&source));

    let named: Vec<&str> = segments.iter().map(|s| s.code.as_str()).collect();
    assert!(named.iter().any(|c| c.starts_with("def load_settings")));
    assert!(named.iter().any(|c| c.starts_with("def save_settings")));
    assert!(named.iter().any(|c| c.contains("def put")));
    assert!(named.iter().any(|c| c.contains("def get")));
}

#[tokio::test]
async fn upsert_then_delete_then_drop_round_trip() {
    let (service, _) = make_service().await;

    let outcome = service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "settings.py".into(),
                content: python_fixture(),
            }],
        )
        .await
        .unwrap();
    let repo_id = outcome.repo_id;
    let file_id = outcome.file_infos[0].file_id;

    let metas = service.all_index(repo_id).await.unwrap();
    assert!(!metas.is_empty());
    assert!(metas.iter().all(|m| m.file_id == file_id));
    assert!(metas.iter().all(|m| m.segment_hash.len() == 64));
    assert!(metas.iter().all(|m| m.segment_cl100k_base_token.is_some()));
    assert!(metas.iter().all(|m| m.segment_o200k_base_token.is_some()));

    service.delete_index(repo_id, &[file_id]).await.unwrap();
    assert!(service.all_index(repo_id).await.unwrap().is_empty());

    // Re-index, then drop the whole repo.
    service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "settings.py".into(),
                content: python_fixture(),
            }],
        )
        .await
        .unwrap();
    service.drop_index(repo_id).await.unwrap();
    assert!(service.all_index(repo_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn upsert_replaces_a_file_rather_than_duplicating_it() {
    let (service, _) = make_service().await;

    let first = service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "a.py".into(),
                content: "def one():\n    return 1\n".into(),
            }],
        )
        .await
        .unwrap();
    let count_before = service.all_index(first.repo_id).await.unwrap().len();

    service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "a.py".into(),
                content: "def one():\n    return 1\n".into(),
            }],
        )
        .await
        .unwrap();
    let count_after = service.all_index(first.repo_id).await.unwrap().len();
    assert_eq!(count_before, count_after);
}

#[tokio::test]
async fn retrieval_filters_by_file_set() {
    let (service, _) = make_service().await;

    let outcome = service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![
                AddFileInfo {
                    relative_path: "users.py".into(),
                    content: "def find_user(name):\n    return lookup(name)\n".into(),
                },
                AddFileInfo {
                    relative_path: "billing.py".into(),
                    content: "def charge_card(amount):\n    return gateway(amount)\n".into(),
                },
                AddFileInfo {
                    relative_path: "mail.py".into(),
                    content: "def send_mail(to):\n    return smtp(to)\n".into(),
                },
            ],
        )
        .await
        .unwrap();
    let repo_id = outcome.repo_id;
    let users_file = outcome
        .file_infos
        .iter()
        .find(|f| f.relative_path == "users.py")
        .unwrap()
        .file_id;

    let scoped = service
        .retrieval(repo_id, Some(vec![users_file]), "find user by name")
        .await
        .unwrap();
    assert!(!scoped.is_empty());
    assert!(scoped.iter().all(|m| m.file_id == users_file));

    let unscoped = service.retrieval(repo_id, None, "find user").await.unwrap();
    assert!(!unscoped.is_empty());
    assert!(unscoped.iter().all(|m| m.repo_id == repo_id));
    assert!(unscoped.iter().all(|m| m.score.is_some()));

    // Highest score first.
    let scores: Vec<f32> = unscoped.iter().map(|m| m.score.unwrap()).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));
}

#[tokio::test]
async fn one_embed_call_per_file_and_vectors_align() {
    let (service, embedder) = make_service().await;

    service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "settings.py".into(),
                content: python_fixture(),
            }],
        )
        .await
        .unwrap();

    let batches = embedder.batch_sizes.lock().unwrap().clone();
    assert_eq!(batches.len(), 1, "whole file embedded in one call");
    assert!(batches[0] >= 4);
}

#[tokio::test]
async fn stable_ids_are_reproducible() {
    let (service, _) = make_service().await;
    let outcome = service
        .upsert_index(
            "uid-9",
            "/work/app",
            vec![AddFileInfo {
                relative_path: "x.py".into(),
                content: "def x():\n    return 0\n".into(),
            }],
        )
        .await
        .unwrap();

    assert_eq!(outcome.repo_id, fixed_uuid("uid-9:/work/app"));
    assert_eq!(
        outcome.file_infos[0].file_id,
        fixed_uuid("uid-9:/work/app:x.py")
    );
}

#[tokio::test]
async fn unparseable_python_still_indexes_via_fallback() {
    let (service, _) = make_service().await;
    let broken = "import os\n\nvalue = 1\nother = 2\ndef broken(:\n    pass\n";
    let outcome = service
        .upsert_index(
            "uid-1",
            "/work/repo",
            vec![AddFileInfo {
                relative_path: "broken.py".into(),
                content: broken.into(),
            }],
        )
        .await
        .unwrap();

    let metas = service.all_index(outcome.repo_id).await.unwrap();
    assert!(!metas.is_empty(), "fallback segmentation produced documents");
    assert!(metas.iter().all(|m| m.segment_cl100k_base_token.is_some()));
}
