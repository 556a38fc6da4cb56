use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{IndexError, Result};

/// A contiguous region of a single source file emitted by a segmenter.
///
/// Lines are 1-based and inclusive. `block` stays at 1 unless the segment is
/// one of several pieces of a force-split logical unit, in which case later
/// pieces carry increasing numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeSegment {
    pub start_line: usize,
    pub end_line: usize,
    pub code: String,
    pub block: u32,
}

impl CodeSegment {
    pub fn line_count(&self) -> usize {
        self.end_line - self.start_line + 1
    }
}

/// Metadata attached to a stored segment.
///
/// `score` is populated only on retrieval results; `content` carries the
/// segment code for backends that can only store payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub repo_id: Uuid,
    pub file_id: Uuid,
    pub segment_id: Uuid,
    pub relative_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub segment_block: u32,
    pub segment_hash: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segment_cl100k_base_token: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub segment_o200k_base_token: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
}

impl DocumentMeta {
    /// Copy suitable for persistence: retrieval-only fields stripped.
    pub fn stored(&self) -> DocumentMeta {
        DocumentMeta {
            score: None,
            content: None,
            ..self.clone()
        }
    }
}

/// A segment plus its vector, as handed to a store adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub vector: Vec<f32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub content: Option<String>,
    pub meta: DocumentMeta,
}

/// Raw file content plus the identity needed to segment it.
#[derive(Debug, Clone)]
pub struct Blob {
    pub data: Vec<u8>,
    /// Lowercased extension including the leading dot, when the path has one.
    pub extension: Option<String>,
    /// Path used in error reports only.
    pub path: String,
}

impl Blob {
    pub fn from_data(data: impl Into<Vec<u8>>, path: &str) -> Self {
        Blob {
            data: data.into(),
            extension: extension_of(path),
            path: path.to_string(),
        }
    }

    /// Decode the blob as UTF-8 text.
    pub fn as_string(&self) -> Result<String> {
        String::from_utf8(self.data.clone()).map_err(|e| IndexError::Decode {
            path: self.path.clone(),
            reason: e.to_string(),
        })
    }
}

/// Lowercased extension with leading dot, e.g. `Some(".rs")`.
pub fn extension_of(path: &str) -> Option<String> {
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    let dot = name.rfind('.')?;
    if dot == 0 {
        // Dotfiles like `.gitignore` have no extension.
        return None;
    }
    Some(name[dot..].to_ascii_lowercase())
}

/// Everything the per-file pipeline needs to turn a blob into documents.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub repo_id: Uuid,
    pub file_id: Uuid,
    pub relative_path: String,
    pub blob: Blob,
}

/// SHA-256 hex digest of a segment body.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Deterministic UUIDv5 in the URL namespace, shared by repo and file ids.
pub fn fixed_uuid(unique: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_URL, unique.as_bytes())
}
