use crate::error::Result;
use crate::languages;
use crate::line_segmenter::LineSegmenter;
use crate::tokenizer::{length_fn, Encoding};
use crate::tree_segmenter::TreeSegmenter;
use crate::types::{Blob, CodeSegment};

/// Token bound every segmenter is constructed with.
pub const DEFAULT_MAX_TOKENS: usize = 512;

/// Decode a blob and segment it.
///
/// The segmenter is picked by extension; unsupported extensions use the line
/// segmenter directly. A tree-sitter segmenter that reports an invalid parse
/// is replaced by the line segmenter as well, so this only fails on
/// undecodable content.
pub fn load_blob(blob: &Blob) -> Result<Vec<CodeSegment>> {
    let text = blob.as_string()?;
    let length = length_fn(Encoding::Cl100kBase);

    if let Some(ext) = &blob.extension {
        if let Ok(spec) = languages::get(ext) {
            let segmenter =
                TreeSegmenter::new(text.clone(), spec, Some(DEFAULT_MAX_TOKENS), length.clone());
            if segmenter.is_valid() {
                return segmenter.segment();
            }
            tracing::debug!(path = %blob.path, "syntax tree has errors, falling back to line segmentation");
        }
    }

    Ok(LineSegmenter::new(text, Some(DEFAULT_MAX_TOKENS), length).segment())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn python_blob_uses_the_tree_segmenter() {
        let source = "def alpha():\n    return 1\n\ndef beta():\n    return 2\n";
        let blob = Blob::from_data(source.as_bytes().to_vec(), "pkg/mod.py");
        let segments = load_blob(&blob).unwrap();
        assert!(segments.iter().any(|s| s.code.starts_with("def alpha")));
        assert!(segments.iter().any(|s| s.code.starts_with("def beta")));
    }

    #[test]
    fn broken_python_falls_back_to_lines() {
        let source = "import os\n\nx = 1\ny = 2\ndef broken(:\n    pass\n";
        let blob = Blob::from_data(source.as_bytes().to_vec(), "bad.py");
        let segments = load_blob(&blob).unwrap();
        assert!(!segments.is_empty(), "fallback still emits segments");
    }

    #[test]
    fn unknown_extension_uses_line_segmenter() {
        let source = "some notes\n\nmore notes\n";
        let blob = Blob::from_data(source.as_bytes().to_vec(), "NOTES.txt");
        let segments = load_blob(&blob).unwrap();
        assert_eq!(segments.len(), 1);
    }

    #[test]
    fn invalid_utf8_is_a_decode_error() {
        let blob = Blob::from_data(vec![0xff, 0xfe, 0x00, 0x41], "weird.py");
        assert!(load_blob(&blob).is_err());
    }

    #[test]
    fn empty_blob_yields_no_segments() {
        let blob = Blob::from_data(Vec::new(), "empty.py");
        assert!(load_blob(&blob).unwrap().is_empty());
    }
}
