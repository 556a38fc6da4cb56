use std::collections::HashMap;

use once_cell::sync::Lazy;
use tree_sitter::Language;

use crate::error::{IndexError, Result};

/// Everything the tree segmenter needs to know about one language family:
/// the grammar, the node kinds emitted as their own segment, and the node
/// kinds descended into while collecting targets.
pub struct LanguageSpec {
    pub name: &'static str,
    pub extensions: &'static [&'static str],
    pub language: fn() -> Language,
    pub node_types: &'static [&'static str],
    pub recursion_node_types: &'static [&'static str],
}

static SPECS: &[LanguageSpec] = &[
    LanguageSpec {
        name: "css",
        extensions: &[".css"],
        language: || tree_sitter_css::LANGUAGE.into(),
        node_types: &["rule_set", "keyframes_statement", "media_statement"],
        recursion_node_types: &[],
    },
    LanguageSpec {
        name: "go",
        extensions: &[".go"],
        language: || tree_sitter_go::LANGUAGE.into(),
        node_types: &["method_declaration", "function_declaration", "type_declaration"],
        recursion_node_types: &[],
    },
    LanguageSpec {
        name: "java",
        extensions: &[".java"],
        language: || tree_sitter_java::LANGUAGE.into(),
        node_types: &["method_declaration", "enum_declaration"],
        recursion_node_types: &[
            "class_declaration",
            "class_body",
            "interface_declaration",
            "interface_body",
        ],
    },
    LanguageSpec {
        name: "javascript",
        extensions: &[".js", ".mjs"],
        language: || tree_sitter_javascript::LANGUAGE.into(),
        node_types: &[
            "lexical_declaration",
            "interface_declaration",
            "export_statement",
            "method_definition",
            "function_declaration",
            "function_expression",
            "generator_function",
            "generator_function_declaration",
        ],
        recursion_node_types: &["class_declaration", "class_body"],
    },
    LanguageSpec {
        name: "python",
        extensions: &[".py"],
        language: || tree_sitter_python::LANGUAGE.into(),
        node_types: &["function_definition", "decorated_definition"],
        recursion_node_types: &["class_definition", "block"],
    },
    LanguageSpec {
        name: "typescript",
        extensions: &[".ts"],
        language: || tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into(),
        node_types: &[
            "lexical_declaration",
            "interface_declaration",
            "method_definition",
            "function_declaration",
            "export_statement",
        ],
        recursion_node_types: &["class_declaration", "class_body"],
    },
    LanguageSpec {
        name: "tsx",
        extensions: &[".tsx"],
        language: || tree_sitter_typescript::LANGUAGE_TSX.into(),
        node_types: &[
            "lexical_declaration",
            "interface_declaration",
            "method_definition",
            "function_declaration",
            "export_statement",
        ],
        recursion_node_types: &["class_declaration", "class_body"],
    },
];

/// Extension → spec table. First registration wins, so a later spec cannot
/// silently steal an extension.
static REGISTRY: Lazy<HashMap<&'static str, &'static LanguageSpec>> = Lazy::new(|| {
    let mut map: HashMap<&'static str, &'static LanguageSpec> = HashMap::new();
    for spec in SPECS {
        for ext in spec.extensions {
            map.entry(ext).or_insert(spec);
        }
    }
    map
});

/// Look up the segmenter spec for a lowercased extension (leading dot).
pub fn get(extension: &str) -> Result<&'static LanguageSpec> {
    REGISTRY
        .get(extension)
        .copied()
        .ok_or_else(|| IndexError::UnsupportedExtension(extension.to_string()))
}

/// The union of all registered extensions, sorted for stable output.
pub fn supported_extensions() -> Vec<&'static str> {
    let mut exts: Vec<&'static str> = REGISTRY.keys().copied().collect();
    exts.sort_unstable();
    exts
}
