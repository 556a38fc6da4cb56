use std::collections::VecDeque;

use tree_sitter::{Parser, Query, QueryCursor, StreamingIterator};

use crate::error::{IndexError, Result};
use crate::languages::LanguageSpec;
use crate::tokenizer::LengthFn;
use crate::types::CodeSegment;

pub const DEFAULT_CHUNK_SIZE: usize = 30;
pub const DEFAULT_MIN_CHUNK_SIZE: usize = 10;
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 50;
pub const DEFAULT_MAX_DEPTH: usize = 5;

/// Concrete-syntax-tree segmenter.
///
/// The language supplies three sets: target node kinds emitted as their own
/// segment, node kinds descended into while hunting for targets, and the
/// grammar itself. Everything not covered by a target becomes a gap chunk,
/// then all chunks are normalized against the line and token bounds.
pub struct TreeSegmenter {
    text: String,
    spec: &'static LanguageSpec,
    chunk_size: usize,
    min_chunk_size: usize,
    max_chunk_size: usize,
    max_depth: usize,
    split_large_chunks: bool,
    merge_small_chunks: bool,
    max_tokens: Option<usize>,
    length: LengthFn,
}

/// Working chunk: 1-based inclusive lines, no block number yet.
#[derive(Debug, Clone)]
struct Chunk {
    start: usize,
    end: usize,
    code: String,
}

impl TreeSegmenter {
    pub fn new(
        text: String,
        spec: &'static LanguageSpec,
        max_tokens: Option<usize>,
        length: LengthFn,
    ) -> Self {
        Self {
            text,
            spec,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_chunk_size: DEFAULT_MIN_CHUNK_SIZE,
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
            max_depth: DEFAULT_MAX_DEPTH,
            split_large_chunks: true,
            merge_small_chunks: false,
            max_tokens,
            length,
        }
    }

    pub fn with_merge_small_chunks(mut self, merge: bool) -> Self {
        self.merge_small_chunks = merge;
        self
    }

    /// Parse the text and report whether the tree is free of ERROR nodes.
    /// An unparsable text (grammar failure included) counts as invalid so
    /// the caller can fall back to line segmentation.
    pub fn is_valid(&self) -> bool {
        let language = (self.spec.language)();
        let mut parser = Parser::new();
        if parser.set_language(&language).is_err() {
            return false;
        }
        let Some(tree) = parser.parse(self.text.as_str(), None) else {
            return false;
        };
        let Ok(query) = Query::new(&language, "(ERROR) @error") else {
            return false;
        };
        let mut cursor = QueryCursor::new();
        let mut matches = cursor.matches(&query, tree.root_node(), self.text.as_bytes());
        matches.next().is_none()
    }

    pub fn segment(&self) -> Result<Vec<CodeSegment>> {
        let language = (self.spec.language)();
        let mut parser = Parser::new();
        parser
            .set_language(&language)
            .map_err(|_| IndexError::ParseInvalid)?;
        let tree = parser
            .parse(self.text.as_str(), None)
            .ok_or(IndexError::ParseInvalid)?;
        let root = tree.root_node();
        let source = self.text.as_bytes();

        // Breadth-first target collection, bounded by max_depth.
        let mut queue: VecDeque<(tree_sitter::Node<'_>, usize)> = VecDeque::new();
        for i in 0..root.child_count() {
            if let Some(child) = root.child(i as u32) {
                queue.push_back((child, 1));
            }
        }
        let mut targets: Vec<tree_sitter::Node<'_>> = Vec::new();
        while let Some((node, depth)) = queue.pop_front() {
            if self.spec.node_types.contains(&node.kind()) {
                targets.push(node);
            }
            if self.spec.recursion_node_types.contains(&node.kind()) && depth < self.max_depth {
                for i in 0..node.child_count() {
                    if let Some(child) = node.child(i as u32) {
                        queue.push_back((child, depth + 1));
                    }
                }
            }
        }

        // Outer declarations first; drop nodes fully covered by an accepted one.
        targets.sort_by_key(|n| (n.start_position().row, std::cmp::Reverse(n.end_position().row)));
        let mut accepted_ranges: Vec<(usize, usize)> = Vec::new();
        let mut chunks: Vec<Chunk> = Vec::new();
        for node in &targets {
            let start0 = node.start_position().row;
            let end0 = node.end_position().row;
            if range_covered(start0, end0, &accepted_ranges) {
                continue;
            }
            let code = node
                .utf8_text(source)
                .map_err(|_| IndexError::ParseInvalid)?
                .to_string();
            accepted_ranges.push((start0, end0));
            chunks.push(Chunk {
                start: start0 + 1,
                end: end0 + 1,
                code,
            });
        }
        chunks.sort_by_key(|c| c.start);

        // Gap filling: every uncovered run of lines becomes one verbatim chunk.
        let code_lines: Vec<&str> = self.text.split('\n').collect();
        let total_lines = self.text.matches('\n').count() + 1;
        let mut combined: Vec<Chunk> = Vec::new();
        let mut current_pos = 0usize; // 0-based line
        for chunk in chunks {
            let chunk_start0 = chunk.start - 1;
            let chunk_end0 = chunk.end - 1;
            if current_pos < chunk_start0 {
                combined.push(gap_chunk(&code_lines[current_pos..chunk_start0], current_pos));
            }
            current_pos = chunk_end0 + 1;
            combined.push(chunk);
        }
        if current_pos < total_lines {
            combined.push(gap_chunk(&code_lines[current_pos..total_lines], current_pos));
        }

        let finalized = self.post_process(combined);
        let segments = match self.max_tokens {
            Some(max_tokens) => self.split_by_tokens(finalized, max_tokens),
            None => finalized
                .into_iter()
                .map(|c| CodeSegment {
                    start_line: c.start,
                    end_line: c.end,
                    code: c.code,
                    block: 1,
                })
                .collect(),
        };

        Ok(segments
            .into_iter()
            .filter(|s| !s.code.trim().is_empty())
            .collect())
    }

    fn post_process(&self, chunks: Vec<Chunk>) -> Vec<Chunk> {
        let split = if self.split_large_chunks {
            chunks
                .into_iter()
                .filter(|c| !c.code.is_empty())
                .flat_map(|c| split_large_chunk(c, self.chunk_size, self.max_chunk_size))
                .collect()
        } else {
            chunks
        };

        if self.merge_small_chunks {
            merge_small_chunks(split, self.min_chunk_size, self.max_chunk_size, self.chunk_size)
        } else {
            split
        }
    }

    /// Recursively halve any chunk whose token count exceeds the bound.
    /// Pieces of one oversize logical chunk get increasing block numbers.
    fn split_by_tokens(&self, chunks: Vec<Chunk>, max_tokens: usize) -> Vec<CodeSegment> {
        let mut out = Vec::new();
        for chunk in chunks {
            if (self.length)(&chunk.code) <= max_tokens {
                out.push(CodeSegment {
                    start_line: chunk.start,
                    end_line: chunk.end,
                    code: chunk.code,
                    block: 1,
                });
                continue;
            }
            let mut pieces = Vec::new();
            self.halve(chunk, max_tokens, &mut pieces);
            for (i, piece) in pieces.into_iter().enumerate() {
                out.push(CodeSegment {
                    start_line: piece.start,
                    end_line: piece.end,
                    code: piece.code,
                    block: (i + 1) as u32,
                });
            }
        }
        out
    }

    fn halve(&self, chunk: Chunk, max_tokens: usize, out: &mut Vec<Chunk>) {
        if (self.length)(&chunk.code) <= max_tokens {
            out.push(chunk);
            return;
        }

        let lines: Vec<&str> = chunk.code.split('\n').collect();
        if lines.len() > 1 {
            let split_index = lines.len() / 2;
            let first_code = lines[..split_index].join("\n");
            let second_code = lines[split_index..].join("\n");
            let first_end = chunk.start + split_index - 1;
            let first = Chunk {
                start: chunk.start,
                end: first_end,
                code: first_code,
            };
            let second = Chunk {
                start: first_end + 1,
                end: chunk.end,
                code: second_code,
            };
            self.halve(first, max_tokens, out);
            self.halve(second, max_tokens, out);
        } else {
            // Single line: binary-search the largest character prefix that fits.
            let code = chunk.code.as_str();
            let mut low = 0usize;
            let mut high = code.len();
            let mut best = 0usize;
            while low <= high {
                let mid = (low + high) / 2;
                let cut = floor_char_boundary(code, mid);
                if (self.length)(&code[..cut]) <= max_tokens {
                    best = cut;
                    low = mid + 1;
                } else {
                    if mid == 0 {
                        break;
                    }
                    high = mid - 1;
                }
            }
            if best == 0 {
                best = floor_char_boundary(code, code.len() / 2);
            }
            if best == 0 || best >= code.len() {
                // Cannot shrink further; emit as-is to guarantee progress.
                out.push(chunk);
                return;
            }
            let first = Chunk {
                start: chunk.start,
                end: chunk.end,
                code: code[..best].to_string(),
            };
            let second = Chunk {
                start: chunk.start,
                end: chunk.end,
                code: code[best..].to_string(),
            };
            self.halve(first, max_tokens, out);
            self.halve(second, max_tokens, out);
        }
    }
}

fn range_covered(start: usize, end: usize, accepted: &[(usize, usize)]) -> bool {
    accepted.iter().any(|&(s, e)| s <= start && end <= e)
}

fn gap_chunk(lines: &[&str], start0: usize) -> Chunk {
    Chunk {
        start: start0 + 1,
        end: start0 + lines.len(),
        code: lines.join("\n"),
    }
}

/// Partition an oversize chunk into near-equal line runs: `n` grows from
/// `round(lines / chunk_size)` until every piece fits `max_chunk_size`, the
/// first `lines % n` pieces taking one extra line.
fn split_large_chunk(chunk: Chunk, chunk_size: usize, max_chunk_size: usize) -> Vec<Chunk> {
    let lines: Vec<&str> = chunk.code.split('\n').collect();
    let total = lines.len();
    if total <= max_chunk_size {
        return vec![chunk];
    }

    let mut n = ((total as f64 / chunk_size as f64).round() as usize).max(1);
    while (total as f64 / n as f64) > max_chunk_size as f64 {
        n += 1;
    }
    n = n.min(total);

    let base = total / n;
    let remainder = total % n;
    let mut results = Vec::with_capacity(n);
    let mut index = 0usize;
    for i in 0..n {
        let size = base + usize::from(i < remainder);
        let sub = &lines[index..index + size];
        results.push(Chunk {
            start: chunk.start + index,
            end: chunk.start + index + size - 1,
            code: sub.join("\n"),
        });
        index += size;
    }
    results
}

/// Fixed-point merge of undersized chunks into the neighbor that lands the
/// merged size closest to `chunk_size`, skipping neighbors already inside
/// the ideal band. Chunks under half the minimum join their predecessor
/// unconditionally.
fn merge_small_chunks(
    chunks: Vec<Chunk>,
    min_chunk_size: usize,
    max_chunk_size: usize,
    chunk_size: usize,
) -> Vec<Chunk> {
    let tolerance_low = 0.8 * chunk_size as f64;
    let tolerance_high = 1.2 * chunk_size as f64;
    let in_band = |lines: usize| {
        let l = lines as f64;
        (tolerance_low..=tolerance_high).contains(&l)
    };
    let line_count = |c: &Chunk| c.code.split('\n').count();
    let join = |a: &Chunk, b: &Chunk| Chunk {
        start: a.start,
        end: b.end,
        code: format!("{}\n{}", a.code, b.code),
    };

    let mut merged = chunks;
    let mut changed = true;
    while changed {
        changed = false;
        let mut next: Vec<Chunk> = Vec::with_capacity(merged.len());
        let mut i = 0usize;
        while i < merged.len() {
            let current = &merged[i];
            let current_lines = line_count(current);

            if current_lines >= min_chunk_size {
                next.push(current.clone());
                i += 1;
                continue;
            }

            #[derive(PartialEq)]
            enum Candidate {
                Prev,
                Next,
            }
            let mut best: Option<Candidate> = None;
            let mut best_score = f64::INFINITY;

            if let Some(prev) = next.last() {
                let prev_lines = line_count(prev);
                if !in_band(prev_lines) && prev_lines + current_lines <= max_chunk_size {
                    let score = ((prev_lines + current_lines) as f64 - chunk_size as f64).abs();
                    if score < best_score {
                        best = Some(Candidate::Prev);
                        best_score = score;
                    }
                }
            }
            if i + 1 < merged.len() {
                let nxt_lines = line_count(&merged[i + 1]);
                if !in_band(nxt_lines) && current_lines + nxt_lines <= max_chunk_size {
                    let score = ((current_lines + nxt_lines) as f64 - chunk_size as f64).abs();
                    if score < best_score {
                        best = Some(Candidate::Next);
                    }
                }
            }

            match best {
                Some(Candidate::Prev) => {
                    let prev = next.pop().expect("prev candidate exists");
                    next.push(join(&prev, current));
                    i += 1;
                    changed = true;
                }
                Some(Candidate::Next) => {
                    next.push(join(current, &merged[i + 1]));
                    i += 2;
                    changed = true;
                }
                None => {
                    if current_lines * 2 < min_chunk_size && !next.is_empty() {
                        let prev = next.pop().expect("checked non-empty");
                        next.push(join(&prev, current));
                        changed = true;
                    } else {
                        next.push(current.clone());
                    }
                    i += 1;
                }
            }
        }
        merged = next;
    }
    merged
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
