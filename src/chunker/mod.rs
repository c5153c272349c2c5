// Chunking module
// Splits source files into retrieval-unit chunks with stable identifiers

pub mod ast;


use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::config::{ChunkStrategy, ChunkerConfig};
use crate::loader::SourceFile;

/// A contiguous region of one file, the unit of retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Stable hash of `corpus_id ∥ file_path ∥ start_line ∥ end_line ∥ content_hash`.
    pub chunk_id: String,
    pub corpus_id: String,
    pub file_path: String,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    pub language: Option<String>,
    pub content: String,
    pub token_count: usize,
    /// SHA-256 of `content`, hex.
    pub content_hash: String,
    /// Filled in by the embedder during a build.
    pub embedding: Option<Vec<f32>>,
    pub summary: Option<String>,
    /// Set when the chunk still exceeded the token budget after all splitting.
    pub truncated: bool,
}

/// Result of chunking one file.
#[derive(Debug, Clone, Default)]
pub struct ChunkOutcome {
    pub chunks: Vec<Chunk>,
    /// Chunks emitted above the token budget despite splitting.
    pub truncated_count: usize,
}

pub struct Chunker {
    config: ChunkerConfig,
}

impl Chunker {
    #[inline]
    pub fn new(config: ChunkerConfig) -> Self {
        Self { config }
    }

    /// Chunk one file. Deterministic: identical content at identical lines
    /// always produces identical chunks and chunk ids.
    #[inline]
    pub fn chunk_file(&self, corpus_id: &str, file: &SourceFile) -> ChunkOutcome {
        if file.content.trim().is_empty() {
            return ChunkOutcome::default();
        }

        let spans = match self.config.strategy {
            ChunkStrategy::Greedy => self.greedy_spans(&file.content),
            ChunkStrategy::Ast => self.ast_spans(file).unwrap_or_else(|| {
                warn!("No declarations found in {}, falling back to greedy", file.path);
                self.greedy_spans(&file.content)
            }),
            ChunkStrategy::Hybrid => self
                .ast_spans(file)
                .unwrap_or_else(|| self.greedy_spans(&file.content)),
        };

        self.emit(corpus_id, file, spans)
    }

    /// Split the file into line spans using declaration boundaries. Each
    /// span carries its own content (which may include a prepended import
    /// preamble). Returns `None` when the file has no scannable structure.
    fn ast_spans(&self, file: &SourceFile) -> Option<Vec<Span>> {
        let language = file.language.as_deref()?;
        let decls = ast::scan_declarations(&file.content, language)?;
        let lines: Vec<&str> = file.content.lines().collect();

        let preamble = if self.config.preserve_imports {
            let imports = ast::scan_imports(&file.content, language);
            if imports.is_empty() {
                None
            } else {
                Some(imports.join("\n"))
            }
        } else {
            None
        };

        let mut spans = Vec::new();
        let mut covered = vec![false; lines.len()];

        for decl in decls.iter().filter(|d| d.kind != ast::DeclKind::Method) {
            let start = decl.start_line - 1;
            let end = (decl.end_line - 1).min(lines.len().saturating_sub(1));
            for flag in covered.iter_mut().take(end + 1).skip(start) {
                *flag = true;
            }

            let text = lines[start..=end].join("\n");
            if estimate_token_count(&text) > self.config.max_chunk_tokens {
                spans.extend(self.split_oversized(&lines, start, end, preamble.as_deref()));
            } else {
                spans.push(Span::new(start + 1, end + 1, text, preamble.as_deref()));
            }
        }

        // Module-level residue (imports, constants, script bodies) between
        // declarations still has to be retrievable.
        let mut i = 0;
        while i < lines.len() {
            if covered[i] {
                i += 1;
                continue;
            }
            let start = i;
            while i < lines.len() && !covered[i] {
                i += 1;
            }
            let text = lines[start..i].join("\n");
            if text.trim().len() >= self.config.min_chunk_chars {
                spans.push(Span::new(start + 1, i, text, None));
            }
        }

        spans.sort_by_key(|s| s.start_line);
        if spans.is_empty() { None } else { Some(spans) }
    }

    /// Statement-boundary split of an over-large declaration, duplicating
    /// `ast_overlap_lines` of context across adjacent pieces.
    fn split_oversized(
        &self,
        lines: &[&str],
        start: usize,
        end: usize,
        preamble: Option<&str>,
    ) -> Vec<Span> {
        let mut spans = Vec::new();
        let overlap = self.config.ast_overlap_lines;
        let budget = self.config.max_chunk_tokens;

        let mut piece_start = start;
        while piece_start <= end {
            let mut tokens = 0usize;
            let mut piece_end = piece_start;
            for (j, line) in lines.iter().enumerate().take(end + 1).skip(piece_start) {
                let line_tokens = estimate_token_count(line).max(1);
                if tokens + line_tokens > budget && j > piece_start {
                    break;
                }
                tokens += line_tokens;
                piece_end = j;
            }

            let text = lines[piece_start..=piece_end].join("\n");
            spans.push(Span::new(piece_start + 1, piece_end + 1, text, preamble));

            if piece_end >= end {
                break;
            }
            piece_start = (piece_end + 1).saturating_sub(overlap).max(piece_start + 1);
        }
        spans
    }

    /// Token-window chunking that never breaks inside a line.
    fn greedy_spans(&self, content: &str) -> Vec<Span> {
        let lines: Vec<&str> = content.lines().collect();
        let target = self.config.chunk_size;
        let overlap = self.config.chunk_overlap;

        let mut spans = Vec::new();
        let mut start = 0usize;

        while start < lines.len() {
            let mut tokens = 0usize;
            let mut end = start;
            for (j, line) in lines.iter().enumerate().skip(start) {
                let line_tokens = estimate_token_count(line).max(1);
                if tokens + line_tokens > target && j > start {
                    break;
                }
                tokens += line_tokens;
                end = j;
            }

            let text = lines[start..=end].join("\n");
            spans.push(Span::new(start + 1, end + 1, text, None));

            if end + 1 >= lines.len() {
                break;
            }

            // Walk back until the overlap token budget is covered.
            let mut next = end + 1;
            let mut overlap_tokens = 0usize;
            while next > start + 1 && overlap_tokens < overlap {
                next -= 1;
                overlap_tokens += estimate_token_count(lines[next]).max(1);
            }
            start = next;
        }
        spans
    }

    fn emit(&self, corpus_id: &str, file: &SourceFile, spans: Vec<Span>) -> ChunkOutcome {
        let mut outcome = ChunkOutcome::default();

        for span in spans {
            if span.content.trim().is_empty() {
                continue;
            }
            let token_count = estimate_token_count(&span.content).max(1);
            let truncated = token_count > self.config.max_chunk_tokens;
            if truncated {
                outcome.truncated_count += 1;
            }

            outcome.chunks.push(build_chunk(
                corpus_id,
                file,
                span.start_line,
                span.end_line,
                span.content,
                token_count,
                truncated,
            ));
        }

        // Trailing fragments below the size floor merge into their
        // predecessor rather than standing alone.
        merge_small_chunks(&mut outcome.chunks, self.config.min_chunk_chars, corpus_id, file);

        debug!(
            "Chunked {} into {} chunks ({} truncated)",
            file.path,
            outcome.chunks.len(),
            outcome.truncated_count
        );
        outcome
    }
}

struct Span {
    start_line: usize,
    end_line: usize,
    content: String,
}

impl Span {
    fn new(start_line: usize, end_line: usize, text: String, preamble: Option<&str>) -> Self {
        let content = match preamble {
            // Only prepend when the span does not already open with the imports.
            Some(p) if !text.starts_with(p) => format!("{p}\n\n{text}"),
            _ => text,
        };
        Self {
            start_line,
            end_line,
            content,
        }
    }
}

fn merge_small_chunks(
    chunks: &mut Vec<Chunk>,
    min_chars: usize,
    corpus_id: &str,
    file: &SourceFile,
) {
    let mut i = 0;
    while i < chunks.len() {
        if chunks[i].content.len() < min_chars && i > 0 {
            let small = chunks.remove(i);
            let prev = &mut chunks[i - 1];
            let merged_content = format!("{}\n{}", prev.content, small.content);
            let token_count = estimate_token_count(&merged_content).max(1);
            *prev = build_chunk(
                corpus_id,
                file,
                prev.start_line,
                small.end_line.max(prev.end_line),
                merged_content,
                token_count,
                prev.truncated || small.truncated,
            );
        } else {
            i += 1;
        }
    }
}

fn build_chunk(
    corpus_id: &str,
    file: &SourceFile,
    start_line: usize,
    end_line: usize,
    content: String,
    token_count: usize,
    truncated: bool,
) -> Chunk {
    let content_hash = sha256_hex(content.as_bytes());
    let chunk_id = compute_chunk_id(corpus_id, &file.path, start_line, end_line, &content_hash);
    Chunk {
        chunk_id,
        corpus_id: corpus_id.to_string(),
        file_path: file.path.clone(),
        start_line,
        end_line,
        language: file.language.clone(),
        content,
        token_count,
        content_hash,
        embedding: None,
        summary: None,
        truncated,
    }
}

/// Stable chunk identity: same corpus, path, line range, and content always
/// hash to the same id across rebuilds.
#[inline]
pub fn compute_chunk_id(
    corpus_id: &str,
    file_path: &str,
    start_line: usize,
    end_line: usize,
    content_hash: &str,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(corpus_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_path.as_bytes());
    hasher.update([0u8]);
    hasher.update(start_line.to_le_bytes());
    hasher.update(end_line.to_le_bytes());
    hasher.update(content_hash.as_bytes());
    let digest = hasher.finalize();
    hex_encode(&digest[..16])
}

#[inline]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex_encode(&digest)
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Rough token estimate: 1 token ≈ 0.75 words, plus a small surcharge for
/// punctuation-dense code.
#[inline]
pub fn estimate_token_count(text: &str) -> usize {
    let word_count = text.split_whitespace().count();
    let punct_count = text.chars().filter(|c| c.is_ascii_punctuation()).count();

    (punct_count as f64).mul_add(0.1, word_count as f64 / 0.75) as usize
}
