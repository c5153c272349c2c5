//! In-process BM25 lexical index.
//!
//! Postings are held in memory and rebuilt from the backing rows when a
//! store opens, which keeps `k1`/`b` and the tokenizer under caller
//! control. The tokenizer choice is pinned in the corpus manifest so a
//! query can never tokenize differently from the index it searches.

use std::collections::HashMap;

use crate::config::{SparseSearchConfig, SparseTokenizer};

#[derive(Debug, Clone)]
pub struct Bm25Index {
    k1: f32,
    b: f32,
    tokenizer: SparseTokenizer,
    /// term → doc_id → term frequency.
    postings: HashMap<String, HashMap<String, u32>>,
    /// doc_id → token count.
    doc_lengths: HashMap<String, u32>,
    total_length: u64,
}

impl Bm25Index {
    #[inline]
    pub fn new(config: &SparseSearchConfig) -> Self {
        Self {
            k1: config.k1,
            b: config.b,
            tokenizer: config.tokenizer,
            postings: HashMap::new(),
            doc_lengths: HashMap::new(),
            total_length: 0,
        }
    }

    #[inline]
    pub fn tokenizer(&self) -> SparseTokenizer {
        self.tokenizer
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.doc_lengths.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.doc_lengths.is_empty()
    }

    /// Index or re-index one document.
    pub fn insert(&mut self, doc_id: &str, text: &str) {
        if self.doc_lengths.contains_key(doc_id) {
            self.remove(doc_id);
        }

        let tokens = tokenize(text, self.tokenizer);
        let length = tokens.len() as u32;
        self.doc_lengths.insert(doc_id.to_string(), length);
        self.total_length += u64::from(length);

        let mut frequencies: HashMap<String, u32> = HashMap::new();
        for token in tokens {
            *frequencies.entry(token).or_insert(0) += 1;
        }
        for (term, tf) in frequencies {
            self.postings
                .entry(term)
                .or_default()
                .insert(doc_id.to_string(), tf);
        }
    }

    pub fn remove(&mut self, doc_id: &str) {
        if let Some(length) = self.doc_lengths.remove(doc_id) {
            self.total_length = self.total_length.saturating_sub(u64::from(length));
        }
        self.postings.retain(|_, docs| {
            docs.remove(doc_id);
            !docs.is_empty()
        });
    }

    /// Score the query against all documents, returning the top `top_k`
    /// as `(doc_id, score)` in descending score order with a stable
    /// doc-id tiebreak.
    pub fn search(&self, query: &str, top_k: usize) -> Vec<(String, f32)> {
        let n = self.doc_lengths.len();
        if n == 0 || top_k == 0 {
            return Vec::new();
        }
        let avg_length = self.total_length as f32 / n as f32;

        let mut scores: HashMap<&str, f32> = HashMap::new();
        for term in tokenize(query, self.tokenizer) {
            let Some(docs) = self.postings.get(&term) else {
                continue;
            };
            let df = docs.len() as f32;
            let idf = (1.0 + (n as f32 - df + 0.5) / (df + 0.5)).ln();

            for (doc_id, &tf) in docs {
                let tf = tf as f32;
                let doc_len = *self.doc_lengths.get(doc_id).unwrap_or(&0) as f32;
                let norm = self.k1 * (1.0 - self.b + self.b * doc_len / avg_length.max(1.0));
                let contribution = idf * (tf * (self.k1 + 1.0)) / (tf + norm);
                *scores.entry(doc_id.as_str()).or_insert(0.0) += contribution;
            }
        }

        let mut ranked: Vec<(String, f32)> = scores
            .into_iter()
            .filter(|(_, score)| *score > 0.0)
            .map(|(id, score)| (id.to_string(), score))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(top_k);
        ranked
    }
}

/// Tokenize text under the given policy.
pub fn tokenize(text: &str, tokenizer: SparseTokenizer) -> Vec<String> {
    match tokenizer {
        SparseTokenizer::Whitespace => text
            .split_whitespace()
            .map(|t| t.to_string())
            .collect(),
        SparseTokenizer::Code => {
            let mut tokens = Vec::new();
            for raw in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
                if raw.is_empty() {
                    continue;
                }
                // Identifiers contribute both the whole name and their
                // camelCase / snake_case parts.
                let lower = raw.to_lowercase();
                let parts = split_identifier(raw);
                if parts.len() > 1 {
                    for part in parts {
                        tokens.push(part);
                    }
                }
                tokens.push(lower);
            }
            tokens
        }
    }
}

fn split_identifier(ident: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut prev_lower = false;

    for c in ident.chars() {
        if c == '_' {
            if !current.is_empty() {
                parts.push(std::mem::take(&mut current));
            }
            prev_lower = false;
            continue;
        }
        if c.is_uppercase() && prev_lower && !current.is_empty() {
            parts.push(std::mem::take(&mut current));
        }
        prev_lower = c.is_lowercase() || c.is_numeric();
        for lc in c.to_lowercase() {
            current.push(lc);
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}
