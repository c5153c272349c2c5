// Corpus file loading
// Walks a corpus root and yields (path, content, language) in sorted order


use std::path::Path;

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::config::LoaderConfig;

/// Directories and file patterns that are never worth indexing.
const BUILTIN_IGNORES: &[&str] = &[
    "**/.git/**",
    "**/node_modules/**",
    "**/target/**",
    "**/__pycache__/**",
    "**/.venv/**",
    "**/venv/**",
    "**/dist/**",
    "**/build/**",
    "**/*.min.js",
    "**/*.min.css",
    "**/*.lock",
    "**/package-lock.json",
];

/// Maximum fraction of replacement characters tolerated after lossy
/// UTF-8 repair. Files above this are treated as binary and skipped.
const MAX_REPLACEMENT_RATE: f64 = 0.10;

/// One file yielded by the loader.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceFile {
    /// Path relative to the corpus root, with `/` separators.
    pub path: String,
    pub content: String,
    pub language: Option<String>,
}

/// Walks a corpus root applying extension, size, and ignore filters.
pub struct FileLoader {
    extensions: Vec<String>,
    ignores: GlobSet,
    max_file_size: u64,
}

impl FileLoader {
    #[inline]
    pub fn new(config: &LoaderConfig) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for pattern in BUILTIN_IGNORES {
            builder.add(Glob::new(pattern).context("Invalid built-in ignore pattern")?);
        }
        for pattern in &config.ignore_patterns {
            let glob = Glob::new(pattern)
                .with_context(|| format!("Invalid ignore pattern: {pattern}"))?;
            builder.add(glob);
        }
        let ignores = builder.build().context("Failed to build ignore set")?;

        Ok(Self {
            extensions: config.include_extensions.clone(),
            ignores,
            max_file_size: config.max_file_size,
        })
    }

    /// Load all indexable files under `root`, sorted by relative path so
    /// rebuilds observe files in a reproducible order.
    #[inline]
    pub fn load_corpus(&self, root: &Path) -> Result<Vec<SourceFile>> {
        let mut files = Vec::new();

        for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let rel = match entry.path().strip_prefix(root) {
                Ok(r) => r,
                Err(_) => continue,
            };
            let rel_str = rel.to_string_lossy().replace('\\', "/");

            if self.ignores.is_match(rel) || self.ignores.is_match(&rel_str) {
                continue;
            }
            if !self.extension_allowed(rel) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!("Skipping {}: {}", rel_str, e);
                    continue;
                }
            };
            if meta.len() > self.max_file_size {
                debug!(
                    "Skipping {} ({} bytes exceeds max {})",
                    rel_str,
                    meta.len(),
                    self.max_file_size
                );
                continue;
            }

            let bytes = match std::fs::read(entry.path()) {
                Ok(b) => b,
                Err(e) => {
                    warn!("Skipping {}: {}", rel_str, e);
                    continue;
                }
            };

            let Some(content) = decode_utf8_bounded(&bytes) else {
                debug!("Skipping {} (not valid UTF-8)", rel_str);
                continue;
            };

            let language = infer_language(rel, &content);
            files.push(SourceFile {
                path: rel_str,
                content,
                language,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        debug!("Loaded {} files from {}", files.len(), root.display());
        Ok(files)
    }

    fn extension_allowed(&self, path: &Path) -> bool {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| e == &ext)
            }
            // Extensionless files are allowed through so shebang scripts
            // can be picked up; binary detection filters the rest.
            None => true,
        }
    }
}

/// Decode bytes as UTF-8, tolerating a bounded amount of damage.
fn decode_utf8_bounded(bytes: &[u8]) -> Option<String> {
    if bytes.is_empty() {
        return Some(String::new());
    }
    match std::str::from_utf8(bytes) {
        Ok(s) => Some(s.to_string()),
        Err(_) => {
            let repaired = String::from_utf8_lossy(bytes);
            let replacements = repaired.chars().filter(|&c| c == '\u{FFFD}').count();
            let rate = replacements as f64 / repaired.chars().count().max(1) as f64;
            if rate <= MAX_REPLACEMENT_RATE {
                Some(repaired.into_owned())
            } else {
                None
            }
        }
    }
}

/// Infer the programming language from extension, falling back to a
/// shebang sniff for extensionless scripts.
pub fn infer_language(path: &Path, content: &str) -> Option<String> {
    let by_ext = path
        .extension()
        .and_then(|e| e.to_str())
        .and_then(|ext| match ext.to_ascii_lowercase().as_str() {
            "py" => Some("python"),
            "rs" => Some("rust"),
            "js" | "jsx" => Some("javascript"),
            "ts" | "tsx" => Some("typescript"),
            "go" => Some("go"),
            "java" => Some("java"),
            "c" | "h" => Some("c"),
            "cpp" | "hpp" | "cc" | "cxx" => Some("cpp"),
            "rb" => Some("ruby"),
            "sh" | "bash" => Some("shell"),
            "md" => Some("markdown"),
            "toml" => Some("toml"),
            "yaml" | "yml" => Some("yaml"),
            "json" => Some("json"),
            _ => None,
        });

    if by_ext.is_some() {
        return by_ext.map(|s| s.to_string());
    }

    let first_line = content.lines().next().unwrap_or("");
    if let Some(rest) = first_line.strip_prefix("#!") {
        if rest.contains("python") {
            return Some("python".to_string());
        }
        if rest.contains("bash") || rest.contains("/sh") || rest.ends_with("sh") {
            return Some("shell".to_string());
        }
        if rest.contains("node") {
            return Some("javascript".to_string());
        }
        if rest.contains("ruby") {
            return Some("ruby".to_string());
        }
    }
    None
}
