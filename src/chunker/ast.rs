//! Lightweight declaration scanner.
//!
//! Finds top-level declarations (functions, classes, methods, modules) by
//! keyword and indentation analysis. This deliberately avoids a full parse:
//! the scanner only needs boundaries and names that are good enough for
//! chunking and structural entity extraction, and it must never panic on
//! malformed input.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclKind {
    Function,
    Method,
    Class,
    Module,
}

impl DeclKind {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            DeclKind::Function => "function",
            DeclKind::Method => "method",
            DeclKind::Class => "class",
            DeclKind::Module => "module",
        }
    }
}

/// A top-level declaration found in a source file.
#[derive(Debug, Clone, PartialEq)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
    /// Enclosing class name for methods.
    pub parent: Option<String>,
}

/// Scan a file for top-level declarations. Returns `None` when the
/// language is unsupported or nothing was found, so callers can fall
/// back to greedy chunking.
pub fn scan_declarations(content: &str, language: &str) -> Option<Vec<Declaration>> {
    let decls = match language {
        "python" => scan_python(content),
        "rust" => scan_braced(content, &RUST_MARKERS),
        "javascript" | "typescript" => scan_braced(content, &JS_MARKERS),
        "go" => scan_braced(content, &GO_MARKERS),
        "java" => scan_braced(content, &JAVA_MARKERS),
        _ => return None,
    };
    if decls.is_empty() { None } else { Some(decls) }
}

/// Collect the import/preamble lines of a file, for prepending to chunks.
pub fn scan_imports(content: &str, language: &str) -> Vec<String> {
    let mut imports = Vec::new();
    for line in content.lines().take(100) {
        let trimmed = line.trim_start();
        let is_import = match language {
            "python" => trimmed.starts_with("import ") || trimmed.starts_with("from "),
            "rust" => {
                trimmed.starts_with("use ")
                    || trimmed.starts_with("extern crate ")
                    || trimmed.starts_with("pub use ")
            }
            "javascript" | "typescript" => {
                trimmed.starts_with("import ") || trimmed.contains("= require(")
            }
            "go" | "java" => trimmed.starts_with("import "),
            "c" | "cpp" => trimmed.starts_with("#include"),
            _ => false,
        };
        if is_import {
            imports.push(line.to_string());
        }
    }
    imports
}

/// Identifiers called within a span of code, for `calls` edges. Collects
/// `name(` occurrences, skipping language keywords.
pub fn scan_call_targets(content: &str) -> Vec<String> {
    const KEYWORDS: &[&str] = &[
        "if", "for", "while", "match", "switch", "return", "fn", "def", "func", "catch", "with",
        "new", "print", "assert", "typeof", "sizeof", "not", "in", "and", "or", "else", "elif",
        "loop", "do", "try", "raise", "yield", "await", "async",
    ];

    let mut targets = Vec::new();
    let chars: Vec<char> = content.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i].is_alphabetic() || chars[i] == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            // Allow dotted/path calls: keep only the final segment.
            if i < chars.len() && chars[i] == '(' {
                let ident: String = chars[start..i].iter().collect();
                if !KEYWORDS.contains(&ident.as_str()) && ident.len() > 1 {
                    targets.push(ident);
                }
            }
        } else {
            i += 1;
        }
    }
    targets.sort();
    targets.dedup();
    targets
}

/// Class bases for `inherits` edges: `(class_name, base_name)` pairs.
pub fn scan_class_bases(content: &str, language: &str) -> Vec<(String, String)> {
    let mut pairs = Vec::new();
    for line in content.lines() {
        let trimmed = line.trim_start();
        match language {
            "python" => {
                if let Some(rest) = trimmed.strip_prefix("class ") {
                    if let Some(open) = rest.find('(') {
                        let name = rest[..open].trim().to_string();
                        if let Some(close) = rest.find(')') {
                            for base in rest[open + 1..close].split(',') {
                                let base = base.trim().trim_start_matches("metaclass=");
                                let base = base.rsplit('.').next().unwrap_or(base);
                                if !base.is_empty() && base != "object" {
                                    pairs.push((name.clone(), base.to_string()));
                                }
                            }
                        }
                    }
                }
            }
            "javascript" | "typescript" | "java" => {
                if let Some(rest) = trimmed.strip_prefix("class ") {
                    let mut parts = rest.split_whitespace();
                    if let Some(name) = parts.next() {
                        let mut saw_extends = false;
                        for part in parts {
                            if saw_extends {
                                let base = part.trim_end_matches('{').trim();
                                if !base.is_empty() {
                                    pairs.push((name.to_string(), base.to_string()));
                                }
                                break;
                            }
                            saw_extends = part == "extends";
                        }
                    }
                }
            }
            _ => {}
        }
    }
    pairs
}

fn indent_width(line: &str) -> usize {
    line.chars().take_while(|c| *c == ' ' || *c == '\t').count()
}

fn python_decl_name(trimmed: &str) -> Option<(String, DeclKind)> {
    for (prefix, kind) in [
        ("def ", DeclKind::Function),
        ("async def ", DeclKind::Function),
        ("class ", DeclKind::Class),
    ] {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some((name, kind));
            }
        }
    }
    None
}

/// Python: indentation-scoped declarations. Top-level defs and classes,
/// plus one level of methods inside classes.
fn scan_python(content: &str) -> Vec<Declaration> {
    let lines: Vec<&str> = content.lines().collect();
    let mut decls = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();
        if indent_width(line) == 0 {
            if let Some((name, kind)) = python_decl_name(trimmed) {
                // Pull leading decorators into the declaration span.
                let mut start = i;
                while start > 0 && lines[start - 1].trim_start().starts_with('@') {
                    start -= 1;
                }
                let end = python_block_end(&lines, i);
                if kind == DeclKind::Class {
                    decls.push(Declaration {
                        name: name.clone(),
                        kind,
                        start_line: start + 1,
                        end_line: end + 1,
                        parent: None,
                    });
                    // Methods one level in.
                    let mut j = i + 1;
                    while j <= end {
                        let inner = lines[j];
                        let inner_trim = inner.trim_start();
                        let inner_decl = if indent_width(inner) > 0 {
                            python_decl_name(inner_trim)
                                .filter(|(_, k)| *k == DeclKind::Function)
                        } else {
                            None
                        };
                        if let Some((method_name, _)) = inner_decl {
                            let method_indent = indent_width(inner);
                            let method_end = python_block_end_indented(&lines, j, method_indent);
                            decls.push(Declaration {
                                name: method_name,
                                kind: DeclKind::Method,
                                start_line: j + 1,
                                end_line: method_end + 1,
                                parent: Some(name.clone()),
                            });
                            j = method_end + 1;
                        } else {
                            j += 1;
                        }
                    }
                } else {
                    decls.push(Declaration {
                        name,
                        kind,
                        start_line: start + 1,
                        end_line: end + 1,
                        parent: None,
                    });
                }
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    decls
}

/// End index (0-based) of an indentation block starting at `start`.
fn python_block_end(lines: &[&str], start: usize) -> usize {
    python_block_end_indented(lines, start, 0)
}

fn python_block_end_indented(lines: &[&str], start: usize, base_indent: usize) -> usize {
    let mut end = start;
    for (j, line) in lines.iter().enumerate().skip(start + 1) {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if indent_width(line) <= base_indent {
            break;
        }
        end = j;
    }
    end
}

struct DeclMarkers {
    prefixes: &'static [(&'static str, DeclKind)],
}

static RUST_MARKERS: DeclMarkers = DeclMarkers {
    prefixes: &[
        ("fn ", DeclKind::Function),
        ("pub fn ", DeclKind::Function),
        ("pub(crate) fn ", DeclKind::Function),
        ("async fn ", DeclKind::Function),
        ("pub async fn ", DeclKind::Function),
        ("struct ", DeclKind::Class),
        ("pub struct ", DeclKind::Class),
        ("enum ", DeclKind::Class),
        ("pub enum ", DeclKind::Class),
        ("trait ", DeclKind::Class),
        ("pub trait ", DeclKind::Class),
        ("impl ", DeclKind::Class),
        ("mod ", DeclKind::Module),
        ("pub mod ", DeclKind::Module),
    ],
};

static JS_MARKERS: DeclMarkers = DeclMarkers {
    prefixes: &[
        ("function ", DeclKind::Function),
        ("async function ", DeclKind::Function),
        ("export function ", DeclKind::Function),
        ("export async function ", DeclKind::Function),
        ("export default function ", DeclKind::Function),
        ("class ", DeclKind::Class),
        ("export class ", DeclKind::Class),
        ("export default class ", DeclKind::Class),
    ],
};

static GO_MARKERS: DeclMarkers = DeclMarkers {
    prefixes: &[("func ", DeclKind::Function), ("type ", DeclKind::Class)],
};

static JAVA_MARKERS: DeclMarkers = DeclMarkers {
    prefixes: &[
        ("public class ", DeclKind::Class),
        ("class ", DeclKind::Class),
        ("public interface ", DeclKind::Class),
        ("interface ", DeclKind::Class),
        ("public enum ", DeclKind::Class),
        ("enum ", DeclKind::Class),
    ],
};

fn marker_name(rest: &str) -> String {
    rest.chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .collect()
}

/// Brace-counting scan for C-family languages. Only top-level (column 0)
/// declarations are emitted; nested items stay inside their parent span.
fn scan_braced(content: &str, markers: &DeclMarkers) -> Vec<Declaration> {
    let lines: Vec<&str> = content.lines().collect();
    let mut decls = Vec::new();
    let mut i = 0;

    while i < lines.len() {
        let line = lines[i];
        if indent_width(line) != 0 {
            i += 1;
            continue;
        }

        let mut matched = None;
        for (prefix, kind) in markers.prefixes {
            if let Some(rest) = line.strip_prefix(prefix) {
                // Go methods: `func (r *Recv) Name(...)`.
                let rest = if *prefix == "func " && rest.starts_with('(') {
                    rest.find(')')
                        .map(|p| rest[p + 1..].trim_start())
                        .unwrap_or(rest)
                } else {
                    rest
                };
                let name = marker_name(rest);
                if !name.is_empty() {
                    matched = Some((name, *kind));
                    break;
                }
            }
        }

        let Some((name, kind)) = matched else {
            i += 1;
            continue;
        };

        let end = braced_block_end(&lines, i);
        decls.push(Declaration {
            name,
            kind,
            start_line: i + 1,
            end_line: end + 1,
            parent: None,
        });
        i = end + 1;
    }
    decls
}

/// End index (0-based) of a brace-delimited block starting at `start`.
/// Falls back to the declaration line itself for braceless forms.
fn braced_block_end(lines: &[&str], start: usize) -> usize {
    let mut depth = 0i32;
    let mut seen_open = false;
    for (j, line) in lines.iter().enumerate().skip(start) {
        for c in line.chars() {
            match c {
                '{' => {
                    depth += 1;
                    seen_open = true;
                }
                '}' => depth -= 1,
                _ => {}
            }
        }
        if seen_open && depth <= 0 {
            return j;
        }
        // Declaration terminated without a body (e.g. `type X = y;`).
        if !seen_open && line.trim_end().ends_with(';') {
            return j;
        }
    }
    lines.len().saturating_sub(1)
}
