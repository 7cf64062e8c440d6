//! Tree-sitter based chunking for source code, grown from the teacher's
//! `chunk_with_tree_sitter`/`chunk_with_heuristic` pair. The query/merge/
//! dedup algorithm is unchanged in spirit; this version additionally emits
//! typed [`Symbol`]s and prepends each file's import/package header.

use super::{ChunkDraft, ChunkOptions};
use crate::model::{Symbol, SymbolKind};
use serde_json::{Map, Value};
use tree_sitter::{Parser, Query, QueryCursor};

struct LanguageSpec {
    language: tree_sitter::Language,
    query: &'static str,
}

fn language_spec(ext: &str) -> Option<LanguageSpec> {
    Some(match ext {
        "rs" => LanguageSpec {
            language: tree_sitter_rust::language(),
            query: r#"
            (line_comment) @comment
            (block_comment) @comment
            (use_declaration) @header
            (function_item) @func
            (impl_item) @type
            (struct_item) @struct
            (enum_item) @enum
            (trait_item) @trait
            (mod_item) @module
            (macro_definition) @macro
            "#,
        },
        "py" => LanguageSpec {
            language: tree_sitter_python::language(),
            query: r#"
            (comment) @comment
            (import_statement) @header
            (import_from_statement) @header
            (function_definition) @func
            (class_definition) @class
            "#,
        },
        "go" => LanguageSpec {
            language: tree_sitter_go::language(),
            query: r#"
            (comment) @comment
            (import_declaration) @header
            (function_declaration) @func
            (method_declaration) @method
            (type_declaration) @type
            "#,
        },
        "js" | "jsx" | "mjs" | "cjs" => LanguageSpec {
            language: tree_sitter_javascript::language(),
            query: r#"
            (comment) @comment
            (import_statement) @header
            (function_declaration) @func
            (method_definition) @method
            (arrow_function) @arrow
            (class_declaration) @class
            "#,
        },
        "ts" => LanguageSpec {
            language: tree_sitter_typescript::language_typescript(),
            query: r#"
            (comment) @comment
            (import_statement) @header
            (function_declaration) @func
            (method_definition) @method
            (arrow_function) @arrow
            (interface_declaration) @interface
            (class_declaration) @class
            (enum_declaration) @enum
            "#,
        },
        "tsx" => LanguageSpec {
            language: tree_sitter_typescript::language_tsx(),
            query: r#"
            (comment) @comment
            (import_statement) @header
            (function_declaration) @func
            (method_definition) @method
            (arrow_function) @arrow
            (interface_declaration) @interface
            (class_declaration) @class
            (jsx_element) @jsx
            "#,
        },
        "java" => LanguageSpec {
            language: tree_sitter_java::language(),
            query: r#"
            (line_comment) @comment
            (block_comment) @comment
            (import_declaration) @header
            (method_declaration) @method
            (class_declaration) @class
            (interface_declaration) @interface
            "#,
        },
        "cpp" | "cc" | "cxx" | "h" | "hpp" => LanguageSpec {
            language: tree_sitter_cpp::language(),
            query: r#"
            (comment) @comment
            (preproc_include) @header
            (function_definition) @func
            (class_specifier) @class
            "#,
        },
        "php" => LanguageSpec {
            language: unsafe { std::mem::transmute(tree_sitter_php::language_php()) },
            query: r#"
            (comment) @comment
            (namespace_use_declaration) @header
            (function_definition) @func
            (method_declaration) @method
            (class_declaration) @class
            "#,
        },
        "rb" => LanguageSpec {
            language: tree_sitter_ruby::language(),
            query: r#"
            (comment) @comment
            (method) @method
            (class) @class
            (module) @module
            "#,
        },
        "cs" => LanguageSpec {
            language: tree_sitter_c_sharp::language(),
            query: r#"
            (comment) @comment
            (using_directive) @header
            (method_declaration) @method
            (class_declaration) @class
            (interface_declaration) @interface
            "#,
        },
        _ => return None,
    })
}

fn capture_to_symbol_kind(name: &str) -> Option<SymbolKind> {
    Some(match name {
        "func" | "arrow" | "macro" => SymbolKind::Function,
        "method" => SymbolKind::Method,
        "class" => SymbolKind::Class,
        "interface" => SymbolKind::Interface,
        "type" => SymbolKind::Type,
        "struct" => SymbolKind::Struct,
        "enum" => SymbolKind::Enum,
        "trait" => SymbolKind::Trait,
        "module" => SymbolKind::Module,
        _ => return None,
    })
}

struct NodeSpan {
    start_byte: usize,
    end_byte: usize,
    start_row: usize,
    end_row: usize,
    capture: String,
}

struct CodeChunk {
    start_row: usize,
    end_row: usize,
    start_byte: usize,
    end_byte: usize,
    capture: String,
    /// Byte range of the leading comment merged into this chunk, if any.
    doc_comment_byte_range: Option<(usize, usize)>,
}

pub fn chunk_code(
    relative_path: &str,
    content: &str,
    language: Option<&str>,
    options: ChunkOptions,
) -> Vec<ChunkDraft> {
    let ext = language
        .and_then(|_| std::path::Path::new(relative_path).extension())
        .and_then(|e| e.to_str())
        .unwrap_or("");

    if let Some(drafts) = chunk_with_tree_sitter(ext, content, relative_path, options.max_lines) {
        return drafts;
    }
    chunk_with_heuristic(content, relative_path, options.max_lines)
        .into_iter()
        .map(|(start, end, text)| plain_draft(relative_path, start, end, text))
        .collect()
}

fn plain_draft(relative_path: &str, start_line: u32, end_line: u32, content: String) -> ChunkDraft {
    ChunkDraft {
        file_path: relative_path.to_string(),
        start_line,
        end_line,
        raw_content: content,
        symbols: vec![],
        metadata: Map::new(),
    }
}

fn chunk_with_tree_sitter(
    ext: &str,
    content: &str,
    relative_path: &str,
    max_lines: usize,
) -> Option<Vec<ChunkDraft>> {
    let spec = language_spec(ext)?;

    let mut parser = Parser::new();
    parser.set_language(&spec.language).ok()?;
    let tree = parser.parse(content, None)?;
    let query = Query::new(&spec.language, spec.query).ok()?;

    let mut cursor = QueryCursor::new();
    let mut matches = cursor.matches(&query, tree.root_node(), content.as_bytes());

    let mut spans = Vec::new();
    while let Some(m) = matches.next() {
        for capture in m.captures {
            let name = query.capture_names()[capture.index as usize].to_string();
            let range = capture.node.range();
            spans.push(NodeSpan {
                start_byte: range.start_byte,
                end_byte: range.end_byte,
                start_row: range.start_point.row,
                end_row: range.end_point.row,
                capture: name,
            });
        }
    }
    spans.sort_by_key(|s| s.start_byte);

    // Header nodes (imports/use-decls) are collected separately and
    // prepended to every emitted chunk rather than treated as chunks.
    let header: String = spans
        .iter()
        .filter(|s| s.capture == "header")
        .filter_map(|s| content.get(s.start_byte..s.end_byte))
        .collect::<Vec<_>>()
        .join("\n");

    let mut merged_chunks: Vec<CodeChunk> = Vec::new();
    let mut comment_start_row: Option<usize> = None;
    let mut comment_start_byte: Option<usize> = None;
    let mut last_comment_end_row: Option<usize> = None;

    for span in spans.into_iter().filter(|s| s.capture != "header") {
        if span.capture == "comment" {
            let is_contiguous = match last_comment_end_row {
                Some(end_r) => span.start_row <= end_r + 1,
                None => true,
            };
            if is_contiguous {
                if comment_start_row.is_none() {
                    comment_start_row = Some(span.start_row);
                    comment_start_byte = Some(span.start_byte);
                }
            } else {
                comment_start_row = Some(span.start_row);
                comment_start_byte = Some(span.start_byte);
            }
            last_comment_end_row = Some(span.end_row);
        } else {
            let mut final_start_row = span.start_row;
            let mut final_start_byte = span.start_byte;
            let mut doc_comment_byte_range = None;

            if let Some(comment_end) = last_comment_end_row {
                if span.start_row <= comment_end + 1 {
                    if let Some(c_start) = comment_start_row {
                        final_start_row = c_start;
                    }
                    if let Some(c_byte) = comment_start_byte {
                        doc_comment_byte_range = Some((c_byte, span.start_byte));
                        final_start_byte = c_byte;
                    }
                }
            }

            merged_chunks.push(CodeChunk {
                start_row: final_start_row,
                end_row: span.end_row,
                start_byte: final_start_byte,
                end_byte: span.end_byte,
                capture: span.capture,
                doc_comment_byte_range,
            });

            comment_start_row = None;
            comment_start_byte = None;
            last_comment_end_row = None;
        }
    }

    merged_chunks.dedup_by(|a, b| a.start_byte == b.start_byte && a.end_byte == b.end_byte);

    let mut drafts = Vec::new();

    for chunk in merged_chunks {
        let start_line = chunk.start_row as u32 + 1;
        let end_line = chunk.end_row as u32 + 1;
        if start_line > end_line || chunk.end_byte > content.len() {
            continue;
        }
        let chunk_lines = (end_line - start_line + 1) as usize;
        let raw = content.as_bytes()[chunk.start_byte..chunk.end_byte].to_vec();
        let text = String::from_utf8_lossy(&raw).to_string();

        let symbol_name = extract_symbol_name(&text);
        let kind = capture_to_symbol_kind(&chunk.capture);

        if chunk_lines > max_lines {
            for (sub_start, sub_end, sub_text) in
                chunk_with_heuristic(&text, relative_path, max_lines)
            {
                let offset = start_line - 1;
                drafts.push(with_header_and_symbol(
                    relative_path,
                    sub_start + offset,
                    sub_end + offset,
                    sub_text,
                    &header,
                    None,
                ));
            }
        } else {
            let doc_comment = chunk.doc_comment_byte_range.and_then(|(s, e)| {
                content
                    .get(s..e)
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
            });
            let symbol = kind.map(|k| Symbol {
                name: symbol_name.clone().unwrap_or_else(|| "anonymous".to_string()),
                kind: k,
                start_line,
                end_line,
                signature: text.lines().next().map(|l| l.trim().to_string()),
                doc_comment,
            });
            drafts.push(with_header_and_symbol(
                relative_path,
                start_line,
                end_line,
                text,
                &header,
                symbol,
            ));
        }
    }

    Some(drafts)
}

fn with_header_and_symbol(
    relative_path: &str,
    start_line: u32,
    end_line: u32,
    text: String,
    header: &str,
    symbol: Option<Symbol>,
) -> ChunkDraft {
    let raw_content = if header.trim().is_empty() || text.contains(header.trim()) {
        text
    } else {
        format!("{header}\n\n{text}")
    };
    ChunkDraft {
        file_path: relative_path.to_string(),
        start_line,
        end_line,
        raw_content,
        symbols: symbol.into_iter().collect(),
        metadata: Map::new(),
    }
}

/// Best-effort symbol name extraction from a chunk's first line or two;
/// good enough for display/boosting, not a full parse.
fn extract_symbol_name(text: &str) -> Option<String> {
    let first_lines: String = text.lines().take(3).collect::<Vec<_>>().join(" ");
    let markers = [
        "fn ", "func ", "def ", "class ", "struct ", "enum ", "trait ", "interface ", "mod ",
        "impl ",
    ];
    for marker in markers {
        if let Some(idx) = first_lines.find(marker) {
            let rest = &first_lines[idx + marker.len()..];
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() {
                return Some(name);
            }
        }
    }
    None
}

/// Fixed-size fallback chunker with definition-aware boundaries, unchanged
/// from the teacher beyond returning raw (start, end, text) tuples so both
/// the top-level dispatcher and the oversized-chunk splitter can reuse it.
fn chunk_with_heuristic(
    content: &str,
    _relative_path: &str,
    max_lines: usize,
) -> Vec<(u32, u32, String)> {
    let lines: Vec<&str> = content.lines().collect();
    let mut chunks = Vec::new();

    let min_chunk_size = 10.min(max_lines.max(1));
    let max_chunk_size = max_lines.max(1);
    let overlap = if max_lines > 16 { 8 } else { max_lines / 2 };
    let line_count = lines.len();

    if line_count <= max_chunk_size {
        if line_count > 0 {
            chunks.push((1u32, line_count as u32, content.to_string()));
        }
        return chunks;
    }

    let mut start_line = 0usize;
    while start_line < line_count {
        let mut end_line = (start_line + min_chunk_size).min(line_count);
        let mut hit_limit = false;

        while end_line < line_count {
            if end_line - start_line >= max_chunk_size {
                hit_limit = true;
                break;
            }
            let trimmed = lines[end_line].trim_start();
            let is_definition = [
                "fn ", "pub fn ", "async fn ", "pub async fn ", "impl ", "struct ", "enum ",
                "mod ", "type ", "trait ", "class ", "def ", "func ",
            ]
            .iter()
            .any(|m| trimmed.starts_with(m));

            if is_definition && (end_line - start_line >= min_chunk_size) {
                break;
            }
            end_line += 1;
        }

        let chunk_text = lines[start_line..end_line].join("\n");
        if !chunk_text.trim().is_empty() {
            chunks.push((start_line as u32 + 1, end_line as u32, chunk_text));
        }

        start_line = if hit_limit {
            (start_line + 1).max(end_line.saturating_sub(overlap))
        } else {
            end_line
        };
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_rust_function_with_its_doc_comment_attached() {
        let src = "use std::fmt;\n\n/// Adds two numbers.\nfn add(a: i32, b: i32) -> i32 {\n    a + b\n}\n";
        let drafts = chunk_code("lib.rs", src, Some("rust"), ChunkOptions { max_lines: 50 });
        assert!(!drafts.is_empty());
        let fn_chunk = drafts
            .iter()
            .find(|d| d.raw_content.contains("fn add"))
            .unwrap();
        assert!(fn_chunk.raw_content.contains("Adds two numbers"));
        let symbol = fn_chunk.symbols.iter().find(|s| s.name == "add").unwrap();
        assert_eq!(symbol.doc_comment.as_deref(), Some("/// Adds two numbers."));
    }

    #[test]
    fn unsupported_extension_falls_back_to_heuristic_windows() {
        let src = (0..300)
            .map(|i| format!("line {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        let drafts = chunk_code("notes.xyz", &src, None, ChunkOptions { max_lines: 50 });
        assert!(drafts.len() > 1);
        assert!(drafts[0].symbols.is_empty());
    }

    #[test]
    fn heuristic_chunks_do_not_exceed_max_lines() {
        let src = (0..500)
            .map(|i| format!("x{i} = {i}"))
            .collect::<Vec<_>>()
            .join("\n");
        for (start, end, _) in chunk_with_heuristic(&src, "f.xyz", 40) {
            assert!(end - start < 40);
        }
    }
}
