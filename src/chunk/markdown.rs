//! Markdown chunking: splits on ATX heading hierarchy while keeping fenced
//! code blocks, tables, and lists atomic, and records a heading breadcrumb
//! per chunk. No teacher equivalent; grounded on the breadcrumb/atomic-block
//! approach used by the pack's markdown-focused sibling.

use super::{ChunkDraft, ChunkOptions};
use serde_json::{Map, Value};

struct Section {
    breadcrumb: Vec<String>,
    start_line: u32,
    end_line: u32,
    body: String,
}

pub fn chunk_markdown(relative_path: &str, content: &str, options: ChunkOptions) -> Vec<ChunkDraft> {
    let (frontmatter, body_start_line, body) = split_frontmatter(content);
    let sections = split_sections(&body, body_start_line);

    let mut drafts = Vec::new();
    for section in sections {
        for (start, end, text) in split_oversized(&section, options.max_lines) {
            let mut metadata = Map::new();
            metadata.insert(
                "heading_breadcrumb".to_string(),
                Value::Array(
                    section
                        .breadcrumb
                        .iter()
                        .map(|h| Value::String(h.clone()))
                        .collect(),
                ),
            );
            if let Some(fm) = &frontmatter {
                metadata.insert("frontmatter".to_string(), fm.clone());
            }
            drafts.push(ChunkDraft {
                file_path: relative_path.to_string(),
                start_line: start,
                end_line: end,
                raw_content: text,
                symbols: vec![],
                metadata,
            });
        }
    }
    drafts
}

/// Parses a leading `---`-delimited YAML frontmatter block, if present.
/// Returns the parsed value, the 1-based line the body starts on, and the
/// remaining body text.
fn split_frontmatter(content: &str) -> (Option<Value>, u32, String) {
    let lines: Vec<&str> = content.lines().collect();
    if lines.first().map(|l| l.trim()) != Some("---") {
        return (None, 1, content.to_string());
    }
    let end = lines
        .iter()
        .enumerate()
        .skip(1)
        .find(|(_, l)| l.trim() == "---")
        .map(|(i, _)| i);

    match end {
        Some(end_idx) => {
            let yaml = lines[1..end_idx].join("\n");
            let parsed: Option<Value> = serde_yaml::from_str(&yaml).ok();
            let body = lines[end_idx + 1..].join("\n");
            (parsed, end_idx as u32 + 2, body)
        }
        None => (None, 1, content.to_string()),
    }
}

fn split_sections(body: &str, line_offset: u32) -> Vec<Section> {
    let lines: Vec<&str> = body.lines().collect();
    let mut sections = Vec::new();
    let mut breadcrumb: Vec<(usize, String)> = Vec::new();

    let mut current_start = 0usize;
    let mut current_breadcrumb: Vec<String> = vec![];
    let mut in_fence = false;

    let mut i = 0usize;
    while i < lines.len() {
        let line = lines[i];
        let trimmed = line.trim_start();

        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        if !in_fence {
            if let Some(level) = heading_level(line) {
                if i > current_start {
                    let body_text = lines[current_start..i].join("\n");
                    if !body_text.trim().is_empty() {
                        sections.push(Section {
                            breadcrumb: current_breadcrumb.clone(),
                            start_line: current_start as u32 + line_offset,
                            end_line: i as u32 - 1 + line_offset,
                            body: body_text,
                        });
                    }
                }
                let title = line.trim_start_matches('#').trim().to_string();
                breadcrumb.retain(|(lvl, _)| *lvl < level);
                breadcrumb.push((level, title));
                current_breadcrumb = breadcrumb.iter().map(|(_, t)| t.clone()).collect();
                current_start = i;
            }
        }
        i += 1;
    }

    if current_start < lines.len() {
        let body_text = lines[current_start..].join("\n");
        if !body_text.trim().is_empty() {
            sections.push(Section {
                breadcrumb: current_breadcrumb,
                start_line: current_start as u32 + line_offset,
                end_line: lines.len() as u32 - 1 + line_offset,
                body: body_text,
            });
        }
    }

    if sections.is_empty() && !body.trim().is_empty() {
        sections.push(Section {
            breadcrumb: vec![],
            start_line: line_offset,
            end_line: lines.len().max(1) as u32 - 1 + line_offset,
            body: body.to_string(),
        });
    }

    sections
}

fn heading_level(line: &str) -> Option<usize> {
    let trimmed = line.trim_start();
    if !trimmed.starts_with('#') {
        return None;
    }
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    let rest = &trimmed[level..];
    if level >= 1 && level <= 6 && rest.starts_with(' ') {
        Some(level)
    } else {
        None
    }
}

/// Splits an oversized section on paragraph boundaries, never inside a
/// fenced code block, table, or list.
fn split_oversized(section: &Section, max_lines: usize) -> Vec<(u32, u32, String)> {
    let lines: Vec<&str> = section.body.lines().collect();
    if lines.len() <= max_lines {
        return vec![(section.start_line, section.end_line, section.body.clone())];
    }

    let mut out = Vec::new();
    let mut start = 0usize;
    let mut in_fence = false;

    let is_atomic_continuation = |line: &str| {
        let t = line.trim_start();
        t.starts_with('|') || t.starts_with('-') || t.starts_with('*') || t.starts_with(char::is_numeric)
    };

    let mut i = 0usize;
    while i < lines.len() {
        let trimmed = lines[i].trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let at_boundary = !in_fence
            && lines[i].trim().is_empty()
            && (i + 1 >= lines.len() || !is_atomic_continuation(lines[i + 1]));

        if (i - start >= max_lines) && at_boundary {
            out.push((
                section.start_line + start as u32,
                section.start_line + i as u32 - 1,
                lines[start..i].join("\n"),
            ));
            start = i + 1;
        }
        i += 1;
    }
    if start < lines.len() {
        out.push((
            section.start_line + start as u32,
            section.end_line,
            lines[start..].join("\n"),
        ));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_headings_and_records_breadcrumb() {
        let md = "# Title\n\nintro\n\n## Sub\n\nbody text here\n";
        let drafts = chunk_markdown("README.md", md, ChunkOptions { max_lines: 50 });
        assert_eq!(drafts.len(), 2);
        let sub = drafts
            .iter()
            .find(|d| d.raw_content.contains("body text"))
            .unwrap();
        let breadcrumb = sub.metadata.get("heading_breadcrumb").unwrap();
        assert_eq!(breadcrumb, &Value::from(vec!["Title", "Sub"]));
    }

    #[test]
    fn extracts_yaml_frontmatter_into_metadata() {
        let md = "---\ntitle: Hello\ntags: [a, b]\n---\n\n# Heading\n\ncontent\n";
        let drafts = chunk_markdown("doc.md", md, ChunkOptions { max_lines: 50 });
        assert!(!drafts.is_empty());
        let fm = drafts[0].metadata.get("frontmatter").unwrap();
        assert_eq!(fm.get("title").unwrap(), "Hello");
    }

    #[test]
    fn keeps_fenced_code_block_atomic_across_oversize_split() {
        let mut md = String::from("# Title\n\n");
        md.push_str("```\n");
        for i in 0..200 {
            md.push_str(&format!("line {i}\n"));
        }
        md.push_str("```\n");
        let drafts = chunk_markdown("big.md", &md, ChunkOptions { max_lines: 50 });
        let fenced = drafts.iter().find(|d| d.raw_content.contains("```")).unwrap();
        assert!(fenced.raw_content.matches("```").count() % 2 == 0);
    }
}
