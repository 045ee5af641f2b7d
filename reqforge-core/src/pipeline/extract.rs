//! Strict-then-heuristic extraction of structure from model output
//!
//! Models are asked for JSON but routinely wrap it in prose or fences,
//! or answer in sections. Parsing always tries the strict form first and
//! degrades: fenced JSON block, first balanced `{...}` region, then
//! label-anchored section scraping.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static CODE_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?ms)^```([^\n]*)\n(.*?)^```\s*$").expect("fence regex"));

static NUMBERED_ITEM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*\d+\.\s+").expect("numbered item regex"));

static MARKDOWN_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^#{1,3}\s+(.+?)\s*$").expect("header regex"));

static FILENAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\w./\\-]+\.[A-Za-z0-9]+$").expect("filename regex"));

/// A fenced code block: the info string after the backticks, the body,
/// and the byte offset of the opening fence.
#[derive(Debug, Clone, PartialEq)]
pub struct Fence {
    pub info: String,
    pub body: String,
    pub start: usize,
}

/// All fenced code blocks, in document order.
pub fn code_fences(text: &str) -> Vec<Fence> {
    CODE_FENCE
        .captures_iter(text)
        .map(|cap| Fence {
            info: cap[1].trim().to_string(),
            body: cap[2].to_string(),
            start: cap.get(0).map(|m| m.start()).unwrap_or(0),
        })
        .collect()
}

/// Parse a JSON object out of model text.
///
/// Order: the whole text, any fenced block (JSON-tagged fences first),
/// then the largest balanced `{...}` region starting at the first brace.
pub fn json_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if value.is_object() {
            return Some(value);
        }
    }

    let fences = code_fences(text);
    let json_first = fences
        .iter()
        .filter(|f| f.info.eq_ignore_ascii_case("json"))
        .chain(fences.iter().filter(|f| !f.info.eq_ignore_ascii_case("json")));
    for fence in json_first {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(fence.body.trim()) {
            if value.is_object() {
                return Some(value);
            }
        }
    }

    balanced_object(text)
        .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
        .filter(|v| v.is_object())
}

/// The first balanced `{...}` region, string-literal aware.
fn balanced_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if byte == b'\\' {
                escaped = true;
            } else if byte == b'"' {
                in_string = false;
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split a free-text block into list items by bullet markers
/// (`-`, `*`, `•`) or `1.`-style numbering; falls back to non-empty lines.
pub fn split_list(text: &str) -> Vec<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let bullets: Vec<String> = trimmed
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            line.strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))
                .or_else(|| line.strip_prefix("• "))
                .map(|item| item.trim().to_string())
        })
        .filter(|item| !item.is_empty())
        .collect();
    if !bullets.is_empty() {
        return bullets;
    }

    if NUMBERED_ITEM.is_match(trimmed) {
        return NUMBERED_ITEM
            .split(trimmed)
            .map(str::trim)
            .filter(|item| !item.is_empty())
            .map(|item| item.lines().next().unwrap_or(item).trim().to_string())
            .collect();
    }

    trimmed
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Scrape label-anchored sections out of prose.
///
/// Each entry is `(key, label regex)`; the section body runs from the end
/// of the label line's marker to the start of the next recognized label.
/// Missing labels simply yield no entry.
pub fn labeled_sections(text: &str, labels: &[(&str, &str)]) -> HashMap<String, String> {
    struct Hit<'a> {
        key: &'a str,
        start: usize,
        body_start: usize,
    }

    let mut hits: Vec<Hit> = Vec::new();
    for (key, pattern) in labels {
        let regex = match Regex::new(&format!(r"(?im)^\s*(?:#+\s*)?(?:\d+\.\s*)?{pattern}\s*[:：]?\s*")) {
            Ok(regex) => regex,
            Err(_) => continue,
        };
        if let Some(m) = regex.find(text) {
            hits.push(Hit { key, start: m.start(), body_start: m.end() });
        }
    }
    hits.sort_by_key(|h| h.start);

    let mut sections = HashMap::new();
    for (i, hit) in hits.iter().enumerate() {
        let end = hits.get(i + 1).map(|next| next.start).unwrap_or(text.len());
        let body = text[hit.body_start..end].trim();
        sections.insert(hit.key.to_string(), body.to_string());
    }
    sections
}

/// Markdown headers (`#` through `###`) whose text is a filename with an
/// extension, with header position, for pairing against code fences.
pub fn filename_headers(text: &str) -> Vec<(usize, String)> {
    MARKDOWN_HEADER
        .captures_iter(text)
        .filter_map(|cap| {
            let m = cap.get(1)?;
            let name = m.as_str().trim_matches(|c| c == '`' || c == '*' || c == '"').trim();
            FILENAME.is_match(name).then(|| (m.start(), name.to_string()))
        })
        .collect()
}

/// Whether a fence's first line looks like a path header; returns the
/// path and the remaining body.
pub fn path_headed_fence(fence: &Fence) -> Option<(String, String)> {
    let mut lines = fence.body.lines();
    let first = lines.next()?.trim();
    let candidate = first
        .trim_start_matches("//")
        .trim_start_matches('#')
        .trim_start_matches("/*")
        .trim_end_matches("*/")
        .trim();
    let candidate = candidate.trim_matches('`').trim();
    if candidate.contains(char::is_whitespace) || !FILENAME.is_match(candidate) {
        return None;
    }
    let rest: String = lines.collect::<Vec<_>>().join("\n");
    Some((candidate.to_string(), rest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strict_json_wins() {
        let value = json_object(r#"{"title": "Auth"}"#).unwrap();
        assert_eq!(value["title"], "Auth");
    }

    #[test]
    fn fenced_json_is_found() {
        let text = "Here you go:\n```json\n{\"title\": \"Auth\"}\n```\nDone.";
        let value = json_object(text).unwrap();
        assert_eq!(value["title"], "Auth");
    }

    #[test]
    fn balanced_object_survives_prose_and_braces_in_strings() {
        let text = r#"Sure! {"title": "Braces {inside} string", "n": 1} trailing"#;
        let value = json_object(text).unwrap();
        assert_eq!(value["n"], 1);
    }

    #[test]
    fn no_object_yields_none() {
        assert!(json_object("just words").is_none());
        assert!(json_object("[1, 2, 3]").is_none());
    }

    #[test]
    fn split_list_handles_bullets_numbers_and_lines() {
        assert_eq!(split_list("- a\n* b\n• c"), vec!["a", "b", "c"]);
        assert_eq!(split_list("1. first\n2. second"), vec!["first", "second"]);
        assert_eq!(split_list("alpha\nbeta"), vec!["alpha", "beta"]);
        assert!(split_list("   ").is_empty());
    }

    #[test]
    fn labeled_sections_scrape_in_order() {
        let text = "\
Title: User Auth
Main functionality:
Handles registration and login.

Components:
- AuthService
- AuthController
File structure:
- src/auth.service.ts
";
        let sections = labeled_sections(
            text,
            &[
                ("title", "title"),
                ("functionality", "main functionality"),
                ("components", "(?:components|modules)"),
                ("file_structure", "file structure"),
            ],
        );
        assert_eq!(sections["title"], "User Auth");
        assert!(sections["functionality"].starts_with("Handles registration"));
        assert_eq!(split_list(&sections["components"]), vec!["AuthService", "AuthController"]);
        assert_eq!(split_list(&sections["file_structure"]), vec!["src/auth.service.ts"]);
    }

    #[test]
    fn filename_headers_skip_prose_headings() {
        let text = "# Overview\n## src/auth.service.ts\n### `auth.controller.ts`\n";
        let headers = filename_headers(text);
        let names: Vec<&str> = headers.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["src/auth.service.ts", "auth.controller.ts"]);
    }

    #[test]
    fn path_headed_fences_are_recognized() {
        let text = "```ts\n// src/auth.service.ts\nexport class AuthService {}\n```";
        let fences = code_fences(text);
        let (path, body) = path_headed_fence(&fences[0]).unwrap();
        assert_eq!(path, "src/auth.service.ts");
        assert_eq!(body, "export class AuthService {}");
    }

    #[test]
    fn fence_without_path_header_is_ignored() {
        let text = "```ts\nexport const x = 1;\n```";
        let fences = code_fences(text);
        assert!(path_headed_fence(&fences[0]).is_none());
    }
}
