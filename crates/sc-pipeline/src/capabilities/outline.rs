//! Heuristic document splitter for the understand stage.
//!
//! Markdown headings start a new unit. A document without headings is split
//! into blank-line separated paragraphs, titled by their first sentence.

use async_trait::async_trait;
use sc_core::segment::Complexity;
use sc_core::{CapabilityFailure, ContentUnit, Stage};

use crate::capability::{Capability, CapabilityRequest, CapabilityResponse, InvokeContext};

/// Longest title taken from a paragraph's first sentence.
const MAX_TITLE_CHARS: usize = 80;

#[derive(Debug, Clone)]
pub struct OutlineCapability {
    name: String,
    max_key_points: usize,
}

impl OutlineCapability {
    pub fn new(name: impl Into<String>, max_key_points: usize) -> Self {
        Self {
            name: name.into(),
            max_key_points: max_key_points.max(1),
        }
    }

    /// Split `document` into content units.
    pub fn outline(&self, document: &str) -> Vec<ContentUnit> {
        let sections = if document.lines().any(|l| heading(l).is_some()) {
            heading_sections(document)
        } else {
            paragraph_sections(document)
        };

        sections
            .into_iter()
            .filter_map(|(title, body)| self.unit(title, &body))
            .collect()
    }

    fn unit(&self, title: Option<String>, body: &[String]) -> Option<ContentUnit> {
        let mut points: Vec<String> = Vec::new();
        for line in body {
            if let Some(item) = list_item(line) {
                points.push(clean(item));
            } else {
                points.extend(sentences(line));
            }
        }
        points.retain(|p| !p.is_empty());

        let title = match title {
            Some(t) => t,
            None => {
                let first = points.first()?.clone();
                if points.len() > 1 {
                    points.remove(0);
                }
                shorten(&first)
            }
        };
        if points.is_empty() {
            return None;
        }

        let complexity = complexity(&points);
        points.truncate(self.max_key_points);

        Some(ContentUnit {
            title,
            key_points: points,
            complexity,
            visual_hint: None,
        })
    }
}

#[async_trait]
impl Capability for OutlineCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn stage(&self) -> Stage {
        Stage::Understand
    }

    async fn invoke(
        &self,
        request: CapabilityRequest,
        _ctx: &InvokeContext,
    ) -> Result<CapabilityResponse, CapabilityFailure> {
        let (document, max_units) = match request {
            CapabilityRequest::Understand {
                document,
                max_units,
            } => (document, max_units),
            other => {
                return Err(CapabilityFailure::permanent(format!(
                    "outline cannot serve {}",
                    other.stage()
                )))
            }
        };

        let mut units = self.outline(&document);
        if units.is_empty() {
            return Err(CapabilityFailure::permanent("document has no usable sections"));
        }
        if let Some(max) = max_units {
            units.truncate(max);
        }
        tracing::debug!("outline produced {} unit(s)", units.len());
        Ok(CapabilityResponse::Outline(units))
    }
}

fn heading(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    let rest = trimmed.trim_start_matches('#');
    let level = trimmed.len() - rest.len();
    if (1..=6).contains(&level) && rest.starts_with(' ') {
        Some(rest.trim())
    } else {
        None
    }
}

fn list_item(line: &str) -> Option<&str> {
    let trimmed = line.trim_start();
    for marker in ["- ", "* ", "+ "] {
        if let Some(rest) = trimmed.strip_prefix(marker) {
            return Some(rest);
        }
    }
    let digits = trimmed.chars().take_while(char::is_ascii_digit).count();
    if digits > 0 {
        let rest = &trimmed[digits..];
        if let Some(rest) = rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") ")) {
            return Some(rest);
        }
    }
    None
}

fn heading_sections(document: &str) -> Vec<(Option<String>, Vec<String>)> {
    let mut sections: Vec<(Option<String>, Vec<String>)> = Vec::new();
    for line in document.lines() {
        if let Some(title) = heading(line) {
            sections.push((Some(clean(title)), Vec::new()));
        } else if !line.trim().is_empty() {
            match sections.last_mut() {
                Some((_, body)) => body.push(line.trim().to_string()),
                // Text before the first heading forms its own section.
                None => sections.push((None, vec![line.trim().to_string()])),
            }
        }
    }
    sections
}

fn paragraph_sections(document: &str) -> Vec<(Option<String>, Vec<String>)> {
    let mut sections = Vec::new();
    let mut current: Vec<String> = Vec::new();
    for line in document.lines() {
        if line.trim().is_empty() {
            if !current.is_empty() {
                sections.push((None, std::mem::take(&mut current)));
            }
        } else {
            current.push(line.trim().to_string());
        }
    }
    if !current.is_empty() {
        sections.push((None, current));
    }
    sections
}

/// Split prose into sentences on `.`, `!` or `?` followed by whitespace.
fn sentences(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.peek().map_or(true, |(_, next)| next.is_whitespace());
            if at_boundary {
                let end = i + c.len_utf8();
                out.push(clean(&text[start..end]));
                start = end;
            }
        }
    }
    if start < text.len() {
        out.push(clean(&text[start..]));
    }
    out.retain(|s| !s.is_empty());
    out
}

/// Strip inline markdown emphasis and collapse whitespace.
fn clean(text: &str) -> String {
    let stripped: String = text
        .chars()
        .filter(|c| !matches!(c, '*' | '`'))
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn shorten(sentence: &str) -> String {
    let trimmed = sentence.trim_end_matches(['.', '!', '?']);
    if trimmed.chars().count() <= MAX_TITLE_CHARS {
        return trimmed.to_string();
    }
    let cut: String = trimmed.chars().take(MAX_TITLE_CHARS).collect();
    match cut.rfind(' ') {
        Some(pos) => format!("{}...", &cut[..pos]),
        None => format!("{cut}..."),
    }
}

/// Longer sentences read as harder material.
fn complexity(points: &[String]) -> Complexity {
    let words: usize = points.iter().map(|p| p.split_whitespace().count()).sum();
    let average = words / points.len().max(1);
    match average {
        0..=11 => Complexity::Beginner,
        12..=21 => Complexity::Intermediate,
        _ => Complexity::Advanced,
    }
}
