// src/prompt.rs
//! Rewrite prompt template with `{title}` and `{summary}` placeholders.
//! `{{` and `}}` stand for literal braces. Substituted values are inserted
//! verbatim and never expanded again.

use crate::error::ConfigError;

pub const DEFAULT_TEMPLATE: &str = "Rewrite the following news item as a short, neutral article \
in your own words. Do not invent facts.\n\nTitle: {title}\nSummary: {summary}\n\nArticle:";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Title,
    Summary,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl PromptTemplate {
    pub fn parse(template: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: String| ConfigError::invalid("llm.rewrite_prompt", reason);
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars().peekable();

        while let Some(c) = chars.next() {
            match c {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    literal.push('{');
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for n in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(invalid("unclosed `{`".to_string()));
                    }
                    let seg = match name.trim() {
                        "title" => Segment::Title,
                        "summary" => Segment::Summary,
                        other => return Err(invalid(format!("unknown placeholder `{{{other}}}`"))),
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(seg);
                }
                '}' => return Err(invalid("single `}` outside a placeholder".to_string())),
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn render(&self, title: &str, summary: &str) -> String {
        let mut out = String::with_capacity(self.source.len() + title.len() + summary.len());
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => out.push_str(s),
                Segment::Title => out.push_str(title),
                Segment::Summary => out.push_str(summary),
            }
        }
        out
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::parse(DEFAULT_TEMPLATE).unwrap_or_else(|_| Self {
            source: DEFAULT_TEMPLATE.to_string(),
            segments: vec![Segment::Literal(DEFAULT_TEMPLATE.to_string())],
        })
    }
}
