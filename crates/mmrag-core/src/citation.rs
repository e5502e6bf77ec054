//! Binding generated answers back to the sources they were grounded on.
//!
//! Every grounded answer gets one whole-answer [`Citation`] listing all
//! sources that were placed in the context. On top of that, each sentence
//! that carries `[n]` markers gets a span-level citation pointing at the
//! sources with those markers. Markers that do not name an included source
//! are ignored.

use serde::Serialize;

use crate::context::{ContextSource, ContextWindow};
use crate::models::ChunkModality;

/// Character offsets `[start, end)` into the answer text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AnswerSpan {
    pub start: usize,
    pub end: usize,
}

/// Reference to one retrieved chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceRef {
    pub marker: usize,
    pub chunk_id: String,
    pub document_id: String,
    pub filename: String,
    pub modality: ChunkModality,
    pub page_number: Option<u32>,
    pub score: f64,
}

impl From<&ContextSource> for SourceRef {
    fn from(source: &ContextSource) -> Self {
        let entry = &source.hit.entry;
        Self {
            marker: source.marker,
            chunk_id: entry.chunk.id.clone(),
            document_id: entry.metadata.document_id.clone(),
            filename: entry.metadata.filename.clone(),
            modality: entry.metadata.modality,
            page_number: entry.metadata.page_number,
            score: source.hit.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Citation {
    /// `None` means the citation covers the whole answer.
    pub span: Option<AnswerSpan>,
    pub sources: Vec<SourceRef>,
}

/// Attach citations to `answer` given the context it was generated from.
///
/// Returns no citations when the context is empty.
pub fn bind_citations(answer: &str, context: &ContextWindow) -> Vec<Citation> {
    if context.is_empty() {
        return Vec::new();
    }

    let mut citations = vec![Citation {
        span: None,
        sources: context.sources.iter().map(SourceRef::from).collect(),
    }];

    let chars: Vec<char> = answer.chars().collect();
    for span in sentence_spans(&chars) {
        let sentence = &chars[span.start..span.end];
        let mut sources: Vec<SourceRef> = Vec::new();
        for marker in markers_in(sentence) {
            let Some(src) = context.sources.iter().find(|s| s.marker == marker) else {
                continue;
            };
            if sources.iter().all(|s| s.marker != marker) {
                sources.push(SourceRef::from(src));
            }
        }
        if !sources.is_empty() {
            citations.push(Citation {
                span: Some(span),
                sources,
            });
        }
    }

    citations
}

/// Split text into sentences. A sentence ends after `.`, `!` or `?`
/// followed by whitespace, or at a newline. Leading whitespace is skipped.
fn sentence_spans(chars: &[char]) -> Vec<AnswerSpan> {
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i];
        let boundary = c == '\n'
            || (matches!(c, '.' | '!' | '?')
                && chars.get(i + 1).is_none_or(|n| n.is_whitespace()));
        if boundary {
            let end = if c == '\n' { i } else { i + 1 };
            push_trimmed(chars, start, end, &mut spans);
            start = i + 1;
        }
        i += 1;
    }
    push_trimmed(chars, start, chars.len(), &mut spans);
    spans
}

fn push_trimmed(chars: &[char], mut start: usize, end: usize, out: &mut Vec<AnswerSpan>) {
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    if start < end {
        out.push(AnswerSpan { start, end });
    }
}

/// Numbers inside `[n]` or `[n, m]` markers, in order of appearance.
fn markers_in(sentence: &[char]) -> Vec<usize> {
    let mut found = Vec::new();
    let mut i = 0usize;
    while i < sentence.len() {
        if sentence[i] != '[' {
            i += 1;
            continue;
        }
        let Some(close) = sentence[i + 1..].iter().position(|&c| c == ']') else {
            break;
        };
        let inner: String = sentence[i + 1..i + 1 + close].iter().collect();
        let parsed: Option<Vec<usize>> = inner
            .split(',')
            .map(|part| part.trim().parse::<usize>().ok())
            .collect();
        if let Some(numbers) = parsed {
            found.extend(numbers);
        }
        i += close + 2;
    }
    found
}
