//! Context window construction.
//!
//! Turns ranked [`SearchHit`]s into the numbered context block handed to
//! the generator. Hits are laid out best-first and each keeps its metadata
//! so citations can be bound afterwards.
//!
//! # Budget rules
//!
//! 1. Hits are rendered in descending score order.
//! 2. A hit is included only if its rendered block fits in the remaining
//!    character budget.
//! 3. The first hit is always included; if it alone exceeds the budget its
//!    content is truncated (on a char boundary) to fit.
//! 4. Assembly stops at the first later hit that does not fit, so the
//!    included set is always a prefix of the ranking.
//!
//! Image hits contribute their caption, never their encoded payload.

use serde::Serialize;

use crate::models::ChunkModality;
use crate::store::SearchHit;

/// Separator placed between rendered sources.
const SOURCE_SEPARATOR: &str = "\n---\n";

/// A hit that made it into the context, with its 1-based marker.
#[derive(Debug, Clone, Serialize)]
pub struct ContextSource {
    pub marker: usize,
    pub hit: SearchHit,
    /// True when the content was cut to fit the budget.
    pub truncated: bool,
}

/// The assembled context block.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ContextWindow {
    pub text: String,
    pub sources: Vec<ContextSource>,
}

impl ContextWindow {
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

fn header(marker: usize, hit: &SearchHit) -> String {
    let meta = &hit.entry.metadata;
    let kind = match (meta.modality, meta.page_number) {
        (ChunkModality::Text, _) => "Text".to_string(),
        (ChunkModality::PdfPage, Some(p)) => format!("PDF page {}", p),
        (ChunkModality::PdfPage, None) => "PDF page".to_string(),
        (ChunkModality::Image, Some(p)) => format!("Image, page {}", p),
        (ChunkModality::Image, None) => "Image".to_string(),
    };
    format!(
        "[{}] ({}) from {} (score {:.2})\n",
        marker, kind, meta.filename, hit.score
    )
}

/// Build the context block for `hits` within `budget_chars` characters.
pub fn assemble_context(hits: &[SearchHit], budget_chars: usize) -> ContextWindow {
    let mut sorted: Vec<&SearchHit> = hits.iter().collect();
    sorted.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut window = ContextWindow::default();
    let mut used = 0usize;

    for hit in sorted {
        let marker = window.sources.len() + 1;
        let head = header(marker, hit);
        let body = hit.entry.chunk.content.display_text();
        let sep_len = if window.text.is_empty() {
            0
        } else {
            SOURCE_SEPARATOR.len()
        };
        let head_len = head.chars().count();
        let body_len = body.chars().count();
        let needed = sep_len + head_len + body_len;

        if used + needed <= budget_chars {
            if sep_len > 0 {
                window.text.push_str(SOURCE_SEPARATOR);
            }
            window.text.push_str(&head);
            window.text.push_str(body);
            used += needed;
            window.sources.push(ContextSource {
                marker,
                hit: hit.clone(),
                truncated: false,
            });
            continue;
        }

        if window.sources.is_empty() && budget_chars > head_len {
            let keep = budget_chars - head_len;
            let cut: String = body.chars().take(keep).collect();
            window.text.push_str(&head);
            window.text.push_str(&cut);
            window.sources.push(ContextSource {
                marker,
                hit: hit.clone(),
                truncated: true,
            });
        }
        break;
    }

    window
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::ChunkBuilder;
    use crate::models::{
        Document, IndexEntry, IngestionStatus, Modality, SpaceVersion,
    };

    fn hit(text: &str, score: f64, filename: &str) -> SearchHit {
        let doc = Document {
            id: "d".into(),
            filename: filename.into(),
            modality: Modality::Text,
            size_bytes: 1,
            uploaded_at: 0,
            page_count: None,
            status: IngestionStatus::Committed,
            chunk_count: 1,
        };
        let mut b = ChunkBuilder::new("d");
        b.push_text(text, &Default::default(), None);
        let chunk = b.finish().remove(0);
        SearchHit {
            entry: IndexEntry::new(&doc, chunk, vec![1.0], SpaceVersion::new("t", 1)),
            score,
        }
    }

    fn image_hit(score: f64) -> SearchHit {
        let doc = Document {
            id: "img".into(),
            filename: "cat.png".into(),
            modality: Modality::Image,
            size_bytes: 1,
            uploaded_at: 0,
            page_count: None,
            status: IngestionStatus::Committed,
            chunk_count: 1,
        };
        let mut b = ChunkBuilder::new("img");
        b.push_image(&[1, 2, 3, 4], "image/png", "Image: cat.png".into(), None, None);
        let chunk = b.finish().remove(0);
        SearchHit {
            entry: IndexEntry::new(&doc, chunk, vec![1.0], SpaceVersion::new("t", 1)),
            score,
        }
    }

    #[test]
    fn test_orders_by_score_and_numbers_sources() {
        let hits = vec![hit("low", 0.2, "a.txt"), hit("high", 0.9, "b.txt")];
        let ctx = assemble_context(&hits, 10_000);
        assert_eq!(ctx.sources.len(), 2);
        assert_eq!(ctx.sources[0].marker, 1);
        assert!(ctx.text.starts_with("[1] (Text) from b.txt (score 0.90)\nhigh"));
        assert!(ctx.text.contains("[2] (Text) from a.txt"));
    }

    #[test]
    fn test_budget_stops_at_first_overflow() {
        let hits = vec![
            hit(&"a".repeat(100), 0.9, "a.txt"),
            hit(&"b".repeat(100), 0.8, "b.txt"),
            hit("c", 0.7, "c.txt"),
        ];
        let ctx = assemble_context(&hits, 180);
        assert_eq!(ctx.sources.len(), 1);
        assert!(ctx.text.chars().count() <= 180);
    }

    #[test]
    fn test_first_hit_truncated_to_budget() {
        let hits = vec![hit(&"é".repeat(500), 0.9, "a.txt")];
        let ctx = assemble_context(&hits, 100);
        assert_eq!(ctx.sources.len(), 1);
        assert!(ctx.sources[0].truncated);
        assert_eq!(ctx.text.chars().count(), 100);
    }

    #[test]
    fn test_image_hits_use_caption() {
        let ctx = assemble_context(&[image_hit(0.5)], 1000);
        assert!(ctx.text.contains("(Image) from cat.png"));
        assert!(ctx.text.ends_with("Image: cat.png"));
        assert!(!ctx.text.contains("AQIDBA"));
    }

    #[test]
    fn test_empty_hits() {
        assert!(assemble_context(&[], 1000).is_empty());
    }
}
