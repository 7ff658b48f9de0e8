//! Layout rect extraction for headings and paragraphs.
//!
//! A single `Runtime.evaluate` call walks the document for block elements,
//! collects their client rects in CSS pixels, and the Rust side normalizes
//! them against the content size so every coordinate lands in `[0, 1]`.

use std::collections::HashMap;

use serde::Deserialize;
use tracing::debug;

use pagesnap_core_types::{clamp_unit, NormalizedRect};

use crate::session::CdpSession;
use crate::transport::CdpTransport;

/// Walks h1-h6 and p elements. Range rects follow inline wrapping more
/// faithfully than the bounding box, which stays as a fallback for elements
/// the range API reports empty.
const BLOCK_RECTS_JS: &str = r#"
(() => {
    const out = [];
    let headings = 0;
    let paragraphs = 0;
    const take = (el, kind, id) => {
        const range = document.createRange();
        range.selectNodeContents(el);
        let rects = Array.from(range.getClientRects());
        if (rects.length === 0) {
            rects = [el.getBoundingClientRect()];
        }
        const boxes = rects
            .filter(r => r.width > 0 && r.height > 0)
            .map(r => ({ x: r.left + window.scrollX, y: r.top + window.scrollY,
                         width: r.width, height: r.height }));
        if (boxes.length === 0) { return; }
        const excerpt = (el.textContent || '').trim().slice(0, 120);
        out.push({ id, kind, excerpt, rects: boxes });
    };
    for (const el of document.querySelectorAll('h1,h2,h3,h4,h5,h6,p')) {
        if (el.tagName === 'P') {
            take(el, 'p', 'p' + paragraphs++);
        } else {
            take(el, 'h', 'h' + headings++);
        }
    }
    return out;
})()
"#;

#[derive(Debug, Deserialize)]
struct RawBlock {
    id: String,
    #[allow(dead_code)]
    kind: String,
    excerpt: String,
    rects: Vec<RawRect>,
}

#[derive(Debug, Deserialize)]
struct RawRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

/// Normalize raw CSS-pixel blocks against the content size. Empty rect lists
/// are dropped; an empty overall map becomes `None`.
fn normalize(
    blocks: Vec<RawBlock>,
    content_width: u32,
    content_height: u32,
) -> Option<HashMap<String, Vec<NormalizedRect>>> {
    if content_width == 0 || content_height == 0 {
        return None;
    }
    let width = content_width as f64;
    let height = content_height as f64;

    let mut map = HashMap::new();
    for block in blocks {
        let excerpt = block.excerpt;
        let rects: Vec<NormalizedRect> = block
            .rects
            .into_iter()
            .map(|rect| NormalizedRect {
                x: clamp_unit(rect.x / width),
                y: clamp_unit(rect.y / height),
                w: clamp_unit(rect.width / width),
                h: clamp_unit(rect.height / height),
                excerpt: if excerpt.is_empty() {
                    None
                } else {
                    Some(excerpt.clone())
                },
                confidence: Some(0.9),
            })
            .collect();
        if !rects.is_empty() {
            map.insert(block.id, rects);
        }
    }

    if map.is_empty() {
        None
    } else {
        Some(map)
    }
}

/// Best-effort extraction; returns `None` when the content size is unknown
/// or the in-page script fails.
pub async fn extract_block_rects<T: CdpTransport>(
    session: &mut CdpSession<T>,
    content_width: Option<u32>,
    content_height: Option<u32>,
) -> Option<HashMap<String, Vec<NormalizedRect>>> {
    let (width, height) = match (content_width, content_height) {
        (Some(width), Some(height)) if width > 0 && height > 0 => (width, height),
        _ => {
            debug!(target: "cdp-rects", "content size unknown, skipping rects");
            return None;
        }
    };

    let value = match session.eval_value(BLOCK_RECTS_JS).await {
        Ok(Some(value)) => value,
        Ok(None) => {
            debug!(target: "cdp-rects", "block rect script returned no value");
            return None;
        }
        Err(err) => {
            debug!(target: "cdp-rects", %err, "block rect script failed");
            return None;
        }
    };
    let blocks: Vec<RawBlock> = match serde_json::from_value(value) {
        Ok(blocks) => blocks,
        Err(err) => {
            debug!(target: "cdp-rects", %err, "block rect payload malformed");
            return None;
        }
    };

    normalize(blocks, width, height)
}
