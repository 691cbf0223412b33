//! Template Matching Seam
//!
//! The control core never looks at pixels itself; it asks a matcher where
//! a named pattern appears in a frame. The trait keeps the matching backend
//! swappable and lets tests script detections without any capture stack.

use crate::capture::Frame;

/// A reference pattern: small RGBA image plus an optional per-pixel mask
/// (0 = ignore, 255 = compare) derived from its alpha channel.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
    pub mask: Option<Vec<u8>>,
}

/// One raw matcher hit. Coordinates are the pattern center within the
/// searched frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawMatch {
    pub confidence: f32,
    pub x: i32,
    pub y: i32,
}

/// Matching backend. Implementations deduplicate their own output:
/// `match_all` never returns two hits closer than `min_separation`.
pub trait TemplateMatcher: Send + Sync {
    /// Best hit at or above `threshold`, if any.
    fn match_one(&self, frame: &Frame, pattern: &Pattern, threshold: f32) -> Option<RawMatch>;

    /// All hits at or above `threshold`, best first, deduplicated.
    fn match_all(
        &self,
        frame: &Frame,
        pattern: &Pattern,
        threshold: f32,
        min_separation: u32,
    ) -> Vec<RawMatch>;
}

/// Exhaustive-scan matcher scoring masked mean absolute RGB difference.
/// Slow but dependency-free; good enough for small patterns over the
/// bounded scan heights this crate works with.
pub struct PixelMatcher;

impl PixelMatcher {
    /// Confidence of the pattern placed with its top-left corner at
    /// (ox, oy). 1.0 is a perfect match.
    fn score_at(frame: &Frame, pattern: &Pattern, ox: u32, oy: u32) -> f32 {
        let mut total = 0u64;
        let mut counted = 0u64;
        for py in 0..pattern.height {
            let frow = (((oy + py) * frame.width + ox) * 4) as usize;
            let prow = ((py * pattern.width) * 4) as usize;
            for px in 0..pattern.width {
                let pi = prow + (px * 4) as usize;
                if let Some(mask) = &pattern.mask {
                    if mask[(py * pattern.width + px) as usize] < 128 {
                        continue;
                    }
                }
                let fi = frow + (px * 4) as usize;
                for c in 0..3 {
                    total += frame.pixels[fi + c].abs_diff(pattern.pixels[pi + c]) as u64;
                }
                counted += 3;
            }
        }
        if counted == 0 {
            return 0.0;
        }
        1.0 - (total as f32 / counted as f32) / 255.0
    }

    fn scan(&self, frame: &Frame, pattern: &Pattern, threshold: f32) -> Vec<RawMatch> {
        if pattern.width > frame.width || pattern.height > frame.height {
            return Vec::new();
        }
        let mut hits = Vec::new();
        for oy in 0..=frame.height - pattern.height {
            for ox in 0..=frame.width - pattern.width {
                let confidence = Self::score_at(frame, pattern, ox, oy);
                if confidence >= threshold {
                    hits.push(RawMatch {
                        confidence,
                        x: (ox + pattern.width / 2) as i32,
                        y: (oy + pattern.height / 2) as i32,
                    });
                }
            }
        }
        hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        hits
    }
}

impl TemplateMatcher for PixelMatcher {
    fn match_one(&self, frame: &Frame, pattern: &Pattern, threshold: f32) -> Option<RawMatch> {
        self.scan(frame, pattern, threshold).into_iter().next()
    }

    fn match_all(
        &self,
        frame: &Frame,
        pattern: &Pattern,
        threshold: f32,
        min_separation: u32,
    ) -> Vec<RawMatch> {
        // Greedy non-maximum suppression, best hits first.
        let sep = min_separation as i32;
        let mut kept: Vec<RawMatch> = Vec::new();
        for hit in self.scan(frame, pattern, threshold) {
            if kept
                .iter()
                .all(|k| (k.x - hit.x).abs() >= sep || (k.y - hit.y).abs() >= sep)
            {
                kept.push(hit);
            }
        }
        kept
    }
}
