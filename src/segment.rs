//! Pluggable text segmentation.
//!
//! Splits document text into retrieval-sized pieces with `[start, end)` char
//! spans and cheap token estimates (`ceil(chars / 4)` — deliberately not a
//! provider-exact tokenizer). Strategies are a closed enum; unknown strategy
//! names fall back to [`ChunkStrategy::Recursive`] with a logged warning
//! instead of failing silently.
//!
//! All functions here are pure and deterministic: same text and config in,
//! same pieces out.

use anyhow::{bail, Result};
use tracing::warn;

use crate::ragconfig::ChunkingConfig;

/// Approximate chars-per-token ratio.
const CHARS_PER_TOKEN: usize = 4;

/// Estimated token count for a text: `ceil(chars / 4)`.
pub fn estimate_tokens(text: &str) -> usize {
    let chars = text.chars().count();
    chars.div_ceil(CHARS_PER_TOKEN)
}

/// A segmented piece of a document, before storage.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub text: String,
    /// Char offset of the piece start in the source text.
    pub start_char: usize,
    /// Char offset one past the piece end.
    pub end_char: usize,
    pub token_count: usize,
}

impl ChunkPiece {
    fn from_span(chars: &[char], base: usize, start: usize, end: usize) -> Self {
        let text: String = chars[start..end].iter().collect();
        let token_count = estimate_tokens(&text);
        ChunkPiece {
            text,
            start_char: base + start,
            end_char: base + end,
            token_count,
        }
    }
}

/// Segmentation strategy. Selected by name from the chunking facet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkStrategy {
    /// Sliding character window with overlap back-step.
    Fixed,
    /// Separator-priority splitting with greedy packing and recursion.
    Recursive,
    /// Whole sentences accumulated up to the size limit.
    Sentence,
    /// Whole paragraphs accumulated up to the size limit.
    Paragraph,
    /// Split on a caller-supplied pattern. Char spans are not tracked for
    /// this strategy (reported as `[0, 0)`); consumers needing highlight
    /// offsets must use one of the other strategies.
    Custom,
}

impl ChunkStrategy {
    /// Resolve a strategy by name. Unknown names fall back to `Recursive`
    /// with a warning.
    pub fn parse(name: &str) -> Self {
        match name {
            "fixed" => ChunkStrategy::Fixed,
            "recursive" => ChunkStrategy::Recursive,
            "sentence" => ChunkStrategy::Sentence,
            "paragraph" => ChunkStrategy::Paragraph,
            "custom" => ChunkStrategy::Custom,
            other => {
                warn!(strategy = other, "unknown chunking strategy, falling back to recursive");
                ChunkStrategy::Recursive
            }
        }
    }
}

/// Segment `text` per the chunking facet, then drop pieces outside the
/// closed `[min_size, max_size]` token interval.
pub fn chunk_with_config(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let mut pieces = chunk_text(text, ChunkStrategy::parse(&config.strategy), config)?;
    pieces.retain(|p| p.token_count <= config.max_size);
    Ok(pieces)
}

/// Segment `text` with an explicit strategy. All strategies post-filter by
/// `min_size`; `max_size` is applied by [`chunk_with_config`].
pub fn chunk_text(
    text: &str,
    strategy: ChunkStrategy,
    config: &ChunkingConfig,
) -> Result<Vec<ChunkPiece>> {
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let chars: Vec<char> = text.chars().collect();
    let max_chars = config.size_tokens.max(1) * CHARS_PER_TOKEN;

    let mut pieces = match strategy {
        ChunkStrategy::Fixed => {
            chunk_fixed(&chars, max_chars, config.overlap_tokens * CHARS_PER_TOKEN)
        }
        ChunkStrategy::Recursive => {
            let seps: Vec<Vec<char>> = config
                .separators
                .iter()
                .filter(|s| !s.is_empty())
                .map(|s| s.chars().collect())
                .collect();
            let mut out = Vec::new();
            chunk_recursive(&chars, 0, &seps, max_chars, &mut out);
            out
        }
        ChunkStrategy::Sentence => chunk_units(&chars, split_sentences(&chars), max_chars),
        ChunkStrategy::Paragraph => {
            let sep: Vec<char> = "\n\n".chars().collect();
            chunk_units(&chars, split_keep_sep(&chars, &sep), max_chars)
        }
        ChunkStrategy::Custom => chunk_custom(text, config)?,
    };

    pieces.retain(|p| p.token_count >= config.min_size);
    Ok(pieces)
}

// ============ Fixed window ============

/// Slides a window of `max_chars`, backing up `overlap_chars` between
/// windows. Stops once the window cannot advance past the previous start,
/// which prevents an infinite loop when overlap >= window.
fn chunk_fixed(chars: &[char], max_chars: usize, overlap_chars: usize) -> Vec<ChunkPiece> {
    let mut out = Vec::new();
    let len = chars.len();
    let mut start = 0usize;

    while start < len {
        let end = (start + max_chars).min(len);
        out.push(ChunkPiece::from_span(chars, 0, start, end));
        if end == len {
            break;
        }
        let next = end.saturating_sub(overlap_chars);
        if next <= start {
            break;
        }
        start = next;
    }

    out
}

// ============ Recursive separator splitting ============

/// Split `chars` into segments, each keeping its trailing separator so that
/// concatenated segment spans cover the input without gaps. Returns one
/// segment spanning everything when the separator does not occur.
fn split_keep_sep(chars: &[char], sep: &[char]) -> Vec<(usize, usize)> {
    if sep.is_empty() || chars.len() < sep.len() {
        return vec![(0, chars.len())];
    }

    let mut segments = Vec::new();
    let mut seg_start = 0usize;
    let mut i = 0usize;
    while i + sep.len() <= chars.len() {
        if &chars[i..i + sep.len()] == sep {
            let seg_end = i + sep.len();
            segments.push((seg_start, seg_end));
            seg_start = seg_end;
            i = seg_end;
        } else {
            i += 1;
        }
    }
    if seg_start < chars.len() {
        segments.push((seg_start, chars.len()));
    }
    if segments.is_empty() {
        segments.push((0, chars.len()));
    }
    segments
}

/// Tries separators in priority order; greedily packs segments under the
/// limit and recurses with lower-priority separators on any segment still
/// too large. Raw fixed-width slicing is the last resort, used only when no
/// separator reduces the piece at all.
fn chunk_recursive(
    chars: &[char],
    base: usize,
    seps: &[Vec<char>],
    max_chars: usize,
    out: &mut Vec<ChunkPiece>,
) {
    if chars.len() <= max_chars {
        if !chars.is_empty() {
            out.push(ChunkPiece::from_span(chars, base, 0, chars.len()));
        }
        return;
    }

    for (i, sep) in seps.iter().enumerate() {
        let segments = split_keep_sep(chars, sep);
        if segments.len() <= 1 {
            // This separator doesn't reduce the piece; try the next one.
            continue;
        }
        let rest = &seps[i + 1..];

        let mut buf: Option<(usize, usize)> = None;
        for (s, e) in segments {
            if e - s > max_chars {
                if let Some((bs, be)) = buf.take() {
                    out.push(ChunkPiece::from_span(chars, base, bs, be));
                }
                chunk_recursive(&chars[s..e], base + s, rest, max_chars, out);
                continue;
            }
            match buf {
                None => buf = Some((s, e)),
                Some((bs, _)) if e - bs <= max_chars => buf = Some((bs, e)),
                Some((bs, be)) => {
                    out.push(ChunkPiece::from_span(chars, base, bs, be));
                    buf = Some((s, e));
                }
            }
        }
        if let Some((bs, be)) = buf {
            out.push(ChunkPiece::from_span(chars, base, bs, be));
        }
        return;
    }

    // No separator occurs in this piece: raw fixed-width slices.
    let mut start = 0usize;
    while start < chars.len() {
        let end = (start + max_chars).min(chars.len());
        out.push(ChunkPiece::from_span(chars, base, start, end));
        start = end;
    }
}

// ============ Sentence / paragraph units ============

/// Sentence boundaries: after `.`, `!`, or `?` followed by whitespace (the
/// whitespace run stays with the preceding sentence), or at end of text.
fn split_sentences(chars: &[char]) -> Vec<(usize, usize)> {
    let mut units = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;
    let len = chars.len();

    while i < len {
        let c = chars[i];
        if (c == '.' || c == '!' || c == '?') && i + 1 < len && chars[i + 1].is_whitespace() {
            let mut end = i + 1;
            while end < len && chars[end].is_whitespace() {
                end += 1;
            }
            units.push((start, end));
            start = end;
            i = end;
        } else {
            i += 1;
        }
    }
    if start < len {
        units.push((start, len));
    }
    units
}

/// Greedily accumulate whole units until adding the next would exceed the
/// limit, then flush. A unit that alone exceeds the limit becomes its own
/// piece.
fn chunk_units(chars: &[char], units: Vec<(usize, usize)>, max_chars: usize) -> Vec<ChunkPiece> {
    let mut out = Vec::new();
    let mut buf: Option<(usize, usize)> = None;

    for (s, e) in units {
        match buf {
            None => buf = Some((s, e)),
            Some((bs, _)) if e - bs <= max_chars => buf = Some((bs, e)),
            Some((bs, be)) => {
                out.push(ChunkPiece::from_span(chars, 0, bs, be));
                buf = Some((s, e));
            }
        }
    }
    if let Some((bs, be)) = buf {
        out.push(ChunkPiece::from_span(chars, 0, bs, be));
    }
    out
}

// ============ Custom pattern ============

/// Split on the caller-supplied pattern. Char spans are not tracked; every
/// piece reports `[0, 0)`.
fn chunk_custom(text: &str, config: &ChunkingConfig) -> Result<Vec<ChunkPiece>> {
    let pattern = match &config.custom_pattern {
        Some(p) if !p.is_empty() => p,
        _ => bail!("custom chunking strategy requires a non-empty custom_pattern"),
    };

    Ok(text
        .split(pattern.as_str())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| ChunkPiece {
            text: s.to_string(),
            start_char: 0,
            end_char: 0,
            token_count: estimate_tokens(s),
        })
        .collect())
}
