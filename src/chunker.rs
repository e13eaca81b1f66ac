//! Structure-aware semantic chunker.
//!
//! Splits raw document text into token-bounded chunks. Sections are cut
//! at markdown header lines and each section degrades granularity only
//! as far as needed: paragraph split, then sentence split, then a hard
//! character slice as the terminal fallback. Greedy unit merging keeps
//! chunks near `max_tokens`, and each flushed chunk seeds the next one
//! with a trailing overlap window to preserve cross-chunk context.
//!
//! Pure function of its input: same text in, same chunks out.

use serde_json::Value;

use crate::lexical::approx_token_count;
use crate::models::Chunk;

/// Approximate chars-per-token ratio used by the hard-slice fallback.
pub const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone)]
pub struct ChunkerConfig {
    pub max_tokens: usize,
    pub overlap_tokens: usize,
}

impl Default for ChunkerConfig {
    fn default() -> Self {
        Self {
            max_tokens: 500,
            overlap_tokens: 50,
        }
    }
}

pub struct Chunker {
    cfg: ChunkerConfig,
}

#[derive(Clone, Copy, PartialEq)]
enum Granularity {
    Paragraph,
    Sentence,
    Slice,
}

impl Granularity {
    fn finer(self) -> Granularity {
        match self {
            Granularity::Paragraph => Granularity::Sentence,
            Granularity::Sentence | Granularity::Slice => Granularity::Slice,
        }
    }

    fn join_sep(self) -> &'static str {
        match self {
            Granularity::Paragraph => "\n\n",
            _ => " ",
        }
    }
}

struct Unit {
    start: usize,
    chars: Vec<char>,
    tokens: usize,
}

struct Section {
    heading: Option<String>,
    start: usize,
    chars: Vec<char>,
}

impl Chunker {
    pub fn new(cfg: ChunkerConfig) -> Self {
        Self { cfg }
    }

    /// Chunk `text` into an ordered sequence. Empty input produces an
    /// empty sequence, never an error. `extra_meta` object fields are
    /// merged into every chunk's metadata.
    pub fn chunk(&self, text: &str, extra_meta: &Value) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }
        let mut out = Vec::new();
        for section in split_sections(text) {
            if section.chars.iter().all(|c| c.is_whitespace()) {
                continue;
            }
            self.emit(
                &section.chars,
                section.start,
                section.heading.as_deref(),
                extra_meta,
                Granularity::Paragraph,
                &mut out,
            );
        }
        out
    }

    fn emit(
        &self,
        chars: &[char],
        start: usize,
        heading: Option<&str>,
        extra: &Value,
        gran: Granularity,
        out: &mut Vec<Chunk>,
    ) {
        let text: String = chars.iter().collect();
        if approx_token_count(&text) <= self.cfg.max_tokens {
            out.push(make_chunk(text, start, start + chars.len(), heading, extra));
            return;
        }
        if gran == Granularity::Slice {
            self.hard_slice(chars, start, heading, extra, out);
            return;
        }
        let units = split_units(chars, start, gran);
        self.merge_units(units, gran, heading, extra, out);
    }

    /// Greedy accumulation of units up to `max_tokens`. A flushed chunk
    /// leaves a trailing overlap window behind as the seed of the next
    /// chunk. A single unit over `max_tokens` is flushed separately and
    /// re-chunked at finer granularity.
    fn merge_units(
        &self,
        units: Vec<Unit>,
        gran: Granularity,
        heading: Option<&str>,
        extra: &Value,
        out: &mut Vec<Chunk>,
    ) {
        let mut cur: Vec<Unit> = Vec::new();
        let mut cur_tokens = 0usize;
        // Units before this index in `cur` were carried over as overlap.
        let mut fresh_from = 0usize;

        for unit in units {
            if unit.tokens > self.cfg.max_tokens {
                if cur.len() > fresh_from {
                    self.flush(&mut cur, fresh_from, gran, heading, extra, out);
                }
                // Oversized unit: never carry overlap into the recursion.
                cur.clear();
                cur_tokens = 0;
                fresh_from = 0;
                self.emit(&unit.chars, unit.start, heading, extra, gran.finer(), out);
                continue;
            }

            if cur_tokens + unit.tokens > self.cfg.max_tokens && !cur.is_empty() {
                if cur.len() > fresh_from {
                    let (tail, tail_tokens) = self.flush(&mut cur, fresh_from, gran, heading, extra, out);
                    cur = tail;
                    cur_tokens = tail_tokens;
                } else {
                    // Only carried overlap present; dropping it is the
                    // sole way to make progress.
                    cur.clear();
                    cur_tokens = 0;
                }
                fresh_from = cur.len();
            }

            cur_tokens += unit.tokens;
            cur.push(unit);
        }

        if cur.len() > fresh_from {
            self.flush(&mut cur, fresh_from, gran, heading, extra, out);
        }
    }

    /// Emit the accumulated units as one chunk and return the trailing
    /// overlap window (units whose cumulative token count stays within
    /// `overlap_tokens`) for the next chunk's prefix.
    fn flush(
        &self,
        cur: &mut Vec<Unit>,
        fresh_from: usize,
        gran: Granularity,
        heading: Option<&str>,
        extra: &Value,
        out: &mut Vec<Chunk>,
    ) -> (Vec<Unit>, usize) {
        let sep = gran.join_sep();
        let text = cur
            .iter()
            .map(|u| u.chars.iter().collect::<String>())
            .collect::<Vec<_>>()
            .join(sep);
        let start = cur
            .get(fresh_from)
            .map(|u| u.start)
            .unwrap_or_else(|| cur[0].start);
        let last = cur.last().expect("flush on empty unit buffer");
        let end = last.start + last.chars.len();
        out.push(make_chunk(text, start, end, heading, extra));

        let mut tail: Vec<Unit> = Vec::new();
        let mut tail_tokens = 0usize;
        for unit in cur.drain(..).rev() {
            if tail_tokens + unit.tokens > self.cfg.overlap_tokens {
                break;
            }
            tail_tokens += unit.tokens;
            tail.push(unit);
        }
        tail.reverse();
        (tail, tail_tokens)
    }

    /// Terminal fallback: fixed character windows of `max_tokens * 4`
    /// with `overlap_tokens * 4` characters of overlap.
    fn hard_slice(
        &self,
        chars: &[char],
        start: usize,
        heading: Option<&str>,
        extra: &Value,
        out: &mut Vec<Chunk>,
    ) {
        let window = (self.cfg.max_tokens * CHARS_PER_TOKEN).max(1);
        let overlap = (self.cfg.overlap_tokens * CHARS_PER_TOKEN).min(window.saturating_sub(1));
        let step = (window - overlap).max(1);

        let mut pos = 0usize;
        loop {
            let end = (pos + window).min(chars.len());
            let text: String = chars[pos..end].iter().collect();
            if !text.trim().is_empty() {
                out.push(make_chunk(text, start + pos, start + end, heading, extra));
            }
            if end == chars.len() {
                break;
            }
            pos += step;
        }
    }
}

fn make_chunk(
    text: String,
    start_char: usize,
    end_char: usize,
    heading: Option<&str>,
    extra: &Value,
) -> Chunk {
    let mut meta = serde_json::Map::new();
    if let Value::Object(obj) = extra {
        meta.extend(obj.clone());
    }
    if let Some(h) = heading {
        meta.insert("heading".to_string(), Value::String(h.to_string()));
    }
    let token_count = approx_token_count(&text).max(1);
    Chunk {
        text,
        start_char,
        end_char,
        token_count,
        meta: Value::Object(meta),
    }
}

/// Cut `text` into sections at markdown header lines (`#`..`######`).
/// A header-less text is a single section with no heading.
fn split_sections(text: &str) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut heading: Option<String> = None;
    let mut body: Vec<char> = Vec::new();
    let mut body_start = 0usize;
    let mut offset = 0usize;

    let flush = |sections: &mut Vec<Section>,
                 heading: &Option<String>,
                 body: &mut Vec<char>,
                 body_start: usize| {
        if !body.is_empty() {
            sections.push(Section {
                heading: heading.clone(),
                start: body_start,
                chars: std::mem::take(body),
            });
        }
    };

    for line in text.split_inclusive('\n') {
        let line_chars = line.chars().count();
        if let Some(h) = header_text(line) {
            flush(&mut sections, &heading, &mut body, body_start);
            heading = Some(h);
            body_start = offset + line_chars;
        } else {
            if body.is_empty() {
                body_start = offset;
            }
            body.extend(line.chars());
        }
        offset += line_chars;
    }
    flush(&mut sections, &heading, &mut body, body_start);

    // A document that is nothing but a header still yields one section
    // so the heading is not silently dropped.
    if sections.is_empty() {
        if let Some(h) = heading {
            sections.push(Section {
                heading: None,
                start: 0,
                chars: h.chars().collect(),
            });
        }
    }
    sections
}

fn header_text(line: &str) -> Option<String> {
    let trimmed = line.trim_start();
    let hashes = trimmed.chars().take_while(|c| *c == '#').count();
    if (1..=6).contains(&hashes) {
        let rest = &trimmed[hashes..];
        if rest.starts_with(' ') || rest.starts_with('\t') {
            return Some(rest.trim().to_string());
        }
    }
    None
}

/// Split a section into paragraph or sentence units, preserving char
/// offsets relative to the whole document. Empty units are dropped.
fn split_units(chars: &[char], base: usize, gran: Granularity) -> Vec<Unit> {
    let mut boundaries: Vec<usize> = Vec::new();
    match gran {
        Granularity::Paragraph => {
            let mut i = 0;
            while i + 1 < chars.len() {
                if chars[i] == '\n' && chars[i + 1] == '\n' {
                    let mut j = i;
                    while j < chars.len() && chars[j] == '\n' {
                        j += 1;
                    }
                    boundaries.push(i);
                    boundaries.push(j);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        Granularity::Sentence => {
            let mut i = 0;
            while i < chars.len() {
                if matches!(chars[i], '.' | '!' | '?') {
                    let mut j = i;
                    while j < chars.len() && matches!(chars[j], '.' | '!' | '?') {
                        j += 1;
                    }
                    boundaries.push(j);
                    boundaries.push(j);
                    i = j;
                } else {
                    i += 1;
                }
            }
        }
        Granularity::Slice => unreachable!("slice is handled by hard_slice"),
    }

    let mut units = Vec::new();
    let mut start = 0usize;
    let mut bounds = boundaries.chunks(2);
    loop {
        let (end, next_start) = match bounds.next() {
            Some(pair) => (pair[0], pair[1]),
            None => (chars.len(), chars.len()),
        };
        push_unit(&mut units, chars, base, start, end);
        if next_start >= chars.len() {
            break;
        }
        start = next_start;
    }
    units
}

fn push_unit(units: &mut Vec<Unit>, chars: &[char], base: usize, start: usize, end: usize) {
    if start >= end {
        return;
    }
    // Trim whitespace, adjusting the recorded start.
    let mut s = start;
    let mut e = end;
    while s < e && chars[s].is_whitespace() {
        s += 1;
    }
    while e > s && chars[e - 1].is_whitespace() {
        e -= 1;
    }
    if s == e {
        return;
    }
    let slice: Vec<char> = chars[s..e].to_vec();
    let text: String = slice.iter().collect();
    let tokens = approx_token_count(&text);
    units.push(Unit {
        start: base + s,
        chars: slice,
        tokens,
    });
}
