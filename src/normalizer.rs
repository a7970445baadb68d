//! Turns free-text generative model output into strict JSON.
//!
//! The model is asked for JSON only, but replies routinely arrive wrapped in
//! prose or markdown fences, carry trailing commas, or get cut off at the
//! token limit. Extraction walks the text once, collecting top-level balanced
//! `{...}` / `[...]` blocks while tracking string and escape state, so braces
//! inside string values never end a block early.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    Object,
    Array,
}

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("no JSON block found")]
    NoBlock { raw: String },

    #[error("malformed JSON: {source}")]
    Malformed {
        raw: String,
        extracted: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ExtractionError {
    /// The model text exactly as received.
    pub fn raw(&self) -> &str {
        match self {
            ExtractionError::NoBlock { raw } | ExtractionError::Malformed { raw, .. } => raw,
        }
    }

    /// The block that failed to parse, before repair.
    pub fn extracted(&self) -> Option<&str> {
        match self {
            ExtractionError::NoBlock { .. } => None,
            ExtractionError::Malformed { extracted, .. } => Some(extracted),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Block<'a> {
    shape: Shape,
    text: &'a str,
    /// False for the tail of an opener that never closes.
    complete: bool,
}

impl<'a> Block<'a> {
    fn new(text: &'a str, complete: bool) -> Self {
        let shape = if text.starts_with('[') {
            Shape::Array
        } else {
            Shape::Object
        };
        Self {
            shape,
            text,
            complete,
        }
    }
}

/// An opener still waiting for its closer, with the balanced blocks closed
/// directly inside it so far.
struct Frame<'a> {
    start: usize,
    closer: u8,
    children: Vec<Block<'a>>,
}

/// Extracts, repairs and parses the first usable JSON block in `raw`.
///
/// Complete blocks of the `expected` shape are tried first, in order of
/// appearance, then complete blocks of the other shape. The first block that
/// parses wins. An unterminated tail is only reported, never preferred.
pub fn normalize(raw: &str, expected: Shape) -> Result<Value, ExtractionError> {
    let text = raw.trim().trim_start_matches('\u{feff}');
    let mut blocks = top_level_blocks(text);
    blocks.sort_by_key(|block| (!block.complete, block.shape != expected));

    let mut first_failure: Option<(&str, serde_json::Error)> = None;
    for block in &blocks {
        let repaired = strip_trailing_commas(block.text);
        match serde_json::from_str::<Value>(&repaired) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if first_failure.is_none() {
                    first_failure = Some((block.text, err));
                }
            }
        }
    }

    match first_failure {
        Some((extracted, source)) => Err(ExtractionError::Malformed {
            raw: raw.to_string(),
            extracted: extracted.to_string(),
            source,
        }),
        None => Err(ExtractionError::NoBlock {
            raw: raw.to_string(),
        }),
    }
}

/// Single pass over `text`. Balanced blocks that are not nested in another
/// balanced block are returned in order of appearance. When an enclosing
/// opener fails (a mismatched closer or the end of text), the blocks closed
/// inside it surface as top-level blocks. The outermost unterminated opener
/// contributes one incomplete tail at the end.
fn top_level_blocks(text: &str) -> Vec<Block<'_>> {
    let bytes = text.as_bytes();
    let mut blocks = Vec::new();
    let mut stack: Vec<Frame<'_>> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    // Only ASCII bytes are inspected, so every slice index is a char boundary.
    for (pos, &byte) in bytes.iter().enumerate() {
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
            // quotes in surrounding prose are not strings
            b'"' if !stack.is_empty() => in_string = true,
            b'{' | b'[' => stack.push(Frame {
                start: pos,
                closer: if byte == b'{' { b'}' } else { b']' },
                children: Vec::new(),
            }),
            b'}' | b']' => {
                let Some(frame) = stack.pop() else {
                    continue;
                };
                if frame.closer == byte {
                    let block = Block::new(&text[frame.start..=pos], true);
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(block),
                        None => blocks.push(block),
                    }
                } else {
                    // Every open frame sees the same bad closer.
                    stack.push(frame);
                    blocks.extend(stack.drain(..).flat_map(|open| open.children));
                }
            }
            _ => {}
        }
    }

    let tail = stack.first().map(|frame| Block::new(&text[frame.start..], false));
    // Outer frames were opened first, so their children come first.
    for frame in stack {
        blocks.extend(frame.children);
    }
    blocks.extend(tail);
    blocks
}

/// Drops commas that directly precede `]` or `}` (ignoring whitespace),
/// leaving string literals untouched.
pub fn strip_trailing_commas(block: &str) -> String {
    let mut out = String::with_capacity(block.len());
    let mut in_string = false;
    let mut escaped = false;

    for (idx, ch) in block.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            out.push(ch);
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push(ch);
            }
            ',' => {
                let rest = block[idx + 1..].trim_start();
                if !(rest.starts_with(']') || rest.starts_with('}')) {
                    out.push(ch);
                }
            }
            _ => out.push(ch),
        }
    }

    out
}
