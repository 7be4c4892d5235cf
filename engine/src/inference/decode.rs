//! Lenient decoding of judgment output.
//!
//! Model output that should be JSON frequently is not: it arrives wrapped
//! in markdown fences, prefixed with prose, or truncated. Decoding is an
//! ordered list of strategies tried in sequence - strict parse, fenced
//! block extraction, largest-balanced-object heuristic - so callers get a
//! typed value or a clean miss, never a panic or a nested error cascade.
//! Component-specific terminal fallbacks (default task, raw-text adoption,
//! ASK) live with their components.

use serde::de::DeserializeOwned;

/// Which rung of the recovery ladder produced the value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStrategy {
    Strict,
    FencedBlock,
    LargestObject,
}

/// Decode `raw` into `T`, descending through recovery strategies.
pub fn decode_lenient<T: DeserializeOwned>(raw: &str) -> Option<(T, DecodeStrategy)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<T>(trimmed) {
        return Some((value, DecodeStrategy::Strict));
    }

    if let Some(inner) = fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(inner.trim()) {
            return Some((value, DecodeStrategy::FencedBlock));
        }
    }

    if let Some(object) = largest_json_object(trimmed) {
        if let Ok(value) = serde_json::from_str::<T>(object) {
            return Some((value, DecodeStrategy::LargestObject));
        }
    }

    None
}

/// The contents of the first markdown code fence, if any.
fn fenced_block(raw: &str) -> Option<&str> {
    let open = raw.find("```")?;
    let after_open = &raw[open + 3..];
    // Skip an optional language tag up to the first newline.
    let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
    let body = &after_open[body_start..];
    let close = body.find("```")?;
    Some(&body[..close])
}

/// The largest balanced `{...}` span in `raw`, brace-matched outside of
/// string literals.
fn largest_json_object(raw: &str) -> Option<&str> {
    let bytes = raw.as_bytes();
    let mut best: Option<(usize, usize)> = None;

    let mut depth = 0usize;
    let mut start = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' if depth > 0 => in_string = true,
            b'{' => {
                if depth == 0 {
                    start = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    let len = i + 1 - start;
                    if best.map(|(_, l)| len > l).unwrap_or(true) {
                        best = Some((start, len));
                    }
                }
            }
            _ => {}
        }
    }

    best.map(|(start, len)| &raw[start..start + len])
}

/// Field-level extraction: pull a single string field out of text that
/// resisted every structural decoder.
pub fn extract_string_field(raw: &str, field: &str) -> Option<String> {
    let pattern = format!(
        "\"{}\"\\s*:\\s*\"((?:[^\"\\\\]|\\\\.)*)\"",
        regex::escape(field)
    );
    let re = regex::Regex::new(&pattern).ok()?;
    let captured = re.captures(raw)?.get(1)?.as_str();
    // Unescape through serde so \" and \n in the capture survive.
    serde_json::from_str::<String>(&format!("\"{captured}\"")).ok()
}
