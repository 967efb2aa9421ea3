//! Lenient parsing of LLM JSON responses.
//!
//! Models wrap JSON in markdown fences, truncate long diffs mid-object, and
//! emit raw newlines or unescaped quotes inside string values. The recovery
//! ladder here tries progressively more invasive repairs and fails with a
//! structured error only when none of them produce valid JSON:
//!
//! 1. strip markdown fences
//! 2. parse as-is
//! 3. trim to the last balanced brace (truncated objects)
//! 4. escape stray newlines and quotes inside the known string fields
//! 5. strip control characters

use serde::de::DeserializeOwned;

/// String-valued fields that routinely contain raw newlines or quotes in
/// model output and are worth repairing.
pub const RECOVERED_STRING_FIELDS: &[&str] = &[
    "diff",
    "commitMessage",
    "filesModified",
    "notes",
    "fixDescription",
];

/// Error returned when every recovery stage fails.
#[derive(Debug, thiserror::Error)]
#[error("failed to parse agent JSON ({reason}); response starts with: {snippet:?}")]
pub struct JsonRecoveryError {
    pub reason: String,
    pub snippet: String,
}

/// Parse a model response into `T`, applying the recovery ladder.
pub fn parse_lenient<T: DeserializeOwned>(raw: &str) -> Result<T, JsonRecoveryError> {
    let stripped = strip_fences(raw);

    // Stage 1: as-is.
    if let Ok(v) = serde_json::from_str::<T>(stripped) {
        return Ok(v);
    }

    // Stage 2: trim a truncated object to its last balanced brace, then run
    // the string-field repair and control-character scrub on the trimmed
    // text.
    if let Some(trimmed) = trim_to_balanced(stripped) {
        if let Ok(v) = serde_json::from_str::<T>(&trimmed) {
            return Ok(v);
        }
        let repaired = escape_known_fields(&trimmed);
        if let Ok(v) = serde_json::from_str::<T>(&repaired) {
            return Ok(v);
        }
        let scrubbed: String = repaired
            .chars()
            .filter(|c| *c >= ' ' || *c == '\n')
            .collect();
        if let Ok(v) = serde_json::from_str::<T>(&escape_known_fields(&scrubbed)) {
            return Ok(v);
        }
    }

    // Stage 3: repair the known string fields on the untrimmed text (raw
    // newlines appear even when the object is complete).
    let repaired = escape_known_fields(stripped);
    if let Ok(v) = serde_json::from_str::<T>(&repaired) {
        return Ok(v);
    }

    // Stage 4: last resort, strip control characters.
    let scrubbed: String = repaired.chars().filter(|c| *c >= ' ').collect();
    match serde_json::from_str::<T>(&scrubbed) {
        Ok(v) => Ok(v),
        Err(e) => Err(JsonRecoveryError {
            reason: e.to_string(),
            snippet: snippet(raw),
        }),
    }
}

fn snippet(raw: &str) -> String {
    let mut end = raw.len().min(120);
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_owned()
}

/// Remove a surrounding markdown code fence, if any.
fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Drop the info string ("json", "JSON", ...) up to the first newline.
    let body = match rest.find('\n') {
        Some(pos) => &rest[pos + 1..],
        None => rest,
    };
    match body.rfind("```") {
        Some(pos) => body[..pos].trim(),
        None => body.trim(),
    }
}

/// If the text contains an object that never closes, return the prefix up to
/// the last position where the braces balanced out. Returns `None` when the
/// text has no object start or never balances.
fn trim_to_balanced(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut depth: i32 = 0;
    let mut in_string = false;
    let mut escaped = false;
    let mut last_balanced: Option<usize> = None;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
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
            b'"' => in_string = true,
            b'{' | b'[' => depth += 1,
            b'}' | b']' => {
                depth -= 1;
                if depth == 0 {
                    last_balanced = Some(i);
                }
            }
            _ => {}
        }
    }

    let end = last_balanced?;
    if end == text.len() - 1 && start == 0 {
        // Already balanced and whole; nothing to trim.
        return None;
    }
    Some(text[start..=end].to_owned())
}

/// Escape raw newlines, tabs, and unescaped interior quotes inside the
/// values of the known string fields.
fn escape_known_fields(text: &str) -> String {
    let mut out = text.to_owned();
    for field in RECOVERED_STRING_FIELDS {
        out = escape_field(&out, field);
    }
    out
}

/// Repair the value of one `"field": "..."` occurrence.
///
/// Walks the value character by character: raw control characters become
/// escapes, and a quote only terminates the value when it is followed (after
/// whitespace) by `,`, `}`, or `]` -- otherwise it is treated as an interior
/// quote and escaped.
fn escape_field(text: &str, field: &str) -> String {
    let needle = format!("\"{field}\"");
    let Some(key_pos) = text.find(&needle) else {
        return text.to_owned();
    };

    let after_key = key_pos + needle.len();
    let rest = &text[after_key..];
    // Expect a colon, then an opening quote.
    let Some(colon_off) = rest.find(':') else {
        return text.to_owned();
    };
    let after_colon = &rest[colon_off + 1..];
    let ws_len = after_colon.len() - after_colon.trim_start().len();
    if !after_colon.trim_start().starts_with('"') {
        // Not a string value (null, array, number); nothing to repair.
        return text.to_owned();
    }

    let value_start = after_key + colon_off + 1 + ws_len + 1;
    let value = &text[value_start..];

    let mut repaired = String::with_capacity(value.len());
    let mut value_end = None;
    let chars: Vec<char> = value.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            '\\' if i + 1 < chars.len() => {
                // Keep existing escapes intact.
                repaired.push(c);
                repaired.push(chars[i + 1]);
                i += 2;
                continue;
            }
            '"' => {
                // Terminator only if followed by a JSON delimiter.
                let tail: String = chars[i + 1..]
                    .iter()
                    .skip_while(|c| c.is_whitespace())
                    .take(1)
                    .collect();
                if tail.is_empty() || matches!(tail.as_str(), "," | "}" | "]") {
                    value_end = Some(i);
                    break;
                }
                repaired.push_str("\\\"");
            }
            '\n' => repaired.push_str("\\n"),
            '\r' => repaired.push_str("\\r"),
            '\t' => repaired.push_str("\\t"),
            _ => repaired.push(c),
        }
        i += 1;
    }

    let Some(end) = value_end else {
        return text.to_owned();
    };

    // Byte offset of the terminating quote within `value`.
    let end_byte: usize = chars[..end].iter().map(|c| c.len_utf8()).sum();

    let mut out = String::with_capacity(text.len() + 16);
    out.push_str(&text[..value_start]);
    out.push_str(&repaired);
    out.push_str(&text[value_start + end_byte..]);
    out
}
