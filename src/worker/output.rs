//! Phase output extraction: every provider phase must yield exactly one
//! JSON object, possibly buried in prose, fenced code blocks, or a wrapper
//! record with the payload under a string member.

use serde_json::Value;

/// Wrapper member names tried, in order, when an extracted object looks
/// like a provider envelope rather than the phase payload itself.
const WRAP_KEYS: [&str; 5] = ["result", "output", "text", "message", "content"];

/// Extract the single JSON object a phase produced from its captured text.
pub fn extract_phase_output(text: &str) -> Result<Value, String> {
    extract_inner(text, 0)
}

fn extract_inner(text: &str, depth: usize) -> Result<Value, String> {
    if depth > 4 {
        return Err("wrapper recursion too deep".to_string());
    }

    // Fenced ```json blocks win outright; the fence is an explicit signal.
    if let Some(fenced) = fenced_json(text) {
        if let Ok(value) = extract_inner(&fenced, depth + 1) {
            return Ok(value);
        }
    }

    let candidate = direct_extract(text)
        .ok_or_else(|| "no JSON object found in output".to_string())?;

    // A wrapper record carries the real payload under a string (or array of
    // text parts) member; unwrap only when the inner content itself yields
    // an object.
    for key in WRAP_KEYS {
        match candidate.get(key) {
            Some(Value::String(inner)) => {
                if let Ok(value) = extract_inner(inner, depth + 1) {
                    return Ok(value);
                }
            }
            Some(Value::Array(parts)) => {
                let joined: String = parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("\n");
                if !joined.is_empty() {
                    if let Ok(value) = extract_inner(&joined, depth + 1) {
                        return Ok(value);
                    }
                }
            }
            _ => {}
        }
    }

    Ok(candidate)
}

/// Substring from the first `{` to the last `}`, parsed as an object.
fn direct_extract(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let parsed: Value = serde_json::from_str(&text[start..=end]).ok()?;
    if parsed.is_object() { Some(parsed) } else { None }
}

/// Content between ```json fences (closing fence optional on truncation).
fn fenced_json(text: &str) -> Option<String> {
    let open = text.find("```json")?;
    let body = &text[open + "```json".len()..];
    let body = body.strip_prefix('\n').unwrap_or(body);
    match body.find("```") {
        Some(close) => Some(body[..close].to_string()),
        None => Some(body.to_string()),
    }
}
