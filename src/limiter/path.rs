//! Dot-path lookup over JSON payloads.
//!
//! Paths use the gjson dialect operators already write in link configs:
//!
//! | Path | Selects |
//! |------|---------|
//! | `sender` | top-level key |
//! | `meta.host.name` | nested keys |
//! | `hosts.0` | array element by index |
//! | `fqdn\.example` | key containing a literal dot |
//!
//! Wildcards and modifiers are not supported.
//!
//! Values are coerced the way gjson coerces them, see [`as_bool`] and
//! [`as_string`].

use serde_json::Value;

/// Split a path on unescaped dots. A backslash escapes the next character.
pub fn split(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    current.push(escaped);
                }
            }
            '.' => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);
    segments
}

/// Find the value at `path`. An empty path selects nothing.
pub fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }

    split(path).iter().try_fold(doc, |node, segment| match node {
        Value::Object(map) => map.get(segment.as_str()),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// gjson truthiness: `true`, non-zero numbers, and the strings
/// `1`, `t`, `T`, `TRUE`, `true`, `True`.
pub fn as_bool(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.as_str(), "1" | "t" | "T" | "TRUE" | "true" | "True"),
        Value::Null | Value::Array(_) | Value::Object(_) => false,
    }
}

/// gjson string form: strings verbatim, numbers and booleans as written,
/// null as empty, objects and arrays as raw JSON.
pub fn as_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// What the limiter needs out of one payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Extracted {
    /// Update flag, when the path exists.
    pub update: Option<bool>,
    /// Dedup key, empty when the path is missing or the payload is not JSON.
    pub value: String,
}

/// Extract the dedup key and update flag from a raw payload.
pub fn extract(payload: &[u8], inspect: &str, update_flag: Option<&str>) -> Extracted {
    let Ok(doc) = serde_json::from_slice::<Value>(payload) else {
        return Extracted::default();
    };

    Extracted {
        update: update_flag.and_then(|path| lookup(&doc, path)).map(as_bool),
        value: lookup(&doc, inspect).map(as_string).unwrap_or_default(),
    }
}
