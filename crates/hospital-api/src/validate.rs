/// Input validation and sanitation for public form submissions.
///
/// Everything here is pure. The submission pipeline composes these in a fixed order:
/// structural checks, string sanitation, then per-file checks during upload.
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const MAX_FORM_DEPTH: usize = 10;
pub const MAX_FORM_BYTES: usize = 1024 * 1024;

const MAX_FILE_NAME_LEN: usize = 255;
const MAX_KEY_LEN: usize = 100;
const SHORT_TEXT_MAX: usize = 500;
const LONG_TEXT_MAX: usize = 5000;

/// Fields that hold free text typed by the visitor.
const LONG_TEXT_FIELDS: &[&str] = &[
    "query",
    "condition",
    "message",
    "coverLetter",
    "comments",
    "description",
    "additionalInfo",
];

const ALLOWED_MIME_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "image/jpeg",
    "image/png",
    "image/webp",
];

const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "jpg", "jpeg", "png", "webp"];

static UNSAFE_FILE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-zA-Z0-9._-]").expect("valid regex"));
static DOT_RUNS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\.{2,}").expect("valid regex"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("file is empty")]
    EmptyFile,

    #[error("file size {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    #[error("file type {0} is not allowed")]
    MimeNotAllowed(String),

    #[error("file extension of {0} is not allowed")]
    ExtensionNotAllowed(String),

    #[error("form data is nested deeper than {max} levels")]
    TooDeep { max: usize },

    #[error("form data exceeds {max} bytes")]
    TooLarge { max: usize },
}

pub fn validate_file_size(size: u64) -> Result<(), ValidationError> {
    if size == 0 {
        return Err(ValidationError::EmptyFile);
    }
    if size > MAX_FILE_SIZE {
        return Err(ValidationError::FileTooLarge {
            size,
            max: MAX_FILE_SIZE,
        });
    }
    Ok(())
}

/// Both the declared MIME type and the name's extension must be allow-listed. A
/// spoofed `Content-Type` on an `.exe` fails the second check.
pub fn validate_file_type(mime_type: &str, file_name: &str) -> Result<(), ValidationError> {
    let mime = mime_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    if !ALLOWED_MIME_TYPES.contains(&mime.as_str()) {
        return Err(ValidationError::MimeNotAllowed(mime_type.to_string()));
    }

    let extension = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
        return Err(ValidationError::ExtensionNotAllowed(file_name.to_string()));
    }
    Ok(())
}

/// Make a name safe to embed in a storage key: only `[a-zA-Z0-9._-]`, no `..`, no
/// leading dot.
pub fn sanitize_file_name(name: &str) -> String {
    let replaced = UNSAFE_FILE_CHARS.replace_all(name, "_");
    let collapsed = DOT_RUNS.replace_all(&replaced, ".");
    let trimmed = collapsed.trim_start_matches('.');
    let capped: String = trimmed.chars().take(MAX_FILE_NAME_LEN).collect();
    if capped.is_empty() {
        "file".to_string()
    } else {
        capped
    }
}

/// Strip ASCII control characters (0x00-0x1F, 0x7F), trim, and cap at `max_len` chars.
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    let cleaned: String = input
        .chars()
        .filter(|c| !matches!(*c, '\u{0}'..='\u{1f}' | '\u{7f}'))
        .collect();
    cleaned.trim().chars().take(max_len).collect()
}

/// Reject payloads nested deeper than [`MAX_FORM_DEPTH`] or larger than
/// [`MAX_FORM_BYTES`] once serialized. Attachment payloads are not counted toward the
/// size; they are bounded per file.
pub fn validate_form_data(data: &Value) -> Result<(), ValidationError> {
    if depth(data) > MAX_FORM_DEPTH {
        return Err(ValidationError::TooDeep {
            max: MAX_FORM_DEPTH,
        });
    }
    if encoded_len(data) > MAX_FORM_BYTES {
        return Err(ValidationError::TooLarge {
            max: MAX_FORM_BYTES,
        });
    }
    Ok(())
}

/// An object the browser built from an `<input type="file">`: `_isFile: true` plus a
/// base64 payload.
pub fn is_file_descriptor(map: &Map<String, Value>) -> bool {
    map.get("_isFile").and_then(Value::as_bool) == Some(true)
        && map.get("base64").is_some_and(Value::is_string)
}

/// Sanitize every string in a form payload, recursing through objects and arrays.
pub fn sanitize_form_value(value: Value) -> Value {
    sanitize_value(value, SHORT_TEXT_MAX)
}

fn sanitize_value(value: Value, limit: usize) -> Value {
    match value {
        Value::String(s) => Value::String(sanitize_string(&s, limit)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| sanitize_value(item, limit))
                .collect(),
        ),
        Value::Object(map) => Value::Object(sanitize_object(map)),
        other => other,
    }
}

/// Keys that sanitize to an existing key are dropped. Keys that were already clean win.
fn sanitize_object(map: Map<String, Value>) -> Map<String, Value> {
    let file = is_file_descriptor(&map);
    let mut out = Map::new();
    let mut altered = Vec::new();
    for (key, value) in map {
        let clean = sanitize_string(&key, MAX_KEY_LEN);
        if clean == key {
            out.insert(key, value);
        } else {
            altered.push((clean, value));
        }
    }
    for (key, value) in altered {
        if out.contains_key(&key) {
            continue;
        }
        out.insert(key, value);
    }
    out.into_iter()
        .map(|(key, value)| {
            if file && key == "base64" {
                return (key, value);
            }
            let limit = field_limit(&key);
            (key, sanitize_value(value, limit))
        })
        .collect()
}

fn field_limit(key: &str) -> usize {
    if LONG_TEXT_FIELDS.contains(&key) {
        LONG_TEXT_MAX
    } else {
        SHORT_TEXT_MAX
    }
}

/// Scalars are depth 0; each enclosing object or array adds one.
fn depth(value: &Value) -> usize {
    match value {
        Value::Object(map) => 1 + map.values().map(depth).max().unwrap_or(0),
        Value::Array(items) => 1 + items.iter().map(depth).max().unwrap_or(0),
        _ => 0,
    }
}

/// Length of the compact JSON encoding, with attachment payloads counted as `""`.
fn encoded_len(value: &Value) -> usize {
    match value {
        Value::Object(map) => {
            let skip_payload = is_file_descriptor(map);
            let fields: usize = map
                .iter()
                .map(|(key, v)| {
                    let value_len = if skip_payload && key == "base64" {
                        2
                    } else {
                        encoded_len(v)
                    };
                    json_string_len(key) + 1 + value_len
                })
                .sum();
            2 + fields + map.len().saturating_sub(1)
        }
        Value::Array(items) => {
            2 + items.iter().map(encoded_len).sum::<usize>() + items.len().saturating_sub(1)
        }
        Value::String(s) => json_string_len(s),
        other => other.to_string().len(),
    }
}

fn json_string_len(s: &str) -> usize {
    serde_json::to_string(s)
        .map(|encoded| encoded.len())
        .unwrap_or(s.len() + 2)
}
