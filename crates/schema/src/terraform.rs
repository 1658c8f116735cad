//! `variable "x" { ... }` blocks of an inline HCL configuration, as a parameter schema.

use serde_json::{json, Map, Value as Json};

use crate::SchemaDerivationError;

fn parse_err(offset: usize, reason: impl Into<String>) -> SchemaDerivationError {
    SchemaDerivationError::Parse { offset, reason: reason.into() }
}

/// Blank out `#`, `//` and `/* */` comments, keeping byte offsets and newlines.
fn strip_comments(src: &str) -> Result<String, SchemaDerivationError> {
    let b = src.as_bytes();
    let mut out = b.to_vec();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'"' => {
                let start = i;
                i += 1;
                loop {
                    match b.get(i) {
                        None | Some(b'\n') => return Err(parse_err(start, "unterminated string literal")),
                        Some(b'\\') => i += 2,
                        Some(b'"') => { i += 1; break; }
                        Some(_) => i += 1,
                    }
                }
            }
            b'#' => {
                while i < b.len() && b[i] != b'\n' { out[i] = b' '; i += 1; }
            }
            b'/' if b.get(i + 1) == Some(&b'/') => {
                while i < b.len() && b[i] != b'\n' { out[i] = b' '; i += 1; }
            }
            b'/' if b.get(i + 1) == Some(&b'*') => {
                let start = i;
                while i < b.len() && !(b[i] == b'*' && b.get(i + 1) == Some(&b'/')) {
                    if b[i] != b'\n' { out[i] = b' '; }
                    i += 1;
                }
                if i >= b.len() { return Err(parse_err(start, "unterminated block comment")); }
                out[i] = b' ';
                out[i + 1] = b' ';
                i += 2;
            }
            _ => i += 1,
        }
    }
    String::from_utf8(out).map_err(|e| parse_err(e.utf8_error().valid_up_to(), "invalid utf-8"))
}

/// Index just past the bracket matching the opener at `open`.
fn matching(src: &str, open: usize) -> Result<usize, SchemaDerivationError> {
    let b = src.as_bytes();
    let mut depth = 0usize;
    let mut i = open;
    while i < b.len() {
        match b[i] {
            b'"' => {
                i += 1;
                while i < b.len() && b[i] != b'"' { if b[i] == b'\\' { i += 1; } i += 1; }
            }
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 { return Ok(i + 1); }
            }
            _ => {}
        }
        i += 1;
    }
    Err(parse_err(open, "unbalanced brackets"))
}

/// Split at top-level occurrences of any of `seps`, skipping strings and brackets.
fn split_top<'a>(text: &'a str, seps: &[u8]) -> Vec<&'a str> {
    let b = text.as_bytes();
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut start = 0;
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'"' => {
                i += 1;
                while i < b.len() && b[i] != b'"' { if b[i] == b'\\' { i += 1; } i += 1; }
            }
            b'{' | b'[' | b'(' => depth += 1,
            b'}' | b']' | b')' => depth -= 1,
            c if depth == 0 && seps.contains(&c) => {
                parts.push(&text[start..i]);
                start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    parts.push(&text[start..]);
    parts.into_iter().map(str::trim).filter(|p| !p.is_empty()).collect()
}

fn unquote(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// `key = value` (or `key: value`) pairs of a body; nested blocks are skipped.
fn attributes(body: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for item in split_top(body, b"\n,") {
        let Some(eq) = item.find(|c| c == '=' || c == ':') else { continue };
        let key = item[..eq].trim();
        let value = item[eq + 1..].trim();
        if key.is_empty() || value.is_empty() || key.contains(char::is_whitespace) { continue; }
        out.push((unquote(key).unwrap_or_else(|| key.to_string()), value.to_string()));
    }
    out
}

/// Deepest literal or type nesting accepted.
const MAX_DEPTH: usize = 128;

fn too_deep(at: usize, depth: usize) -> Result<(), SchemaDerivationError> {
    if depth >= MAX_DEPTH { Err(parse_err(at, "nesting too deep")) } else { Ok(()) }
}

/// HCL literal expression to JSON. Anything that is not a literal is `None`.
fn literal(expr: &str, at: usize, depth: usize) -> Result<Option<Json>, SchemaDerivationError> {
    too_deep(at, depth)?;
    let expr = expr.trim();
    if let Some(s) = unquote(expr) {
        return Ok(Some(Json::String(s)));
    }
    match expr {
        "true" => return Ok(Some(Json::Bool(true))),
        "false" => return Ok(Some(Json::Bool(false))),
        "null" => return Ok(Some(Json::Null)),
        _ => {}
    }
    if let Some(inner) = expr.strip_prefix('[').and_then(|e| e.strip_suffix(']')) {
        let mut items = Vec::new();
        for part in split_top(inner, b",\n") {
            let Some(v) = literal(part, at, depth + 1)? else { return Ok(None) };
            items.push(v);
        }
        return Ok(Some(Json::Array(items)));
    }
    if let Some(inner) = expr.strip_prefix('{').and_then(|e| e.strip_suffix('}')) {
        let mut obj = Map::new();
        for (k, v) in attributes(inner) {
            let Some(v) = literal(&v, at, depth + 1)? else { return Ok(None) };
            obj.insert(k, v);
        }
        return Ok(Some(Json::Object(obj)));
    }
    match serde_json::from_str::<Json>(expr) {
        Ok(n @ Json::Number(_)) => Ok(Some(n)),
        _ => Ok(None),
    }
}

/// HCL type constraint to a schema fragment.
fn type_schema(expr: &str, at: usize, depth: usize) -> Result<Json, SchemaDerivationError> {
    too_deep(at, depth)?;
    let expr = expr.trim();
    let expr = unquote(expr).unwrap_or_else(|| expr.to_string());
    let call = |name: &str| -> Option<String> {
        expr.strip_prefix(name)
            .map(str::trim_start)
            .and_then(|r| r.strip_prefix('('))
            .and_then(|r| r.strip_suffix(')'))
            .map(|r| r.trim().to_string())
    };
    match expr.as_str() {
        "string" => return Ok(json!({ "type": "string" })),
        "number" => return Ok(json!({ "type": "number" })),
        "bool" => return Ok(json!({ "type": "boolean" })),
        "list" | "set" | "tuple" => return Ok(json!({ "type": "array" })),
        "map" | "object" => return Ok(json!({ "type": "object" })),
        _ => {}
    }
    if let Some(inner) = call("list").or_else(|| call("set")) {
        return Ok(json!({ "type": "array", "items": type_schema(&inner, at, depth + 1)? }));
    }
    if call("tuple").is_some() {
        return Ok(json!({ "type": "array" }));
    }
    if let Some(inner) = call("map") {
        return Ok(json!({ "type": "object", "additionalProperties": type_schema(&inner, at, depth + 1)? }));
    }
    if let Some(inner) = call("object") {
        let fields = inner.strip_prefix('{').and_then(|r| r.strip_suffix('}')).unwrap_or("");
        let mut props = Map::new();
        for (k, v) in attributes(fields) {
            let ty = v.strip_prefix("optional(").and_then(|r| r.strip_suffix(')')).unwrap_or(&v);
            props.insert(k, type_schema(ty, at, depth + 1)?);
        }
        return Ok(json!({ "type": "object", "properties": props }));
    }
    Ok(json!({}))
}

pub(crate) fn infer_type(v: &Json) -> Option<&'static str> {
    match v {
        Json::String(_) => Some("string"),
        Json::Bool(_) => Some("boolean"),
        Json::Number(n) if n.is_i64() || n.is_u64() => Some("integer"),
        Json::Number(_) => Some("number"),
        Json::Array(_) => Some("array"),
        Json::Object(_) => Some("object"),
        Json::Null => None,
    }
}

/// Schema of the `variable` blocks in `configuration`; `Ok(None)` when there are none.
pub fn variables_schema(configuration: &str) -> Result<Option<Json>, SchemaDerivationError> {
    let src = strip_comments(configuration)?;
    let b = src.as_bytes();
    let mut props = Map::new();
    let mut required: Vec<Json> = Vec::new();
    let mut i = 0;
    while i < b.len() {
        match b[i] {
            b'"' => {
                i += 1;
                while i < b.len() && b[i] != b'"' { if b[i] == b'\\' { i += 1; } i += 1; }
                i += 1;
            }
            b'{' | b'[' | b'(' => i = matching(&src, i)?,
            b'}' | b']' | b')' => return Err(parse_err(i, "unbalanced closing bracket")),
            _ if b[i..].starts_with(b"variable") && (i == 0 || !is_word(b[i - 1])) => {
                let rest = &src[i + "variable".len()..];
                let after = rest.trim_start();
                let Some(name_end) = after.strip_prefix('"').and_then(|r| r.find('"')) else {
                    i += "variable".len();
                    continue;
                };
                let name = after[1..name_end + 1].to_string();
                let block_rel = after[name_end + 2..].trim_start();
                if !block_rel.starts_with('{') {
                    i += "variable".len();
                    continue;
                }
                let open = src.len() - block_rel.len();
                let close = matching(&src, open)?;
                let body = &src[open + 1..close - 1];
                let (schema, has_default) = variable_schema(body, open)?;
                if !has_default { required.push(Json::String(name.clone())); }
                props.insert(name, schema);
                i = close;
            }
            _ => i += 1,
        }
    }
    if props.is_empty() {
        return Ok(None);
    }
    let mut obj = Map::new();
    obj.insert("type".into(), json!("object"));
    obj.insert("properties".into(), Json::Object(props));
    if !required.is_empty() {
        obj.insert("required".into(), Json::Array(required));
    }
    Ok(Some(Json::Object(obj)))
}

fn is_word(c: u8) -> bool { c.is_ascii_alphanumeric() || c == b'_' || c == b'-' }

fn variable_schema(body: &str, at: usize) -> Result<(Json, bool), SchemaDerivationError> {
    let mut schema = Map::new();
    let mut default: Option<Json> = None;
    let mut has_default = false;
    for (key, value) in attributes(body) {
        match key.as_str() {
            "type" => {
                if let Json::Object(t) = type_schema(&value, at, 0)? { schema.extend(t); }
            }
            "default" => {
                has_default = true;
                default = literal(&value, at, 0)?;
            }
            "description" => {
                if let Some(d) = unquote(&value) { schema.insert("description".into(), Json::String(d)); }
            }
            _ => {}
        }
    }
    if let Some(d) = default {
        if !schema.contains_key("type") {
            if let Some(t) = infer_type(&d) { schema.insert("type".into(), json!(t)); }
        }
        schema.insert("default".into(), d);
    }
    Ok((Json::Object(schema), has_default))
}
