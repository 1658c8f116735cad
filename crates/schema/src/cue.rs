//! Tolerant scanner for the top-level `parameter` field of a CUE template.
//!
//! This is not a CUE evaluator. It understands the declaration shapes used in
//! capability templates (scalar kinds, `*default | T`, literal enums, `?`
//! optional fields, `[...T]`, `[string]: T`, nested structs, `close({..})`
//! and `// +usage=` comments) and treats everything else as unconstrained.

use serde_json::{json, Map, Value as Json};

use crate::SchemaDerivationError;

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(String),
    Punct(char),
    Ellipsis,
    Comment(String),
    Newline,
}

#[derive(Debug, Clone)]
struct Token {
    tok: Tok,
    offset: usize,
}

fn parse_err(offset: usize, reason: impl Into<String>) -> SchemaDerivationError {
    SchemaDerivationError::Parse { offset, reason: reason.into() }
}

fn is_ident_start(c: char) -> bool { c.is_alphabetic() || c == '_' || c == '#' || c == '$' }
fn is_ident_char(c: char) -> bool { c.is_alphanumeric() || c == '_' || c == '#' || c == '$' }

fn lex(src: &str) -> Result<Vec<Token>, SchemaDerivationError> {
    let mut out = Vec::new();
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut i = 0;
    while i < chars.len() {
        let (off, c) = chars[i];
        let next = chars.get(i + 1).map(|x| x.1);
        match c {
            '\n' => { out.push(Token { tok: Tok::Newline, offset: off }); i += 1; }
            c if c.is_whitespace() => i += 1,
            '/' if next == Some('/') => {
                let mut j = i + 2;
                let mut text = String::new();
                while j < chars.len() && chars[j].1 != '\n' { text.push(chars[j].1); j += 1; }
                out.push(Token { tok: Tok::Comment(text.trim().to_string()), offset: off });
                i = j;
            }
            '"' | '\'' => {
                let quote = c;
                let multiline = chars.get(i + 1).map(|x| x.1) == Some(quote) && chars.get(i + 2).map(|x| x.1) == Some(quote);
                let mut j = if multiline { i + 3 } else { i + 1 };
                let mut text = String::new();
                loop {
                    let Some(&(_, ch)) = chars.get(j) else {
                        return Err(parse_err(off, "unterminated string literal"));
                    };
                    if ch == '\\' {
                        if let Some(&(_, esc)) = chars.get(j + 1) {
                            text.push(match esc { 'n' => '\n', 't' => '\t', other => other });
                        }
                        j += 2;
                        continue;
                    }
                    if multiline {
                        if ch == quote && chars.get(j + 1).map(|x| x.1) == Some(quote) && chars.get(j + 2).map(|x| x.1) == Some(quote) {
                            j += 3;
                            break;
                        }
                    } else if ch == quote {
                        j += 1;
                        break;
                    } else if ch == '\n' {
                        return Err(parse_err(off, "newline in string literal"));
                    }
                    text.push(ch);
                    j += 1;
                }
                out.push(Token { tok: Tok::Str(text), offset: off });
                i = j;
            }
            '.' if next == Some('.') && chars.get(i + 2).map(|x| x.1) == Some('.') => {
                out.push(Token { tok: Tok::Ellipsis, offset: off });
                i += 3;
            }
            c if c.is_ascii_digit() => {
                let mut j = i;
                let mut text = String::new();
                while j < chars.len() && (chars[j].1.is_ascii_alphanumeric() || chars[j].1 == '.' || chars[j].1 == '_') {
                    text.push(chars[j].1);
                    j += 1;
                }
                out.push(Token { tok: Tok::Num(text), offset: off });
                i = j;
            }
            c if is_ident_start(c) => {
                let mut j = i;
                let mut text = String::new();
                while j < chars.len() && is_ident_char(chars[j].1) { text.push(chars[j].1); j += 1; }
                // `_|_` (bottom) lexes as one identifier.
                if text == "_" && chars.get(j).map(|x| x.1) == Some('|') && chars.get(j + 1).map(|x| x.1) == Some('_') {
                    text.push_str("|_");
                    j += 2;
                }
                out.push(Token { tok: Tok::Ident(text), offset: off });
                i = j;
            }
            other => { out.push(Token { tok: Tok::Punct(other), offset: off }); i += 1; }
        }
    }
    Ok(out)
}

/// One alternative of a disjunction.
enum Term {
    Type(Json),
    Literal(Json),
    Ignored,
}

/// Deepest value nesting accepted before giving up on a template.
const MAX_DEPTH: usize = 128;

struct Parser {
    toks: Vec<Token>,
    pos: usize,
    end: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> { self.toks.get(self.pos).map(|t| &t.tok) }
    fn peek_at(&self, n: usize) -> Option<&Tok> { self.toks.get(self.pos + n).map(|t| &t.tok) }
    fn offset(&self) -> usize { self.toks.get(self.pos).map(|t| t.offset).unwrap_or(self.end) }
    fn bump(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).map(|t| t.tok.clone());
        self.pos += 1;
        t
    }
    fn is_punct(&self, c: char) -> bool { self.peek() == Some(&Tok::Punct(c)) }

    fn skip_newlines(&mut self) {
        while matches!(self.peek(), Some(Tok::Newline) | Some(Tok::Comment(_))) { self.pos += 1; }
    }

    fn expect(&mut self, c: char) -> Result<(), SchemaDerivationError> {
        if self.is_punct(c) {
            self.pos += 1;
            Ok(())
        } else {
            Err(parse_err(self.offset(), format!("expected `{}`", c)))
        }
    }

    /// Consume the rest of a declaration. Stops before a closer of the enclosing block.
    fn skip_clause(&mut self) -> Result<(), SchemaDerivationError> {
        let mut depth = 0usize;
        let start = self.offset();
        loop {
            match self.peek() {
                None => {
                    if depth > 0 { return Err(parse_err(start, "unbalanced brackets")); }
                    return Ok(());
                }
                Some(Tok::Newline) | Some(Tok::Punct(',')) if depth == 0 => { self.pos += 1; return Ok(()); }
                Some(Tok::Punct('}')) | Some(Tok::Punct(']')) | Some(Tok::Punct(')')) if depth == 0 => return Ok(()),
                Some(Tok::Punct('{')) | Some(Tok::Punct('[')) | Some(Tok::Punct('(')) => { depth += 1; self.pos += 1; }
                Some(Tok::Punct('}')) | Some(Tok::Punct(']')) | Some(Tok::Punct(')')) => { depth -= 1; self.pos += 1; }
                _ => self.pos += 1,
            }
        }
    }

    /// Parse declarations up to the matching `}` (or end of input when `closed` is false).
    fn parse_struct(&mut self, closed: bool) -> Result<Json, SchemaDerivationError> {
        let open_at = self.offset();
        let mut props = Map::new();
        let mut required: Vec<Json> = Vec::new();
        let mut additional: Option<Json> = None;
        let mut docs: Vec<String> = Vec::new();
        let mut blank = false;
        loop {
            match self.peek().cloned() {
                None => {
                    if closed { return Err(parse_err(open_at, "unterminated struct")); }
                    break;
                }
                Some(Tok::Punct('}')) if closed => { self.pos += 1; break; }
                Some(Tok::Newline) => {
                    if blank { docs.clear(); }
                    blank = true;
                    self.pos += 1;
                    continue;
                }
                Some(Tok::Punct(',')) => { self.pos += 1; }
                Some(Tok::Comment(text)) => { docs.push(text); self.pos += 1; }
                Some(Tok::Punct('[')) if self.looks_like_pattern() => {
                    self.pos += 4;
                    let (schema, _) = self.parse_value()?;
                    additional = Some(schema);
                    self.skip_clause()?;
                    docs.clear();
                }
                Some(Tok::Ident(label)) | Some(Tok::Str(label)) if self.looks_like_field() => {
                    let quoted = matches!(self.peek(), Some(Tok::Str(_)));
                    self.pos += 1;
                    let optional = self.is_punct('?');
                    if optional || self.is_punct('!') { self.pos += 1; }
                    self.expect(':')?;
                    let (mut schema, default) = self.parse_value()?;
                    self.skip_clause()?;
                    let hidden = !quoted && (label.starts_with('_') || label.starts_with('#'));
                    if !hidden {
                        if let Some(d) = describe(&docs) {
                            if let Some(obj) = schema.as_object_mut() { obj.insert("description".into(), Json::String(d)); }
                        }
                        if let Some(d) = &default {
                            if let Some(obj) = schema.as_object_mut() { obj.insert("default".into(), d.clone()); }
                        }
                        if !optional && default.is_none() && !required.contains(&Json::String(label.clone())) {
                            required.push(Json::String(label.clone()));
                        }
                        props.insert(label, schema);
                    }
                    docs.clear();
                }
                Some(_) => {
                    let before = self.pos;
                    self.skip_clause()?;
                    if self.pos == before { self.pos += 1; }
                    docs.clear();
                }
            }
            blank = false;
        }
        let mut obj = Map::new();
        obj.insert("type".into(), json!("object"));
        if !props.is_empty() || additional.is_none() {
            obj.insert("properties".into(), Json::Object(props));
        }
        if !required.is_empty() {
            obj.insert("required".into(), Json::Array(required));
        }
        if let Some(a) = additional {
            obj.insert("additionalProperties".into(), a);
        }
        Ok(Json::Object(obj))
    }

    fn looks_like_field(&self) -> bool {
        match (self.peek_at(1), self.peek_at(2)) {
            (Some(Tok::Punct(':')), _) => true,
            (Some(Tok::Punct('?')), Some(Tok::Punct(':'))) | (Some(Tok::Punct('!')), Some(Tok::Punct(':'))) => true,
            _ => false,
        }
    }

    /// `[ident]: ...`
    fn looks_like_pattern(&self) -> bool {
        matches!(
            (self.peek(), self.peek_at(1), self.peek_at(2), self.peek_at(3)),
            (Some(Tok::Punct('[')), Some(Tok::Ident(_)), Some(Tok::Punct(']')), Some(Tok::Punct(':')))
        )
    }

    /// A value: disjunction of conjunctions. Returns the schema and the marked default.
    fn parse_value(&mut self) -> Result<(Json, Option<Json>), SchemaDerivationError> {
        if self.depth >= MAX_DEPTH {
            return Err(parse_err(self.offset(), "nesting too deep"));
        }
        self.depth += 1;
        let out = self.parse_disjunction();
        self.depth -= 1;
        out
    }

    fn parse_disjunction(&mut self) -> Result<(Json, Option<Json>), SchemaDerivationError> {
        let mut types: Vec<Json> = Vec::new();
        let mut literals: Vec<Json> = Vec::new();
        let mut default: Option<Json> = None;
        loop {
            let starred = self.is_punct('*');
            if starred { self.pos += 1; }
            let mut term = self.parse_term()?;
            while self.is_punct('&') {
                self.pos += 1;
                let rhs = self.parse_term()?;
                if matches!(term, Term::Ignored) { term = rhs; }
            }
            match term {
                Term::Type(t) => types.push(t),
                Term::Literal(v) => {
                    if starred { default = Some(v.clone()); }
                    literals.push(v);
                }
                Term::Ignored => {}
            }
            if self.is_punct('|') {
                self.pos += 1;
                self.skip_newlines();
                continue;
            }
            break;
        }
        let schema = match (types.len(), literals.len()) {
            (0, 0) => json!({}),
            (0, _) => {
                let mut obj = Map::new();
                if let Some(t) = json_type(&literals[0]) {
                    if literals.iter().all(|l| json_type(l) == Some(t)) {
                        obj.insert("type".into(), json!(t));
                    }
                }
                if literals.len() > 1 || default.is_none() {
                    obj.insert("enum".into(), Json::Array(literals));
                }
                Json::Object(obj)
            }
            (1, _) => types.remove(0),
            _ => {
                if types.iter().all(|t| t == &types[0]) { types.remove(0) } else { json!({ "anyOf": types }) }
            }
        };
        Ok((schema, default))
    }

    fn parse_term(&mut self) -> Result<Term, SchemaDerivationError> {
        let Some(tok) = self.peek().cloned() else {
            return Err(parse_err(self.end, "unexpected end of template"));
        };
        match tok {
            Tok::Ident(id) => {
                // `a: b: T` shorthand
                if matches!(self.peek_at(1), Some(Tok::Punct(':'))) || (matches!(self.peek_at(1), Some(Tok::Punct('?'))) && matches!(self.peek_at(2), Some(Tok::Punct(':')))) {
                    let mut p = self.sub_struct_until_line_end();
                    return Ok(Term::Type(p.parse_struct(false)?));
                }
                self.pos += 1;
                if id == "close" && self.is_punct('(') {
                    self.pos += 1;
                    self.skip_newlines();
                    let inner = self.parse_value()?.0;
                    self.skip_newlines();
                    self.expect(')')?;
                    return Ok(Term::Type(inner));
                }
                self.skip_selectors()?;
                Ok(scalar_kind(&id))
            }
            Tok::Str(s) => {
                self.pos += 1;
                Ok(Term::Literal(Json::String(s)))
            }
            Tok::Num(n) => {
                self.pos += 1;
                Ok(number_literal(&n, false))
            }
            Tok::Punct('-') if matches!(self.peek_at(1), Some(Tok::Num(_))) => {
                self.pos += 1;
                let Some(Tok::Num(n)) = self.bump() else { return Ok(Term::Ignored) };
                Ok(number_literal(&n, true))
            }
            Tok::Punct('{') => {
                self.pos += 1;
                Ok(Term::Type(self.parse_struct(true)?))
            }
            Tok::Punct('[') => {
                if self.looks_like_pattern() {
                    self.pos += 4;
                    let (item, _) = self.parse_value()?;
                    return Ok(Term::Type(json!({ "type": "object", "additionalProperties": item })));
                }
                self.pos += 1;
                self.parse_list()
            }
            Tok::Punct('(') => {
                self.pos += 1;
                self.skip_newlines();
                let (inner, _) = self.parse_value()?;
                self.skip_newlines();
                self.expect(')')?;
                Ok(Term::Type(inner))
            }
            Tok::Punct(c) if matches!(c, '>' | '<' | '=' | '!') => {
                while matches!(self.peek(), Some(Tok::Punct('>' | '<' | '=' | '!' | '~'))) { self.pos += 1; }
                if matches!(self.peek(), Some(Tok::Punct('-'))) { self.pos += 1; }
                if matches!(self.peek(), Some(Tok::Num(_) | Tok::Str(_) | Tok::Ident(_))) { self.pos += 1; }
                Ok(Term::Ignored)
            }
            _ => Ok(Term::Ignored),
        }
    }

    /// Skip `.field`, `[expr]` and `(args)` after a reference.
    fn skip_selectors(&mut self) -> Result<(), SchemaDerivationError> {
        loop {
            if self.is_punct('.') && matches!(self.peek_at(1), Some(Tok::Ident(_))) {
                self.pos += 2;
            } else if self.is_punct('(') {
                self.skip_balanced('(', ')')?;
            } else {
                return Ok(());
            }
        }
    }

    fn skip_balanced(&mut self, open: char, close: char) -> Result<(), SchemaDerivationError> {
        let start = self.offset();
        let mut depth = 0usize;
        while let Some(t) = self.bump() {
            if t == Tok::Punct(open) { depth += 1; }
            if t == Tok::Punct(close) {
                depth -= 1;
                if depth == 0 { return Ok(()); }
            }
        }
        Err(parse_err(start, format!("unbalanced `{}`", open)))
    }

    /// Tokens of a `a: b: T` chain up to the end of the current declaration,
    /// handed to a nested parser.
    fn sub_struct_until_line_end(&mut self) -> Parser {
        let start = self.pos;
        let mut depth = 0usize;
        while let Some(t) = self.peek() {
            match t {
                Tok::Newline | Tok::Punct(',') if depth == 0 => break,
                Tok::Punct('}') | Tok::Punct(']') | Tok::Punct(')') if depth == 0 => break,
                Tok::Punct('{') | Tok::Punct('[') | Tok::Punct('(') => depth += 1,
                Tok::Punct('}') | Tok::Punct(']') | Tok::Punct(')') => depth -= 1,
                _ => {}
            }
            self.pos += 1;
        }
        let end = self.offset();
        Parser { toks: self.toks[start..self.pos].to_vec(), pos: 0, end, depth: self.depth }
    }

    fn parse_list(&mut self) -> Result<Term, SchemaDerivationError> {
        let mut items: Option<Json> = None;
        let mut literals: Vec<Json> = Vec::new();
        let mut all_literal = true;
        loop {
            self.skip_newlines();
            match self.peek() {
                None => return Err(parse_err(self.end, "unterminated list")),
                Some(Tok::Punct(']')) => { self.pos += 1; break; }
                Some(Tok::Punct(',')) => { self.pos += 1; }
                Some(Tok::Ellipsis) => {
                    self.pos += 1;
                    all_literal = false;
                    if !self.is_punct(']') {
                        let (t, _) = self.parse_value()?;
                        items.get_or_insert(t);
                    } else {
                        items.get_or_insert(json!({}));
                    }
                }
                Some(_) => {
                    let before = self.pos;
                    let starred = self.is_punct('*');
                    let (schema, default) = self.parse_value()?;
                    if self.pos == before { self.pos += 1; }
                    match default.filter(|_| starred) {
                        Some(v) => literals.push(v),
                        None if schema.get("enum").and_then(|e| e.as_array()).map_or(false, |e| e.len() == 1) => {
                            literals.push(schema["enum"][0].clone());
                        }
                        None => {
                            all_literal = false;
                            items.get_or_insert(schema);
                        }
                    }
                }
            }
        }
        if all_literal {
            return Ok(Term::Literal(Json::Array(literals)));
        }
        Ok(Term::Type(json!({ "type": "array", "items": items.unwrap_or_else(|| json!({})) })))
    }
}

fn scalar_kind(id: &str) -> Term {
    match id {
        "string" | "bytes" => Term::Type(json!({ "type": "string" })),
        "bool" => Term::Type(json!({ "type": "boolean" })),
        "int" | "int8" | "int16" | "int32" | "int64" | "uint" | "uint8" | "uint16" | "uint32" | "uint64" => {
            Term::Type(json!({ "type": "integer" }))
        }
        "float" | "float32" | "float64" | "number" => Term::Type(json!({ "type": "number" })),
        "true" => Term::Literal(Json::Bool(true)),
        "false" => Term::Literal(Json::Bool(false)),
        "null" => Term::Literal(Json::Null),
        "_|_" => Term::Ignored,
        _ => Term::Type(json!({})),
    }
}

fn number_literal(n: &str, negative: bool) -> Term {
    let text = if negative { format!("-{}", n.replace('_', "")) } else { n.replace('_', "") };
    match serde_json::from_str::<Json>(&text) {
        Ok(v @ Json::Number(_)) => Term::Literal(v),
        _ => Term::Type(json!({})),
    }
}

fn json_type(v: &Json) -> Option<&'static str> {
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

fn describe(docs: &[String]) -> Option<String> {
    if let Some(u) = docs.iter().find_map(|d| d.strip_prefix("+usage=")) {
        return Some(u.trim().to_string());
    }
    let plain: Vec<&str> = docs.iter().map(String::as_str).filter(|d| !d.starts_with('+') && !d.is_empty()).collect();
    if plain.is_empty() { None } else { Some(plain.join(" ")) }
}

/// Translate the top-level `parameter` field of `template` into a JSON-Schema-shaped
/// document. `Ok(None)` when the template declares no parameter.
pub fn parameter_schema(template: &str) -> Result<Option<Json>, SchemaDerivationError> {
    let toks = lex(template)?;
    let end = template.len();
    let mut depth = 0i64;
    let mut line_start = true;
    let mut i = 0;
    while i < toks.len() {
        match &toks[i].tok {
            Tok::Punct('{') | Tok::Punct('[') | Tok::Punct('(') => depth += 1,
            Tok::Punct('}') | Tok::Punct(']') | Tok::Punct(')') => {
                depth -= 1;
                if depth < 0 { return Err(parse_err(toks[i].offset, "unbalanced closing bracket")); }
            }
            Tok::Ident(id) | Tok::Str(id) if depth == 0 && line_start && id == "parameter" => {
                let colon = match toks.get(i + 1).map(|t| &t.tok) {
                    Some(Tok::Punct(':')) => Some(i + 2),
                    Some(Tok::Punct('?')) | Some(Tok::Punct('!')) if matches!(toks.get(i + 2).map(|t| &t.tok), Some(Tok::Punct(':'))) => Some(i + 3),
                    _ => None,
                };
                if let Some(start) = colon {
                    let mut p = Parser { toks: toks.clone(), pos: start, end, depth: 0 };
                    let (schema, _) = p.parse_value()?;
                    return Ok(Some(schema));
                }
            }
            _ => {}
        }
        line_start = matches!(toks[i].tok, Tok::Newline | Tok::Punct(',') | Tok::Comment(_));
        i += 1;
    }
    if depth != 0 {
        return Err(parse_err(end, "unbalanced brackets"));
    }
    Ok(None)
}
