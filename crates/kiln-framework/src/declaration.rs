//! Argument declaration parsing.
//!
//! A definition string such as `greet <name:string> [times:integer] -l`
//! carries three kinds of declarations:
//!
//! | Form              | Meaning                               |
//! |-------------------|---------------------------------------|
//! | `<name:type>`     | required positional argument          |
//! | `[name:type]`     | optional positional argument          |
//! | `<...name:type>`  | variadic (collects remaining tokens)  |
//! | `-x`, `--flag`    | boolean flag outside any brackets     |
//!
//! The type defaults to `string`, or `boolean` when the bracketed name starts
//! with `-`. Parsing returns angled declarations first, then square ones, then
//! bare flags. Only a positional declaration may be variadic, and a variadic
//! one must be the only positional declaration of its definition.

use std::fmt;

use serde_json::Value;

use crate::error::{DefinitionError, FrameworkResult};

// ============================================================================
// Argument types
// ============================================================================

/// The value type of a declared argument or option.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ArgType {
    String,
    /// Greedy string: consumes the rest of the input, whitespace included.
    Text,
    Number,
    Integer,
    Boolean,
    /// A type name Kiln has no parser for. Values are kept as strings.
    Custom(String),
}

impl ArgType {
    pub fn parse(name: &str) -> Self {
        match name {
            "string" => Self::String,
            "text" => Self::Text,
            "number" => Self::Number,
            "integer" | "int" => Self::Integer,
            "boolean" | "bool" => Self::Boolean,
            other => Self::Custom(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::String => "string",
            Self::Text => "text",
            Self::Number => "number",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Custom(name) => name,
        }
    }

    /// Whether a value of this type swallows every remaining token.
    pub fn is_greedy(&self) -> bool {
        matches!(self, Self::Text)
    }

    /// Converts a raw token into a JSON value of this type.
    pub fn convert(&self, raw: &str) -> Result<Value, String> {
        match self {
            Self::String | Self::Text | Self::Custom(_) => Ok(Value::String(raw.to_string())),
            Self::Number => raw
                .parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
                .ok_or_else(|| format!("\"{raw}\" is not a number")),
            Self::Integer => raw
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| format!("\"{raw}\" is not an integer")),
            Self::Boolean => match raw {
                "true" | "1" | "yes" | "on" => Ok(Value::Bool(true)),
                "false" | "0" | "no" | "off" => Ok(Value::Bool(false)),
                _ => Err(format!("\"{raw}\" is not a boolean")),
            },
        }
    }
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Declaration
// ============================================================================

/// One declared argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Declaration {
    pub name: String,
    pub ty: ArgType,
    pub required: bool,
    pub variadic: bool,
}

impl Declaration {
    /// A boolean flag such as `-l` or `--loud`.
    pub fn flag(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ArgType::Boolean,
            required: false,
            variadic: false,
        }
    }

    /// Whether this declaration names a flag rather than a positional slot.
    pub fn is_flag(&self) -> bool {
        self.name.starts_with('-')
    }

    /// Parses the text between a pair of brackets.
    fn from_inner(inner: &str, required: bool) -> Self {
        let (variadic, inner) = match inner.strip_prefix("...") {
            Some(rest) => (true, rest),
            None => (false, inner),
        };
        let (name, ty) = match inner.split_once(':') {
            Some((name, ty)) => (name.trim(), Some(ty.trim())),
            None => (inner.trim(), None),
        };
        let ty = match ty {
            Some(ty) if !ty.is_empty() => ArgType::parse(ty),
            _ if name.starts_with('-') => ArgType::Boolean,
            _ => ArgType::String,
        };
        Self {
            name: name.to_string(),
            ty,
            required,
            variadic,
        }
    }
}

impl fmt::Display for Declaration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (open, close) = if self.required { ('<', '>') } else { ('[', ']') };
        let dots = if self.variadic { "..." } else { "" };
        write!(f, "{open}{dots}{}:{}{close}", self.name, self.ty)
    }
}

/// Renders declarations back into their bracket form, space separated.
pub fn render_declarations(decls: &[Declaration]) -> String {
    decls
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

// ============================================================================
// Parsing
// ============================================================================

/// Parses every declaration in `source`.
pub fn parse_declarations(source: &str) -> FrameworkResult<Vec<Declaration>> {
    let mut decls = scan_brackets(source, '<', '>', true)?;
    decls.extend(scan_brackets(source, '[', ']', false)?);
    decls.extend(scan_flags(source));

    if let Some(empty) = decls.iter().find(|d| d.name.trim_start_matches('-').is_empty()) {
        return Err(DefinitionError::invalid(
            source,
            format!("declaration \"{empty}\" has no name"),
        ));
    }
    if decls.iter().any(|d| d.variadic && d.is_flag()) {
        return Err(DefinitionError::invalid(source, "flags cannot be variadic"));
    }
    let positional = decls.iter().filter(|d| !d.is_flag()).count();
    if let Some(variadic) = decls.iter().find(|d| d.variadic)
        && positional > 1
    {
        return Err(DefinitionError::invalid(
            source,
            format!(
                "variadic argument \"{}\" must be the only positional argument",
                variadic.name
            ),
        ));
    }
    Ok(decls)
}

/// The command name of a definition string: everything before the first
/// bracket, trimmed.
pub fn signature_name(source: &str) -> &str {
    let end = source.find(['<', '[']).unwrap_or(source.len());
    source[..end].trim()
}

fn scan_brackets(
    source: &str,
    open: char,
    close: char,
    required: bool,
) -> FrameworkResult<Vec<Declaration>> {
    let mut out = Vec::new();
    let mut rest = source;
    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len_utf8()..];
        let end = after
            .find(close)
            .ok_or_else(|| DefinitionError::invalid(source, format!("unterminated `{open}`")))?;
        let inner = after[..end].trim();
        if inner.is_empty() {
            return Err(DefinitionError::invalid(source, "empty declaration"));
        }
        out.push(Declaration::from_inner(inner, required));
        rest = &after[end + close.len_utf8()..];
    }
    Ok(out)
}

/// Collects `-x` / `--flag` words that sit outside any bracket pair.
fn scan_flags(source: &str) -> Vec<Declaration> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut word = String::new();
    fn flush(word: &mut String, out: &mut Vec<Declaration>) {
        if word.starts_with('-') && !word.trim_start_matches('-').is_empty() {
            out.push(Declaration::flag(word.as_str()));
        }
        word.clear();
    }

    for ch in source.chars() {
        match ch {
            '<' | '[' => {
                flush(&mut word, &mut out);
                depth += 1;
            }
            '>' | ']' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() => flush(&mut word, &mut out),
            c if depth == 0 => word.push(c),
            _ => {}
        }
    }
    flush(&mut word, &mut out);
    out
}
