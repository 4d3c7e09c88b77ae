//! Command shortcuts.
//!
//! A shortcut lets a message reach a command without spelling its name. It is
//! either a literal word (optionally fuzzy, i.e. a prefix followed by extra
//! tokens) or a regular expression matched against the whole message. Either
//! form can carry canned positional values and option values; for patterns,
//! `$1`, `$2`, ... in string values are replaced by the matching capture.

use std::fmt;

use regex::Regex;
use serde_json::{Map, Value};

use crate::argv::shell_split;

/// What a shortcut reacts to.
#[derive(Debug, Clone)]
pub enum ShortcutTrigger {
    Literal(String),
    Pattern(Regex),
}

impl fmt::Display for ShortcutTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(text) => f.write_str(text),
            Self::Pattern(re) => write!(f, "/{}/", re.as_str()),
        }
    }
}

/// A shortcut and its canned values.
#[derive(Debug, Clone)]
pub struct Shortcut {
    pub trigger: ShortcutTrigger,
    /// For literal shortcuts: also match when the literal is only a prefix
    /// of the message, passing the remainder on as tokens.
    pub fuzzy: bool,
    pub args: Vec<Value>,
    pub options: Map<String, Value>,
}

/// A message that hit a shortcut during command lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShortcutHit {
    /// The name the command was reached by.
    pub name: Option<String>,
    pub tokens: Vec<String>,
}

impl Shortcut {
    pub fn literal(text: impl Into<String>) -> Self {
        Self::with_trigger(ShortcutTrigger::Literal(text.into()))
    }

    pub fn pattern(regex: Regex) -> Self {
        Self::with_trigger(ShortcutTrigger::Pattern(regex))
    }

    /// Compiles `pattern` into a pattern shortcut.
    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self::pattern(Regex::new(pattern)?))
    }

    fn with_trigger(trigger: ShortcutTrigger) -> Self {
        Self {
            trigger,
            fuzzy: false,
            args: Vec::new(),
            options: Map::new(),
        }
    }

    pub fn fuzzy(mut self) -> Self {
        self.fuzzy = true;
        self
    }

    /// Appends a canned positional value.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args.push(value.into());
        self
    }

    /// Sets a canned option value.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    /// Checks whether `text` reaches the command through this shortcut.
    pub(crate) fn lookup(&self, text: &str) -> Option<ShortcutHit> {
        let text = text.trim();
        match &self.trigger {
            ShortcutTrigger::Literal(literal) if text == literal => Some(ShortcutHit {
                name: Some(literal.clone()),
                tokens: Vec::new(),
            }),
            ShortcutTrigger::Literal(literal) if self.fuzzy => {
                let rest = text.strip_prefix(literal.as_str())?;
                if !rest.starts_with(char::is_whitespace) {
                    return None;
                }
                Some(ShortcutHit {
                    name: Some(literal.clone()),
                    tokens: shell_split(rest),
                })
            }
            ShortcutTrigger::Literal(_) => None,
            ShortcutTrigger::Pattern(re) => re.is_match(text).then(|| ShortcutHit {
                name: None,
                tokens: Vec::new(),
            }),
        }
    }

    pub(crate) fn is_literal(&self, name: &str) -> bool {
        matches!(&self.trigger, ShortcutTrigger::Literal(literal) if literal == name)
    }

    /// For pattern shortcuts, the captures of `text` (index 0 is the whole
    /// match).
    pub(crate) fn captures(&self, text: &str) -> Option<Vec<String>> {
        let ShortcutTrigger::Pattern(re) = &self.trigger else {
            return None;
        };
        let caps = re.captures(text)?;
        Some(
            caps.iter()
                .map(|m| m.map(|m| m.as_str().to_string()).unwrap_or_default())
                .collect(),
        )
    }
}

/// Substitutes `$n` placeholders in `template` with `captures[n]`.
///
/// Returns `None` when the template references none of the captures, so the
/// caller can tell canned literals from templated values.
pub(crate) fn substitute(template: &str, captures: &[String]) -> Option<String> {
    let mut used = false;
    let mut out = template.to_string();
    // Highest index first so `$1` never eats the prefix of `$10`.
    for (index, capture) in captures.iter().enumerate().skip(1).rev() {
        let placeholder = format!("${index}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, capture);
            used = true;
        }
    }
    used.then_some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_lookup() {
        let shortcut = Shortcut::literal("签到");
        assert!(shortcut.lookup("签到").is_some());
        assert!(shortcut.lookup("签到 now").is_none());
    }

    #[test]
    fn test_fuzzy_lookup_passes_rest_as_tokens() {
        let shortcut = Shortcut::literal("help").fuzzy();
        let hit = shortcut.lookup("help greet").unwrap();
        assert_eq!(hit.name.as_deref(), Some("help"));
        assert_eq!(hit.tokens, vec!["greet"]);
        assert!(shortcut.lookup("helper").is_none());
    }

    #[test]
    fn test_pattern_captures() {
        let shortcut = Shortcut::regex(r"^(\S+)签到$").unwrap();
        assert!(shortcut.lookup("小明签到").is_some());
        let caps = shortcut.captures("小明签到").unwrap();
        assert_eq!(caps[1], "小明");
    }

    #[test]
    fn test_substitute() {
        let caps = vec!["all".to_string(), "a".to_string(), "b".to_string()];
        assert_eq!(substitute("$1-$2", &caps).as_deref(), Some("a-b"));
        assert_eq!(substitute("plain", &caps), None);
    }

    #[test]
    fn test_display() {
        assert_eq!(Shortcut::literal("hi").trigger.to_string(), "hi");
        assert_eq!(Shortcut::regex("^a$").unwrap().trigger.to_string(), "/^a$/");
    }
}
