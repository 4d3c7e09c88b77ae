//! Parsed command invocations.
//!
//! An [`Argv`] starts life as the tokenized message text and is filled in by
//! [`Command::parse`](crate::command::Command::parse): positional values land
//! in `args`, named values in `options`, and the first parse failure is kept
//! in `error` so that execution can report it instead of running callbacks.

use std::collections::VecDeque;
use std::sync::Arc;

use kiln_core::MessageEvent;
use serde_json::{Map, Value};

/// A command invocation in the middle of being parsed or executed.
#[derive(Debug, Clone)]
pub struct Argv {
    /// The name or alias the command was invoked with.
    pub name: String,
    /// Tokens not consumed yet.
    pub tokens: VecDeque<String>,
    /// Positional values, in declaration order.
    pub args: Vec<Value>,
    /// Option values keyed by option name.
    pub options: Map<String, Value>,
    /// The message that triggered the invocation.
    pub event: Arc<MessageEvent>,
    /// The first parse error, if any.
    pub error: Option<String>,
}

impl Argv {
    pub fn new(
        event: Arc<MessageEvent>,
        name: impl Into<String>,
        tokens: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            name: name.into(),
            tokens: tokens.into_iter().collect(),
            args: Vec::new(),
            options: Map::new(),
            event,
            error: None,
        }
    }

    /// Splits the message text into a command name and its tokens.
    ///
    /// Returns `None` for messages with no words.
    pub fn from_event(event: Arc<MessageEvent>) -> Option<Self> {
        let mut tokens: VecDeque<String> = shell_split(&event.text).into();
        let name = tokens.pop_front()?;
        Some(Self::new(event, name, tokens))
    }

    /// The raw message text.
    pub fn source(&self) -> &str {
        &self.event.text
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// A positional value as a string slice, if it is one.
    pub fn arg_str(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Value::as_str)
    }

    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Whether a boolean option is set.
    pub fn flag(&self, name: &str) -> bool {
        self.options
            .get(name)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    pub(crate) fn fail(&mut self, message: impl Into<String>) {
        if self.error.is_none() {
            self.error = Some(message.into());
        }
    }
}

/// Shell-like splitting of message text.
///
/// Whitespace separates tokens; single and double quotes group them, and a
/// backslash escapes the next character inside double quotes.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut in_single = false;
    let mut in_double = false;
    let mut escaped = false;

    for ch in input.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_double => escaped = true,
            '\'' if !in_double => {
                in_single = !in_single;
                quoted = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                quoted = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if !current.is_empty() || quoted {
                    args.push(std::mem::take(&mut current));
                }
                quoted = false;
            }
            _ => current.push(ch),
        }
    }
    if !current.is_empty() || quoted {
        args.push(current);
    }
    args
}
