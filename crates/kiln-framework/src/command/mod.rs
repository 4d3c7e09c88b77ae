//! The command tree.
//!
//! Commands are created through
//! [`PluginContext::command`](crate::context::PluginContext::command) from a
//! definition string such as `greet <name:string> [--loud]`, then refined with
//! chained calls:
//!
//! ```rust,ignore
//! ctx.command("greet <name:string> [--loud]", None)?
//!     .desc("say hello")
//!     .alias("hi")
//!     .option("times", "-t <times:integer>", OptionSettings::default())?
//!     .action(|argv: Argv| async move {
//!         let name = argv.arg_str(0).unwrap_or_default().to_string();
//!         if argv.flag("loud") { format!("HELLO {name}!") } else { format!("hello {name}") }
//!     });
//! ```
//!
//! Execution applies shortcuts, parses the remaining tokens into positional
//! values and options, then runs checkers followed by actions. The first
//! callback that produces a [`Reply`] ends the invocation.

mod help;
mod shortcut;

use std::future::Future;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::BoxFuture;
use kiln_core::{ChannelKind, MessageEvent};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::debug;

use crate::argv::Argv;
use crate::declaration::{ArgType, Declaration, parse_declarations, signature_name};
use crate::error::{BoxError, DefinitionError, FrameworkResult};

pub use help::HelpOptions;
pub use shortcut::{Shortcut, ShortcutTrigger};
pub(crate) use shortcut::ShortcutHit;

// ============================================================================
// Callback results
// ============================================================================

/// What a command callback produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Text to send back to the channel the command came from.
    Message(String),
    /// The invocation is complete, but there is nothing to send.
    Handled,
}

/// Result of running a command or one of its callbacks.
pub type CommandOutcome = Result<Option<Reply>, BoxError>;

/// A stored checker or action.
pub type Callback = Arc<dyn Fn(Argv) -> BoxFuture<'static, CommandOutcome> + Send + Sync>;

/// Conversion from a callback's return value into a [`CommandOutcome`].
///
/// `()` and `false` produce nothing, so the next callback runs. Non-empty
/// text becomes a reply, `true` marks the invocation as handled.
pub trait IntoOutcome {
    fn into_outcome(self) -> CommandOutcome;
}

impl IntoOutcome for () {
    fn into_outcome(self) -> CommandOutcome {
        Ok(None)
    }
}

impl IntoOutcome for bool {
    fn into_outcome(self) -> CommandOutcome {
        Ok(self.then_some(Reply::Handled))
    }
}

impl IntoOutcome for String {
    fn into_outcome(self) -> CommandOutcome {
        Ok((!self.is_empty()).then_some(Reply::Message(self)))
    }
}

impl IntoOutcome for &'static str {
    fn into_outcome(self) -> CommandOutcome {
        self.to_string().into_outcome()
    }
}

impl IntoOutcome for Reply {
    fn into_outcome(self) -> CommandOutcome {
        Ok(Some(self))
    }
}

impl<T: IntoOutcome> IntoOutcome for Option<T> {
    fn into_outcome(self) -> CommandOutcome {
        match self {
            Some(inner) => inner.into_outcome(),
            None => Ok(None),
        }
    }
}

impl<T, E> IntoOutcome for Result<T, E>
where
    T: IntoOutcome,
    E: Into<BoxError>,
{
    fn into_outcome(self) -> CommandOutcome {
        match self {
            Ok(inner) => inner.into_outcome(),
            Err(err) => Err(err.into()),
        }
    }
}

fn into_callback<F, Fut, R>(f: F) -> Callback
where
    F: Fn(Argv) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoOutcome + 'static,
{
    Arc::new(move |argv| f(argv).map(IntoOutcome::into_outcome).boxed())
}

// ============================================================================
// Options
// ============================================================================

/// A named option of a command.
#[derive(Debug, Clone, PartialEq)]
pub struct OptionConfig {
    pub name: String,
    /// The short form as written, e.g. `-t`.
    pub short_name: String,
    pub description: String,
    /// Type and arity of the option's value.
    pub declaration: Declaration,
    pub hidden: bool,
    pub initial: Option<Value>,
}

impl OptionConfig {
    /// Whether `token` (with its leading dashes) names this option.
    fn named_by(&self, token: &str) -> bool {
        let bare = token.trim_start_matches('-');
        !bare.is_empty()
            && token.starts_with('-')
            && (bare == self.name.trim_start_matches('-')
                || bare == self.short_name.trim_start_matches('-'))
    }

    fn keys(&self) -> [&str; 2] {
        [
            self.name.trim_start_matches('-'),
            self.short_name.trim_start_matches('-'),
        ]
    }
}

/// Optional settings for [`Command::option`].
#[derive(Debug, Clone, Default)]
pub struct OptionSettings {
    pub description: Option<String>,
    pub hidden: bool,
    pub initial: Option<Value>,
}

impl OptionSettings {
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn hidden(mut self) -> Self {
        self.hidden = true;
        self
    }

    pub fn initial(mut self, value: impl Into<Value>) -> Self {
        self.initial = Some(value.into());
        self
    }
}

/// Splits `-t <type:string> the type` into its declaration part and its
/// description.
fn split_option_declaration(source: &str) -> (&str, &str) {
    let mut depth = 0usize;
    let mut at_word_start = true;
    for (i, ch) in source.char_indices() {
        match ch {
            '<' | '[' => depth += 1,
            '>' | ']' => depth = depth.saturating_sub(1),
            c if c.is_whitespace() => {
                at_word_start = true;
                continue;
            }
            c if depth == 0 && at_word_start && c != '-' => return source.split_at(i),
            _ => {}
        }
        at_word_start = false;
    }
    (source, "")
}

// ============================================================================
// Command
// ============================================================================

#[derive(Default)]
struct CommandState {
    children: Vec<Arc<Command>>,
    options: Vec<Arc<OptionConfig>>,
    alias_names: Vec<String>,
    shortcuts: Vec<Shortcut>,
    descriptions: Vec<String>,
    examples: Vec<String>,
    checkers: Vec<Callback>,
    actions: Vec<Callback>,
}

/// A node of a plugin's command tree.
pub struct Command {
    name: String,
    args: Vec<Declaration>,
    trigger: Option<ChannelKind>,
    parent: Weak<Command>,
    state: RwLock<CommandState>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("trigger", &self.trigger)
            .finish_non_exhaustive()
    }
}

impl Command {
    /// Builds a command from its definition string. Path resolution is the
    /// caller's job; `parent` is the already-resolved parent, if any.
    pub(crate) fn new(
        signature: &str,
        trigger: Option<ChannelKind>,
        parent: Option<&Arc<Command>>,
    ) -> FrameworkResult<Arc<Self>> {
        let path = command_path(signature);
        let name = path.rsplit('/').next().unwrap_or(path).to_string();
        if name.is_empty() {
            return Err(DefinitionError::invalid(signature, "missing command name"));
        }

        let decls = parse_declarations(signature)?;
        let (flags, args): (Vec<_>, Vec<_>) = decls.into_iter().partition(Declaration::is_flag);

        let command = Arc::new(Self {
            name,
            args,
            trigger,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            state: RwLock::new(CommandState::default()),
        });
        for flag in flags {
            let option_name = flag.name.trim_start_matches('-').to_string();
            command.insert_option(OptionConfig {
                description: format!("--{option_name}"),
                name: option_name,
                short_name: flag.name.clone(),
                declaration: flag,
                hidden: false,
                initial: None,
            })?;
        }
        Ok(command)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Declaration] {
        &self.args
    }

    pub fn trigger(&self) -> Option<ChannelKind> {
        self.trigger
    }

    pub fn parent(&self) -> Option<Arc<Command>> {
        self.parent.upgrade()
    }

    pub fn children(&self) -> Vec<Arc<Command>> {
        self.state.read().children.clone()
    }

    pub fn options(&self) -> Vec<Arc<OptionConfig>> {
        self.state.read().options.clone()
    }

    pub fn aliases(&self) -> Vec<String> {
        self.state.read().alias_names.clone()
    }

    pub fn descriptions(&self) -> Vec<String> {
        self.state.read().descriptions.clone()
    }

    pub fn examples(&self) -> Vec<String> {
        self.state.read().examples.clone()
    }

    /// Whether this command answers to `name` (its own name or an alias).
    pub fn accepts(&self, name: &str) -> bool {
        self.name == name || self.state.read().alias_names.iter().any(|a| a == name)
    }

    /// Whether the command may run for a message on `event`'s channel.
    pub fn matches(&self, event: &MessageEvent) -> bool {
        self.trigger.is_none_or(|kind| kind == event.kind())
    }

    pub(crate) fn lookup_shortcut(&self, text: &str) -> Option<ShortcutHit> {
        self.state
            .read()
            .shortcuts
            .iter()
            .find_map(|shortcut| shortcut.lookup(text))
    }

    pub(crate) fn add_child(&self, child: Arc<Command>) {
        self.state.write().children.push(child);
    }

    pub(crate) fn remove_child(&self, child: &Arc<Command>) {
        self.state
            .write()
            .children
            .retain(|existing| !Arc::ptr_eq(existing, child));
    }

    // ─── Definition ──────────────────────────────────────────────────────

    pub fn alias(&self, name: impl Into<String>) -> &Self {
        self.state.write().alias_names.push(name.into());
        self
    }

    pub fn desc(&self, description: impl Into<String>) -> &Self {
        self.state.write().descriptions.push(description.into());
        self
    }

    pub fn example(&self, example: impl Into<String>) -> &Self {
        self.state.write().examples.push(example.into());
        self
    }

    pub fn shortcut(&self, shortcut: Shortcut) -> &Self {
        self.state.write().shortcuts.push(shortcut);
        self
    }

    /// Declares an option.
    ///
    /// `declaration` is the short form, optionally followed by a value
    /// declaration and a description: `-t <type:string> filter by type`.
    /// An option without a value declaration is a boolean flag.
    pub fn option(
        &self,
        name: impl Into<String>,
        declaration: &str,
        settings: OptionSettings,
    ) -> FrameworkResult<&Self> {
        let name = name.into();
        let (decl, desc) = split_option_declaration(declaration);
        let short_name = match signature_name(decl) {
            "" => format!("--{name}"),
            short => short.to_string(),
        };
        let value_decl = parse_declarations(decl)?
            .into_iter()
            .find(|d| d.name != short_name)
            .unwrap_or_else(|| Declaration::flag(short_name.clone()));
        let description = settings
            .description
            .or_else(|| Some(desc.trim().to_string()).filter(|d| !d.is_empty()))
            .unwrap_or_else(|| format!("--{name}"));

        self.insert_option(OptionConfig {
            name,
            short_name,
            description,
            declaration: value_decl,
            hidden: settings.hidden,
            initial: settings.initial,
        })?;
        Ok(self)
    }

    fn insert_option(&self, option: OptionConfig) -> FrameworkResult<()> {
        let mut state = self.state.write();
        let [name_key, short_key] = option.keys();
        for existing in &state.options {
            let taken = existing.keys();
            if taken.contains(&name_key) {
                return Err(DefinitionError::DuplicateOption {
                    command: self.name.clone(),
                    name: option.name.clone(),
                });
            }
            if taken.contains(&short_key) {
                return Err(DefinitionError::DuplicateShortName {
                    command: self.name.clone(),
                    short: option.short_name.clone(),
                });
            }
        }
        state.options.push(Arc::new(option));
        Ok(())
    }

    /// Adds a checker. Checkers run before actions; the first one that
    /// produces a reply stops the invocation.
    pub fn check<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Argv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        self.state.write().checkers.push(into_callback(f));
        self
    }

    /// Adds an action.
    pub fn action<F, Fut, R>(&self, f: F) -> &Self
    where
        F: Fn(Argv) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoOutcome + 'static,
    {
        self.state.write().actions.push(into_callback(f));
        self
    }

    // ─── Execution ───────────────────────────────────────────────────────

    /// Runs the command for `argv`.
    ///
    /// A parse failure is returned as the reply text. Errors from checkers
    /// and actions propagate.
    pub async fn execute(&self, mut argv: Argv) -> CommandOutcome {
        self.apply_shortcuts(&mut argv);
        if argv.error.is_none() {
            self.parse(&mut argv);
        }
        if let Some(error) = argv.error.take() {
            return Ok(Some(Reply::Message(error)));
        }

        let callbacks: Vec<Callback> = {
            let state = self.state.read();
            state
                .checkers
                .iter()
                .chain(state.actions.iter())
                .cloned()
                .collect()
        };
        for callback in callbacks {
            if let Some(reply) = callback(argv.clone()).await? {
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }

    /// Applies the canned values of every shortcut that fired for `argv`.
    fn apply_shortcuts(&self, argv: &mut Argv) {
        let shortcuts = self.state.read().shortcuts.clone();
        for shortcut in &shortcuts {
            if shortcut.is_literal(&argv.name) {
                argv.args.extend(shortcut.args.iter().cloned());
                for (key, value) in &shortcut.options {
                    argv.options.insert(key.clone(), value.clone());
                }
            }

            let Some(captures) = shortcut.captures(argv.source()) else {
                continue;
            };
            for (index, template) in shortcut.args.iter().enumerate() {
                let ty = self.args.get(index).map(|d| &d.ty).unwrap_or(&ArgType::String);
                if let Some(value) = fill_template(argv, template, &captures, ty, "argument") {
                    argv.args.push(value);
                }
            }
            for (key, template) in &shortcut.options {
                let option = self.find_option(key);
                let ty = option
                    .as_ref()
                    .map(|o| o.declaration.ty.clone())
                    .unwrap_or(ArgType::String);
                if let Some(value) = fill_template(argv, template, &captures, &ty, "option") {
                    let name = option.map(|o| o.name.clone()).unwrap_or_else(|| key.clone());
                    argv.options.insert(name, value);
                }
            }
        }
    }

    fn find_option(&self, key: &str) -> Option<Arc<OptionConfig>> {
        self.state
            .read()
            .options
            .iter()
            .find(|o| o.name == key || o.short_name == key)
            .cloned()
    }

    /// Consumes `argv.tokens` into positional values and options.
    pub fn parse(&self, argv: &mut Argv) {
        let options = self.options();

        while argv.error.is_none() {
            let Some(token) = argv.tokens.pop_front() else {
                break;
            };
            let option = options.iter().find(|o| o.named_by(&token));
            let slot = self.args.get(argv.args.len());

            let Some(option) = option else {
                match slot {
                    Some(decl) if takes_positional(decl, &token) => {
                        if decl.ty.is_greedy() {
                            let rest: Vec<String> = argv.tokens.drain(..).collect();
                            let joined = std::iter::once(token).chain(rest).collect::<Vec<_>>();
                            push_arg(argv, decl, &joined.join(" "));
                            break;
                        }
                        if decl.variadic {
                            let rest: Vec<String> = argv.tokens.drain(..).collect();
                            for raw in std::iter::once(token).chain(rest) {
                                push_arg(argv, decl, &raw);
                            }
                            break;
                        }
                        push_arg(argv, decl, &token);
                    }
                    _ => debug!(command = %self.name, token = %token, "Ignoring unexpected token"),
                }
                continue;
            };

            if argv.options.contains_key(&option.name) {
                continue;
            }
            let decl = &option.declaration;
            if decl.ty == ArgType::Boolean {
                argv.options.insert(option.name.clone(), Value::Bool(true));
                continue;
            }

            let value_missing = argv
                .tokens
                .front()
                .is_none_or(|next| options.iter().any(|o| o.named_by(next)));
            if value_missing {
                if decl.required && option.initial.is_none() {
                    argv.fail(format!("option {} is required", option.name));
                    break;
                }
                continue;
            }

            if decl.variadic {
                let raws: Vec<String> = argv.tokens.drain(..).collect();
                let values: Vec<Value> = raws
                    .iter()
                    .filter_map(|raw| convert(argv, decl, raw, "option"))
                    .collect();
                argv.options.insert(option.name.clone(), Value::Array(values));
                break;
            }
            let raw = if decl.ty.is_greedy() {
                argv.tokens.drain(..).collect::<Vec<_>>().join(" ")
            } else {
                argv.tokens.pop_front().unwrap_or_default()
            };
            if let Some(value) = convert(argv, decl, &raw, "option") {
                argv.options.insert(option.name.clone(), value);
            }
        }

        for option in &options {
            if let Some(initial) = &option.initial {
                if !argv.options.contains_key(&option.name) {
                    argv.options.insert(option.name.clone(), initial.clone());
                }
            }
        }

        if argv.error.is_none() {
            if let Some(missing) = self.args.iter().skip(argv.args.len()).find(|d| d.required) {
                argv.fail(format!("argument {} is required", missing.name));
            }
        }
    }
}

/// The addressing part of a definition: the first whitespace segment of
/// the text before any bracket.
pub(crate) fn command_path(signature: &str) -> &str {
    signature_name(signature)
        .split_whitespace()
        .next()
        .unwrap_or_default()
}

/// Plain words fill positional slots; a dash-prefixed token only does when
/// it is a number for a numeric slot.
fn takes_positional(decl: &Declaration, token: &str) -> bool {
    !token.starts_with('-')
        || (matches!(decl.ty, ArgType::Number | ArgType::Integer) && decl.ty.convert(token).is_ok())
}

fn convert(argv: &mut Argv, decl: &Declaration, raw: &str, site: &str) -> Option<Value> {
    match decl.ty.convert(raw) {
        Ok(value) => Some(value),
        Err(reason) => {
            argv.fail(format!("invalid {site} {}: {reason}", decl.name));
            None
        }
    }
}

fn push_arg(argv: &mut Argv, decl: &Declaration, raw: &str) {
    if let Some(value) = convert(argv, decl, raw, "argument") {
        argv.args.push(value);
    }
}

/// Resolves one canned shortcut value against the pattern's captures.
fn fill_template(
    argv: &mut Argv,
    template: &Value,
    captures: &[String],
    ty: &ArgType,
    site: &str,
) -> Option<Value> {
    let Some(text) = template.as_str() else {
        return Some(template.clone());
    };
    let Some(filled) = shortcut::substitute(text, captures) else {
        return Some(template.clone());
    };
    match ty.convert(&filled) {
        Ok(value) => Some(value),
        Err(reason) => {
            argv.fail(format!("invalid {site} from shortcut: {reason}"));
            None
        }
    }
}
