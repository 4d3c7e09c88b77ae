//! Manifest plugins: TOML files under the plugin directory.
//!
//! A manifest lives at `<plugin_dir>/<name>.toml` or
//! `<plugin_dir>/<name>/index.toml` and declares commands whose action is a
//! reply template:
//!
//! ```toml
//! include = ["common/greetings.toml"]
//!
//! [[commands]]
//! signature = "greet <name:string> [--loud]"
//! reply = "Hello, {name}!"
//! aliases = ["hi"]
//! desc = "Greets someone"
//!
//! [[commands.options]]
//! name = "times"
//! declaration = "-t <count:integer> repeat the greeting"
//!
//! [[commands.shortcuts]]
//! pattern = "^早上好(.+)$"
//! args = ["$1"]
//! options = { loud = true }
//! ```
//!
//! `include` pulls further command fragments in, relative to the including
//! file. Every include is recorded in the module cache, so editing a
//! fragment reloads exactly the plugins that include it. Fragments must not
//! sit directly in the plugin directory, where they would be discovered as
//! plugins of their own.

use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use figment::Figment;
use figment::providers::{Format, Toml};
use kiln_core::ChannelKind;
use kiln_framework::{
    Argv, BotHost, BoxError, Declaration, LoadError, LoadResult, OptionSettings, PluginContext,
    PluginIdentity, PluginLoader, Shortcut,
};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

/// File name of a directory plugin's manifest.
pub const INDEX_FILE: &str = "index.toml";

#[derive(Debug, Default, Deserialize)]
struct Manifest {
    #[serde(default)]
    include: Vec<PathBuf>,
    #[serde(default)]
    commands: Vec<CommandSpec>,
}

#[derive(Debug, Deserialize)]
struct CommandSpec {
    signature: String,
    #[serde(default)]
    trigger: Option<ChannelKind>,
    #[serde(default)]
    reply: Option<String>,
    #[serde(default)]
    desc: Option<String>,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    examples: Vec<String>,
    #[serde(default)]
    options: Vec<OptionSpec>,
    #[serde(default)]
    shortcuts: Vec<ShortcutSpec>,
}

#[derive(Debug, Deserialize)]
struct OptionSpec {
    name: String,
    #[serde(default)]
    declaration: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    hidden: bool,
    #[serde(default)]
    initial: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ShortcutSpec {
    #[serde(default)]
    literal: Option<String>,
    #[serde(default)]
    pattern: Option<String>,
    #[serde(default)]
    fuzzy: bool,
    #[serde(default)]
    args: Vec<Value>,
    #[serde(default)]
    options: Map<String, Value>,
}

/// A command read from a manifest, with its shortcuts already compiled.
#[derive(Debug)]
struct CommandDef {
    spec: CommandSpec,
    shortcuts: Vec<Shortcut>,
}

impl CommandDef {
    fn build(mut spec: CommandSpec, path: &Path) -> LoadResult<Self> {
        let shortcuts = std::mem::take(&mut spec.shortcuts)
            .into_iter()
            .map(|s| build_shortcut(s, path))
            .collect::<LoadResult<Vec<_>>>()?;
        Ok(Self { spec, shortcuts })
    }

    fn install(self, ctx: &Arc<PluginContext>) -> Result<(), BoxError> {
        let Self { spec, shortcuts } = self;
        let command = ctx.command(&spec.signature, spec.trigger)?;

        for alias in spec.aliases {
            command.alias(alias);
        }
        if let Some(desc) = spec.desc {
            command.desc(desc);
        }
        for example in spec.examples {
            command.example(example);
        }
        for option in spec.options {
            let mut settings = OptionSettings::default();
            if let Some(description) = option.description {
                settings = settings.description(description);
            }
            if option.hidden {
                settings = settings.hidden();
            }
            if let Some(initial) = option.initial {
                settings = settings.initial(initial);
            }
            command.option(option.name, &option.declaration, settings)?;
        }
        for shortcut in shortcuts {
            command.shortcut(shortcut);
        }

        if let Some(template) = spec.reply {
            let fields = Fields {
                args: command.args().to_vec(),
                options: command.options().iter().map(|o| o.name.clone()).collect(),
            };
            command.action(move |argv: Argv| {
                let text = render_reply(&template, &fields, &argv);
                async move { text }
            });
        }
        Ok(())
    }
}

fn build_shortcut(spec: ShortcutSpec, path: &Path) -> LoadResult<Shortcut> {
    let invalid = |reason: String| LoadError::Manifest {
        path: path.to_path_buf(),
        reason,
    };
    let mut shortcut = match (spec.literal, spec.pattern) {
        (Some(literal), None) => Shortcut::literal(literal),
        (None, Some(pattern)) => Shortcut::regex(&pattern)
            .map_err(|e| invalid(format!("invalid shortcut pattern {pattern:?}: {e}")))?,
        _ => {
            return Err(invalid(
                "a shortcut needs exactly one of `literal` or `pattern`".to_string(),
            ));
        }
    };
    if spec.fuzzy {
        shortcut = shortcut.fuzzy();
    }
    for arg in spec.args {
        shortcut = shortcut.arg(arg);
    }
    for (name, value) in spec.options {
        shortcut = shortcut.option(name, value);
    }
    Ok(shortcut)
}

/// What a reply template may refer to.
#[derive(Debug, Default)]
struct Fields {
    args: Vec<Declaration>,
    options: Vec<String>,
}

/// Fills `{placeholder}`s in a reply template.
///
/// Placeholders name a declared argument, a positional index, an option, or
/// one of `sender` and `channel`. A variadic argument expands to all of its
/// values separated by spaces; a declared argument or option that was not
/// given renders empty. Unknown placeholders are left as written.
fn render_reply(template: &str, fields: &Fields, argv: &Argv) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find('{') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let Some(end) = after.find('}') else {
            rest = &rest[start..];
            break;
        };
        let key = &after[..end];
        match placeholder(key, fields, argv) {
            Some(value) => out.push_str(&value),
            None => {
                out.push('{');
                out.push_str(key);
                out.push('}');
            }
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);
    out
}

fn placeholder(key: &str, fields: &Fields, argv: &Argv) -> Option<String> {
    let args = &fields.args;
    match key {
        "sender" => return Some(argv.event.sender_id.clone()),
        "channel" => return Some(argv.event.channel.to_string()),
        _ => {}
    }

    let index = key
        .parse::<usize>()
        .ok()
        .or_else(|| args.iter().position(|d| d.name == key));
    if let Some(index) = index {
        let variadic = args.get(index).is_some_and(|d| d.variadic);
        let values = if variadic {
            argv.args.get(index..).unwrap_or_default()
        } else {
            argv.args.get(index..=index).unwrap_or_default()
        };
        return Some(values.iter().map(display).collect::<Vec<_>>().join(" "));
    }

    match argv.option(key) {
        Some(value) => Some(display(value)),
        None => fields.options.iter().any(|o| o == key).then(String::new),
    }
}

fn display(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn read_manifest(path: &Path) -> LoadResult<Manifest> {
    let text = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Figment::from(Toml::string(&text))
        .extract()
        .map_err(|e| LoadError::Manifest {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
}

/// Loads plugins from manifests under a plugin directory.
#[derive(Debug, Clone)]
pub struct ManifestLoader {
    root: PathBuf,
}

impl ManifestLoader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            root: root.canonicalize().unwrap_or(root),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads `entry` and every file it includes, recording each include
    /// edge in the host's module cache.
    fn collect(&self, host: &BotHost, entry: &Path) -> LoadResult<Vec<CommandDef>> {
        let modules = host.modules();
        modules.insert(entry);

        let mut defs = Vec::new();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([entry.to_path_buf()]);
        while let Some(file) = queue.pop_front() {
            if !visited.insert(file.clone()) {
                continue;
            }
            let manifest = read_manifest(&file)?;
            let base = file.parent().unwrap_or(&self.root);
            for include in &manifest.include {
                let joined = base.join(include);
                let child = joined.canonicalize().map_err(|source| LoadError::Io {
                    path: joined.clone(),
                    source,
                })?;
                modules.record(&file, &child);
                queue.push_back(child);
            }
            for spec in manifest.commands {
                defs.push(CommandDef::build(spec, &file)?);
            }
        }
        Ok(defs)
    }
}

#[async_trait]
impl PluginLoader for ManifestLoader {
    fn kind(&self) -> &'static str {
        "manifest"
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        [
            self.root.join(format!("{name}.toml")),
            self.root.join(name).join(INDEX_FILE),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
        .and_then(|found| found.canonicalize().ok())
    }

    fn discover(&self) -> Vec<String> {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(root = %self.root.display(), error = %e, "Plugin directory not readable");
                return Vec::new();
            }
        };

        let mut names: Vec<String> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                if path.is_dir() {
                    path.join(INDEX_FILE)
                        .is_file()
                        .then(|| entry.file_name().to_string_lossy().into_owned())
                } else if path.extension().is_some_and(|ext| ext == "toml") {
                    path.file_stem().map(|s| s.to_string_lossy().into_owned())
                } else {
                    None
                }
            })
            .collect();
        names.sort();
        names
    }

    async fn load(
        &self,
        host: &Arc<BotHost>,
        name: &str,
        entry: &Path,
    ) -> LoadResult<Arc<PluginContext>> {
        let defs = self.collect(host, entry)?;
        if defs.is_empty() {
            warn!(plugin = %name, path = %entry.display(), "Manifest defines no commands");
        }

        host.define(PluginIdentity::new(name, entry), move |ctx| {
            defs.into_iter().try_for_each(|def| def.install(ctx))
        })
        .await
    }
}
