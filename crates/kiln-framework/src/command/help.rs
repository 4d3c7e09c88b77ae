use super::Command;
use crate::declaration::{Declaration, render_declarations};

/// Controls what [`Command::help`] prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelpOptions {
    /// Only the summary line of each command.
    pub simple: bool,
    /// Include hidden options.
    pub show_hidden: bool,
    /// Include the channel kind a command is restricted to.
    pub show_auth: bool,
    /// How many levels of children to expand.
    pub depth: usize,
    /// The level being rendered. Callers leave this at 0.
    pub current: usize,
}

impl Default for HelpOptions {
    fn default() -> Self {
        Self {
            simple: false,
            show_hidden: false,
            show_auth: false,
            depth: 1,
            current: 0,
        }
    }
}

impl Command {
    /// Renders help text, one entry per line.
    ///
    /// The first line is `name <args> description`; detail lines follow
    /// unless `simple` is set, then the children indented by two spaces per
    /// level.
    pub fn help(&self, options: &HelpOptions) -> Vec<String> {
        let state = self.state.read();

        let summary = [
            self.name.clone(),
            render_declarations(&self.args),
            state.descriptions.join(";"),
        ];
        let mut output = vec![
            summary
                .iter()
                .filter(|part| !part.is_empty())
                .cloned()
                .collect::<Vec<_>>()
                .join(" "),
        ];

        if !options.simple {
            if options.show_auth {
                let trigger = self.trigger.map_or("any", |kind| kind.as_str());
                output.push(format!(" trigger:{trigger}"));
            }
            if !state.alias_names.is_empty() {
                output.push(format!(" alias:{}", state.alias_names.join(",")));
            }
            if !state.shortcuts.is_empty() {
                let names: Vec<String> =
                    state.shortcuts.iter().map(|s| s.trigger.to_string()).collect();
                output.push(format!(" shortcuts:{}", names.join(",")));
            }
            let visible: Vec<_> = state
                .options
                .iter()
                .filter(|o| options.show_hidden || !o.hidden)
                .collect();
            if !visible.is_empty() {
                output.push(" options:".to_string());
                for option in visible {
                    let shown = Declaration {
                        name: option.name.clone(),
                        ..option.declaration.clone()
                    };
                    output.push(format!(
                        "  {} {shown} {}",
                        option.short_name, option.description
                    ));
                }
            }
            if !state.examples.is_empty() {
                output.push(" examples:".to_string());
                output.extend(state.examples.iter().map(|e| format!("  {e}")));
            }
        }

        if !state.children.is_empty() && options.depth != options.current {
            output.push(" children:".to_string());
            let indent = " ".repeat((options.current + 1) * 2);
            let nested = HelpOptions {
                current: options.current + 1,
                ..*options
            };
            for child in &state.children {
                output.extend(
                    child
                        .help(&nested)
                        .into_iter()
                        .map(|line| format!("{indent}{line}")),
                );
            }
        }
        output
    }
}
