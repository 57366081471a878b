//! Parser for macro configuration files.
//!
//! The format is line oriented with `#` comments. A line starting with
//! `$` opens a macro: `$ <name> [idents…] [: k=v; …]`, where the idents
//! mark special roles (startup, shutdown, fallback, startsession,
//! stopsession, keep; button/key/menu idents are accepted and
//! ignored). Indented lines are commands, `[!] <verb> <name> [: params]`;
//! a leading `!` disables the command, and lines that start with no
//! known verb continue the parameters of the preceding command.
//! Syntax errors are accumulated so a broken file reports everything
//! at once.

use crate::error::Error;
use crate::options::Options;

#[derive(Debug, Clone, PartialEq)]
pub enum FilterAction {
    /// Assign parameters to the node.
    Configure(String),
    /// Re-derive settings from the data in `[t0, t1]`.
    AutoConfigure { t0: f64, t1: f64 },
    /// Write the node's settings to a file.
    Save,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandKind {
    Repro { name: String, params: String },
    MacroCall { name: String, params: String },
    Filter { name: String, action: FilterAction },
    Detector { name: String, action: FilterAction },
    Switch { file: String },
    StartSession,
    Shell { command: String },
    Message { timeout: f64, text: String },
    Browse { file: String },
}

#[derive(Debug, Clone)]
pub struct MacroCommand {
    pub enabled: bool,
    pub kind: CommandKind,
    pub line: usize,
}

#[derive(Debug, Clone)]
pub struct MacroDef {
    pub name: String,
    pub variables: Options,
    pub commands: Vec<MacroCommand>,
    pub startup: bool,
    pub shutdown: bool,
    pub fallback: bool,
    pub startsession: bool,
    pub stopsession: bool,
    pub keep: bool,
    pub line: usize,
}

#[derive(Debug, Clone, Default)]
pub struct MacroFile {
    pub label: String,
    pub macros: Vec<MacroDef>,
}

impl MacroFile {
    pub fn find(&self, name: &str) -> Option<usize> {
        self.macros
            .iter()
            .position(|m| m.name.eq_ignore_ascii_case(name))
    }

    pub fn startup(&self) -> Option<usize> {
        self.macros.iter().position(|m| m.startup)
    }

    pub fn shutdown(&self) -> Option<usize> {
        self.macros.iter().position(|m| m.shutdown)
    }

    pub fn fallback(&self) -> Option<usize> {
        self.macros.iter().position(|m| m.fallback)
    }
}

const ROLE_IDENTS: &[&str] = &[
    "startup",
    "shutdown",
    "fallback",
    "startsession",
    "stopsession",
    "keep",
    "overwrite",
    "nobutton",
    "nokey",
    "nomenu",
];

const VERBS: &[&str] = &[
    "repro",
    "macro",
    "filter",
    "detector",
    "switch",
    "startsession",
    "shell",
    "message",
    "browse",
];

/// Parses macro definitions; syntax problems are accumulated, not
/// aborted on.
pub fn parse(label: &str, text: &str) -> (MacroFile, Vec<Error>) {
    let mut file = MacroFile {
        label: label.to_string(),
        macros: Vec::new(),
    };
    let mut errors = Vec::new();

    for (lineno, raw) in text.lines().enumerate() {
        let lineno = lineno + 1;
        let line = strip_comment(raw);
        if line.trim().is_empty() {
            continue;
        }

        if let Some(rest) = line.trim_start().strip_prefix('$') {
            let (head, params) = match rest.split_once(':') {
                Some((h, p)) => (h.trim(), p.trim()),
                None => (rest.trim(), ""),
            };
            let mut tokens = head.split_whitespace();
            let Some(name) = tokens.next() else {
                errors.push(Error::syntax(label, lineno, "macro without a name"));
                continue;
            };
            let mut def = MacroDef {
                name: name.to_string(),
                variables: Options::new(name),
                commands: Vec::new(),
                startup: false,
                shutdown: false,
                fallback: false,
                startsession: false,
                stopsession: false,
                keep: false,
                line: lineno,
            };
            for ident in tokens {
                match ident {
                    "startup" => def.startup = true,
                    "shutdown" => def.shutdown = true,
                    "fallback" => def.fallback = true,
                    "startsession" => def.startsession = true,
                    "stopsession" => def.stopsession = true,
                    "keep" => def.keep = true,
                    i if ROLE_IDENTS.contains(&i) => {}
                    other => errors.push(Error::syntax(
                        label,
                        lineno,
                        format!("unknown macro ident {other}"),
                    )),
                }
            }
            if !params.is_empty() {
                def.variables.load(params);
                def.variables.set_defaults_to_values();
            }
            file.macros.push(def);
            continue;
        }

        let Some(current) = file.macros.last_mut() else {
            errors.push(Error::syntax(
                label,
                lineno,
                "command outside of a macro definition",
            ));
            continue;
        };

        let trimmed = line.trim();
        let (enabled, body) = match trimmed.strip_prefix('!') {
            Some(rest) => (false, rest.trim_start()),
            None => (true, trimmed),
        };
        let verb = body.split_whitespace().next().unwrap_or("");
        if !VERBS.contains(&verb) {
            // continuation of the previous command's parameter block
            match current.commands.last_mut() {
                Some(prev) => {
                    append_params(&mut prev.kind, body);
                }
                None => errors.push(Error::syntax(
                    label,
                    lineno,
                    format!("unknown command verb {verb}"),
                )),
            }
            continue;
        }

        let rest = body[verb.len()..].trim();
        match parse_command(verb, rest) {
            Ok(kind) => current.commands.push(MacroCommand {
                enabled,
                kind,
                line: lineno,
            }),
            Err(message) => errors.push(Error::syntax(label, lineno, message)),
        }
    }

    (file, errors)
}

fn parse_command(verb: &str, rest: &str) -> std::result::Result<CommandKind, String> {
    let (name, params) = match rest.split_once(':') {
        Some((n, p)) => (n.trim(), p.trim()),
        None => (rest.trim(), ""),
    };
    match verb {
        "repro" => {
            if name.is_empty() {
                return Err("repro command without a name".to_string());
            }
            Ok(CommandKind::Repro {
                name: name.to_string(),
                params: params.to_string(),
            })
        }
        "macro" => {
            if name.is_empty() {
                return Err("macro command without a name".to_string());
            }
            Ok(CommandKind::MacroCall {
                name: name.to_string(),
                params: params.to_string(),
            })
        }
        "filter" | "detector" => {
            if name.is_empty() {
                return Err(format!("{verb} command without a name"));
            }
            let action = parse_filter_action(params)?;
            if verb == "filter" {
                Ok(CommandKind::Filter {
                    name: name.to_string(),
                    action,
                })
            } else {
                Ok(CommandKind::Detector {
                    name: name.to_string(),
                    action,
                })
            }
        }
        "switch" => {
            if name.is_empty() {
                return Err("switch command without a file".to_string());
            }
            Ok(CommandKind::Switch {
                file: name.to_string(),
            })
        }
        "startsession" => Ok(CommandKind::StartSession),
        "shell" => {
            if rest.is_empty() {
                return Err("shell command without a command line".to_string());
            }
            Ok(CommandKind::Shell {
                command: rest.to_string(),
            })
        }
        "message" => {
            let mut tokens = rest.splitn(2, char::is_whitespace);
            let first = tokens.next().unwrap_or("");
            match first.parse::<f64>() {
                Ok(timeout) => Ok(CommandKind::Message {
                    timeout,
                    text: tokens.next().unwrap_or("").trim().to_string(),
                }),
                Err(_) => Ok(CommandKind::Message {
                    timeout: 0.0,
                    text: rest.to_string(),
                }),
            }
        }
        "browse" => {
            if name.is_empty() {
                return Err("browse command without a file".to_string());
            }
            Ok(CommandKind::Browse {
                file: name.to_string(),
            })
        }
        other => Err(format!("unknown command verb {other}")),
    }
}

fn parse_filter_action(params: &str) -> std::result::Result<FilterAction, String> {
    let p = params.trim();
    if p.is_empty() || p == "save" {
        return Ok(if p == "save" {
            FilterAction::Save
        } else {
            FilterAction::Configure(String::new())
        });
    }
    if let Some(rest) = p.strip_prefix("autoconf") {
        let nums: Vec<f64> = rest
            .split_whitespace()
            .map(|t| t.parse::<f64>())
            .collect::<std::result::Result<_, _>>()
            .map_err(|e| format!("bad autoconf time: {e}"))?;
        return match nums.as_slice() {
            [t0, t1] => Ok(FilterAction::AutoConfigure { t0: *t0, t1: *t1 }),
            [t] => Ok(FilterAction::AutoConfigure { t0: 0.0, t1: *t }),
            _ => Err("autoconf needs one or two times".to_string()),
        };
    }
    Ok(FilterAction::Configure(p.to_string()))
}

fn append_params(kind: &mut CommandKind, more: &str) {
    let slot = match kind {
        CommandKind::Repro { params, .. } => params,
        CommandKind::MacroCall { params, .. } => params,
        CommandKind::Filter { action, .. } | CommandKind::Detector { action, .. } => {
            if let FilterAction::Configure(params) = action {
                params
            } else {
                return;
            }
        }
        CommandKind::Message { text, .. } => text,
        _ => return,
    };
    let joined = slot.trim_end().trim_end_matches(';').to_string();
    *slot = if joined.is_empty() {
        more.trim().trim_end_matches(';').to_string()
    } else {
        format!("{joined}; {}", more.trim().trim_end_matches(';'))
    };
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(0) => "",
        Some(pos) if line[..pos].ends_with(char::is_whitespace) => &line[..pos],
        _ => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
# search and characterize
$ Search startup fallback : amplitude=2mV; freq=1kHz
    repro SinePulse: amplitude=$amplitude; freq=$freq
    ! repro SinePulse: amplitude=0
$ Characterize : dur=0.5s
    startsession
    repro SinePulse: duration=$dur;
        pause=0.2s
    message 5 Characterization done
    shell echo done
    macro Search
"#;

    #[test]
    fn macros_variables_and_idents() {
        let (file, errors) = parse("macros.cfg", SAMPLE);
        assert!(errors.is_empty(), "{errors:?}");
        assert_eq!(file.macros.len(), 2);
        let search = &file.macros[0];
        assert!(search.startup && search.fallback);
        assert_eq!(search.variables.number("freq", "Hz"), 1000.0);
        assert_eq!(file.fallback(), Some(0));
        assert_eq!(file.find("characterize"), Some(1));
    }

    #[test]
    fn disabled_commands_kept_but_flagged() {
        let (file, _) = parse("macros.cfg", SAMPLE);
        let search = &file.macros[0];
        assert_eq!(search.commands.len(), 2);
        assert!(search.commands[0].enabled);
        assert!(!search.commands[1].enabled);
    }

    #[test]
    fn parameter_blocks_continue_on_indented_lines() {
        let (file, _) = parse("macros.cfg", SAMPLE);
        let characterize = &file.macros[1];
        match &characterize.commands[1].kind {
            CommandKind::Repro { name, params } => {
                assert_eq!(name, "SinePulse");
                assert!(params.contains("duration=$dur"));
                assert!(params.contains("pause=0.2s"), "{params}");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn message_shell_and_macro_commands() {
        let (file, _) = parse("macros.cfg", SAMPLE);
        let commands = &file.macros[1].commands;
        assert!(matches!(commands[0].kind, CommandKind::StartSession));
        match &commands[2].kind {
            CommandKind::Message { timeout, text } => {
                assert_eq!(*timeout, 5.0);
                assert_eq!(text, "Characterization done");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(
            matches!(&commands[3].kind, CommandKind::Shell { command } if command == "echo done")
        );
        assert!(
            matches!(&commands[4].kind, CommandKind::MacroCall { name, .. } if name == "Search")
        );
    }

    #[test]
    fn errors_are_accumulated_not_fatal() {
        let text = "repro Lost\n$ Ok\n  bogus stuff\n  repro Fine\n";
        let (file, errors) = parse("m.cfg", text);
        // command before any macro + unknown verb with no previous command
        assert_eq!(errors.len(), 2);
        assert_eq!(file.macros.len(), 1);
        assert_eq!(file.macros[0].commands.len(), 1);
    }

    #[test]
    fn filter_actions() {
        let text = "$ M\n  filter lowpass: window=8\n  detector spikes: autoconf 0 2\n  detector spikes: save\n";
        let (file, errors) = parse("m.cfg", text);
        assert!(errors.is_empty());
        let commands = &file.macros[0].commands;
        assert!(matches!(
            &commands[0].kind,
            CommandKind::Filter { action: FilterAction::Configure(p), .. } if p == "window=8"
        ));
        assert!(matches!(
            &commands[1].kind,
            CommandKind::Detector {
                action: FilterAction::AutoConfigure { t0, t1 },
                ..
            } if *t0 == 0.0 && *t1 == 2.0
        ));
        assert!(matches!(
            &commands[2].kind,
            CommandKind::Detector {
                action: FilterAction::Save,
                ..
            }
        ));
    }
}
