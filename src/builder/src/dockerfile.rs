//! Dockerfile tokenizer.
//!
//! Turns Dockerfile text into a sequence of instructions, each carrying
//! its typed arguments plus the raw logical line and line number.
//! Supports line continuations (`\`), comments, and both shell and JSON
//! (exec) forms for RUN/CMD/ENTRYPOINT.

use kiln_core::error::{KilnError, Result};

use crate::shellword;

/// Command body for RUN/CMD/ENTRYPOINT.
#[derive(Debug, Clone, PartialEq)]
pub enum ShellForm {
    /// Shell form: the rest of the line, verbatim.
    Shell(String),
    /// Exec form: a JSON array of argv words.
    Exec(Vec<String>),
}

impl ShellForm {
    /// The form as stored in the image config: shell strings are wrapped
    /// as `/bin/sh -c <string>`.
    pub fn as_config_cmd(&self) -> Vec<String> {
        match self {
            ShellForm::Shell(s) => vec!["/bin/sh".to_string(), "-c".to_string(), s.clone()],
            ShellForm::Exec(v) => v.clone(),
        }
    }

    /// Argv handed to the host's `run` task. The container root carries
    /// no shell to wrap with, so shell strings split into words.
    pub fn as_run_argv(&self) -> Vec<String> {
        match self {
            ShellForm::Shell(s) => s.split_whitespace().map(str::to_string).collect(),
            ShellForm::Exec(v) => v.clone(),
        }
    }
}

/// A single Dockerfile instruction.
#[derive(Debug, Clone, PartialEq)]
pub enum InstructionKind {
    /// `ADD <src>... <dest>`
    Add(Vec<String>),
    /// `ARG <name>[=<default>]`
    Arg {
        name: String,
        default: Option<String>,
    },
    /// `CMD <command>` or `CMD ["argv", ...]`
    Cmd(ShellForm),
    /// `COPY <src>... <dest>`
    Copy(Vec<String>),
    /// `ENTRYPOINT <command>` or `ENTRYPOINT ["argv", ...]`
    Entrypoint(ShellForm),
    /// `ENV <key>=<value> ...` or `ENV <key> <value>`
    Env(Vec<(String, String)>),
    /// `EXPOSE <port>[/<proto>] ...`
    Expose(Vec<String>),
    /// `FROM <image>`
    From(String),
    /// `LABEL <key>=<value> ...`
    Label(Vec<(String, String)>),
    /// `MAINTAINER <author>`
    Maintainer(String),
    /// `ONBUILD <instruction>`
    Onbuild(Box<Instruction>),
    /// `RUN <command>` or `RUN ["argv", ...]`
    Run(ShellForm),
    /// `STOPSIGNAL <signal>`
    StopSignal(String),
    /// `USER <user>`
    User(String),
    /// `VOLUME <path> ...`
    Volume(Vec<String>),
    /// `WORKDIR <path>`
    Workdir(String),
}

/// A parsed instruction: typed args plus the raw logical line.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    pub kind: InstructionKind,
    pub raw: String,
    pub lineno: usize,
}

impl Instruction {
    /// Canonical uppercase instruction name.
    pub fn name(&self) -> &'static str {
        match &self.kind {
            InstructionKind::Add(_) => "ADD",
            InstructionKind::Arg { .. } => "ARG",
            InstructionKind::Cmd(_) => "CMD",
            InstructionKind::Copy(_) => "COPY",
            InstructionKind::Entrypoint(_) => "ENTRYPOINT",
            InstructionKind::Env(_) => "ENV",
            InstructionKind::Expose(_) => "EXPOSE",
            InstructionKind::From(_) => "FROM",
            InstructionKind::Label(_) => "LABEL",
            InstructionKind::Maintainer(_) => "MAINTAINER",
            InstructionKind::Onbuild(_) => "ONBUILD",
            InstructionKind::Run(_) => "RUN",
            InstructionKind::StopSignal(_) => "STOPSIGNAL",
            InstructionKind::User(_) => "USER",
            InstructionKind::Volume(_) => "VOLUME",
            InstructionKind::Workdir(_) => "WORKDIR",
        }
    }

    /// Whether environment/build-arg expansion applies to this
    /// instruction's arguments.
    pub fn expands_variables(&self) -> bool {
        matches!(
            self.kind,
            InstructionKind::Add(_)
                | InstructionKind::Arg { .. }
                | InstructionKind::Copy(_)
                | InstructionKind::Env(_)
                | InstructionKind::Expose(_)
                | InstructionKind::Label(_)
                | InstructionKind::Onbuild(_)
                | InstructionKind::StopSignal(_)
                | InstructionKind::User(_)
                | InstructionKind::Volume(_)
                | InstructionKind::Workdir(_)
        )
    }

    /// Expand variables in the typed arguments in place. The raw line is
    /// left as written.
    pub fn expand(&mut self, envs: &[String]) -> Result<()> {
        match &mut self.kind {
            InstructionKind::Add(args)
            | InstructionKind::Copy(args)
            | InstructionKind::Expose(args)
            | InstructionKind::Volume(args) => {
                for arg in args {
                    *arg = shellword::expand(arg, envs)?;
                }
            }
            InstructionKind::Arg { name, default } => {
                *name = shellword::expand(name, envs)?;
                if let Some(value) = default {
                    *value = shellword::expand(value, envs)?;
                }
            }
            InstructionKind::Env(pairs) | InstructionKind::Label(pairs) => {
                for (key, value) in pairs {
                    *key = shellword::expand(key, envs)?;
                    *value = shellword::expand(value, envs)?;
                }
            }
            InstructionKind::StopSignal(s)
            | InstructionKind::User(s)
            | InstructionKind::Workdir(s) => {
                *s = shellword::expand(s, envs)?;
            }
            InstructionKind::Onbuild(inner) => {
                if inner.expands_variables() {
                    inner.expand(envs)?;
                }
            }
            InstructionKind::Cmd(_)
            | InstructionKind::Entrypoint(_)
            | InstructionKind::From(_)
            | InstructionKind::Maintainer(_)
            | InstructionKind::Run(_) => {}
        }
        Ok(())
    }

    /// Render the arguments for the synthetic nop command line.
    pub fn nop_args(&self) -> String {
        match &self.kind {
            InstructionKind::Env(pairs) | InstructionKind::Label(pairs) => pairs
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(" "),
            InstructionKind::Add(args)
            | InstructionKind::Copy(args)
            | InstructionKind::Expose(args)
            | InstructionKind::Volume(args) => args.join(" "),
            InstructionKind::From(s)
            | InstructionKind::Maintainer(s)
            | InstructionKind::StopSignal(s)
            | InstructionKind::User(s)
            | InstructionKind::Workdir(s) => s.clone(),
            InstructionKind::Arg { name, default } => match default {
                Some(value) => format!("{}={}", name, value),
                None => name.clone(),
            },
            InstructionKind::Onbuild(inner) => {
                format!("{} {}", inner.name(), inner.nop_args())
            }
            InstructionKind::Run(form)
            | InstructionKind::Cmd(form)
            | InstructionKind::Entrypoint(form) => match form {
                ShellForm::Shell(s) => s.clone(),
                ShellForm::Exec(v) => v.join(" "),
            },
        }
    }
}

/// Parse Dockerfile text into instructions, in file order.
pub fn parse(content: &str) -> Result<Vec<Instruction>> {
    logical_lines(content)
        .into_iter()
        .map(|(line, lineno)| parse_line(&line, lineno))
        .collect()
}

/// Parse one logical line into an instruction.
pub fn parse_line(line: &str, lineno: usize) -> Result<Instruction> {
    let (keyword, rest) = split_first_word(line);
    let rest = rest.trim();
    let upper = keyword.to_uppercase();

    let kind = match upper.as_str() {
        "ADD" => InstructionKind::Add(parse_list("ADD", rest)?),
        "ARG" => parse_arg(rest)?,
        "CMD" => InstructionKind::Cmd(parse_shell_form("CMD", rest)?),
        "COPY" => InstructionKind::Copy(parse_list("COPY", rest)?),
        "ENTRYPOINT" => InstructionKind::Entrypoint(parse_shell_form("ENTRYPOINT", rest)?),
        "ENV" => InstructionKind::Env(parse_pairs("ENV", rest)?),
        "EXPOSE" => InstructionKind::Expose(parse_list("EXPOSE", rest)?),
        "FROM" => parse_from(rest)?,
        "LABEL" => InstructionKind::Label(parse_pairs("LABEL", rest)?),
        "MAINTAINER" => InstructionKind::Maintainer(require_value("MAINTAINER", rest)?),
        "ONBUILD" => {
            if rest.is_empty() {
                return Err(arg_count("ONBUILD", "at least one"));
            }
            InstructionKind::Onbuild(Box::new(parse_line(rest, lineno)?))
        }
        "RUN" => InstructionKind::Run(parse_shell_form("RUN", rest)?),
        "STOPSIGNAL" => InstructionKind::StopSignal(require_value("STOPSIGNAL", rest)?),
        "USER" => InstructionKind::User(require_value("USER", rest)?),
        "VOLUME" => InstructionKind::Volume(parse_list("VOLUME", rest)?),
        "WORKDIR" => InstructionKind::Workdir(require_value("WORKDIR", rest)?),
        other => {
            return Err(KilnError::Input(format!("Unknown instruction: {}", other)));
        }
    };

    Ok(Instruction {
        kind,
        raw: line.to_string(),
        lineno,
    })
}

/// Join continuation lines and drop comments/blanks. Returns each logical
/// line with the number of its first physical line.
fn logical_lines(content: &str) -> Vec<(String, usize)> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut start_line = 0usize;

    for (idx, line) in content.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.starts_with('#') {
            continue;
        }
        if current.is_empty() {
            if trimmed.is_empty() {
                continue;
            }
            start_line = idx + 1;
        }
        if let Some(stripped) = trimmed.strip_suffix('\\') {
            let segment = stripped.trim_end();
            if !segment.is_empty() {
                current.push_str(segment);
                current.push(' ');
            }
        } else {
            current.push_str(trimmed);
            out.push((current.trim().to_string(), start_line));
            current.clear();
        }
    }

    // Trailing continuation without a final line
    if !current.trim().is_empty() {
        out.push((current.trim().to_string(), start_line));
    }

    out
}

// --- Individual argument parsers ---

fn parse_from(rest: &str) -> Result<InstructionKind> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() != 1 {
        return Err(arg_count("FROM", "exactly one"));
    }
    Ok(InstructionKind::From(tokens[0].to_string()))
}

fn parse_arg(rest: &str) -> Result<InstructionKind> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.len() != 1 {
        return Err(arg_count("ARG", "exactly one"));
    }
    match tokens[0].split_once('=') {
        Some((name, default)) => Ok(InstructionKind::Arg {
            name: name.to_string(),
            default: Some(unquote(default)),
        }),
        None => Ok(InstructionKind::Arg {
            name: tokens[0].to_string(),
            default: None,
        }),
    }
}

fn parse_shell_form(name: &str, rest: &str) -> Result<ShellForm> {
    if rest.is_empty() {
        return Err(arg_count(name, "at least one"));
    }
    if rest.starts_with('[') {
        if let Ok(argv) = serde_json::from_str::<Vec<String>>(rest) {
            return Ok(ShellForm::Exec(argv));
        }
    }
    Ok(ShellForm::Shell(rest.to_string()))
}

/// Whitespace token list; VOLUME-style JSON arrays are accepted too.
fn parse_list(name: &str, rest: &str) -> Result<Vec<String>> {
    if rest.is_empty() {
        return Err(arg_count(name, "at least one"));
    }
    if rest.starts_with('[') {
        if let Ok(items) = serde_json::from_str::<Vec<String>>(rest) {
            return Ok(items);
        }
    }
    Ok(tokenize(rest))
}

/// `K=V [K2=V2 ...]` pairs, or the legacy `KEY VALUE` form.
fn parse_pairs(name: &str, rest: &str) -> Result<Vec<(String, String)>> {
    if rest.is_empty() {
        return Err(arg_count(name, "at least one"));
    }
    let tokens = tokenize(rest);
    if tokens.first().map_or(false, |t| t.contains('=')) {
        tokens
            .iter()
            .map(|token| {
                token
                    .split_once('=')
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .ok_or_else(|| {
                        KilnError::Input(format!(
                            "Syntax error - can't find = in \"{}\". Must be of the form: name=value",
                            token
                        ))
                    })
            })
            .collect()
    } else {
        // Legacy form: KEY VALUE, the value verbatim to end of line.
        let (key, value) = split_first_word(rest);
        Ok(vec![(key.to_string(), unquote(value))])
    }
}

fn require_value(name: &str, rest: &str) -> Result<String> {
    if rest.is_empty() {
        return Err(arg_count(name, "exactly one"));
    }
    Ok(rest.to_string())
}

fn arg_count(name: &str, expected: &str) -> KilnError {
    KilnError::Input(format!("{} requires {} argument", name, expected))
}

// --- Helpers ---

/// Split a string into the first word and the rest.
fn split_first_word(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.find(char::is_whitespace) {
        Some(pos) => (&s[..pos], s[pos..].trim_start()),
        None => (s, ""),
    }
}

/// Whitespace split that respects quoted tokens; quotes are stripped,
/// backslashes pass through for the expansion pass.
fn tokenize(s: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in s.chars() {
        match c {
            q @ ('\'' | '"') if quote == Some(q) => quote = None,
            q @ ('\'' | '"') if quote.is_none() => quote = Some(q),
            c if c.is_whitespace() && quote.is_none() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Remove surrounding quotes from a string.
fn unquote(s: &str) -> String {
    let s = s.trim();
    if s.len() >= 2
        && ((s.starts_with('"') && s.ends_with('"')) || (s.starts_with('\'') && s.ends_with('\'')))
    {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}
