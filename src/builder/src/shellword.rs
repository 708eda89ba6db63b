//! Shell-style word expansion for Dockerfile arguments.
//!
//! Expands `$NAME`, `${NAME}`, `${NAME:+word}`, and `${NAME:-word}`
//! against a `K=V` environment list (first match wins), honoring single
//! quotes, double quotes, and backslash escapes. A single-pass character
//! cursor; correctness over speed.

use kiln_core::error::{KilnError, Result};

use crate::image::env_get;

/// Expand one word against `envs`. Inputs without any of `$`, `'`, `"`,
/// `\` are returned unchanged.
pub fn expand(word: &str, envs: &[String]) -> Result<String> {
    if !word.contains(['$', '\'', '"', '\\']) {
        return Ok(word.to_string());
    }

    let mut cursor = Cursor::new(word);
    let mut out = String::with_capacity(word.len());
    let mut quote: Option<char> = None;

    while let Some(c) = cursor.next() {
        match c {
            '\'' if quote == Some('\'') => quote = None,
            '\'' if quote.is_none() => quote = Some('\''),
            '"' if quote == Some('"') => quote = None,
            '"' if quote.is_none() => quote = Some('"'),
            '\\' if quote == Some('\'') => out.push('\\'),
            '\\' if quote == Some('"') => {
                // Inside double quotes a backslash escapes only `"` and `$`.
                match cursor.peek() {
                    Some(n @ ('"' | '$')) => {
                        cursor.next();
                        out.push(n);
                    }
                    _ => out.push('\\'),
                }
            }
            '\\' => match cursor.next() {
                Some(n) => out.push(n),
                None => out.push('\\'),
            },
            '$' if quote != Some('\'') => out.push_str(&dollar(&mut cursor, envs)?),
            other => out.push(other),
        }
    }

    Ok(out)
}

fn dollar(cursor: &mut Cursor, envs: &[String]) -> Result<String> {
    match cursor.peek() {
        None => Ok("$".to_string()),
        Some('{') => {
            cursor.next();
            braced(cursor, envs)
        }
        // Shell positional: only the single digit is consumed.
        Some(c) if c.is_ascii_digit() => {
            cursor.next();
            Ok(String::new())
        }
        Some(c) if is_name_char(c) => {
            let name = cursor.take_while(is_name_char);
            Ok(lookup(envs, &name))
        }
        Some(_) => Ok("$".to_string()),
    }
}

fn braced(cursor: &mut Cursor, envs: &[String]) -> Result<String> {
    let name = cursor.take_while(is_name_char);
    match cursor.next() {
        Some('}') => {
            if name.is_empty() {
                return Err(KilnError::BadSubstitution(
                    "empty variable name in ${}".to_string(),
                ));
            }
            Ok(lookup(envs, &name))
        }
        Some(':') => match cursor.next() {
            // `${NAME:}` survives verbatim (error-recovery path).
            Some('}') => Ok(format!("${{{}:}}", name)),
            Some('+') => {
                let word = modifier_word(cursor)?;
                if lookup(envs, &name).is_empty() {
                    Ok(String::new())
                } else {
                    expand(&word, envs)
                }
            }
            Some('-') => {
                let word = modifier_word(cursor)?;
                let value = lookup(envs, &name);
                if value.is_empty() {
                    expand(&word, envs)
                } else {
                    Ok(value)
                }
            }
            Some(modifier) => Err(KilnError::BadSubstitution(format!(
                "unsupported modifier '{}' in ${{{}}}",
                modifier, name
            ))),
            None => Err(KilnError::BadSubstitution(format!(
                "unexpected end of input in ${{{}:",
                name
            ))),
        },
        Some(other) => Err(KilnError::BadSubstitution(format!(
            "missing ':' before modifier '{}' in ${{{}}}",
            other, name
        ))),
        None => Err(KilnError::BadSubstitution(format!(
            "unexpected end of input in ${{{}",
            name
        ))),
    }
}

/// Collect the modifier word up to the matching `}`, tracking nested
/// braces so `${a:-${b}}` parses.
fn modifier_word(cursor: &mut Cursor) -> Result<String> {
    let mut word = String::new();
    let mut depth = 1usize;
    while let Some(c) = cursor.next() {
        match c {
            '{' => {
                depth += 1;
                word.push(c);
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(word);
                }
                word.push(c);
            }
            other => word.push(other),
        }
    }
    Err(KilnError::BadSubstitution(
        "unexpected end of input in substitution word".to_string(),
    ))
}

fn lookup(envs: &[String], name: &str) -> String {
    env_get(envs, name).unwrap_or_default().to_string()
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

struct Cursor {
    chars: Vec<char>,
    pos: usize,
}

impl Cursor {
    fn new(s: &str) -> Self {
        Self {
            chars: s.chars().collect(),
            pos: 0,
        }
    }

    fn next(&mut self) -> Option<char> {
        let c = self.chars.get(self.pos).copied();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if !pred(c) {
                break;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }
}
