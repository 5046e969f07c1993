//! Shell-like command lines.
//!
//! A [`Command`] is a program name plus its arguments, parsed from a single
//! line of text. Parsing understands one layer of `'...'` or `"..."` quoting;
//! it does not expand variables, globs or escapes.
//!
//! Serializing a command joins the parts with single spaces and never adds
//! quotes, so arguments that contain whitespace survive [`Command::parse`] but
//! not a `to_string()` / `parse` round trip. Use [`Command::quoted`] when a
//! shell-safe rendering is needed for display.

use std::fmt;
use std::str::FromStr;

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// The program to execute.
    pub name: String,
    /// Arguments passed to the program.
    pub args: Vec<String>,
}

impl Command {
    /// Splits `raw` on unquoted whitespace.
    ///
    /// A quote character opens a quoted section that runs until the same
    /// character appears again; the delimiting quotes are not part of the
    /// token. Input with no tokens at all becomes a command named `raw` with
    /// no arguments, so nothing is silently discarded.
    pub fn parse(raw: &str) -> Self {
        let mut tokens = tokenize(raw).into_iter();
        match tokens.next() {
            Some(name) => Self {
                name,
                args: tokens.collect(),
            },
            None => Self {
                name: raw.to_string(),
                args: Vec::new(),
            },
        }
    }

    /// Shell-quoted rendering, used in log lines.
    pub fn quoted(&self) -> String {
        let mut parts = Vec::with_capacity(1 + self.args.len());
        parts.push(self.name.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        shell_words::join(parts)
    }
}

impl FromStr for Command {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

fn tokenize(raw: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    // A token exists once any character or quote pair has been seen, so `""`
    // still produces an (empty) argument.
    let mut in_token = false;
    let mut quote: Option<char> = None;

    for ch in raw.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '\'' || ch == '"' => {
                quote = Some(ch);
                in_token = true;
            }
            None if ch.is_whitespace() => {
                if in_token {
                    tokens.push(std::mem::take(&mut current));
                    in_token = false;
                }
            }
            None => {
                current.push(ch);
                in_token = true;
            }
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}
