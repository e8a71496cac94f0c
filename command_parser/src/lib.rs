// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Turns one line of operator input into a typed QMP command.
//!
//! A line has the form `<command-name> [key1=value1] ... [keyN=valueN]`.
//! Fields are separated by whitespace, keys from values by `=`, and either
//! separator can be protected by wrapping the text in quotation marks.
//! Every value is then given a type: boolean, integer, JSON or string.

use std::collections::HashMap;

use log::debug;
use serde::Serialize;
use thiserror::Error;

/// Operation used to tunnel human monitor (HMP) command lines through QMP.
pub const HMP_PASSTHROUGH_COMMAND: &str = "human-monitor-command";
/// Argument of [`HMP_PASSTHROUGH_COMMAND`] carrying the HMP command line.
pub const HMP_COMMAND_LINE_ARGUMENT: &str = "command-line";

// Code points carrying the Unicode Quotation_Mark property.
const QUOTATION_MARKS: &[char] = &[
    '\u{0022}', '\u{0027}', '\u{00ab}', '\u{00bb}', '\u{2018}', '\u{2019}', '\u{201a}',
    '\u{201b}', '\u{201c}', '\u{201d}', '\u{201e}', '\u{201f}', '\u{2039}', '\u{203a}',
    '\u{2e42}', '\u{300c}', '\u{300d}', '\u{300e}', '\u{300f}', '\u{301d}', '\u{301e}',
    '\u{301f}', '\u{fe41}', '\u{fe42}', '\u{fe43}', '\u{fe44}', '\u{ff02}', '\u{ff07}',
    '\u{ff62}', '\u{ff63}',
];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("empty command, expected <command-name> [arg-name1=arg1] ... [arg-nameN=argN]")]
    EmptyCommand,
    #[error("malformed argument {0:?}, expected <arg-name>=<arg>")]
    MalformedArgument(String),
    #[error("JSON parsing error: {0}")]
    InvalidStructuredValue(String),
}
pub type Result<T> = std::result::Result<T, Error>;

fn is_quotation_mark(c: char) -> bool {
    QUOTATION_MARKS.contains(&c)
}

/// Splits `text` into non-empty fields on `separator`.
///
/// A space separator matches any whitespace. A quotation mark suspends
/// splitting until the very same code point shows up again, or until the
/// end of the input if it never does. Quotation marks are kept in the
/// returned fields.
pub fn split_fields(text: &str, separator: char) -> Vec<&str> {
    let is_separator = |c: char| {
        if separator == ' ' {
            c.is_whitespace()
        } else {
            c == separator
        }
    };

    let mut fields = Vec::new();
    let mut closing_quote: Option<char> = None;
    let mut start: Option<usize> = None;

    for (i, c) in text.char_indices() {
        match closing_quote {
            Some(q) if c == q => closing_quote = None,
            Some(_) => {}
            None if is_quotation_mark(c) => closing_quote = Some(c),
            None if is_separator(c) => {
                if let Some(s) = start.take() {
                    fields.push(&text[s..i]);
                }
                continue;
            }
            None => {}
        }
        start.get_or_insert(i);
    }

    if let Some(s) = start {
        fields.push(&text[s..]);
    }

    fields
}

/// Removes one matching pair of ASCII single or double quotes wrapping `s`.
pub fn strip_quotes(s: &str) -> &str {
    for q in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(q) && s.ends_with(q) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

/// Typed value of a single command argument.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Integer(i64),
    Structured(serde_json::Value),
    String(String),
}

impl Value {
    /// Gives `raw` a type. The first matching rule wins: `true`/`false` in
    /// any case, then JSON when the text opens with `{` or `[`, then a
    /// base-10 `i64`, then the literal string.
    pub fn coerce(raw: &str) -> Result<Value> {
        if raw.eq_ignore_ascii_case("true") {
            return Ok(Value::Bool(true));
        }
        if raw.eq_ignore_ascii_case("false") {
            return Ok(Value::Bool(false));
        }

        if raw.starts_with(['{', '[']) {
            let value = serde_json::from_str(raw)
                .map_err(|e| Error::InvalidStructuredValue(e.to_string()))?;
            debug!("Parsed structured argument: {raw}");
            return Ok(Value::Structured(value));
        }

        if let Ok(n) = raw.parse::<i64>() {
            // `str::parse` accepts a leading '+', a QMP integer never has one
            if !raw.starts_with('+') {
                return Ok(Value::Integer(n));
            }
        }

        Ok(Value::String(raw.to_owned()))
    }
}

/// A named QMP operation with its typed arguments.
#[derive(Clone, Debug, PartialEq)]
pub struct Command {
    name: String,
    arguments: HashMap<String, Value>,
}

impl Command {
    /// Builds a command from one line of input.
    ///
    /// With `legacy_text` set the whole line becomes the single argument of
    /// [`HMP_PASSTHROUGH_COMMAND`] before it is parsed.
    pub fn build(line: &str, legacy_text: bool) -> Result<Command> {
        let wrapped;
        let line = if legacy_text {
            wrapped = format!("{HMP_PASSTHROUGH_COMMAND} {HMP_COMMAND_LINE_ARGUMENT}='{line}'");
            wrapped.as_str()
        } else {
            line
        };

        let tokens = split_fields(line, ' ');
        let (name, args) = tokens.split_first().ok_or(Error::EmptyCommand)?;

        let mut arguments = HashMap::new();
        for arg in args {
            let parts = split_fields(arg, '=');
            let [key, value] = parts[..] else {
                return Err(Error::MalformedArgument((*arg).to_owned()));
            };
            // Later occurrences of a key replace earlier ones
            arguments.insert(key.to_owned(), Value::coerce(strip_quotes(value))?);
        }

        Ok(Command {
            name: (*name).to_owned(),
            arguments,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arguments(&self) -> &HashMap<String, Value> {
        &self.arguments
    }

    pub fn is_hmp_passthrough(&self) -> bool {
        self.name == HMP_PASSTHROUGH_COMMAND
    }
}
