// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Builds the HMP completion vocabulary from the free-text output of the
//! `help` and `info` monitor commands.

use crate::completion::CompletionIndex;

/// HMP command listing every monitor command.
pub const HELP_COMMAND: &str = "help";
/// HMP command listing every status topic.
pub const INFO_COMMAND: &str = "info";

/// Extracts command names from the output of `help`.
///
/// Each command yields itself and `help <command>`. Usage continuation
/// lines (starting with `[` or a tab) are ignored, and so is `info`, whose
/// topics come from [`parse_info_output`]. Of two `|` separated aliases
/// the longer one is kept, and a single character alias is never kept.
pub fn parse_help_output(output: &str) -> Vec<String> {
    let mut entries = Vec::new();

    for line in output.lines() {
        if line.is_empty() || line.starts_with(['[', '\t']) {
            continue;
        }
        let Some(token) = line.split_whitespace().next() else {
            continue;
        };
        if token == INFO_COMMAND {
            continue;
        }

        let mut aliases = token.split('|');
        let name = match (aliases.next(), aliases.next()) {
            (Some(first), Some(second))
                if first.chars().count() <= 1 || second.chars().count() > first.chars().count() =>
            {
                second
            }
            (Some(first), _) => first,
            (None, _) => continue,
        };
        if name.is_empty() {
            continue;
        }

        entries.push(name.to_owned());
        entries.push(format!("{HELP_COMMAND} {name}"));
    }

    entries
}

/// Extracts `info <topic>` entries from the output of `info`.
///
/// Only lines with at least two fields are considered. Monitors print each
/// topic as `info <topic> ...`, in which case the topic is the second field,
/// otherwise the line is taken to start with the topic itself.
pub fn parse_info_output(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields[..] {
                [INFO_COMMAND, topic, ..] => Some(topic),
                [topic, _, ..] => Some(topic),
                _ => None,
            }
        })
        .map(|topic| format!("{INFO_COMMAND} {topic}"))
        .collect()
}

/// Merges both reports into a single completion index.
pub fn build_index(help_output: &str, info_output: &str) -> CompletionIndex {
    parse_help_output(help_output)
        .into_iter()
        .chain(parse_info_output(info_output))
        .collect()
}
