// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeSet;

use rustyline::completion::{Completer, Pair};
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{Context, Helper};

/// Sorted, deduplicated set of strings offered for prefix completion.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompletionIndex {
    entries: BTreeSet<String>,
}

impl CompletionIndex {
    /// Returns every entry starting with the lower-cased `partial`, in
    /// sorted order.
    pub fn complete(&self, partial: &str) -> Vec<&str> {
        let prefix = partial.to_lowercase();
        self.entries
            .range(prefix.clone()..)
            .take_while(|entry| entry.starts_with(&prefix))
            .map(String::as_str)
            .collect()
    }

    pub fn contains(&self, entry: &str) -> bool {
        self.entries.contains(entry)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<String> for CompletionIndex {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        CompletionIndex {
            entries: iter.into_iter().filter(|e| !e.is_empty()).collect(),
        }
    }
}

/// Line editor helper completing the whole input line from a
/// [`CompletionIndex`].
pub struct CompletionHelper {
    index: CompletionIndex,
}

impl CompletionHelper {
    pub fn new(index: CompletionIndex) -> Self {
        CompletionHelper { index }
    }
}

impl Completer for CompletionHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let candidates = self
            .index
            .complete(&line[..pos])
            .into_iter()
            .map(|entry| Pair {
                display: entry.to_owned(),
                replacement: entry.to_owned(),
            })
            .collect();

        Ok((0, candidates))
    }
}

impl Hinter for CompletionHelper {
    type Hint = String;
}

impl Highlighter for CompletionHelper {}

impl Validator for CompletionHelper {}

impl Helper for CompletionHelper {}
