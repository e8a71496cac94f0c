// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
pub mod tests {
    use std::cmp::Ordering;

    use clap::Arg;

    /// Checks that the named options of a command are declared in
    /// alphabetical order. Positional arguments keep their own order.
    pub fn assert_options_sorted<'a, F: Fn() -> R, R: Iterator<Item = &'a Arg>>(
        get_base_iter: F,
    ) {
        let options = || get_base_iter().filter(|arg| !arg.is_positional());
        for (arg, next) in options().zip(options().skip(1)) {
            assert_ne!(
                arg.get_id().cmp(next.get_id()),
                Ordering::Greater,
                "options not alphabetically sorted: arg={}, next={}",
                arg.get_id(),
                next.get_id()
            );
        }
    }
}
