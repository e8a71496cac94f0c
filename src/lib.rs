// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

pub mod completion;
pub mod introspect;
pub mod shell;

use std::error::Error;

/// Reports a fatal error to the user.
///
/// Every error of this crate already renders its cause in its message, so
/// only the top level goes to stderr. The full chain is logged at debug
/// level for bug reports.
pub fn cli_print_error_chain(top_error: &dyn Error, component: &str) {
    eprintln!("{component} error: {top_error}");

    std::iter::successors(top_error.source(), |sub_error| {
        // Dereference necessary to mitigate rustc compiler bug.
        // See <https://github.com/rust-lang/rust/issues/141673>
        (*sub_error).source()
    })
    .enumerate()
    .for_each(|(level, error)| {
        log::debug!("  caused by {level}: {error}");
    });
    log::debug!("Debug Info: {top_error:?}");
}
