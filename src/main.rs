// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

#[cfg(test)]
mod test_util;

use std::io::{self, Write};
use std::path::PathBuf;
use std::process;

use clap::{Arg, ArgAction, ArgMatches, Command};
use log::debug;
use qmp_client::{QmpMonitor, DEFAULT_TIMEOUT};
use qmp_shell::cli_print_error_chain;
use qmp_shell::shell::{create_editor, Error, LineEditor, Mode, Shell};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
enum RunError {
    #[error("Cannot connect to the monitor: {0}")]
    Connect(#[source] qmp_client::Error),
    #[error(transparent)]
    Shell(Error),
    #[error("Error writing output: {0}")]
    Output(#[source] io::Error),
}

fn create_app() -> Command {
    Command::new("qmp-shell")
        .version(env!("BUILD_VERSION"))
        .about("Low-level shell for the QEMU Machine Protocol.")
        .arg(
            Arg::new("hmp")
                .short('H')
                .long("hmp")
                .help("Run the HMP shell instead of QMP")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("socket")
                .help("QMP UNIX socket path")
                .value_parser(clap::value_parser!(PathBuf))
                .num_args(1)
                .required(true),
        )
}

fn stdin_is_terminal() -> bool {
    // SAFETY: isatty() only inspects the file descriptor
    unsafe { libc::isatty(libc::STDIN_FILENO) == 1 }
}

fn run(matches: &ArgMatches) -> Result<(), RunError> {
    let mode = if matches.get_flag("hmp") {
        Mode::Hmp
    } else {
        Mode::Qmp
    };
    let socket = matches
        .get_one::<PathBuf>("socket")
        .cloned()
        .unwrap_or_default();

    let monitor = QmpMonitor::connect(&socket, DEFAULT_TIMEOUT).map_err(RunError::Connect)?;
    let mut shell = Shell::new(monitor, mode).map_err(RunError::Shell)?;

    let mut stdout = io::stdout().lock();

    if !stdin_is_terminal() {
        let reply = shell
            .execute_from(io::stdin().lock())
            .map_err(RunError::Shell)?;
        return writeln!(stdout, "{reply}").map_err(RunError::Output);
    }

    let history = mode.history_path();
    debug!("Using history file {}", history.display());

    let mut editor = create_editor(shell.completions().clone()).map_err(RunError::Shell)?;
    editor.restore_history(&history);
    let result = shell.serve(&mut editor, &mut stdout);
    editor.persist_history(&history);

    result.map_err(RunError::Shell)
}

fn main() {
    env_logger::init();

    let matches = create_app().get_matches();

    let exit_code = match run(&matches) {
        Ok(()) => 0,
        Err(e) => {
            cli_print_error_chain(&e, "qmp_shell");
            1
        }
    };

    process::exit(exit_code);
}

#[cfg(test)]
mod unit_tests {
    use clap::error::ErrorKind;

    use super::*;
    use crate::test_util::tests::assert_options_sorted;

    #[test]
    fn test_options_sorted() {
        let app = create_app();
        assert_options_sorted(|| app.get_arguments());
    }

    #[test]
    fn test_parse_args() {
        let matches = create_app()
            .try_get_matches_from(["qmp-shell", "/run/vm.qmp"])
            .unwrap();
        assert!(!matches.get_flag("hmp"));
        assert_eq!(
            matches.get_one::<PathBuf>("socket"),
            Some(&PathBuf::from("/run/vm.qmp"))
        );

        let matches = create_app()
            .try_get_matches_from(["qmp-shell", "-H", "/run/vm.qmp"])
            .unwrap();
        assert!(matches.get_flag("hmp"));
    }

    #[test]
    fn test_usage_errors() {
        for args in [
            vec!["qmp-shell"],
            vec!["qmp-shell", "-H"],
            vec!["qmp-shell", "a.sock", "b.sock"],
        ] {
            let e = create_app().try_get_matches_from(args.clone()).unwrap_err();
            assert_ne!(e.kind(), ErrorKind::DisplayHelp, "{args:?}");
            assert_eq!(e.exit_code(), 2, "{args:?}");
        }
    }
}
