// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! The interactive QMP/HMP shell.
//!
//! A [`Shell`] owns the connection to the monitor and runs one command at a
//! time: it reads a line, turns it into a [`Command`], waits for the reply
//! and prints it. Empty lines print the asynchronous events received since
//! the last poll instead. What differs between the QMP and HMP flavours is
//! captured by [`Mode`].

use std::collections::HashMap;
use std::env;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use command_parser::{Command, Value, HMP_COMMAND_LINE_ARGUMENT, HMP_PASSTHROUGH_COMMAND};
use log::{debug, info, warn};
use qmp_client::{Event, QmpMonitor};
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{CompletionType, Config, Editor};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::completion::{CompletionHelper, CompletionIndex};
use crate::introspect;

const DISCARD_PATH: &str = "/dev/null";
const HOME_VARIABLE: &str = "HOME";

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid command: {0}")]
    Build(#[source] command_parser::Error),
    #[error("Command failed: {0}")]
    Transport(#[source] qmp_client::Error),
    #[error("Cannot query {0}: {1}")]
    Startup(&'static str, #[source] qmp_client::Error),
    #[error("Cannot read command from stdin: {0}")]
    ReadStdin(#[source] io::Error),
    #[error("No command on stdin")]
    NoInput,
    #[error("Error reading input line: {0}")]
    Readline(#[source] ReadlineError),
    #[error("Error writing output: {0}")]
    Output(#[source] io::Error),
}
pub type Result<T> = std::result::Result<T, Error>;

/// Something able to run QMP commands and hand out buffered events.
pub trait Transport {
    fn run(
        &mut self,
        name: &str,
        arguments: Option<&HashMap<String, Value>>,
    ) -> qmp_client::Result<serde_json::Value>;

    fn events_since(&mut self, seconds: u64) -> qmp_client::Result<Vec<Event>>;
}

impl Transport for QmpMonitor {
    fn run(
        &mut self,
        name: &str,
        arguments: Option<&HashMap<String, Value>>,
    ) -> qmp_client::Result<serde_json::Value> {
        self.execute(name, arguments)
    }

    fn events_since(&mut self, seconds: u64) -> qmp_client::Result<Vec<Event>> {
        QmpMonitor::events_since(self, seconds)
    }
}

fn run_command<T: Transport>(
    transport: &mut T,
    command: &Command,
) -> qmp_client::Result<serde_json::Value> {
    let arguments = Some(command.arguments()).filter(|a| !a.is_empty());
    transport.run(command.name(), arguments)
}

fn run_hmp<T: Transport>(transport: &mut T, command_line: &str) -> qmp_client::Result<String> {
    let arguments = HashMap::from([(
        HMP_COMMAND_LINE_ARGUMENT.to_owned(),
        Value::String(command_line.to_owned()),
    )]);
    let ret = transport.run(HMP_PASSTHROUGH_COMMAND, Some(&arguments))?;
    serde_json::from_value(ret).map_err(qmp_client::Error::Decode)
}

fn to_pretty_json(value: &serde_json::Value) -> String {
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
    if let Err(e) = value.serialize(&mut serializer) {
        warn!("Cannot format reply: {e}");
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

#[derive(Deserialize)]
struct NameInfo {
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct VersionTriple {
    major: u64,
    minor: u64,
    micro: u64,
}

#[derive(Deserialize)]
struct VersionInfo {
    qemu: VersionTriple,
}

#[derive(Deserialize)]
struct CommandInfo {
    name: String,
}

fn query<T: Transport, R: DeserializeOwned>(
    transport: &mut T,
    name: &'static str,
) -> Result<R> {
    transport
        .run(name, None)
        .and_then(|ret| serde_json::from_value(ret).map_err(qmp_client::Error::Decode))
        .map_err(|e| Error::Startup(name, e))
}

/// Flavour of the shell.
///
/// QMP lines are parsed into typed commands and replies are printed as
/// JSON. HMP lines are forwarded verbatim through `human-monitor-command`
/// and replies are printed as the monitor's own text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Qmp,
    Hmp,
}

impl Mode {
    fn tag(self) -> &'static str {
        match self {
            Mode::Qmp => "qmp",
            Mode::Hmp => "hmp",
        }
    }

    pub fn banner(self) -> &'static str {
        match self {
            Mode::Qmp => "Welcome to the QMP low-level shell",
            Mode::Hmp => "Welcome to the HMP low-level shell",
        }
    }

    pub fn prompt(self, vm_name: &str) -> String {
        format!("{}_shell/{vm_name}> ", self.tag())
    }

    /// Where the line history of this flavour is kept: a dot file in the
    /// `$HOME` directory, or a discarding path when `$HOME` is not set.
    pub fn history_path(self) -> PathBuf {
        let home = env::var_os(HOME_VARIABLE).map(PathBuf::from);
        history_path(self, home.as_deref())
    }

    pub fn build_command(self, line: &str) -> command_parser::Result<Command> {
        match self {
            Mode::Qmp => Command::build(line, false),
            Mode::Hmp => Command::build(line, true),
        }
    }

    /// Formats the reply to `command`. HMP replies are printed raw,
    /// whichever flavour sent them.
    pub fn render(self, command: &Command, reply: &serde_json::Value) -> String {
        match (self, reply) {
            (Mode::Hmp, serde_json::Value::String(text)) => text.clone(),
            (Mode::Qmp, serde_json::Value::String(text)) if command.is_hmp_passthrough() => {
                text.clone()
            }
            (Mode::Qmp | Mode::Hmp, reply) => to_pretty_json(reply),
        }
    }

    /// Asks the monitor which commands exist.
    pub fn completion_index<T: Transport>(self, transport: &mut T) -> Result<CompletionIndex> {
        match self {
            Mode::Qmp => {
                let commands: Vec<CommandInfo> = query(transport, "query-commands")?;
                Ok(commands.into_iter().map(|c| c.name).collect())
            }
            Mode::Hmp => {
                let help = run_hmp(transport, introspect::HELP_COMMAND)
                    .map_err(|e| Error::Startup("the HMP command list", e))?;
                let info = run_hmp(transport, introspect::INFO_COMMAND)
                    .map_err(|e| Error::Startup("the HMP info topics", e))?;
                Ok(introspect::build_index(&help, &info))
            }
        }
    }
}

fn history_path(mode: Mode, home: Option<&Path>) -> PathBuf {
    match home {
        Some(home) => home.join(format!(".{}shell_history", mode.tag())),
        None => PathBuf::from(DISCARD_PATH),
    }
}

/// Outcome of waiting for one line of input.
#[derive(Debug, PartialEq, Eq)]
pub enum Input {
    Line(String),
    Interrupted,
    Eof,
}

/// Line editing and history, as needed by [`Shell::serve`].
pub trait LineEditor {
    fn read_line(&mut self, prompt: &str) -> Result<Input>;
    fn add_history(&mut self, line: &str);
    /// Loads the history kept at `path`. A missing file is not an error.
    fn restore_history(&mut self, path: &Path);
    fn persist_history(&mut self, path: &Path);
}

pub type ShellEditor = Editor<CompletionHelper, DefaultHistory>;

/// Creates a line editor completing from `index`.
pub fn create_editor(index: CompletionIndex) -> Result<ShellEditor> {
    let config = Config::builder()
        .completion_type(CompletionType::List)
        .auto_add_history(false)
        .build();
    let mut editor = Editor::with_config(config).map_err(Error::Readline)?;
    editor.set_helper(Some(CompletionHelper::new(index)));
    Ok(editor)
}

impl LineEditor for ShellEditor {
    fn read_line(&mut self, prompt: &str) -> Result<Input> {
        match self.readline(prompt) {
            Ok(line) => Ok(Input::Line(line)),
            Err(ReadlineError::Interrupted) => Ok(Input::Interrupted),
            Err(ReadlineError::Eof) => Ok(Input::Eof),
            Err(e) => Err(Error::Readline(e)),
        }
    }

    fn add_history(&mut self, line: &str) {
        if let Err(e) = self.add_history_entry(line) {
            warn!("Cannot record history entry: {e}");
        }
    }

    fn restore_history(&mut self, path: &Path) {
        match self.load_history(path) {
            Ok(()) => debug!("Loaded history from {}", path.display()),
            Err(ReadlineError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Cannot read history file {}: {e}", path.display()),
        }
    }

    fn persist_history(&mut self, path: &Path) {
        if let Err(e) = self.save_history(path) {
            warn!("Cannot write history file {}: {e}", path.display());
        }
    }
}

pub struct Shell<T: Transport> {
    transport: T,
    mode: Mode,
    vm_name: String,
    qemu_version: String,
    completions: CompletionIndex,
    // Events stamped before this many seconds have already been shown
    next_event_seconds: u64,
}

impl<T: Transport> Shell<T> {
    /// Queries the VM name, the QEMU version and the available commands.
    /// Any failure here prevents the shell from starting.
    pub fn new(mut transport: T, mode: Mode) -> Result<Self> {
        let name: NameInfo = query(&mut transport, "query-name")?;
        let version: VersionInfo = query(&mut transport, "query-version")?;
        let completions = mode.completion_index(&mut transport)?;
        info!(
            "{} shell ready with {} completion entries",
            mode.tag(),
            completions.len()
        );

        Ok(Shell {
            transport,
            mode,
            vm_name: name.name.unwrap_or_default(),
            qemu_version: format!(
                "{}.{}.{}",
                version.qemu.major, version.qemu.minor, version.qemu.micro
            ),
            completions,
            next_event_seconds: 0,
        })
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn qemu_version(&self) -> &str {
        &self.qemu_version
    }

    pub fn prompt(&self) -> String {
        self.mode.prompt(&self.vm_name)
    }

    pub fn completions(&self) -> &CompletionIndex {
        &self.completions
    }

    /// Runs one line of input and returns the formatted reply.
    pub fn execute(&mut self, line: &str) -> Result<String> {
        let command = self.mode.build_command(line).map_err(Error::Build)?;
        debug!("Running {command:?}");
        let reply = run_command(&mut self.transport, &command).map_err(Error::Transport)?;
        Ok(self.mode.render(&command, &reply))
    }

    fn print_events<W: Write>(&mut self, out: &mut W) -> io::Result<()> {
        let events = match self.transport.events_since(self.next_event_seconds) {
            Ok(events) => events,
            Err(e) => return writeln!(out, "Error: {}", Error::Transport(e)),
        };

        for e in events {
            writeln!(
                out,
                "Received QMP Event {}: {}, Timestamp: seconds = {}, microseconds = {}",
                e.event,
                e.data.unwrap_or(serde_json::Value::Null),
                e.timestamp.seconds,
                e.timestamp.microseconds
            )?;
            self.next_event_seconds = self.next_event_seconds.max(e.timestamp.seconds + 1);
        }

        Ok(())
    }

    /// Handles one line of interactive input. Errors are reported to `out`
    /// and never end the session.
    pub fn handle_line<W: Write>(&mut self, line: &str, out: &mut W) -> io::Result<()> {
        if line.is_empty() {
            return self.print_events(out);
        }

        match self.execute(line) {
            Ok(reply) => writeln!(out, "{reply}"),
            Err(e) => writeln!(out, "Error: {e}"),
        }
    }

    /// Prints the banner, then runs commands until end of input or an
    /// interrupt.
    pub fn serve<E: LineEditor, W: Write>(&mut self, editor: &mut E, out: &mut W) -> Result<()> {
        writeln!(out, "{}", self.mode.banner()).map_err(Error::Output)?;
        writeln!(out, "Connected to QEMU {}", self.qemu_version).map_err(Error::Output)?;
        writeln!(out).map_err(Error::Output)?;

        let prompt = self.prompt();
        loop {
            match editor.read_line(&prompt)? {
                Input::Line(line) => {
                    if !line.is_empty() {
                        editor.add_history(&line);
                    }
                    self.handle_line(&line, out).map_err(Error::Output)?;
                }
                Input::Interrupted => {
                    eprintln!("Aborted");
                    return Ok(());
                }
                Input::Eof => {
                    writeln!(out).map_err(Error::Output)?;
                    return Ok(());
                }
            }
        }
    }

    /// Runs the single command read from `input`.
    pub fn execute_from<R: io::BufRead>(&mut self, mut input: R) -> Result<String> {
        let mut line = String::new();
        if input.read_line(&mut line).map_err(Error::ReadStdin)? == 0 {
            return Err(Error::NoInput);
        }
        self.execute(line.trim_end_matches(['\r', '\n']))
    }
}
