// Copyright © 2026 The QMP Shell Authors
//
// SPDX-License-Identifier: Apache-2.0
//

//! Minimal synchronous QMP client.
//!
//! QMP messages are newline-delimited JSON objects exchanged over a UNIX
//! domain socket. After connecting, the server sends a greeting and the
//! client must enable command mode with `qmp_capabilities`. Every command
//! then receives exactly one `return` or `error` reply, echoing the `id` of
//! the request, while asynchronous events may show up at any point in
//! between.

use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default time to wait for a single reply.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum Error {
    #[error("Cannot connect to the socket {0}: {1}")]
    Connect(String, #[source] io::Error),
    #[error("Error writing to or reading from QMP socket: {0}")]
    Socket(#[source] io::Error),
    #[error("Timed out waiting for a QMP reply")]
    Timeout,
    #[error("QMP connection closed by peer")]
    Disconnected,
    #[error("Error decoding QMP message: {0}")]
    Decode(#[source] serde_json::Error),
    #[error("Error encoding QMP command: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("Server did not start with a QMP greeting")]
    Greeting,
    #[error("{class}: {desc}")]
    Command { class: String, desc: String },
}
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Timestamp {
    pub seconds: u64,
    pub microseconds: u64,
}

/// Asynchronous notification sent by the server.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Event {
    pub event: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    pub timestamp: Timestamp,
}

#[derive(Deserialize)]
struct CommandError {
    class: String,
    desc: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Message {
    Greeting {
        #[serde(rename = "QMP")]
        qmp: serde_json::Value,
    },
    Return {
        #[serde(rename = "return")]
        ret: serde_json::Value,
        #[serde(default)]
        id: Option<u64>,
    },
    Error {
        error: CommandError,
        #[serde(default)]
        id: Option<u64>,
    },
    Event(Event),
}

#[derive(Serialize)]
struct Request<'a, T> {
    execute: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a T>,
    id: u64,
}

pub struct QmpMonitor {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
    // Bytes of a line that has not been fully received yet
    partial: Vec<u8>,
    events: Vec<Event>,
    // Id of the last request sent
    last_id: u64,
}

impl QmpMonitor {
    /// Connects to the QMP socket at `path` and enables command mode.
    pub fn connect<P: AsRef<Path>>(path: P, timeout: Duration) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)
            .map_err(|e| Error::Connect(path.display().to_string(), e))?;
        info!("Connected to QMP socket {}", path.display());
        Self::from_stream(stream, timeout)
    }

    /// Takes over an already connected stream and enables command mode.
    pub fn from_stream(stream: UnixStream, timeout: Duration) -> Result<Self> {
        stream
            .set_read_timeout(Some(timeout))
            .map_err(Error::Socket)?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(Error::Socket)?;
        let writer = stream.try_clone().map_err(Error::Socket)?;

        let mut monitor = QmpMonitor {
            reader: BufReader::new(stream),
            writer,
            partial: Vec::new(),
            events: Vec::new(),
            last_id: 0,
        };
        monitor.negotiate()?;

        Ok(monitor)
    }

    fn negotiate(&mut self) -> Result<()> {
        match self.read_message()? {
            Message::Greeting { qmp } => debug!("QMP greeting: {qmp}"),
            _ => return Err(Error::Greeting),
        }
        self.execute::<()>("qmp_capabilities", None)?;

        Ok(())
    }

    fn read_message(&mut self) -> Result<Message> {
        loop {
            match self.reader.read_until(b'\n', &mut self.partial) {
                Ok(0) => return Err(Error::Disconnected),
                Ok(_) => {
                    if !self.partial.ends_with(b"\n") {
                        return Err(Error::Disconnected);
                    }
                    let line = std::mem::take(&mut self.partial);
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    debug!("<- {}", String::from_utf8_lossy(&line).trim_end());
                    return serde_json::from_slice(&line).map_err(Error::Decode);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
                    ) =>
                {
                    return Err(Error::Timeout)
                }
                Err(e) => return Err(Error::Socket(e)),
            }
        }
    }

    /// Runs `name` and waits for its reply, buffering any event received
    /// in the meantime. Replies to earlier requests, such as one that timed
    /// out, are discarded.
    pub fn execute<T: Serialize>(
        &mut self,
        name: &str,
        arguments: Option<&T>,
    ) -> Result<serde_json::Value> {
        self.last_id += 1;
        let id = self.last_id;
        let mut request = serde_json::to_vec(&Request {
            execute: name,
            arguments,
            id,
        })
        .map_err(Error::Encode)?;
        debug!("-> {}", String::from_utf8_lossy(&request));
        request.push(b'\n');

        self.writer.write_all(&request).map_err(Error::Socket)?;
        self.writer.flush().map_err(Error::Socket)?;

        loop {
            match self.read_message()? {
                Message::Return { ret, id: Some(r) } if r == id => return Ok(ret),
                Message::Error {
                    error,
                    id: Some(r),
                } if r == id => {
                    return Err(Error::Command {
                        class: error.class,
                        desc: error.desc,
                    })
                }
                Message::Return { id: r, .. } | Message::Error { id: r, .. } => {
                    warn!("Discarding stale QMP reply (id {r:?}, expected {id})")
                }
                Message::Event(event) => self.events.push(event),
                Message::Greeting { .. } => warn!("Ignoring unexpected QMP greeting"),
            }
        }
    }

    // Picks up whatever the server already sent without waiting for more.
    fn drain_pending(&mut self) -> Result<()> {
        self.reader
            .get_ref()
            .set_nonblocking(true)
            .map_err(Error::Socket)?;

        let result = loop {
            match self.read_message() {
                Ok(Message::Event(event)) => self.events.push(event),
                Ok(_) => warn!("Discarding unsolicited QMP message"),
                Err(Error::Timeout) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        self.reader
            .get_ref()
            .set_nonblocking(false)
            .map_err(Error::Socket)?;

        result
    }

    /// Returns the events stamped at or after `seconds`, in arrival order.
    /// The event buffer is emptied.
    pub fn events_since(&mut self, seconds: u64) -> Result<Vec<Event>> {
        self.drain_pending()?;

        Ok(std::mem::take(&mut self.events)
            .into_iter()
            .filter(|e| e.timestamp.seconds >= seconds)
            .collect())
    }
}

#[cfg(test)]
mod unit_tests {
    use std::io::Read;

    use serde_json::json;

    use super::*;

    const GREETING: &str =
        "{\"QMP\": {\"version\": {\"qemu\": {\"micro\": 0, \"minor\": 2, \"major\": 8}}, \"capabilities\": []}}\n";
    const CAPABILITIES_REPLY: &str = "{\"return\": {}, \"id\": 1}\n";

    // Queues the server side of a conversation before the client starts
    // talking, so no peer thread is needed.
    fn connect_scripted(lines: &[&str], timeout: Duration) -> (Result<QmpMonitor>, UnixStream) {
        let (client, mut server) = UnixStream::pair().unwrap();
        for line in lines {
            server.write_all(line.as_bytes()).unwrap();
        }
        (QmpMonitor::from_stream(client, timeout), server)
    }

    fn sent_requests(server: &mut UnixStream) -> Vec<serde_json::Value> {
        server
            .set_read_timeout(Some(Duration::from_millis(50)))
            .unwrap();
        let mut buf = Vec::new();
        let _ = server.read_to_end(&mut buf);
        String::from_utf8(buf)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[test]
    fn test_execute() {
        let (monitor, mut server) = connect_scripted(
            &[
                GREETING,
                CAPABILITIES_REPLY,
                "{\"return\": {\"name\": \"vm0\"}, \"id\": 2}\n",
            ],
            DEFAULT_TIMEOUT,
        );
        let mut monitor = monitor.unwrap();

        let mut args = std::collections::HashMap::new();
        args.insert("verbose", true);
        let ret = monitor.execute("query-name", Some(&args)).unwrap();
        assert_eq!(ret, json!({"name": "vm0"}));

        assert_eq!(
            sent_requests(&mut server),
            vec![
                json!({"execute": "qmp_capabilities", "id": 1}),
                json!({"execute": "query-name", "arguments": {"verbose": true}, "id": 2}),
            ]
        );
    }

    #[test]
    fn test_command_error() {
        let (monitor, _server) = connect_scripted(
            &[
                GREETING,
                CAPABILITIES_REPLY,
                "{\"error\": {\"class\": \"CommandNotFound\", \"desc\": \"The command foo has not been found\"}, \"id\": 2}\n",
            ],
            DEFAULT_TIMEOUT,
        );
        let mut monitor = monitor.unwrap();

        match monitor.execute::<()>("foo", None) {
            Err(Error::Command { class, desc }) => {
                assert_eq!(class, "CommandNotFound");
                assert_eq!(desc, "The command foo has not been found");
            }
            r => panic!("unexpected result: {r:?}"),
        }
    }

    #[test]
    fn test_events() {
        let (monitor, mut server) = connect_scripted(
            &[
                GREETING,
                CAPABILITIES_REPLY,
                "{\"event\": \"STOP\", \"timestamp\": {\"seconds\": 100, \"microseconds\": 5}}\n",
                "{\"return\": {}, \"id\": 2}\n",
            ],
            DEFAULT_TIMEOUT,
        );
        let mut monitor = monitor.unwrap();
        monitor.execute::<()>("stop", None).unwrap();

        server
            .write_all(
                b"{\"event\": \"RESUME\", \"data\": {\"x\": 1}, \"timestamp\": {\"seconds\": 90, \"microseconds\": 0}}\n\
                  {\"event\": \"RESET\", \"data\": {\"guest\": true}, \"timestamp\": {\"seconds\": 120, \"microseconds\": 1}}\n",
            )
            .unwrap();

        let events = monitor.events_since(100).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "STOP");
        assert_eq!(events[0].data, None);
        assert_eq!(
            events[0].timestamp,
            Timestamp {
                seconds: 100,
                microseconds: 5
            }
        );
        assert_eq!(events[1].event, "RESET");
        assert_eq!(events[1].data, Some(json!({"guest": true})));

        assert!(monitor.events_since(0).unwrap().is_empty());
    }

    #[test]
    fn test_partial_event_line() {
        let (monitor, mut server) = connect_scripted(&[GREETING, CAPABILITIES_REPLY], DEFAULT_TIMEOUT);
        let mut monitor = monitor.unwrap();

        server
            .write_all(b"{\"event\": \"STOP\", \"timestamp\": ")
            .unwrap();
        assert!(monitor.events_since(0).unwrap().is_empty());

        server
            .write_all(b"{\"seconds\": 1, \"microseconds\": 2}}\n")
            .unwrap();
        let events = monitor.events_since(0).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "STOP");
    }

    #[test]
    fn test_missing_greeting() {
        let (monitor, _server) = connect_scripted(&[CAPABILITIES_REPLY], DEFAULT_TIMEOUT);
        assert!(matches!(monitor, Err(Error::Greeting)));
    }

    #[test]
    fn test_timeout() {
        let (monitor, _server) =
            connect_scripted(&[GREETING, CAPABILITIES_REPLY], Duration::from_millis(50));
        let mut monitor = monitor.unwrap();
        assert!(matches!(
            monitor.execute::<()>("query-status", None),
            Err(Error::Timeout)
        ));
    }

    #[test]
    fn test_late_reply_discarded() {
        let (monitor, mut server) =
            connect_scripted(&[GREETING, CAPABILITIES_REPLY], Duration::from_millis(50));
        let mut monitor = monitor.unwrap();

        // Half of the reply arrives before the timeout, the rest after it
        server.write_all(b"{\"return\": {\"name\": ").unwrap();
        assert!(matches!(
            monitor.execute::<()>("query-name", None),
            Err(Error::Timeout)
        ));
        server
            .write_all(
                b"\"late\"}, \"id\": 2}\n\
                  {\"error\": {\"class\": \"GenericError\", \"desc\": \"stale\"}, \"id\": 2}\n\
                  {\"return\": {\"status\": \"running\"}, \"id\": 3}\n",
            )
            .unwrap();

        let ret = monitor.execute::<()>("query-status", None).unwrap();
        assert_eq!(ret, json!({"status": "running"}));
    }

    #[test]
    fn test_disconnected() {
        let (monitor, server) = connect_scripted(&[GREETING, CAPABILITIES_REPLY], DEFAULT_TIMEOUT);
        let mut monitor = monitor.unwrap();
        server.shutdown(std::net::Shutdown::Write).unwrap();
        assert!(matches!(
            monitor.execute::<()>("query-status", None),
            Err(Error::Disconnected)
        ));
    }

    #[test]
    fn test_decode_error() {
        let (monitor, _server) =
            connect_scripted(&[GREETING, CAPABILITIES_REPLY, "not json\n"], DEFAULT_TIMEOUT);
        let mut monitor = monitor.unwrap();
        assert!(matches!(
            monitor.execute::<()>("query-status", None),
            Err(Error::Decode(_))
        ));
    }
}
