//! Blocking client side of the control protocol.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;

use serde_json::{json, Value};

#[derive(Debug, thiserror::Error)]
pub enum ControlClientError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("{class}: {desc}")]
    Remote { class: String, desc: String },

    #[error("connection closed")]
    Closed,
}

/// A connection to a control socket.
///
/// Responses and events share the socket: events received while waiting
/// for a command response are queued and drained via
/// [`ControlClient::wait_event`].
pub struct ControlClient {
    stream: UnixStream,
    reader: BufReader<UnixStream>,
    pending_events: VecDeque<Vec<Value>>,
}

impl ControlClient {
    pub fn connect(path: &Path) -> Result<Self, ControlClientError> {
        let stream = UnixStream::connect(path)?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            stream,
            reader,
            pending_events: VecDeque::new(),
        })
    }

    /// Send a command and wait for its response.
    pub fn run_command(&mut self, cmd: &str, args: Value) -> Result<Value, ControlClientError> {
        let request = json!({ "cmd": cmd, "args": args });
        let frame = serde_json::to_string(&request)
            .map_err(|e| ControlClientError::Protocol(e.to_string()))?;
        self.stream.write_all(frame.as_bytes())?;
        self.stream.write_all(super::FRAME_SEPARATOR.as_bytes())?;
        self.stream.flush()?;

        loop {
            match self.read_frame()? {
                Frame::Response(response) => {
                    if let Some(error) = response.get("error") {
                        return Err(ControlClientError::Remote {
                            class: error
                                .get("class")
                                .and_then(Value::as_str)
                                .unwrap_or("unknown")
                                .to_string(),
                            desc: error
                                .get("desc")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                        });
                    }
                    return Ok(response.get("result").cloned().unwrap_or(Value::Null));
                }
                Frame::Events(events) => self.pending_events.push_back(events),
            }
        }
    }

    /// Block until the next event batch arrives.
    pub fn wait_event(&mut self) -> Result<Vec<Value>, ControlClientError> {
        if let Some(events) = self.pending_events.pop_front() {
            return Ok(events);
        }
        loop {
            match self.read_frame()? {
                Frame::Events(events) => return Ok(events),
                Frame::Response(_) => {
                    // A response nobody is waiting for; drop it.
                    continue;
                }
            }
        }
    }

    /// Iterate over event batches until the connection closes.
    pub fn iter_events(&mut self) -> impl Iterator<Item = Vec<Value>> + '_ {
        std::iter::from_fn(move || self.wait_event().ok())
    }

    fn read_frame(&mut self) -> Result<Frame, ControlClientError> {
        let mut frame = String::new();
        loop {
            let mut line = String::new();
            let read = self.reader.read_line(&mut line)?;
            if read == 0 {
                if frame.trim().is_empty() {
                    return Err(ControlClientError::Closed);
                }
                break;
            }
            if line == "\n" {
                if frame.trim().is_empty() {
                    continue;
                }
                break;
            }
            frame.push_str(&line);
        }
        let value: Value = serde_json::from_str(&frame)
            .map_err(|e| ControlClientError::Protocol(format!("malformed frame: {}", e)))?;
        match value {
            Value::Array(events) => Ok(Frame::Events(events)),
            Value::Object(_) => Ok(Frame::Response(value)),
            _ => Err(ControlClientError::Protocol("unexpected frame shape".into())),
        }
    }
}

enum Frame {
    Response(Value),
    Events(Vec<Value>),
}
