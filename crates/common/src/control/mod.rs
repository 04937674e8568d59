//! JSON control protocol over unix stream sockets.
//!
//! Frames are UTF-8 JSON documents terminated by a blank line (`\n\n`).
//! Requests are `{"cmd": <name>, "args": {...}}`; responses are
//! `{"result": ...}` or `{"error": {"class": ..., "desc": ...}}`. Events
//! are pushed asynchronously as bare JSON arrays on the same socket.

pub mod client;
pub mod server;

pub use client::{ControlClient, ControlClientError};
pub use server::{CommandError, CommandHandler, ConnectionHandle, ControlServer, ServerHandle};

/// Terminator between frames.
pub const FRAME_SEPARATOR: &str = "\n\n";
