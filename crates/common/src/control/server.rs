//! Socket server side of the control protocol.
//!
//! The server owns the accept loop; every connection gets a reader task
//! and a writer task. Command execution runs on the blocking pool since
//! handlers may call into storage backends. A connection's watches die
//! with it: close callbacks registered on the [`ConnectionHandle`] run
//! when the peer disconnects.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};

use crate::manifest::Schema;

/// A command-level failure, reported to the client as
/// `{"error": {"class", "desc"}}`. The connection stays open.
#[derive(Debug, thiserror::Error)]
#[error("{class}: {desc}")]
pub struct CommandError {
    pub class: String,
    pub desc: String,
}

impl CommandError {
    pub fn new(class: &str, desc: impl std::fmt::Display) -> Self {
        Self {
            class: class.to_string(),
            desc: desc.to_string(),
        }
    }

    pub fn control(desc: impl std::fmt::Display) -> Self {
        Self::new("ControlError", desc)
    }
}

/// Server-side view of one client connection.
///
/// Watch registrations keep a clone; events pushed through it are
/// interleaved with responses on the same socket.
pub struct ConnectionHandle {
    id: u64,
    events: mpsc::UnboundedSender<String>,
    close_callbacks: parking_lot::Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl ConnectionHandle {
    /// A handle not attached to any socket; pushed events are dropped.
    /// Useful for in-process callers and tests.
    pub fn detached(id: u64) -> Arc<Self> {
        let (events, _) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            events,
            close_callbacks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    /// A handle whose pushed frames land on the returned receiver.
    pub fn with_channel(id: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id,
                events,
                close_callbacks: parking_lot::Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Push an event batch to the client. Safe to call from any thread.
    pub fn send_event(&self, events: Vec<Value>) {
        let frame = match serde_json::to_string(&Value::Array(events)) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("cannot serialize event batch: {}", e);
                return;
            }
        };
        let _ = self.events.send(frame);
    }

    /// Run a cleanup when the connection closes (e.g. release watches).
    pub fn on_close(&self, callback: impl FnOnce() + Send + 'static) {
        self.close_callbacks.lock().push(Box::new(callback));
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    fn close(&self) {
        let callbacks = std::mem::take(&mut *self.close_callbacks.lock());
        for callback in callbacks {
            callback();
        }
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle").field("id", &self.id).finish()
    }
}

/// Implemented by the daemon: dispatch one validated command.
pub trait CommandHandler: Send + Sync + 'static {
    fn handle(
        &self,
        cmd: &str,
        args: Value,
        conn: &Arc<ConnectionHandle>,
    ) -> Result<Value, CommandError>;
}

/// The control socket server.
pub struct ControlServer {
    handler: Arc<dyn CommandHandler>,
    validators: Arc<HashMap<String, Schema>>,
}

/// Handle for stopping a running server.
pub struct ServerHandle {
    path: PathBuf,
    shutdown: watch::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl ServerHandle {
    /// Stop accepting connections and remove the socket file.
    pub async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.task.await;
        let _ = std::fs::remove_file(&self.path);
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }
}

impl ControlServer {
    pub fn new(handler: Arc<dyn CommandHandler>, validators: HashMap<String, Schema>) -> Self {
        Self {
            handler,
            validators: Arc::new(validators),
        }
    }

    /// Bind the socket and start serving.
    pub fn start(self, path: &Path) -> std::io::Result<ServerHandle> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(path)?;
        tracing::info!("control server listening on {}", path.display());

        let (shutdown_tx, mut shutdown_rx) = watch::channel(());
        let handler = self.handler;
        let validators = self.validators;
        let connection_counter = Arc::new(AtomicU64::new(1));

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, _)) => {
                                let id = connection_counter.fetch_add(1, Ordering::SeqCst);
                                tokio::spawn(handle_connection(
                                    stream,
                                    id,
                                    handler.clone(),
                                    validators.clone(),
                                ));
                            }
                            Err(e) => {
                                tracing::error!("control accept failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
        });

        Ok(ServerHandle {
            path: path.to_path_buf(),
            shutdown: shutdown_tx,
            task,
        })
    }
}

async fn handle_connection(
    stream: UnixStream,
    id: u64,
    handler: Arc<dyn CommandHandler>,
    validators: Arc<HashMap<String, Schema>>,
) {
    tracing::debug!("control connection {} opened", id);
    let (read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let conn = Arc::new(ConnectionHandle {
        id,
        events: tx,
        close_callbacks: parking_lot::Mutex::new(Vec::new()),
    });

    // Writer: everything leaving the socket goes through one queue so
    // responses and events never interleave mid-frame.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write_half.write_all(frame.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(super::FRAME_SEPARATOR.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut reader = BufReader::new(read_half);
    let mut request = String::new();
    loop {
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                // EOF: the last request may end without a separator.
                if !request.trim().is_empty() {
                    dispatch(&handler, &validators, &conn, &request).await;
                }
                break;
            }
            Ok(_) => {
                if line == "\n" {
                    if !request.trim().is_empty() {
                        let frame = std::mem::take(&mut request);
                        dispatch(&handler, &validators, &conn, &frame).await;
                    }
                } else {
                    request.push_str(&line);
                }
            }
            Err(e) => {
                tracing::debug!("control connection {} read error: {}", id, e);
                break;
            }
        }
    }

    conn.close();
    writer.abort();
    tracing::debug!("control connection {} closed", id);
}

async fn dispatch(
    handler: &Arc<dyn CommandHandler>,
    validators: &Arc<HashMap<String, Schema>>,
    conn: &Arc<ConnectionHandle>,
    request: &str,
) {
    let response = match handle_request(handler, validators, conn, request).await {
        Ok(result) => json!({ "result": result }),
        Err(e) => {
            tracing::debug!("control request failed: {}", e);
            json!({ "error": { "class": e.class, "desc": e.desc } })
        }
    };
    match serde_json::to_string_pretty(&response) {
        Ok(frame) => {
            let _ = conn.events.send(frame);
        }
        Err(e) => tracing::error!("cannot serialize control response: {}", e),
    }
}

async fn handle_request(
    handler: &Arc<dyn CommandHandler>,
    validators: &Arc<HashMap<String, Schema>>,
    conn: &Arc<ConnectionHandle>,
    request: &str,
) -> Result<Value, CommandError> {
    let request: Value = serde_json::from_str(request)
        .map_err(|e| CommandError::control(format!("malformed JSON: {}", e)))?;
    let cmd = request
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or_else(|| CommandError::control("expecting a \"cmd\" key"))?
        .to_string();
    let args = request.get("args").cloned().unwrap_or_else(|| json!({}));

    if let Some(validator) = validators.get(&cmd) {
        validator
            .validate(&args)
            .map_err(|e| CommandError::new("SchemaError", e))?;
    } else if !validators.is_empty() {
        return Err(CommandError::control(format!("unknown command: {}", cmd)));
    }

    // Handlers may block on backend I/O; keep them off the async runtime.
    let handler = handler.clone();
    let conn = conn.clone();
    tokio::task::spawn_blocking(move || handler.handle(&cmd, args, &conn))
        .await
        .map_err(|e| CommandError::new("ControlError", format!("handler panicked: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::client::ControlClient;
    use crate::manifest::CommandSet;

    struct EchoHandler;

    impl CommandHandler for EchoHandler {
        fn handle(
            &self,
            cmd: &str,
            args: Value,
            conn: &Arc<ConnectionHandle>,
        ) -> Result<Value, CommandError> {
            match cmd {
                "test" => Ok(json!({ "kwargs": args })),
                "event" => {
                    conn.send_event(vec![json!({"type": "create", "path": "/x"})]);
                    Ok(Value::Null)
                }
                other => Err(CommandError::control(format!("unknown command: {}", other))),
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_request_response() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let server = ControlServer::new(Arc::new(EchoHandler), HashMap::new());
        let handle = server.start(&path).unwrap();

        let response = tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let mut client = ControlClient::connect(&path).unwrap();
                client.run_command("test", json!({"x": 1})).unwrap()
            }
        })
        .await
        .unwrap();
        assert_eq!(response, json!({ "kwargs": { "x": 1 } }));

        handle.stop().await;
        assert!(!path.exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_unknown_command_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let validators = Schema::load_commands(CommandSet::Fs).unwrap();
        let server = ControlServer::new(Arc::new(EchoHandler), validators);
        let handle = server.start(&path).unwrap();

        tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let mut client = ControlClient::connect(&path).unwrap();
                let err = client.run_command("bogus", json!({})).unwrap_err();
                assert!(err.to_string().contains("unknown command"));
                // The same connection still works afterwards.
                let result = client.run_command("test", json!({})).unwrap();
                assert_eq!(result, json!({ "kwargs": {} }));
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_schema_validated_args() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let validators = Schema::load_commands(CommandSet::Fs).unwrap();
        let server = ControlServer::new(Arc::new(EchoHandler), validators);
        let handle = server.start(&path).unwrap();

        tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let mut client = ControlClient::connect(&path).unwrap();
                // "mount" requires an items list.
                let err = client.run_command("mount", json!({})).unwrap_err();
                assert!(err.to_string().contains("SchemaError"));
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_event_push() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("control.sock");
        let server = ControlServer::new(Arc::new(EchoHandler), HashMap::new());
        let handle = server.start(&path).unwrap();

        tokio::task::spawn_blocking({
            let path = path.clone();
            move || {
                let mut client = ControlClient::connect(&path).unwrap();
                client.run_command("event", json!({})).unwrap();
                let events = client.wait_event().unwrap();
                assert_eq!(events[0]["type"], "create");
            }
        })
        .await
        .unwrap();

        handle.stop().await;
    }
}
