//! Unix socket front end of the queue.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use taskrelay_common::codec::{encode, FrameError, LineDecoder};
use taskrelay_common::protocol::{parse_message, request_id_hint};
use taskrelay_common::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::queue::{QueueItem, ReplyHandle, WorkQueue};

const READ_CHUNK: usize = 8 * 1024;
const SOCKET_MODE: u32 = 0o666;

/// Stops the accept loop and removes the socket file. Safe to trigger more than once and from
/// any task, including a signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    inner: Arc<ShutdownInner>,
}

struct ShutdownInner {
    requested: AtomicBool,
    tx: watch::Sender<bool>,
    socket_path: PathBuf,
}

impl ShutdownHandle {
    fn new(socket_path: PathBuf) -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            inner: Arc::new(ShutdownInner {
                requested: AtomicBool::new(false),
                tx,
                socket_path,
            }),
        }
    }

    pub fn shutdown(&self) {
        if self.inner.requested.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.tx.send_replace(true);
        remove_socket_file(&self.inner.socket_path);
        info!("IPC server stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.requested.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.inner.tx.subscribe()
    }
}

pub struct Acceptor {
    listener: UnixListener,
    socket_path: PathBuf,
    queue: WorkQueue,
    request_types: Arc<Vec<String>>,
    shutdown: ShutdownHandle,
}

impl Acceptor {
    /// Binds `socket_path`, replacing a stale socket file left by a previous run.
    ///
    /// `request_types` limits which message types are queued; empty accepts any.
    pub fn bind(
        socket_path: impl Into<PathBuf>,
        queue: WorkQueue,
        request_types: Vec<String>,
    ) -> Result<Self> {
        let socket_path = socket_path.into();

        match fs::remove_file(&socket_path) {
            Ok(()) => info!("Removed existing socket file: {}", socket_path.display()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(
                "Could not remove existing socket file {}: {}",
                socket_path.display(),
                err
            ),
        }

        let listener = UnixListener::bind(&socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;

        if let Err(err) = fs::set_permissions(&socket_path, fs::Permissions::from_mode(SOCKET_MODE))
        {
            warn!("Could not set socket permissions: {}", err);
        }

        info!("Server listening on Unix socket: {}", socket_path.display());

        Ok(Self {
            listener,
            shutdown: ShutdownHandle::new(socket_path.clone()),
            socket_path,
            queue,
            request_types: Arc::new(request_types),
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Accepts connections until shutdown is requested.
    pub async fn run(self) -> Result<()> {
        let Acceptor {
            listener,
            queue,
            request_types,
            shutdown,
            ..
        } = self;
        let mut stop = shutdown.subscribe();
        let next_connection = AtomicU64::new(1);

        loop {
            tokio::select! {
                _ = stop.wait_for(|stopped| *stopped) => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let connection = next_connection.fetch_add(1, Ordering::Relaxed);
                        let queue = queue.clone();
                        let request_types = Arc::clone(&request_types);
                        tokio::spawn(async move {
                            if let Err(e) =
                                handle_connection(stream, connection, queue, request_types).await
                            {
                                error!(connection, "Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                },
            }
        }

        drop(listener);
        // No-op when shutdown already ran; covers the listener closing on its own.
        shutdown.shutdown();
        Ok(())
    }
}

async fn handle_connection(
    stream: UnixStream,
    connection: u64,
    queue: WorkQueue,
    request_types: Arc<Vec<String>>,
) -> Result<()> {
    debug!(connection, "Client connected to Unix socket");
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(write_replies(writer, rx, connection));

    let reply = ReplyHandle::new(connection, tx);
    let mut decoder = LineDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        for frame in decoder.push(&chunk[..n]) {
            route_frame(frame, &reply, &queue, &request_types);
        }
    }

    // Items still queued keep their own reply handles; the writer ends once they are done.
    debug!(connection, "Client disconnected");
    Ok(())
}

async fn write_replies(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Message>,
    connection: u64,
) {
    while let Some(msg) = rx.recv().await {
        let line = match encode(&msg) {
            Ok(line) => line,
            Err(err) => {
                error!(connection, "Error encoding IPC response: {}", err);
                continue;
            }
        };
        if let Err(err) = writer.write_all(&line).await {
            debug!(connection, "Error sending IPC response: {}", err);
            break;
        }
    }
}

fn route_frame(
    frame: Result<Value, FrameError>,
    reply: &ReplyHandle,
    queue: &WorkQueue,
    request_types: &[String],
) {
    let connection = reply.connection();
    let value = match frame {
        Ok(value) => value,
        Err(FrameError::Json(err)) => {
            warn!(connection, "Error parsing IPC message: {}", err);
            reply.send(Message::error("Invalid JSON format", None));
            return;
        }
        Err(err) => {
            warn!(connection, "Dropped IPC frame: {}", err);
            reply.send(Message::error(err.to_string(), None));
            return;
        }
    };

    let hint = request_id_hint(&value).map(str::to_owned);
    let message = match parse_message(value) {
        Ok(message) => message,
        Err(err) => {
            warn!(connection, "Rejected IPC message: {}", err);
            reply.send(Message::error(err.to_string(), hint.as_deref()));
            return;
        }
    };

    if !request_types.is_empty() && !request_types.iter().any(|t| *t == message.kind) {
        warn!(connection, kind = %message.kind, "Unknown request type");
        reply.send(Message::error(
            format!("Unknown request type: {}", message.kind),
            message.request_id(),
        ));
        return;
    }

    info!(
        connection,
        kind = %message.kind,
        request_id = ?message.request_id(),
        "IPC message received"
    );
    queue.enqueue(QueueItem::new(message, reply.clone()));
}

fn remove_socket_file(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed socket file: {}", path.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!("Could not remove socket file {}: {}", path.display(), err),
    }
}
