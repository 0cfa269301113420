//! taskrelay client library
//!
//! Keeps one persistent, reconnecting connection to the daemon and multiplexes any number of
//! outstanding requests over it by correlation id. Each request waits under a queue timeout
//! until the daemon reports `processing`, then under a processing timeout until its terminal
//! message arrives.

pub mod connector;
pub mod hooks;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde_json::{Map, Value};
use taskrelay_common::codec::{encode, LineDecoder};
use taskrelay_common::protocol::{parse_message, REQUEST_ID_FIELD};
use taskrelay_common::{ActionKinds, Message, RelayConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub use connector::{BoxedReader, BoxedWriter, Connector, UnixConnector};
pub use hooks::StageHooks;
pub use taskrelay_common::DEFAULT_SOCK;

use hooks::Hook;

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("IPC connection error: {0}")]
    Connection(String),
    #[error("Queue timeout - request waited longer than {0:?}")]
    QueueTimeout(Duration),
    #[error("Processing timeout - execution took longer than {0:?}")]
    ProcessingTimeout(Duration),
    #[error("request rejected by daemon: {0}")]
    Rejected(String),
    #[error("request payload must be a JSON object")]
    InvalidPayload,
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub socket_path: PathBuf,
    pub connection_timeout: Duration,
    pub queue_timeout: Duration,
    pub processing_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_delay: Duration,
    pub kinds: ActionKinds,
}

impl ClientConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            socket_path: config.socket_path.clone(),
            connection_timeout: config.connection_timeout(),
            queue_timeout: config.queue_timeout(),
            processing_timeout: config.processing_timeout(),
            max_reconnects: config.max_reconnects,
            reconnect_delay: config.reconnect_delay(),
            kinds: config.kinds.clone(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from_relay(&RelayConfig::default())
    }
}

enum Event {
    Queued,
    Processing,
    Terminal(Message),
    Rejected(String),
    Disconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Waiting,
    Processing,
}

struct PendingRequest {
    connection: u64,
    events: mpsc::UnboundedSender<Event>,
}

struct Connection {
    id: u64,
    writer: tokio::sync::Mutex<BoxedWriter>,
    open: Arc<AtomicBool>,
    reader: JoinHandle<()>,
}

impl Connection {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write_frame(&self, line: &[u8]) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(line).await?;
        writer.flush().await
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[derive(Default)]
struct ConnectionState {
    live: Option<Arc<Connection>>,
    reconnect_attempts: u32,
    // Outcome of the most recent connect sequence that gave up.
    last_failure: Option<String>,
}

struct Shared {
    config: ClientConfig,
    connector: Box<dyn Connector>,
    // Held for the whole connect sequence so concurrent callers wait on one attempt.
    state: tokio::sync::Mutex<ConnectionState>,
    pending: Mutex<HashMap<String, PendingRequest>>,
    next_connection: AtomicU64,
    // Bumped under `state` each time a connect sequence exhausts its attempts.
    failed_sequences: AtomicU64,
}

/// Handle to the daemon. Cheap to clone; clones share the connection and pending requests.
#[derive(Clone)]
pub struct RelayClient {
    shared: Arc<Shared>,
}

impl RelayClient {
    /// Client over the Unix socket named in `config`. No connection is opened until the first
    /// request.
    pub fn new(config: ClientConfig) -> Self {
        let connector = UnixConnector::new(config.socket_path.clone());
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: ClientConfig, connector: impl Connector + 'static) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connector: Box::new(connector),
                state: tokio::sync::Mutex::new(ConnectionState::default()),
                pending: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
                failed_sequences: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Whether a live connection is currently held.
    pub async fn is_connected(&self) -> bool {
        let state = self.shared.state.lock().await;
        state.live.as_ref().is_some_and(|conn| conn.is_open())
    }

    /// Requests still waiting for their outcome.
    pub fn pending_count(&self) -> usize {
        self.shared.lock_pending().len()
    }

    /// Sends one request and waits for its terminal message.
    ///
    /// `payload` must be a JSON object (or null); `requestId` is added to it. The returned
    /// message is the full terminal frame, whatever its `success` flag says.
    pub async fn send_request(
        &self,
        kind: &str,
        payload: Value,
        hooks: StageHooks,
    ) -> Result<Message, ClientError> {
        let mut data = match payload {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            _ => return Err(ClientError::InvalidPayload),
        };

        let conn = self.ensure_connection().await?;
        let request_id = Uuid::new_v4().to_string();
        data.insert(REQUEST_ID_FIELD.into(), Value::String(request_id.clone()));
        let line = encode(&Message::new(kind, data))?;

        let (tx, rx) = mpsc::unbounded_channel();
        // Removes the entry on every exit path, including the caller dropping this future.
        let _registration = self.register(&conn, &request_id, tx)?;

        if let Err(err) = conn.write_frame(&line).await {
            conn.open.store(false, Ordering::SeqCst);
            return Err(ClientError::Connection(format!(
                "failed to send request: {err}"
            )));
        }
        debug!("Sent IPC message: {} (request {})", kind, request_id);

        self.await_outcome(&request_id, rx, hooks).await
    }

    fn register<'a>(
        &'a self,
        conn: &Connection,
        request_id: &'a str,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Registration<'a>, ClientError> {
        self.shared.lock_pending().insert(
            request_id.to_string(),
            PendingRequest {
                connection: conn.id,
                events,
            },
        );
        let registration = Registration {
            shared: &self.shared,
            request_id,
        };
        // The reader may have failed this connection's requests before the entry existed.
        if !conn.is_open() {
            return Err(ClientError::Connection("IPC connection closed".into()));
        }
        Ok(registration)
    }

    async fn await_outcome(
        &self,
        request_id: &str,
        mut events: mpsc::UnboundedReceiver<Event>,
        mut hooks: StageHooks,
    ) -> Result<Message, ClientError> {
        let config = &self.shared.config;
        let mut phase = Phase::Waiting;
        let mut deadline = Instant::now() + config.queue_timeout;

        loop {
            let event = match time::timeout_at(deadline, events.recv()).await {
                Err(_) => {
                    warn!(request_id, ?phase, "Request timed out");
                    return Err(match phase {
                        Phase::Waiting => ClientError::QueueTimeout(config.queue_timeout),
                        Phase::Processing => {
                            ClientError::ProcessingTimeout(config.processing_timeout)
                        }
                    });
                }
                Ok(None) => {
                    return Err(ClientError::Connection("IPC connection closed".into()));
                }
                Ok(Some(event)) => event,
            };

            match event {
                Event::Queued => {
                    debug!(request_id, "Request queued");
                    if phase == Phase::Waiting {
                        run_hook(hooks.on_queued.as_mut(), "queued", request_id, deadline).await;
                    }
                }
                Event::Processing => {
                    if phase == Phase::Waiting {
                        phase = Phase::Processing;
                        deadline = Instant::now() + config.processing_timeout;
                        debug!(request_id, "Request processing");
                        run_hook(
                            hooks.on_processing.as_mut(),
                            "processing",
                            request_id,
                            deadline,
                        )
                        .await;
                    }
                }
                Event::Terminal(msg) => {
                    debug!("Received IPC message: {} (request {})", msg.kind, request_id);
                    return Ok(msg);
                }
                Event::Rejected(reason) => return Err(ClientError::Rejected(reason)),
                Event::Disconnected(reason) => return Err(ClientError::Connection(reason)),
            }
        }
    }

    /// Returns the live connection, opening one if needed.
    ///
    /// Attempts are bounded by `connection_timeout` each and `max_reconnects` in total. A caller
    /// arriving while another sequence is underway waits for it and shares its result: the new
    /// connection on success, the same `ClientError::Connection` when it gave up.
    async fn ensure_connection(&self) -> Result<Arc<Connection>, ClientError> {
        let shared = &self.shared;
        let config = &shared.config;
        let seen_failures = shared.failed_sequences.load(Ordering::SeqCst);
        let mut state = shared.state.lock().await;

        if let Some(conn) = state.live.as_ref().filter(|conn| conn.is_open()) {
            return Ok(Arc::clone(conn));
        }
        if shared.failed_sequences.load(Ordering::SeqCst) != seen_failures {
            let reason = state
                .last_failure
                .clone()
                .unwrap_or_else(|| "Failed to connect to IPC server".to_string());
            return Err(ClientError::Connection(reason));
        }
        if let Some(dead) = state.live.take() {
            shared.fail_connection(dead.id, "IPC connection lost");
        }
        state.reconnect_attempts = 0;

        let max_attempts = config.max_reconnects.max(1);
        let mut last_error = String::new();

        while state.reconnect_attempts < max_attempts {
            state.reconnect_attempts += 1;
            let attempt = state.reconnect_attempts;

            match time::timeout(config.connection_timeout, shared.connector.connect()).await {
                Ok(Ok((reader, writer))) => {
                    let id = shared.next_connection.fetch_add(1, Ordering::Relaxed);
                    let open = Arc::new(AtomicBool::new(true));
                    let reader = tokio::spawn(read_loop(
                        Arc::downgrade(shared),
                        id,
                        Arc::clone(&open),
                        reader,
                    ));
                    let conn = Arc::new(Connection {
                        id,
                        writer: tokio::sync::Mutex::new(writer),
                        open,
                        reader,
                    });
                    debug!(connection = id, "IPC connected (attempt {})", attempt);
                    state.live = Some(Arc::clone(&conn));
                    state.reconnect_attempts = 0;
                    state.last_failure = None;
                    return Ok(conn);
                }
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_) => last_error = "Connection timeout".to_string(),
            }

            warn!("IPC connect attempt {} failed: {}", attempt, last_error);
            if attempt < max_attempts {
                time::sleep(config.reconnect_delay).await;
            }
        }

        error!("Max IPC reconnects reached");
        let reason = format!(
            "unable to establish IPC connection after {max_attempts} attempt(s): {last_error}"
        );
        state.last_failure = Some(reason.clone());
        shared.failed_sequences.fetch_add(1, Ordering::SeqCst);
        Err(ClientError::Connection(reason))
    }
}

impl Shared {
    fn lock_pending(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Routes one inbound message to the pending request it names, if any.
    fn dispatch(&self, msg: Message) {
        let Some(request_id) = msg.request_id().map(str::to_owned) else {
            debug!(kind = %msg.kind, "Ignoring IPC message without requestId");
            return;
        };
        let kinds = &self.config.kinds;
        let mut pending = self.lock_pending();

        if msg.kind == kinds.response || msg.is_error() {
            let Some(entry) = pending.remove(&request_id) else {
                debug!(
                    request_id = %request_id,
                    kind = %msg.kind,
                    "Dropping message for unknown request"
                );
                return;
            };
            let event = if msg.is_error() {
                Event::Rejected(msg.error_message().unwrap_or("unknown error").to_string())
            } else {
                Event::Terminal(msg)
            };
            let _ = entry.events.send(event);
            return;
        }

        let event = if msg.kind == kinds.queued {
            Event::Queued
        } else if msg.kind == kinds.processing {
            Event::Processing
        } else {
            debug!(
                request_id = %request_id,
                kind = %msg.kind,
                "Ignoring unrecognised message type"
            );
            return;
        };

        match pending.get(&request_id) {
            Some(entry) => {
                let _ = entry.events.send(event);
            }
            None => debug!(
                request_id = %request_id,
                kind = %msg.kind,
                "Dropping message for unknown request"
            ),
        }
    }

    /// Fails every request bound to a connection that just went away.
    fn fail_connection(&self, connection: u64, reason: &str) {
        let mut pending = self.lock_pending();
        let affected: Vec<String> = pending
            .iter()
            .filter(|(_, entry)| entry.connection == connection)
            .map(|(id, _)| id.clone())
            .collect();

        for id in affected {
            if let Some(entry) = pending.remove(&id) {
                let _ = entry.events.send(Event::Disconnected(reason.to_string()));
            }
        }
    }
}

struct Registration<'a> {
    shared: &'a Shared,
    request_id: &'a str,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.shared.lock_pending().remove(self.request_id);
    }
}

async fn read_loop(
    shared: Weak<Shared>,
    connection: u64,
    open: Arc<AtomicBool>,
    mut reader: BoxedReader,
) {
    let mut decoder = LineDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    let reason = loop {
        match reader.read(&mut chunk).await {
            Ok(0) => break "IPC socket closed".to_string(),
            Ok(n) => {
                let Some(shared) = shared.upgrade() else {
                    return;
                };
                for frame in decoder.push(&chunk[..n]) {
                    match frame.map(parse_message) {
                        Ok(Ok(msg)) => shared.dispatch(msg),
                        Ok(Err(err)) => warn!(connection, "Invalid message from IPC: {}", err),
                        Err(err) => error!(connection, "Invalid JSON from IPC: {}", err),
                    }
                }
            }
            Err(err) => break format!("IPC socket error: {err}"),
        }
    };

    open.store(false, Ordering::SeqCst);
    debug!(connection, "{}", reason);
    if let Some(shared) = shared.upgrade() {
        shared.fail_connection(connection, &reason);
    }
}

async fn run_hook(hook: Option<&mut Hook>, stage: &str, request_id: &str, deadline: Instant) {
    let Some(hook) = hook else {
        return;
    };
    let mut task = tokio::spawn(hook());
    match time::timeout_at(deadline, &mut task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => warn!(request_id, stage, "Stage hook failed: {:#}", err),
        Ok(Err(join_err)) => warn!(request_id, stage, "Stage hook aborted: {}", join_err),
        Err(_) => {
            task.abort();
            warn!(request_id, stage, "Stage hook still running at timeout; abandoned");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> RelayClient {
        RelayClient::new(ClientConfig::default())
    }

    fn register(client: &RelayClient, id: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        client.shared.lock_pending().insert(
            id.to_string(),
            PendingRequest {
                connection: 7,
                events: tx,
            },
        );
        rx
    }

    fn msg(value: Value) -> Message {
        parse_message(value).unwrap()
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let client = client();
        let mut rx = register(&client, "mine");

        client
            .shared
            .dispatch(msg(json!({"type": "response", "data": {"requestId": "other"}})));
        client
            .shared
            .dispatch(msg(json!({"type": "processing", "data": {"requestId": "other"}})));
        client.shared.dispatch(msg(json!({"type": "response", "data": {}})));

        assert!(rx.try_recv().is_err());
        assert_eq!(client.pending_count(), 1);
    }

    #[test]
    fn terminal_settles_once() {
        let client = client();
        let mut rx = register(&client, "r1");
        let terminal = json!({"type": "response", "data": {"requestId": "r1", "success": true}});

        client.shared.dispatch(msg(terminal.clone()));
        client.shared.dispatch(msg(terminal));
        client
            .shared
            .dispatch(msg(json!({"type": "processing", "data": {"requestId": "r1"}})));

        assert!(matches!(rx.try_recv(), Ok(Event::Terminal(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn error_with_request_id_rejects() {
        let client = client();
        let mut rx = register(&client, "r1");
        client.shared.dispatch(msg(json!({
            "type": "error",
            "data": {"requestId": "r1", "message": "Unknown request type: x"}
        })));
        match rx.try_recv() {
            Ok(Event::Rejected(reason)) => assert_eq!(reason, "Unknown request type: x"),
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn connection_failure_only_hits_its_own_requests() {
        let client = client();
        let mut ours = register(&client, "a");
        let (tx, mut theirs) = mpsc::unbounded_channel();
        client.shared.lock_pending().insert(
            "b".into(),
            PendingRequest {
                connection: 8,
                events: tx,
            },
        );

        client.shared.fail_connection(7, "IPC socket closed");
        assert!(matches!(ours.try_recv(), Ok(Event::Disconnected(_))));
        assert!(theirs.try_recv().is_err());
        assert_eq!(client.pending_count(), 1);
    }

    struct ClosedConnector;

    #[async_trait::async_trait]
    impl Connector for ClosedConnector {
        async fn connect(&self) -> std::io::Result<(BoxedReader, BoxedWriter)> {
            Ok((Box::new(tokio::io::empty()), Box::new(tokio::io::sink())))
        }
    }

    #[tokio::test]
    async fn registering_on_a_connection_that_already_closed_fails_fast() {
        let client = RelayClient::with_connector(ClientConfig::default(), ClosedConnector);
        let conn = client.ensure_connection().await.unwrap();
        for _ in 0..100 {
            if !conn.is_open() {
                break;
            }
            time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!conn.is_open());

        let (tx, _rx) = mpsc::unbounded_channel();
        let err = client.register(&conn, "late", tx).err().unwrap();
        assert!(matches!(err, ClientError::Connection(_)));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn non_object_payload_is_refused() {
        let err = client()
            .send_request("run", json!([1, 2]), StageHooks::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidPayload));
    }
}
