#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use taskrelay_common::{ActionKinds, TaskOutcome};
use taskrelayd::{Acceptor, QueueSettings, TaskExecutor, TaskRequest, WorkQueue};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

struct DelayExecutor(Duration);

#[async_trait]
impl TaskExecutor for DelayExecutor {
    async fn execute(&self, _request: &TaskRequest) -> Result<TaskOutcome> {
        sleep(self.0).await;
        Ok(TaskOutcome::success())
    }
}

fn start_server(
    dir: &Path,
    work: Duration,
    item_delay: Duration,
) -> (PathBuf, taskrelayd::ShutdownHandle) {
    let sock = dir.join("relay.sock");
    let queue = WorkQueue::new(
        Arc::new(DelayExecutor(work)),
        QueueSettings {
            kinds: ActionKinds::default(),
            item_delay,
            execution_timeout: Duration::from_secs(5),
        },
    );
    let acceptor = Acceptor::bind(&sock, queue, vec!["run".into()]).expect("bind");
    let shutdown = acceptor.shutdown_handle();
    tokio::spawn(acceptor.run());
    (sock, shutdown)
}

struct RawClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl RawClient {
    async fn connect(sock: &Path) -> Self {
        let stream = UnixStream::connect(sock).await.expect("connect");
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
        }
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.writer.write_all(bytes).await.expect("write");
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
            .await
            .expect("reply within 5s")
            .expect("read");
        assert!(n > 0, "connection closed unexpectedly");
        serde_json::from_str(line.trim()).expect("reply is JSON")
    }

    async fn expect_silence(&mut self, wait: Duration) {
        let mut line = String::new();
        let read = timeout(wait, self.reader.read_line(&mut line)).await;
        assert!(read.is_err(), "unexpected reply: {line}");
    }
}

#[tokio::test]
async fn idle_request_gets_processing_then_response_and_second_waits() {
    let dir = tempfile::tempdir().unwrap();
    let item_delay = Duration::from_millis(200);
    let (sock, _shutdown) = start_server(dir.path(), Duration::from_millis(300), item_delay);

    let mut first = RawClient::connect(&sock).await;
    let mut second = RawClient::connect(&sock).await;

    first
        .send_raw(b"{\"type\":\"run\",\"data\":{\"id\":42,\"requestId\":\"r1\"}}\n")
        .await;
    assert_eq!(
        first.recv().await,
        json!({"type": "processing", "data": {"requestId": "r1"}})
    );

    second
        .send_raw(b"{\"type\":\"run\",\"data\":{\"id\":43,\"requestId\":\"r2\"}}\n")
        .await;
    assert_eq!(
        second.recv().await,
        json!({"type": "queued", "data": {"requestId": "r2"}})
    );

    let done = first.recv().await;
    assert_eq!(done["type"], "response");
    assert_eq!(done["data"]["success"], json!(true));
    assert_eq!(done["data"]["requestId"], "r1");
    let r1_done = tokio::time::Instant::now();

    assert_eq!(
        second.recv().await,
        json!({"type": "processing", "data": {"requestId": "r2"}})
    );
    assert!(r1_done.elapsed() >= item_delay - Duration::from_millis(20));

    let done = second.recv().await;
    assert_eq!(done["type"], "response");
    assert_eq!(done["data"]["requestId"], "r2");
}

#[tokio::test]
async fn malformed_frames_get_one_error_each_and_do_not_disturb_others() {
    let dir = tempfile::tempdir().unwrap();
    let (sock, _shutdown) = start_server(dir.path(), Duration::from_millis(10), Duration::ZERO);

    let mut bad = RawClient::connect(&sock).await;
    let mut good = RawClient::connect(&sock).await;

    bad.send_raw(b"this is not json\n").await;
    let reply = bad.recv().await;
    assert_eq!(
        reply,
        json!({"type": "error", "data": {"message": "Invalid JSON format"}})
    );
    bad.expect_silence(Duration::from_millis(100)).await;

    bad.send_raw(b"{\"type\":\"\",\"data\":{\"requestId\":\"x1\"}}\n").await;
    let reply = bad.recv().await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["data"]["requestId"], "x1");
    assert!(reply["data"]["message"]
        .as_str()
        .unwrap()
        .contains("\"type\""));

    bad.send_raw(b"{\"type\":\"dance\",\"data\":{\"requestId\":\"x2\"}}\n").await;
    let reply = bad.recv().await;
    assert_eq!(reply["data"]["message"], "Unknown request type: dance");
    bad.expect_silence(Duration::from_millis(100)).await;

    // Same connection keeps working after rejections.
    bad.send_raw(b"{\"type\":\"run\",\"data\":{\"requestId\":\"ok1\"}}\n").await;
    assert_eq!(bad.recv().await["type"], "processing");
    assert_eq!(bad.recv().await["type"], "response");

    good.send_raw(b"{\"type\":\"run\",\"data\":{\"requestId\":\"ok2\"}}\n").await;
    let mut kinds = Vec::new();
    loop {
        let msg = good.recv().await;
        assert_eq!(msg["data"]["requestId"], "ok2");
        let kind = msg["type"].as_str().unwrap().to_string();
        kinds.push(kind.clone());
        if kind == "response" {
            break;
        }
    }
    assert!(!kinds.contains(&"error".to_string()));
}

#[tokio::test]
async fn split_and_batched_frames_are_both_routed() {
    let dir = tempfile::tempdir().unwrap();
    let (sock, _shutdown) = start_server(dir.path(), Duration::from_millis(10), Duration::ZERO);
    let mut client = RawClient::connect(&sock).await;

    client.send_raw(b"{\"type\":\"run\",\"da").await;
    sleep(Duration::from_millis(50)).await;
    client.send_raw(b"ta\":{\"requestId\":\"s1\"}}\n").await;
    assert_eq!(
        client.recv().await,
        json!({"type": "processing", "data": {"requestId": "s1"}})
    );
    assert_eq!(client.recv().await["type"], "response");

    sleep(Duration::from_millis(50)).await;
    client
        .send_raw(
            b"{\"type\":\"run\",\"data\":{\"requestId\":\"b1\"}}\n{\"type\":\"run\",\"data\":{\"requestId\":\"b2\"}}\n",
        )
        .await;

    let mut seen = Vec::new();
    for _ in 0..5 {
        let msg = client.recv().await;
        seen.push(format!(
            "{}:{}",
            msg["data"]["requestId"].as_str().unwrap(),
            msg["type"].as_str().unwrap()
        ));
    }
    assert_eq!(
        seen,
        vec![
            "b1:processing",
            "b2:queued",
            "b1:response",
            "b2:processing",
            "b2:response"
        ]
    );
}

#[tokio::test]
async fn bind_replaces_stale_file_and_shutdown_removes_it() {
    let dir = tempfile::tempdir().unwrap();
    let stale = dir.path().join("relay.sock");
    std::fs::write(&stale, b"left over").unwrap();

    let (sock, shutdown) = start_server(dir.path(), Duration::ZERO, Duration::ZERO);
    assert_eq!(sock, stale);
    let mode = std::fs::metadata(&sock).unwrap().permissions().mode();
    assert_eq!(mode & 0o777, 0o666);
    RawClient::connect(&sock).await;

    shutdown.shutdown();
    shutdown.shutdown();
    assert!(shutdown.is_shutdown());
    assert!(!sock.exists());

    sleep(Duration::from_millis(50)).await;
    assert!(UnixStream::connect(&sock).await.is_err());
}
