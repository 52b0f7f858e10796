//! End-to-end tests for [`alfred_gateway::runtime::GatewayRuntime`] driven
//! against an in-memory fake transport, per the transport trait boundary
//! documented in `SPEC_FULL.md` section 9.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, Mutex};

use alfred_gateway::config::GatewayConfig;
use alfred_gateway::errors::GatewayError;
use alfred_gateway::pipeline::InboundMessage;
use alfred_gateway::runtime::{GatewayRuntime, InboundHandler};
use alfred_gateway::transport::{
    ConnectOptions, GatewayTransport, ProtocolVersion, TransportError, TransportEvent,
    TransportSession, TransportSocket,
};

#[derive(Default)]
struct SocketCalls {
    sent_texts: Vec<(String, String)>,
    sent_docs: Vec<(String, String, String, Option<String>)>,
    end_calls: u32,
    logout_calls: u32,
    save_creds_calls: u32,
}

struct FakeSocket {
    calls: StdMutex<SocketCalls>,
    user_id: StdMutex<Option<String>>,
    fail_send: StdMutex<bool>,
    fail_logout: StdMutex<bool>,
    fail_save_creds: StdMutex<bool>,
}

impl FakeSocket {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: StdMutex::new(SocketCalls::default()),
            user_id: StdMutex::new(None),
            fail_send: StdMutex::new(false),
            fail_logout: StdMutex::new(false),
            fail_save_creds: StdMutex::new(false),
        })
    }

    fn set_user_id(&self, id: impl Into<String>) {
        *self.user_id.lock().expect("lock") = Some(id.into());
    }

    fn set_fail_logout(&self, fail: bool) {
        *self.fail_logout.lock().expect("lock") = fail;
    }

    fn set_fail_save_creds(&self, fail: bool) {
        *self.fail_save_creds.lock().expect("lock") = fail;
    }

    fn end_calls(&self) -> u32 {
        self.calls.lock().expect("lock").end_calls
    }

    fn logout_calls(&self) -> u32 {
        self.calls.lock().expect("lock").logout_calls
    }

    fn save_creds_calls(&self) -> u32 {
        self.calls.lock().expect("lock").save_creds_calls
    }

    fn sent_texts(&self) -> Vec<(String, String)> {
        self.calls.lock().expect("lock").sent_texts.clone()
    }
}

#[async_trait]
impl TransportSocket for FakeSocket {
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), TransportError> {
        if *self.fail_send.lock().expect("lock") {
            return Err(TransportError::Send("forced failure".to_owned()));
        }
        self.calls.lock().expect("lock").sent_texts.push((jid.to_owned(), text.to_owned()));
        Ok(())
    }

    async fn send_document(
        &self,
        jid: &str,
        _bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        caption: Option<String>,
    ) -> Result<(), TransportError> {
        self.calls.lock().expect("lock").sent_docs.push((
            jid.to_owned(),
            file_name.to_owned(),
            mime_type.to_owned(),
            caption,
        ));
        Ok(())
    }

    async fn end(&self) {
        let mut calls = self.calls.lock().expect("lock");
        calls.end_calls = calls.end_calls.saturating_add(1);
    }

    async fn logout(&self) -> Result<(), TransportError> {
        {
            let mut calls = self.calls.lock().expect("lock");
            calls.logout_calls = calls.logout_calls.saturating_add(1);
        }
        if *self.fail_logout.lock().expect("lock") {
            return Err(TransportError::Connection("logout failed".to_owned()));
        }
        Ok(())
    }

    async fn save_credentials(&self) -> Result<(), TransportError> {
        {
            let mut calls = self.calls.lock().expect("lock");
            calls.save_creds_calls = calls.save_creds_calls.saturating_add(1);
        }
        if *self.fail_save_creds.lock().expect("lock") {
            return Err(TransportError::Connection("save creds failed".to_owned()));
        }
        Ok(())
    }

    fn user_id(&self) -> Option<String> {
        self.user_id.lock().expect("lock").clone()
    }
}

/// An in-memory stand-in for the transport driver. Each `connect()` call
/// opens a fresh fake socket and event channel, tracked as "latest" so
/// tests can push events and assert on send calls after the fact.
struct FakeTransport {
    connect_count: AtomicU32,
    connect_delay: StdMutex<Duration>,
    latest: Mutex<Option<(Arc<FakeSocket>, mpsc::Sender<TransportEvent>)>>,
}

impl FakeTransport {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_count: AtomicU32::new(0),
            connect_delay: StdMutex::new(Duration::from_millis(0)),
            latest: Mutex::new(None),
        })
    }

    fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock().expect("lock") = delay;
    }

    fn connect_calls(&self) -> u32 {
        self.connect_count.load(Ordering::SeqCst)
    }

    async fn latest_socket(&self) -> Arc<FakeSocket> {
        self.latest.lock().await.as_ref().expect("connect must have been called").0.clone()
    }

    async fn send_event(&self, event: TransportEvent) {
        let tx = self.latest.lock().await.as_ref().expect("connect must have been called").1.clone();
        tx.send(event).await.expect("runtime event loop should still be receiving");
    }
}

#[async_trait]
impl GatewayTransport for FakeTransport {
    async fn latest_version(&self) -> Result<ProtocolVersion, TransportError> {
        Ok((2, 3000, 0))
    }

    async fn connect(&self, _options: ConnectOptions) -> Result<TransportSession, TransportError> {
        let delay = *self.connect_delay.lock().expect("lock");
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.connect_count.fetch_add(1, Ordering::SeqCst);
        let socket = FakeSocket::new();
        let (tx, rx) = mpsc::channel(32);
        *self.latest.lock().await = Some((socket.clone(), tx));
        Ok(TransportSession { socket, events: rx })
    }
}

struct RecordingHandler {
    messages: StdMutex<Vec<InboundMessage>>,
}

impl RecordingHandler {
    fn new() -> Arc<Self> {
        Arc::new(Self { messages: StdMutex::new(Vec::new()) })
    }

    fn messages(&self) -> Vec<InboundMessage> {
        self.messages.lock().expect("lock").clone()
    }
}

#[async_trait]
impl InboundHandler for RecordingHandler {
    async fn handle(&self, message: InboundMessage) {
        self.messages.lock().expect("lock").push(message);
    }
}

fn test_config(auth_dir: &std::path::Path) -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.auth_dir = auth_dir.to_path_buf();
    config
}

async fn open_connection(runtime: &GatewayRuntime, transport: &FakeTransport) {
    runtime.connect().await.expect("connect should succeed");
    transport.send_event(TransportEvent::ConnectionUpdate(json!({"connection": "open"}))).await;
    wait_until(runtime, |s| s.connected).await;
}

/// Poll `status()` until `predicate` holds or panic after a short timeout.
async fn wait_until(runtime: &GatewayRuntime, predicate: impl Fn(&alfred_gateway::StatusSnapshot) -> bool) {
    for _ in 0..200 {
        let status = runtime.status().await;
        if predicate(&status) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within timeout; last status: {:?}", runtime.status().await);
}

#[tokio::test]
async fn scenario_outbound_jid_validation_and_single_send() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;

    let err = runtime.send_text("not-a-jid", "hi").await.expect_err("should reject bad jid");
    assert!(matches!(err, GatewayError::InvalidJid));

    runtime.send_text("12345@s.whatsapp.net", "hello").await.expect("should send");

    let socket = transport.latest_socket().await;
    assert_eq!(socket.sent_texts(), vec![("12345@s.whatsapp.net".to_owned(), "hello".to_owned())]);
}

#[tokio::test]
async fn scenario_qr_lock_stops_at_configured_limit_without_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let mut config = test_config(dir.path());
    config.max_qr_generations = 3;
    let runtime = GatewayRuntime::new(config, transport.clone(), handler);

    runtime.connect().await.expect("initial connect should succeed");
    assert_eq!(transport.connect_calls(), 1);

    for _ in 0..4 {
        transport.send_event(TransportEvent::ConnectionUpdate(json!({"qr": "some-qr-data"}))).await;
    }

    wait_until(&runtime, |s| s.qr_locked).await;
    let status = runtime.status().await;
    assert!(!status.connected);
    assert!(status.qr.is_none());
    assert_eq!(status.qr_generation_count, 3);
    assert!(status.qr_locked);
    assert_eq!(status.last_error.as_deref(), Some("qr_generation_limit_reached"));

    // No automatic reconnect: the transport was never asked to connect again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn concurrent_connect_calls_join_a_single_attempt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    transport.set_connect_delay(Duration::from_millis(30));
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    let mut joins = Vec::new();
    for _ in 0..5 {
        let runtime = runtime.clone();
        joins.push(tokio::spawn(async move { runtime.connect().await }));
    }
    for join in joins {
        join.await.expect("task should not panic").expect("connect should succeed");
    }

    assert_eq!(transport.connect_calls(), 1);
}

#[tokio::test]
async fn stop_never_logs_out_disconnect_with_logout_always_calls_it_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;
    let first_socket = transport.latest_socket().await;

    runtime.stop().await;
    assert_eq!(first_socket.end_calls(), 1);
    assert_eq!(first_socket.logout_calls(), 0);

    open_connection(&runtime, &transport).await;
    let second_socket = transport.latest_socket().await;

    second_socket.set_fail_logout(true);
    runtime.disconnect(true).await;
    assert_eq!(second_socket.logout_calls(), 1);
    assert_eq!(second_socket.end_calls(), 1);
}

#[tokio::test]
async fn duplicate_message_is_delivered_once_across_batches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler.clone());

    open_connection(&runtime, &transport).await;

    let payload = json!({
        "type": "notify",
        "messages": [{"id": "dup-1", "remoteJid": "11111@s.whatsapp.net", "message": {"conversation": "hi"}}]
    });
    transport.send_event(TransportEvent::MessagesUpsert(payload.clone())).await;
    transport.send_event(TransportEvent::MessagesUpsert(payload)).await;

    wait_until(&runtime, |s| s.ignored_duplicate == 1).await;
    assert_eq!(handler.messages().len(), 1);
    let status = runtime.status().await;
    assert_eq!(status.accepted, 1);
    assert_eq!(status.ignored_duplicate, 1);
}

#[tokio::test]
async fn stale_message_before_live_window_is_dropped_live_one_is_delivered() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let mut config = test_config(dir.path());
    config.history_grace_window_sec = 0;
    let runtime = GatewayRuntime::new(config, transport.clone(), handler.clone());

    open_connection(&runtime, &transport).await;
    let now = chrono::Utc::now().timestamp();

    let payload = json!({
        "type": "notify",
        "messages": [
            {"id": "old", "remoteJid": "1@s.whatsapp.net", "messageTimestamp": now.saturating_sub(120), "message": {"conversation": "old"}},
            {"id": "new", "remoteJid": "1@s.whatsapp.net", "messageTimestamp": now.saturating_add(5), "message": {"conversation": "new"}},
        ]
    });
    transport.send_event(TransportEvent::MessagesUpsert(payload)).await;

    wait_until(&runtime, |s| s.accepted == 1).await;
    let messages = handler.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].conversation, "new");
    let status = runtime.status().await;
    assert_eq!(status.ignored_stale, 1);
}

#[tokio::test]
async fn own_jid_is_recorded_from_the_socket_on_open() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    runtime.connect().await.expect("connect should succeed");
    let socket = transport.latest_socket().await;
    socket.set_user_id("99999@s.whatsapp.net");
    transport.send_event(TransportEvent::ConnectionUpdate(json!({"connection": "open"}))).await;

    wait_until(&runtime, |s| s.own_jid.is_some()).await;
    let status = runtime.status().await;
    assert_eq!(status.own_jid.as_deref(), Some("99999@s.whatsapp.net"));
}

#[tokio::test]
async fn creds_update_saves_credentials_through_the_socket() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;
    let socket = transport.latest_socket().await;

    transport.send_event(TransportEvent::CredsUpdate).await;
    for _ in 0..200 {
        if socket.save_creds_calls() >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(socket.save_creds_calls(), 1);
    assert!(runtime.status().await.last_error.is_none());
}

#[tokio::test]
async fn creds_update_records_save_creds_failed_on_error() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;
    let socket = transport.latest_socket().await;
    socket.set_fail_save_creds(true);

    transport.send_event(TransportEvent::CredsUpdate).await;
    wait_until(&runtime, |s| s.last_error.as_deref() == Some("save_creds_failed")).await;
}

#[tokio::test]
async fn general_close_schedules_an_automatic_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let mut config = test_config(dir.path());
    config.reconnect_delay_ms = 10;
    let runtime = GatewayRuntime::new(config, transport.clone(), handler);

    open_connection(&runtime, &transport).await;
    assert_eq!(transport.connect_calls(), 1);

    transport
        .send_event(TransportEvent::ConnectionUpdate(json!({
            "connection": "close",
            "lastDisconnect": {"error": {"output": {"statusCode": 500}, "message": "stream errored"}}
        })))
        .await;

    for _ in 0..200 {
        if transport.connect_calls() >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(transport.connect_calls(), 2);
    assert_eq!(runtime.status().await.reconnect_attempts, 1);
}

#[tokio::test]
async fn not_connected_send_fails_before_any_connect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport, handler);

    let err = runtime.send_text("12345@s.whatsapp.net", "hi").await.expect_err("no socket yet");
    assert!(matches!(err, GatewayError::NotConnected));
}

#[tokio::test]
async fn send_file_derives_name_and_default_mime_type() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;

    let doc_path = dir.path().join("report.pdf");
    std::fs::write(&doc_path, b"%PDF-fake-bytes").expect("write fixture file");

    runtime
        .send_file("12345@s.whatsapp.net", &doc_path, alfred_gateway::runtime::SendFileOptions::default())
        .await
        .expect("send_file should succeed");

    let socket = transport.latest_socket().await;
    let docs = socket.calls.lock().expect("lock").sent_docs.clone();
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].0, "12345@s.whatsapp.net");
    assert_eq!(docs[0].1, "report.pdf");
    assert_eq!(docs[0].2, "application/octet-stream");
    assert!(docs[0].3.is_none());
}

#[tokio::test]
async fn send_file_rejects_a_missing_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let transport = FakeTransport::new();
    let handler = RecordingHandler::new();
    let runtime = GatewayRuntime::new(test_config(dir.path()), transport.clone(), handler);

    open_connection(&runtime, &transport).await;

    let missing = dir.path().join("does-not-exist.bin");
    let err = runtime
        .send_file("12345@s.whatsapp.net", &missing, alfred_gateway::runtime::SendFileOptions::default())
        .await
        .expect_err("missing file should fail");
    assert!(matches!(err, GatewayError::InvalidFilePath));
}
