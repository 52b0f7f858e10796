//! The top-level session runtime.
//!
//! [`GatewayRuntime`] owns the transport handle, the status model, the
//! dedup window, the reconnect timer, and the QR counter, and serializes
//! every mutation of that state behind a single async mutex so callers
//! always observe a coherent snapshot.

mod connection;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, watch, Mutex};

use crate::config::GatewayConfig;
use crate::credential_store::{self, RepairOutcome};
use crate::dedup::DedupWindow;
use crate::errors::GatewayError;
use crate::pipeline::{self, PipelineConfig};
use crate::status::{ConnectionState, Status, StatusSnapshot, SyncState};
use crate::transport::{ConnectOptions, GatewayTransport, TransportEvent, TransportSocket};

/// Hard-coded browser descriptor advertised during the handshake.
///
/// Left as a compile-time constant rather than configuration: whether this
/// (and the dedup cap) should become a runtime option is an open product
/// decision, noted alongside the rest of the grounding ledger.
const BROWSER_DESCRIPTOR: (&str, &str, &str) = ("Alfred", "Chrome", "1.0.0");

/// A downstream consumer of normalized inbound messages.
///
/// The runtime always invokes its mandatory handler first, then every
/// handler registered via [`GatewayRuntime::on_message`], in registration
/// order. A handler that panics or returns is never allowed to abort batch
/// processing; the runtime only awaits it.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Handle one normalized inbound message.
    async fn handle(&self, message: pipeline::InboundMessage);
}

/// Options accepted by [`GatewayRuntime::send_file`].
#[derive(Debug, Clone, Default)]
pub struct SendFileOptions {
    /// Overrides the file name derived from the path.
    pub file_name: Option<String>,
    /// Overrides the default `application/octet-stream` mime type.
    pub mime_type: Option<String>,
    /// Optional caption sent alongside the document.
    pub caption: Option<String>,
}

struct Inner {
    status: Status,
    dedup: DedupWindow,
    socket: Option<Arc<dyn TransportSocket>>,
    allow_reconnect: bool,
    live_since_unix_sec: Option<i64>,
    reconnect_handle: Option<tokio::task::JoinHandle<()>>,
}

enum ConnectSlot {
    Idle,
    InProgress(watch::Receiver<Option<Result<StatusSnapshot, String>>>),
}

struct Shared {
    config: GatewayConfig,
    transport: Arc<dyn GatewayTransport>,
    inner: Mutex<Inner>,
    connect_slot: Mutex<ConnectSlot>,
    on_inbound: Arc<dyn InboundHandler>,
    on_message: Mutex<Vec<Arc<dyn InboundHandler>>>,
}

/// The session runtime: the single public entry point into this crate.
///
/// Cheap to clone; clones share the same underlying session. The event
/// loop spawned by `connect()` holds its own clone so it outlives any
/// particular caller's handle.
#[derive(Clone)]
pub struct GatewayRuntime {
    shared: Arc<Shared>,
}

impl GatewayRuntime {
    /// Build a runtime over `transport`, with `on_inbound` as the mandatory
    /// downstream handler.
    #[must_use]
    pub fn new(config: GatewayConfig, transport: Arc<dyn GatewayTransport>, on_inbound: Arc<dyn InboundHandler>) -> Self {
        let status = Status::new("whatsapp", config.max_qr_generations, Utc::now());
        let inner = Inner {
            status,
            dedup: DedupWindow::new(),
            socket: None,
            allow_reconnect: false,
            live_since_unix_sec: None,
            reconnect_handle: None,
        };
        Self {
            shared: Arc::new(Shared {
                config,
                transport,
                inner: Mutex::new(inner),
                connect_slot: Mutex::new(ConnectSlot::Idle),
                on_inbound,
                on_message: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register an additional handler invoked after the mandatory one, in
    /// registration order.
    pub async fn on_message(&self, handler: Arc<dyn InboundHandler>) {
        self.shared.on_message.lock().await.push(handler);
    }

    /// Return a coherent copy of the current status.
    pub async fn status(&self) -> StatusSnapshot {
        self.shared.inner.lock().await.status.snapshot()
    }

    /// Idempotent, re-entrant connect. If a connect attempt is already in
    /// flight this call joins it instead of starting a second one.
    ///
    /// # Errors
    ///
    /// Returns whatever error aborted `connectInternal`: a transport
    /// failure fetching the protocol version or opening the socket.
    pub async fn connect(&self) -> Result<StatusSnapshot, GatewayError> {
        enum Role {
            Leader(watch::Sender<Option<Result<StatusSnapshot, String>>>),
            Follower(watch::Receiver<Option<Result<StatusSnapshot, String>>>),
        }

        let role = {
            let mut slot = self.shared.connect_slot.lock().await;
            match &*slot {
                ConnectSlot::InProgress(rx) => Role::Follower(rx.clone()),
                ConnectSlot::Idle => {
                    let (tx, rx) = watch::channel(None);
                    *slot = ConnectSlot::InProgress(rx);
                    Role::Leader(tx)
                }
            }
        };

        {
            let mut inner = self.shared.inner.lock().await;
            inner.allow_reconnect = true;
            cancel_reconnect_timer(&mut inner);
        }

        match role {
            Role::Leader(tx) => {
                let result = self.connect_internal().await;
                *self.shared.connect_slot.lock().await = ConnectSlot::Idle;
                let broadcast = result.as_ref().map_err(ToString::to_string).map(Clone::clone);
                let _ = tx.send(Some(broadcast));
                result
            }
            Role::Follower(mut rx) => loop {
                if let Some(result) = rx.borrow().clone() {
                    return result.map_err(GatewayError::ConnectFailed);
                }
                if rx.changed().await.is_err() {
                    return Ok(self.status().await);
                }
            },
        }
    }

    async fn connect_internal(&self) -> Result<StatusSnapshot, GatewayError> {
        {
            let mut inner = self.shared.inner.lock().await;
            inner.status.live_since = None;
            inner.live_since_unix_sec = None;
            inner.dedup = DedupWindow::new();
            inner.status.connection_state = ConnectionState::Connecting;
            inner.status.sync_state = SyncState::Bootstrapping;
            inner.status.qr_generation_count = 0;
            inner.status.qr_locked = false;
            inner.status.qr = None;
            inner.status.last_error = None;
            inner.status.updated_at = Utc::now();
        }

        match credential_store::repair(&self.shared.config.auth_dir) {
            Ok(RepairOutcome::Repaired { quarantined_path }) => {
                tracing::info!(path = %quarantined_path.display(), "quarantined partial credentials before reconnect");
                let mut inner = self.shared.inner.lock().await;
                inner.status.last_error = Some(crate::errors::last_error::PARTIAL_CREDS_RESET.to_owned());
                inner.status.updated_at = Utc::now();
            }
            Ok(RepairOutcome::NoOp) => {}
            Err(error) => {
                tracing::warn!(%error, "credential repair failed, proceeding with existing credential file");
            }
        }

        let version = match self.shared.transport.latest_version().await {
            Ok(v) => v,
            Err(error) => return self.fail_connect(GatewayError::Transport(error)).await,
        };

        let options = ConnectOptions {
            auth_dir: self.shared.config.auth_dir.clone(),
            browser: (BROWSER_DESCRIPTOR.0.to_owned(), BROWSER_DESCRIPTOR.1.to_owned(), BROWSER_DESCRIPTOR.2.to_owned()),
            version,
        };

        let session = match self.shared.transport.connect(options).await {
            Ok(s) => s,
            Err(error) => return self.fail_connect(GatewayError::Transport(error)).await,
        };

        {
            let mut inner = self.shared.inner.lock().await;
            let previous = inner.socket.replace(session.socket);
            if let Some(previous) = previous {
                tokio::spawn(async move { previous.end().await });
            }
        }

        self.spawn_event_loop(session.events);

        Ok(self.status().await)
    }

    async fn fail_connect(&self, error: GatewayError) -> Result<StatusSnapshot, GatewayError> {
        let mut inner = self.shared.inner.lock().await;
        inner.status.connection_state = ConnectionState::Error;
        inner.status.last_error = Some(error.to_string());
        inner.status.updated_at = Utc::now();
        Err(error)
    }

    fn spawn_event_loop(&self, mut events: mpsc::Receiver<TransportEvent>) {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                this.handle_event(event).await;
            }
        });
    }

    async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::CredsUpdate => self.handle_creds_update().await,
            TransportEvent::ConnectionUpdate(payload) => self.handle_connection_update(&payload).await,
            TransportEvent::MessagesUpsert(payload) => self.handle_messages_upsert(&payload).await,
        }
    }

    async fn handle_creds_update(&self) {
        let socket = self.shared.inner.lock().await.socket.clone();
        let Some(socket) = socket else {
            return;
        };

        if let Err(error) = socket.save_credentials().await {
            tracing::warn!(%error, "failed to save credentials");
            let mut inner = self.shared.inner.lock().await;
            inner.status.last_error = Some(crate::errors::last_error::SAVE_CREDS_FAILED.to_owned());
            inner.status.updated_at = Utc::now();
        }
    }

    async fn handle_connection_update(&self, payload: &serde_json::Value) {
        let own_jid = {
            let inner = self.shared.inner.lock().await;
            inner.socket.as_ref().and_then(|s| s.user_id())
        };

        let outcome = {
            let mut inner = self.shared.inner.lock().await;
            connection::step(&mut inner, &self.shared.config, payload, own_jid, Utc::now())
        };

        if outcome.detach_socket {
            let socket = {
                let mut inner = self.shared.inner.lock().await;
                inner.socket.take()
            };
            if let Some(socket) = socket {
                socket.end().await;
            }
        }

        if outcome.reset_dedup {
            self.shared.inner.lock().await.dedup = DedupWindow::new();
        }

        if let Some(delay) = outcome.schedule_reconnect {
            self.schedule_reconnect(delay).await;
        } else {
            let mut inner = self.shared.inner.lock().await;
            cancel_reconnect_timer(&mut inner);
        }
    }

    async fn handle_messages_upsert(&self, payload: &serde_json::Value) {
        let pipeline_config = PipelineConfig {
            max_text_chars: self.shared.config.max_text_chars,
            allow_self_from_me: self.shared.config.allow_self_from_me,
            require_prefix: self.shared.config.require_prefix.clone(),
            allowed_senders: self.shared.config.allowed_senders.iter().map(|s| pipeline::canonical_sender_key(s)).collect(),
        };

        let messages = {
            let mut inner = self.shared.inner.lock().await;
            let connected = inner.status.connected();
            let live_since = inner.live_since_unix_sec;
            let (messages, counters) = pipeline::process_upsert(payload, connected, live_since, &mut inner.dedup, &pipeline_config);
            counters.apply_to(&mut inner.status);
            inner.status.updated_at = Utc::now();
            messages
        };

        for message in messages {
            self.shared.on_inbound.handle(message.clone()).await;
            let handlers = self.shared.on_message.lock().await.clone();
            for handler in handlers {
                handler.handle(message.clone()).await;
            }
        }
    }

    async fn schedule_reconnect(&self, delay: Duration) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            // Clear our own handle first: `connect()` cancels any pending
            // reconnect timer, and this task *is* that timer. Leaving the
            // handle in place would have it abort itself the next time it
            // awaits, right as it is firing.
            this.shared.inner.lock().await.reconnect_handle = None;
            if let Err(error) = this.connect().await {
                tracing::warn!(%error, "scheduled reconnect failed");
            }
        });
        let mut inner = self.shared.inner.lock().await;
        inner.status.reconnect_attempts = inner.status.reconnect_attempts.saturating_add(1);
        if let Some(old) = inner.reconnect_handle.replace(handle) {
            old.abort();
        }
    }

    /// Disconnect the current session.
    ///
    /// `logout` additionally invalidates credentials server-side before the
    /// socket is force-closed; failures from `logout` are swallowed, the
    /// force-close is attempted regardless.
    pub async fn disconnect(&self, logout: bool) -> StatusSnapshot {
        let mut inner = self.shared.inner.lock().await;
        inner.allow_reconnect = false;
        cancel_reconnect_timer(&mut inner);
        let socket = inner.socket.take();
        inner.status.live_since = None;
        inner.live_since_unix_sec = None;
        inner.dedup = DedupWindow::new();
        inner.status.qr_generation_count = 0;
        inner.status.qr_locked = false;
        inner.status.qr = None;
        inner.status.qr_issued_at = None;
        inner.status.sync_state = SyncState::Bootstrapping;
        inner.status.connection_state = ConnectionState::Disconnected;
        inner.status.updated_at = Utc::now();
        let snapshot = inner.status.snapshot();
        drop(inner);

        if let Some(socket) = socket {
            if logout {
                if let Err(error) = socket.logout().await {
                    tracing::warn!(%error, "logout failed, closing socket anyway");
                }
            }
            socket.end().await;
        }

        snapshot
    }

    /// `Disconnect(logout = false)`. Preserves credentials on disk so the
    /// next `connect()` resumes without a fresh QR pairing.
    pub async fn stop(&self) -> StatusSnapshot {
        self.disconnect(false).await
    }

    /// Send plain text to `jid`.
    ///
    /// # Errors
    ///
    /// `invalid_jid` if `jid` does not end in a supported suffix,
    /// `empty_text` if normalized text is empty, `not_connected` if no
    /// socket is installed, or a propagated [`crate::transport::TransportError`].
    pub async fn send_text(&self, jid: &str, text: &str) -> Result<(), GatewayError> {
        validate_jid(jid)?;
        let text = pipeline::normalize_field(text, self.shared.config.max_text_chars);
        if text.is_empty() {
            self.bump_text_result(false).await;
            return Err(GatewayError::EmptyText);
        }

        let socket = self.shared.inner.lock().await.socket.clone();
        let Some(socket) = socket else {
            self.bump_text_result(false).await;
            return Err(GatewayError::NotConnected);
        };

        match socket.send_text(jid, &text).await {
            Ok(()) => {
                self.bump_text_result(true).await;
                Ok(())
            }
            Err(error) => {
                self.bump_text_result(false).await;
                Err(GatewayError::Transport(error))
            }
        }
    }

    /// Send a document at `path` to `jid`.
    ///
    /// # Errors
    ///
    /// `invalid_jid`, `invalid_file_path` if the file cannot be read, or a
    /// propagated [`crate::transport::TransportError`].
    pub async fn send_file(&self, jid: &str, path: &Path, options: SendFileOptions) -> Result<(), GatewayError> {
        validate_jid(jid)?;

        let bytes = match tokio::fs::read(path).await {
            Ok(b) => b,
            Err(_) => {
                self.bump_file_result(false).await;
                return Err(GatewayError::InvalidFilePath);
            }
        };

        let file_name = options.file_name.unwrap_or_else(|| {
            path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_else(|| "file".to_owned())
        });
        let mime_type = options.mime_type.unwrap_or_else(|| "application/octet-stream".to_owned());

        let socket = self.shared.inner.lock().await.socket.clone();
        let Some(socket) = socket else {
            self.bump_file_result(false).await;
            return Err(GatewayError::NotConnected);
        };

        match socket.send_document(jid, bytes, &file_name, &mime_type, options.caption).await {
            Ok(()) => {
                self.bump_file_result(true).await;
                Ok(())
            }
            Err(error) => {
                self.bump_file_result(false).await;
                Err(GatewayError::Transport(error))
            }
        }
    }

    async fn bump_text_result(&self, ok: bool) {
        let mut inner = self.shared.inner.lock().await;
        if ok {
            inner.status.sends_text_ok = inner.status.sends_text_ok.saturating_add(1);
        } else {
            inner.status.sends_text_failed = inner.status.sends_text_failed.saturating_add(1);
        }
        inner.status.updated_at = Utc::now();
    }

    async fn bump_file_result(&self, ok: bool) {
        let mut inner = self.shared.inner.lock().await;
        if ok {
            inner.status.sends_file_ok = inner.status.sends_file_ok.saturating_add(1);
        } else {
            inner.status.sends_file_failed = inner.status.sends_file_failed.saturating_add(1);
        }
        inner.status.updated_at = Utc::now();
    }
}

fn cancel_reconnect_timer(inner: &mut Inner) {
    if let Some(handle) = inner.reconnect_handle.take() {
        handle.abort();
    }
}

fn validate_jid(jid: &str) -> Result<(), GatewayError> {
    if pipeline::SUPPORTED_JID_SUFFIXES.iter().any(|suffix| jid.ends_with(suffix)) {
        Ok(())
    } else {
        Err(GatewayError::InvalidJid)
    }
}
