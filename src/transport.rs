//! The transport driver boundary.
//!
//! The real chat transport — handshake, noise-protocol framing, the
//! multi-device pairing state machine itself — lives in a library outside
//! this ecosystem. This module defines the trait a concrete adapter crate
//! implements; everything above it (connection lifecycle, inbound
//! normalization, dedup) is written and tested against this trait alone,
//! using an in-memory fake in tests.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

/// Browser descriptor sent during the handshake: `(name, platform, version)`.
pub type BrowserDescriptor = (String, String, String);

/// Protocol version tuple as returned by the transport's version endpoint.
pub type ProtocolVersion = (u32, u32, u32);

/// Options used to open a new transport session.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Directory holding `creds.json` and auxiliary auth files.
    pub auth_dir: PathBuf,
    /// Browser descriptor advertised to the transport during handshake.
    pub browser: BrowserDescriptor,
    /// Protocol version to pin the handshake to.
    pub version: ProtocolVersion,
}

/// An event emitted by a live transport session.
///
/// Payloads are intentionally untyped [`serde_json::Value`]s: the upstream
/// transport is a dynamically-typed event emitter and the core must treat
/// any field mismatch as if the field were absent rather than fail the
/// whole event. See [`crate::runtime::connection`] for the defensive
/// extractors that walk these values.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Credentials were persisted by the transport driver.
    CredsUpdate,
    /// A connection lifecycle transition: open, close, or QR rotation.
    ConnectionUpdate(Value),
    /// A batch of inbound messages, live or history-sync.
    MessagesUpsert(Value),
}

/// An open transport session: a socket handle plus its event stream.
pub struct TransportSession {
    /// Handle for outbound operations against the now-open socket.
    pub socket: Arc<dyn TransportSocket>,
    /// Receives events for this session until it ends.
    pub events: mpsc::Receiver<TransportEvent>,
}

/// Errors returned by a [`GatewayTransport`] or [`TransportSocket`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The transport could not establish or maintain a connection.
    #[error("transport connection failed: {0}")]
    Connection(String),
    /// An outbound send was rejected by the transport.
    #[error("transport send failed: {0}")]
    Send(String),
}

/// A handle to an open transport socket.
///
/// Single-owner: the runtime holds at most one live handle at a time and
/// calls [`TransportSocket::end`] on the previous handle before installing
/// a replacement.
#[async_trait]
pub trait TransportSocket: Send + Sync {
    /// Send a plain text message to `jid`.
    async fn send_text(&self, jid: &str, text: &str) -> Result<(), TransportError>;

    /// Send a document to `jid`.
    async fn send_document(
        &self,
        jid: &str,
        bytes: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        caption: Option<String>,
    ) -> Result<(), TransportError>;

    /// Force-close the socket. Errors are swallowed by callers; this method
    /// itself never fails.
    async fn end(&self);

    /// Log out of the session, invalidating credentials server-side.
    async fn logout(&self) -> Result<(), TransportError>;

    /// Persist the latest credentials to the auth directory.
    ///
    /// Invoked by the runtime on every [`TransportEvent::CredsUpdate`].
    /// Corresponds to calling the `saveCreds` callback handed back by
    /// `useMultiFileAuthState(dir)` in the upstream contract.
    async fn save_credentials(&self) -> Result<(), TransportError>;

    /// The transport's own JID, available once the connection has opened.
    fn user_id(&self) -> Option<String>;
}

/// The transport driver: opens sessions and reports the latest protocol
/// version to pin handshakes to.
#[async_trait]
pub trait GatewayTransport: Send + Sync {
    /// Fetch the latest protocol version the transport should hand-shake
    /// with. Corresponds to `fetchLatestBaileysVersion()` in the upstream
    /// contract.
    async fn latest_version(&self) -> Result<ProtocolVersion, TransportError>;

    /// Open a new session against `options.auth_dir`.
    async fn connect(&self, options: ConnectOptions) -> Result<TransportSession, TransportError>;
}
