//! Read-only status model.
//!
//! [`Status`] is the mutable record the runtime updates as events arrive;
//! [`StatusSnapshot`] is the immutable copy handed out by `status()`. Kept
//! separate so callers can never observe a half-updated status and so the
//! runtime's lock is never held across a caller's use of the data.

use chrono::{DateTime, Utc};

/// Coarse connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket is installed; `Connect` has not been called, or `Stop` was.
    Disconnected,
    /// A connect attempt is in flight: handshake, QR pairing, or history sync.
    Connecting,
    /// The socket has received its `open` transition.
    Connected,
    /// The last connect attempt or socket ended abnormally.
    Error,
}

/// Whether history backfill is still in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// History sync is still delivering backlog batches.
    Bootstrapping,
    /// The session is caught up; all further upserts are live traffic.
    Live,
}

/// The mutable status record the runtime keeps behind its lock.
#[derive(Debug, Clone)]
pub struct Status {
    /// Identifier of the configured transport provider, e.g. `"whatsapp"`.
    pub provider: String,
    /// Current connection lifecycle state.
    pub connection_state: ConnectionState,
    /// Own JID once known (set on `open`).
    pub own_jid: Option<String>,
    /// Latest QR string, cleared once the connection opens.
    pub qr: Option<String>,
    /// When the current `qr` was issued.
    pub qr_issued_at: Option<DateTime<Utc>>,
    /// Number of QR codes issued this pairing attempt.
    pub qr_generation_count: u32,
    /// Configured ceiling on `qr_generation_count`.
    pub qr_generation_limit: u32,
    /// Set once `qr_generation_count` has reached `qr_generation_limit`;
    /// cleared only by a fresh `Connect`.
    pub qr_locked: bool,
    /// Disconnect status code from the most recent close, if any.
    pub last_disconnect_code: Option<u16>,
    /// Disconnect reason string from the most recent close, if any.
    pub last_disconnect_reason: Option<String>,
    /// Vocabulary string for the most recent event-driven failure.
    pub last_error: Option<String>,
    /// Whether history backfill has completed.
    pub sync_state: SyncState,
    /// When the connection most recently transitioned to `Connected`.
    pub live_since: Option<DateTime<Utc>>,
    /// Count of inbound messages that passed every pipeline gate.
    pub accepted: u64,
    /// Count of messages dropped because their upsert batch type was not
    /// `notify` (history-sync or append/replace batches).
    pub ignored_non_notify: u64,
    /// Count of messages dropped because the batch arrived before `open`.
    pub ignored_pre_live: u64,
    /// Count of messages dropped for a timestamp before the live window.
    pub ignored_stale: u64,
    /// Count of messages dropped as duplicates of an already-seen key.
    pub ignored_duplicate: u64,
    /// Count of messages dropped for an empty or unsupported JID suffix.
    pub ignored_unsupported_jid: u64,
    /// Count of messages dropped for `fromMe == true` with self messages
    /// disallowed.
    pub ignored_from_me: u64,
    /// Count of messages dropped for a sender outside the allowlist.
    pub ignored_sender_not_allowed: u64,
    /// Count of messages dropped for missing the configured prefix.
    pub ignored_missing_prefix: u64,
    /// Count of outbound text sends accepted by the transport.
    pub sends_text_ok: u64,
    /// Count of outbound text sends rejected by validation or transport.
    pub sends_text_failed: u64,
    /// Count of outbound document sends accepted by the transport.
    pub sends_file_ok: u64,
    /// Count of outbound document sends rejected by validation or transport.
    pub sends_file_failed: u64,
    /// Count of reconnect attempts scheduled after a general close.
    pub reconnect_attempts: u64,
    /// Last time any field on this record changed.
    pub updated_at: DateTime<Utc>,
}

impl Status {
    /// Build a fresh status record for a provider that has never connected.
    #[must_use]
    pub fn new(provider: impl Into<String>, qr_generation_limit: u32, now: DateTime<Utc>) -> Self {
        Self {
            provider: provider.into(),
            connection_state: ConnectionState::Disconnected,
            own_jid: None,
            qr: None,
            qr_issued_at: None,
            qr_generation_count: 0,
            qr_generation_limit,
            qr_locked: false,
            last_disconnect_code: None,
            last_disconnect_reason: None,
            last_error: None,
            sync_state: SyncState::Bootstrapping,
            live_since: None,
            accepted: 0,
            ignored_non_notify: 0,
            ignored_pre_live: 0,
            ignored_stale: 0,
            ignored_duplicate: 0,
            ignored_unsupported_jid: 0,
            ignored_from_me: 0,
            ignored_sender_not_allowed: 0,
            ignored_missing_prefix: 0,
            sends_text_ok: 0,
            sends_text_failed: 0,
            sends_file_ok: 0,
            sends_file_failed: 0,
            reconnect_attempts: 0,
            updated_at: now,
        }
    }

    /// Whether the connection is fully established (state `connected` and
    /// sync state `live`), per the invariant linking the two fields.
    #[must_use]
    pub fn connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected && self.sync_state == SyncState::Live
    }

    /// Take an immutable copy for callers of `status()`.
    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            provider: self.provider.clone(),
            connection_state: self.connection_state,
            connected: self.connected(),
            own_jid: self.own_jid.clone(),
            qr: self.qr.clone(),
            qr_issued_at: self.qr_issued_at,
            qr_generation_count: self.qr_generation_count,
            qr_generation_limit: self.qr_generation_limit,
            qr_locked: self.qr_locked,
            last_disconnect_code: self.last_disconnect_code,
            last_disconnect_reason: self.last_disconnect_reason.clone(),
            last_error: self.last_error.clone(),
            sync_state: self.sync_state,
            live_since: self.live_since,
            accepted: self.accepted,
            ignored_non_notify: self.ignored_non_notify,
            ignored_pre_live: self.ignored_pre_live,
            ignored_stale: self.ignored_stale,
            ignored_duplicate: self.ignored_duplicate,
            ignored_unsupported_jid: self.ignored_unsupported_jid,
            ignored_from_me: self.ignored_from_me,
            ignored_sender_not_allowed: self.ignored_sender_not_allowed,
            ignored_missing_prefix: self.ignored_missing_prefix,
            sends_text_ok: self.sends_text_ok,
            sends_text_failed: self.sends_text_failed,
            sends_file_ok: self.sends_file_ok,
            sends_file_failed: self.sends_file_failed,
            reconnect_attempts: self.reconnect_attempts,
            updated_at: self.updated_at,
        }
    }
}

/// Immutable snapshot of [`Status`] returned by `status()`.
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    /// Identifier of the configured transport provider.
    pub provider: String,
    /// Current connection lifecycle state.
    pub connection_state: ConnectionState,
    /// Derived from `connection_state == Connected && sync_state == Live`.
    pub connected: bool,
    /// Own JID once known.
    pub own_jid: Option<String>,
    /// Latest QR string, if pairing is in progress.
    pub qr: Option<String>,
    /// When the current `qr` was issued.
    pub qr_issued_at: Option<DateTime<Utc>>,
    /// Number of QR codes issued this pairing attempt.
    pub qr_generation_count: u32,
    /// Configured ceiling on `qr_generation_count`.
    pub qr_generation_limit: u32,
    /// Whether pairing is locked out pending a fresh `Connect`.
    pub qr_locked: bool,
    /// Disconnect status code from the most recent close, if any.
    pub last_disconnect_code: Option<u16>,
    /// Disconnect reason string from the most recent close, if any.
    pub last_disconnect_reason: Option<String>,
    /// Vocabulary string for the most recent event-driven failure.
    pub last_error: Option<String>,
    /// Whether history backfill has completed.
    pub sync_state: SyncState,
    /// When the connection most recently transitioned to `Connected`.
    pub live_since: Option<DateTime<Utc>>,
    /// Count of inbound messages that passed every pipeline gate.
    pub accepted: u64,
    /// Count of messages dropped for a non-`notify` upsert batch type.
    pub ignored_non_notify: u64,
    /// Count of messages dropped because the batch arrived before `open`.
    pub ignored_pre_live: u64,
    /// Count of messages dropped for a timestamp before the live window.
    pub ignored_stale: u64,
    /// Count of messages dropped as duplicates.
    pub ignored_duplicate: u64,
    /// Count of messages dropped for an unsupported JID.
    pub ignored_unsupported_jid: u64,
    /// Count of messages dropped for `fromMe == true`.
    pub ignored_from_me: u64,
    /// Count of messages dropped for a sender outside the allowlist.
    pub ignored_sender_not_allowed: u64,
    /// Count of messages dropped for missing the configured prefix.
    pub ignored_missing_prefix: u64,
    /// Count of outbound text sends accepted by the transport.
    pub sends_text_ok: u64,
    /// Count of outbound text sends rejected by validation or transport.
    pub sends_text_failed: u64,
    /// Count of outbound document sends accepted by the transport.
    pub sends_file_ok: u64,
    /// Count of outbound document sends rejected by validation or transport.
    pub sends_file_failed: u64,
    /// Count of reconnect attempts scheduled after a general close.
    pub reconnect_attempts: u64,
    /// Last time any field on this record changed.
    pub updated_at: DateTime<Utc>,
}
