//! The connection lifecycle state machine.
//!
//! Consumes raw `connection.update` payloads and mutates [`super::Inner`]
//! in place. Returns a [`StepOutcome`] describing the async follow-up work
//! (closing a socket, scheduling a reconnect) the caller must perform once
//! it has released the lock guarding `Inner`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::Inner;
use crate::config::GatewayConfig;
use crate::errors::last_error;
use crate::status::{ConnectionState, SyncState};

/// Disconnect code the transport uses to signal an in-band protocol resync,
/// distinct from a true outage.
const RESTART_REQUIRED_CODE: u16 = 515;
/// Disconnect code meaning the session's credentials were invalidated
/// server-side; reconnecting without new credentials would only loop.
const AUTH_INVALIDATED_CODE: u16 = 401;

/// Follow-up actions for the caller to perform after unlocking `Inner`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StepOutcome {
    /// Force-close (and drop) the currently installed socket, if any.
    pub detach_socket: bool,
    /// Replace the dedup window with an empty one.
    pub reset_dedup: bool,
    /// Schedule a reconnect after this delay.
    pub schedule_reconnect: Option<Duration>,
}

/// Apply one `connection.update` payload to `inner`.
///
/// `own_jid` is the transport socket's own JID, sampled by the caller just
/// before calling this function; it is only consulted on the `open`
/// transition.
pub fn step(inner: &mut Inner, config: &GatewayConfig, payload: &Value, own_jid: Option<String>, now: DateTime<Utc>) -> StepOutcome {
    let mut outcome = StepOutcome::default();

    if let Some(qr) = payload.get("qr").and_then(Value::as_str) {
        if !qr.is_empty() {
            apply_qr(inner, config, qr, now, &mut outcome);
        }
    }

    match payload.get("connection").and_then(Value::as_str) {
        Some("open") => apply_open(inner, config, own_jid, now),
        Some("close") => apply_close(inner, config, payload, now, &mut outcome),
        Some("connecting") => {
            inner.status.connection_state = ConnectionState::Connecting;
            inner.status.updated_at = now;
        }
        _ => {}
    }

    outcome
}

fn apply_qr(inner: &mut Inner, config: &GatewayConfig, qr: &str, now: DateTime<Utc>, outcome: &mut StepOutcome) {
    let next_count = inner.status.qr_generation_count.saturating_add(1);
    if next_count > config.max_qr_generations {
        inner.allow_reconnect = false;
        inner.status.connection_state = ConnectionState::Disconnected;
        inner.status.sync_state = SyncState::Bootstrapping;
        inner.status.qr = None;
        inner.status.qr_issued_at = None;
        inner.status.qr_locked = true;
        inner.status.last_error = Some(last_error::QR_GENERATION_LIMIT_REACHED.to_owned());
        outcome.detach_socket = true;
    } else {
        inner.status.qr_generation_count = next_count;
        inner.status.qr = Some(qr.to_owned());
        inner.status.qr_issued_at = Some(now);
        inner.status.connection_state = ConnectionState::Connecting;
    }
    inner.status.updated_at = now;
}

fn apply_open(inner: &mut Inner, config: &GatewayConfig, own_jid: Option<String>, now: DateTime<Utc>) {
    let live_since_unix_sec = now.timestamp().saturating_sub(config.history_grace_window_sec);
    inner.live_since_unix_sec = Some(live_since_unix_sec);
    inner.status.connection_state = ConnectionState::Connected;
    inner.status.sync_state = SyncState::Live;
    inner.status.live_since = Some(now);
    inner.status.qr = None;
    inner.status.qr_issued_at = None;
    inner.status.own_jid = own_jid;
    inner.status.last_error = None;
    inner.status.updated_at = now;
}

fn apply_close(inner: &mut Inner, config: &GatewayConfig, payload: &Value, now: DateTime<Utc>, outcome: &mut StepOutcome) {
    let code = safe_disconnect_code(payload);
    let reason = safe_disconnect_reason(payload);
    let is_restart = code == Some(RESTART_REQUIRED_CODE)
        || reason.as_deref().is_some_and(|r| r.to_lowercase().contains("restart required"));

    inner.status.last_disconnect_code = code;
    inner.status.last_disconnect_reason = reason;
    inner.status.sync_state = SyncState::Bootstrapping;
    inner.live_since_unix_sec = None;
    inner.status.live_since = None;
    inner.status.updated_at = now;
    outcome.detach_socket = true;
    outcome.reset_dedup = true;

    if is_restart {
        inner.status.connection_state =
            if inner.allow_reconnect { ConnectionState::Connecting } else { ConnectionState::Disconnected };
        if inner.allow_reconnect {
            outcome.schedule_reconnect = Some(Duration::from_millis(config.reconnect_delay_ms.min(1000)));
        }
        return;
    }

    inner.status.own_jid = None;
    inner.status.qr = None;
    inner.status.qr_issued_at = None;

    let auth_fatal = code == Some(AUTH_INVALIDATED_CODE);
    inner.status.connection_state =
        if inner.allow_reconnect { ConnectionState::Connecting } else { ConnectionState::Disconnected };

    if !auth_fatal && inner.allow_reconnect {
        outcome.schedule_reconnect = Some(Duration::from_millis(config.reconnect_delay_ms));
    }
}

/// Walk a dotted path of object keys, returning `None` the moment any
/// segment is absent or not an object.
fn get_path<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |v, key| v.get(key))
}

/// Defensively extract a disconnect status code from any of the three
/// shapes the transport has been observed to use.
fn safe_disconnect_code(payload: &Value) -> Option<u16> {
    get_path(payload, &["lastDisconnect", "error", "output", "statusCode"])
        .or_else(|| get_path(payload, &["lastDisconnect", "error", "output", "payload", "statusCode"]))
        .or_else(|| get_path(payload, &["lastDisconnect", "error", "data", "attrs", "code"]))
        .and_then(value_as_u16)
}

fn value_as_u16(value: &Value) -> Option<u16> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        Value::String(s) => s.trim().parse::<u16>().ok(),
        _ => None,
    }
}

/// Defensively extract the human-readable disconnect reason.
fn safe_disconnect_reason(payload: &Value) -> Option<String> {
    get_path(payload, &["lastDisconnect", "error", "message"])
        .and_then(Value::as_str)
        .map(str::to_owned)
}
