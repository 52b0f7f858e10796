//! Inbound filter pipeline.
//!
//! A stateless sequence of gates applied to each raw upstream message:
//! JID shape -> dedup -> staleness -> self-message policy -> sender
//! allowlist -> text extraction -> truncation -> prefix stripping. Every
//! rejection increments exactly one counter and the batch continues; a
//! malformed single message never aborts the rest of the batch.

use std::collections::HashSet;

use serde_json::Value;

use crate::dedup::DedupWindow;

/// The two JID suffixes this gateway understands.
pub(crate) const SUPPORTED_JID_SUFFIXES: [&str; 2] = ["@s.whatsapp.net", "@lid"];

/// A timestamp above this many seconds is assumed to be milliseconds and is
/// floored to seconds (10^10 seconds is the year 2286).
const MILLIS_THRESHOLD: f64 = 1e10;

/// A fully normalized inbound message, ready for the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Transport-assigned message id.
    pub id: String,
    /// Sender JID, canonicalized to the raw upstream value (not lowercased).
    pub remote_jid: String,
    /// Extracted and prefix-stripped text, null-byte stripped, trimmed, and
    /// truncated to the configured bound.
    pub conversation: String,
    /// Sender's display name, if the upstream record carried one.
    pub push_name: Option<String>,
    /// Message timestamp in seconds, if present and well-formed.
    pub timestamp: Option<i64>,
}

/// Immutable configuration the pipeline consults on every message.
pub struct PipelineConfig {
    /// Truncation bound for inbound (and outbound) text.
    pub max_text_chars: usize,
    /// Whether `fromMe == true` messages are accepted.
    pub allow_self_from_me: bool,
    /// Mandatory leading token, already trimmed; `None` disables the rule.
    pub require_prefix: Option<String>,
    /// Canonical sender keys permitted to send inbound; empty means any.
    pub allowed_senders: HashSet<String>,
}

/// Per-batch counter deltas, one field per rejection reason plus acceptance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PipelineCounters {
    /// Messages that passed every gate.
    pub accepted: u64,
    /// Messages dropped for a non-`notify` batch type.
    pub ignored_non_notify: u64,
    /// Messages dropped because the batch arrived before `open`.
    pub ignored_pre_live: u64,
    /// Messages dropped for a timestamp before the live window.
    pub ignored_stale: u64,
    /// Messages dropped as duplicates.
    pub ignored_duplicate: u64,
    /// Messages dropped for an empty or unsupported JID.
    pub ignored_unsupported_jid: u64,
    /// Messages dropped for `fromMe == true` with self messages disallowed.
    pub ignored_from_me: u64,
    /// Messages dropped for a sender outside the allowlist.
    pub ignored_sender_not_allowed: u64,
    /// Messages dropped for missing the configured prefix.
    pub ignored_missing_prefix: u64,
}

impl PipelineCounters {
    /// Fold these deltas into a live [`crate::status::Status`].
    pub fn apply_to(&self, status: &mut crate::status::Status) {
        status.accepted = status.accepted.saturating_add(self.accepted);
        status.ignored_non_notify = status.ignored_non_notify.saturating_add(self.ignored_non_notify);
        status.ignored_pre_live = status.ignored_pre_live.saturating_add(self.ignored_pre_live);
        status.ignored_stale = status.ignored_stale.saturating_add(self.ignored_stale);
        status.ignored_duplicate = status.ignored_duplicate.saturating_add(self.ignored_duplicate);
        status.ignored_unsupported_jid = status.ignored_unsupported_jid.saturating_add(self.ignored_unsupported_jid);
        status.ignored_from_me = status.ignored_from_me.saturating_add(self.ignored_from_me);
        status.ignored_sender_not_allowed =
            status.ignored_sender_not_allowed.saturating_add(self.ignored_sender_not_allowed);
        status.ignored_missing_prefix = status.ignored_missing_prefix.saturating_add(self.ignored_missing_prefix);
    }
}

/// Process one `messages.upsert` payload.
///
/// `connected` and `live_since_unix_sec` reflect the runtime's state at the
/// moment the batch arrived; they gate the whole batch before any
/// per-message filter runs.
pub fn process_upsert(
    payload: &Value,
    connected: bool,
    live_since_unix_sec: Option<i64>,
    dedup: &mut DedupWindow,
    config: &PipelineConfig,
) -> (Vec<InboundMessage>, PipelineCounters) {
    let mut counters = PipelineCounters::default();
    let mut accepted = Vec::new();

    let messages = match payload.get("messages").and_then(Value::as_array) {
        Some(m) if !m.is_empty() => m,
        _ => return (accepted, counters),
    };

    if let Some(batch_type) = payload.get("type").and_then(Value::as_str) {
        if !batch_type.is_empty() && !batch_type.eq_ignore_ascii_case("notify") {
            counters.ignored_non_notify =
                counters.ignored_non_notify.saturating_add(messages.len() as u64);
            return (accepted, counters);
        }
    }

    let Some(live_since) = (connected.then_some(live_since_unix_sec).flatten()) else {
        counters.ignored_pre_live = counters.ignored_pre_live.saturating_add(messages.len() as u64);
        return (accepted, counters);
    };

    for raw in messages {
        match process_message(raw, live_since, dedup, config) {
            Ok(message) => {
                counters.accepted = counters.accepted.saturating_add(1);
                accepted.push(message);
            }
            Err(Some(rejection)) => rejection.tally(&mut counters),
            Err(None) => {} // empty-text silent skip, no counter
        }
    }

    (accepted, counters)
}

enum Rejection {
    UnsupportedJid,
    Duplicate,
    Stale,
    FromMe,
    SenderNotAllowed,
    MissingPrefix,
}

impl Rejection {
    fn tally(&self, counters: &mut PipelineCounters) {
        match self {
            Self::UnsupportedJid => counters.ignored_unsupported_jid = counters.ignored_unsupported_jid.saturating_add(1),
            Self::Duplicate => counters.ignored_duplicate = counters.ignored_duplicate.saturating_add(1),
            Self::Stale => counters.ignored_stale = counters.ignored_stale.saturating_add(1),
            Self::FromMe => counters.ignored_from_me = counters.ignored_from_me.saturating_add(1),
            Self::SenderNotAllowed => counters.ignored_sender_not_allowed = counters.ignored_sender_not_allowed.saturating_add(1),
            Self::MissingPrefix => counters.ignored_missing_prefix = counters.ignored_missing_prefix.saturating_add(1),
        }
    }
}

fn process_message(
    raw: &Value,
    live_since_unix_sec: i64,
    dedup: &mut DedupWindow,
    config: &PipelineConfig,
) -> Result<InboundMessage, Option<Rejection>> {
    // a. shape
    let remote_jid = raw.get("remoteJid").and_then(Value::as_str).unwrap_or("");
    let id = raw.get("id").and_then(Value::as_str).unwrap_or("");
    if remote_jid.is_empty()
        || id.is_empty()
        || !SUPPORTED_JID_SUFFIXES.iter().any(|suffix| remote_jid.ends_with(suffix))
    {
        return Err(Some(Rejection::UnsupportedJid));
    }

    // b. dedup
    let key = DedupWindow::key(remote_jid, id);
    if !dedup.insert(key) {
        return Err(Some(Rejection::Duplicate));
    }

    // c. staleness
    let timestamp = normalize_timestamp(raw.get("messageTimestamp"));
    if let Some(ts) = timestamp {
        if ts < live_since_unix_sec {
            return Err(Some(Rejection::Stale));
        }
    }

    // d. self-message policy
    let from_me = raw.get("fromMe").and_then(Value::as_bool).unwrap_or(false);
    if from_me && !config.allow_self_from_me {
        return Err(Some(Rejection::FromMe));
    }

    // e. sender allowlist
    if !from_me && !config.allowed_senders.is_empty() {
        let sender_key = canonical_sender_key(remote_jid);
        if !config.allowed_senders.contains(&sender_key) {
            return Err(Some(Rejection::SenderNotAllowed));
        }
    }

    // f. text extraction
    let text = extract_text(raw).trim().to_owned();
    if text.is_empty() {
        return Err(None);
    }

    // g. required-prefix rule
    let text = match apply_required_prefix(&text, config.require_prefix.as_deref()) {
        Some(stripped) if !stripped.is_empty() || config.require_prefix.is_none() => stripped,
        _ => return Err(Some(Rejection::MissingPrefix)),
    };

    let push_name = raw
        .get("pushName")
        .and_then(Value::as_str)
        .map(|s| normalize_field(s, config.max_text_chars))
        .filter(|s| !s.is_empty());

    Ok(InboundMessage {
        id: normalize_field(id, config.max_text_chars),
        remote_jid: remote_jid.to_owned(),
        conversation: normalize_field(&text, config.max_text_chars),
        push_name,
        timestamp,
    })
}

fn extract_text(raw: &Value) -> String {
    let message = raw.get("message");
    if let Some(conversation) = message.and_then(|m| m.get("conversation")).and_then(Value::as_str) {
        return conversation.to_owned();
    }
    if let Some(extended) = message
        .and_then(|m| m.get("extendedTextMessage"))
        .and_then(|m| m.get("text"))
        .and_then(Value::as_str)
    {
        return extended.to_owned();
    }
    String::new()
}

/// Strip null bytes, trim, and truncate to `max_chars` (counted in `char`s).
pub(crate) fn normalize_field(s: &str, max_chars: usize) -> String {
    let cleaned: String = s.chars().filter(|c| *c != '\0').collect();
    cleaned.trim().chars().take(max_chars).collect()
}

/// See [`crate::pipeline`] module docs and the required-prefix rule: case
/// insensitively match the leading bytes of `text` against `prefix`, strip
/// it plus an optional following `:`/`-` separator, left-trim the result.
///
/// Returns `None` only when a prefix is configured and does not match.
fn apply_required_prefix(text: &str, prefix: Option<&str>) -> Option<String> {
    let prefix = match prefix.map(str::trim) {
        None => return Some(text.to_owned()),
        Some(p) if p.is_empty() => return Some(text.to_owned()),
        Some(p) => p,
    };

    if text.len() < prefix.len() || !text.is_char_boundary(prefix.len()) {
        return None;
    }
    let (head, tail) = text.split_at(prefix.len());
    if !head.eq_ignore_ascii_case(prefix) {
        return None;
    }

    let mut remainder = tail.trim_start();
    if let Some(stripped) = remainder.strip_prefix(':').or_else(|| remainder.strip_prefix('-')) {
        remainder = stripped.trim_start();
    }
    Some(remainder.to_owned())
}

/// Canonicalize a JID to its allowlist-comparable form: lowercase, the
/// portion before `@`, then before `:`, trimmed.
#[must_use]
pub fn canonical_sender_key(jid: &str) -> String {
    let before_at = jid.split('@').next().unwrap_or("");
    let before_colon = before_at.split(':').next().unwrap_or("");
    before_colon.trim().to_lowercase()
}

/// Normalize a `messageTimestamp` field per the documented rules: values
/// above [`MILLIS_THRESHOLD`] are assumed to be milliseconds and floored to
/// seconds; numeric strings are accepted; anything else (including absent,
/// non-finite, or negative values) yields `None`.
fn normalize_timestamp(value: Option<&Value>) -> Option<i64> {
    let number = match value {
        Some(Value::Number(n)) => n.as_f64()?,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if !number.is_finite() || number <= 0.0 {
        return None;
    }
    let seconds = if number > MILLIS_THRESHOLD { (number / 1000.0).floor() } else { number.floor() };
    #[allow(clippy::cast_possible_truncation)]
    Some(seconds as i64)
}
