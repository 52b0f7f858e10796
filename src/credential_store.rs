//! Credential repair.
//!
//! Before each connect attempt the runtime inspects `creds.json` in the
//! auth directory and quarantines it if it looks half-paired: the
//! transport's own multi-file auth state loader is what actually reads
//! and writes this directory; this module only implements the one
//! defensive check the core needs to run first.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

const CREDS_FILE_NAME: &str = "creds.json";

/// Result of a repair pass over the auth directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RepairOutcome {
    /// Nothing needed fixing: no file, an unparseable file, a fully
    /// registered session, or a session with neither `me` nor `account`.
    NoOp,
    /// The file looked partially paired and was quarantined.
    Repaired {
        /// Path the original `creds.json` was renamed to.
        quarantined_path: PathBuf,
    },
}

/// Inspect and, if necessary, quarantine `creds.json` under `auth_dir`.
///
/// Returns `Ok(RepairOutcome::NoOp)` rather than an error whenever the file
/// is missing or fails to parse: an absent or garbled file is simply
/// treated as a fresh session by the transport, per the repair predicate.
///
/// # Errors
///
/// Returns an error only if the file exists, parses, looks partial, and the
/// rename itself fails (e.g. a permissions problem).
pub fn repair(auth_dir: &Path) -> std::io::Result<RepairOutcome> {
    let creds_path = auth_dir.join(CREDS_FILE_NAME);

    let contents = match std::fs::read_to_string(&creds_path) {
        Ok(c) => c,
        Err(_) => return Ok(RepairOutcome::NoOp),
    };

    let Ok(parsed) = serde_json::from_str::<Value>(&contents) else {
        return Ok(RepairOutcome::NoOp);
    };

    if !is_partial(&parsed) {
        return Ok(RepairOutcome::NoOp);
    }

    let now_millis = now_millis();
    let quarantined_path = auth_dir.join(format!("creds.partial.{now_millis}.json"));
    std::fs::rename(&creds_path, &quarantined_path)?;
    Ok(RepairOutcome::Repaired { quarantined_path })
}

/// A parsed credential record is partial when it is neither fully
/// registered nor entirely empty of identity fields: it has `me` or
/// `account` but `registered` is not `true`.
fn is_partial(parsed: &Value) -> bool {
    let Some(obj) = parsed.as_object() else {
        return false;
    };

    let registered = obj.get("registered").and_then(Value::as_bool).unwrap_or(false);
    if registered {
        return false;
    }

    let has_me = obj.get("me").is_some_and(|v| !v.is_null());
    let has_account = obj.get("account").is_some_and(|v| !v.is_null());
    has_me || has_account
}

#[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}
