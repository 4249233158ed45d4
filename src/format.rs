//! Formatting of one alert into a bounded-length SMS body.

use crate::{
    alertmanager::{Alert, Status},
    gateway::GatewayConfig,
};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

/// Maximum message length used when the configured value is 0.
const DEFAULT_MAX_MESSAGE_LENGTH: usize = 150;

/// Matches `$labels.xxx` placeholders in alert annotations.
///
/// Identifiers are restricted to `[a-zA-Z_][a-zA-Z0-9_]*`; label names
/// containing dots or dashes are never matched.
static LABEL_PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$labels\.([a-zA-Z_][a-zA-Z0-9_]*)").unwrap());

/// Error formatting an alert into a message body.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    /// Neither `annotations.summary` nor `annotations.description` has
    /// non-blank content. The alert cannot be rendered and is not retried.
    #[error("alert missing summary and description annotations")]
    MissingSummaryAndDescription,
}

/// Format an alert into a message string ready to be sent via SMS.
///
/// Selects summary (or description as a fallback), replaces label
/// placeholders, appends the start timestamp when parsable, prepends the
/// alert name, resolved marker and configured prefix, then truncates.
/// Prefix order is fixed: `<prefix> RESOLVED: [<name>] "<text>" alert starts at <ts>`.
/// Truncation happens last, so a long prefix can consume the entire budget.
pub fn format_message(
    alert: &Alert,
    status: Status,
    config: &GatewayConfig,
) -> Result<String, FormatError> {
    let source = alert
        .annotation("summary")
        .filter(|s| !s.trim().is_empty())
        .or_else(|| {
            alert
                .annotation("description")
                .filter(|s| !s.trim().is_empty())
        })
        .ok_or(FormatError::MissingSummaryAndDescription)?;

    let mut body = interpolate_labels(source, alert);

    // startsAt is optional, and may be malformed. Only include the timestamp
    // when it parses as RFC3339.
    if let Ok(starts_at) = DateTime::parse_from_rfc3339(&alert.starts_at) {
        let rfc1123 = starts_at
            .with_timezone(&Utc)
            .format("%a, %d %b %Y %H:%M:%S UTC");
        body = format!("\"{body}\" alert starts at {rfc1123}");
    }

    if let Some(name) = alert.label("alertname").filter(|s| !s.trim().is_empty()) {
        body = format!("[{name}] {body}");
    }

    if status == Status::Resolved {
        body = format!("RESOLVED: {body}");
    }

    if !config.message_prefix.is_empty() {
        body = format!("{} {body}", config.message_prefix);
    }

    let max_len = match config.max_message_length {
        0 => DEFAULT_MAX_MESSAGE_LENGTH,
        n => n as usize,
    };

    Ok(truncate_message(&body, max_len))
}

/// Replace `$labels.xxx` placeholders with the alert's label values.
///
/// All occurrences are replaced; a missing label replaces with the empty
/// string. Replacement values are never re-scanned for further placeholders.
pub fn interpolate_labels(body: &str, alert: &Alert) -> String {
    LABEL_PLACEHOLDER
        .replace_all(body, |caps: &regex::Captures<'_>| {
            alert.label(&caps[1]).unwrap_or_default().to_owned()
        })
        .into_owned()
}

/// Truncate a message to at most `max_len` bytes, appending `"..."` when
/// truncation occurs. When `max_len <= 3` the message is cut with no suffix.
///
/// The bound is byte-oriented, matching SMS billing semantics rather than
/// character counts. A cut that would split a multi-byte character backs off
/// to the previous char boundary, so multi-byte text can come out slightly
/// under `max_len`.
pub fn truncate_message(msg: &str, max_len: usize) -> String {
    if msg.len() <= max_len {
        return msg.to_owned();
    }
    if max_len <= 3 {
        return msg[..floor_char_boundary(msg, max_len)].to_owned();
    }
    format!("{}...", &msg[..floor_char_boundary(msg, max_len - 3)])
}

/// Largest char boundary that is `<= at`.
fn floor_char_boundary(s: &str, mut at: usize) -> usize {
    while !s.is_char_boundary(at) {
        at -= 1;
    }
    at
}
