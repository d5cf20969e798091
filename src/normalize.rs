//! Mapping of provider payloads into the canonical [`Message`].
//!
//! Adapters decode their wire format into a [`RawMessage`] and hand it to
//! [`normalize`], which applies the same fallbacks for every provider:
//!
//! - missing sender → `"unknown sender"`, missing subject → `"no subject"`
//! - unparsable or missing date → the current time
//! - only one of html/text present → the other is derived from it

use crate::message::{Message, MessageId};
use crate::providers::ProviderKey;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

/// Sender used when the provider gives none.
pub const UNKNOWN_SENDER: &str = "unknown sender";
/// Subject used when the provider gives none.
pub const NO_SUBJECT: &str = "no subject";

static TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[/!?a-zA-Z][^>]*>").expect("valid regex"));
static BLOCK_BREAK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)<\s*(br\s*/?|/p|/div|/tr|/li|/h[1-6])\s*>").expect("valid regex")
});
static SCRIPT_STYLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)\s*>").expect("valid regex")
});

/// How a provider expressed a message date.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum DateHint {
    /// Free-form text (RFC 3339, RFC 2822 or `YYYY-MM-DD HH:MM:SS`).
    Text(String),
    /// Unix seconds.
    Unix(i64),
    /// Nothing usable.
    #[default]
    Missing,
}

impl DateHint {
    /// Interprets a JSON value that may be a number, a numeric string or a date string.
    #[must_use]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Number(n) => n.as_i64().map_or(Self::Missing, Self::Unix),
            Value::String(s) if s.trim().is_empty() => Self::Missing,
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map_or_else(|_| Self::Text(s.clone()), Self::Unix),
            _ => Self::Missing,
        }
    }
}

/// Provider-neutral message fields before normalization.
#[derive(Debug, Clone, Default)]
pub struct RawMessage {
    /// Id as the provider knows it.
    pub native_id: String,
    /// Sender, if any.
    pub from: Option<String>,
    /// Subject, if any.
    pub subject: Option<String>,
    /// Date as provided.
    pub date: DateHint,
    /// Plain-text body, if any.
    pub text: Option<String>,
    /// HTML body, if any.
    pub html: Option<String>,
}

/// Normalizes a raw provider message, using `now` for a missing date.
#[must_use]
pub fn normalize_at(provider: &ProviderKey, raw: RawMessage, now: DateTime<Utc>) -> Message {
    let date = parse_timestamp(&raw.date).unwrap_or_else(|| {
        debug!(provider = %provider, native_id = %raw.native_id, date = ?raw.date, "Unparsable date, using now");
        now
    });

    let text = non_empty(raw.text);
    let html = non_empty(raw.html);
    let (text, html) = match (text, html) {
        (Some(text), Some(html)) => (text, html),
        (Some(text), None) => {
            let html = text_to_html(&text);
            (text, html)
        }
        (None, Some(html)) => (html_to_text(&html), html),
        (None, None) => (String::new(), String::new()),
    };

    Message {
        id: MessageId::new(provider.clone(), raw.native_id),
        from: non_empty(raw.from).unwrap_or_else(|| UNKNOWN_SENDER.to_string()),
        subject: non_empty(raw.subject).unwrap_or_else(|| NO_SUBJECT.to_string()),
        date,
        text,
        html,
    }
}

/// Normalizes a raw provider message.
#[must_use]
pub fn normalize(provider: &ProviderKey, raw: RawMessage) -> Message {
    normalize_at(provider, raw, Utc::now())
}

/// Parses a date hint, or `None` if it cannot be understood.
#[must_use]
pub fn parse_timestamp(hint: &DateHint) -> Option<DateTime<Utc>> {
    match hint {
        DateHint::Missing => None,
        DateHint::Unix(secs) => Utc.timestamp_opt(*secs, 0).single(),
        DateHint::Text(text) => {
            let text = text.trim();
            DateTime::parse_from_rfc3339(text)
                .or_else(|_| DateTime::parse_from_rfc2822(text))
                .map(|dt| dt.with_timezone(&Utc))
                .ok()
                .or_else(|| {
                    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S")
                        .ok()
                        .map(|naive| naive.and_utc())
                })
        }
    }
}

/// Strips markup from an HTML body, keeping line structure.
#[must_use]
pub fn html_to_text(html: &str) -> String {
    let without_code = SCRIPT_STYLE.replace_all(html, "");
    let with_breaks = BLOCK_BREAK.replace_all(&without_code, "\n");
    let stripped = TAG.replace_all(&with_breaks, "");
    decode_entities(&stripped).trim().to_string()
}

/// Wraps a plain-text body as HTML, turning newlines into `<br>`.
#[must_use]
pub fn text_to_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace("\r\n", "\n")
        .replace('\n', "<br>")
}

/// Returns `true` if a body looks like markup rather than plain text.
#[must_use]
pub fn looks_like_html(body: &str) -> bool {
    TAG.is_match(body)
}

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
