//! Data model and CLI output DTOs
//!
//! The first half holds the cache data model shared by the protocol client,
//! the store, and the sync and search engines. The second half holds the
//! serializable shapes the CLI prints.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Default result cap applied when `SearchOptions::limit` is 0
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Mailbox metadata returned by SELECT/EXAMINE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MailboxStatus {
    /// Number of messages currently in the mailbox
    pub num_messages: u32,
    /// Epoch marker of the mailbox UID namespace
    pub uid_validity: u32,
}

/// Envelope metadata as fetched from the server
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Envelope {
    /// Server-assigned UID, unique within one UIDVALIDITY epoch
    pub uid: u32,
    /// `Message-ID` header value, if the message has one
    pub message_id: Option<String>,
    /// Unix seconds; 0 when the server reported no usable date
    pub date: i64,
    /// `mailbox@host` of the first sender
    pub from_address: String,
    /// Decoded display name of the first sender (may be empty)
    pub from_name: String,
    /// Decoded subject (may be empty)
    pub subject: String,
}

/// Envelope row held in the cache, keyed by `(mailbox, uid)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedEnvelope {
    pub mailbox: String,
    pub uid: u32,
    pub message_id: Option<String>,
    pub date: i64,
    pub from_address: String,
    pub from_name: String,
    pub subject: String,
}

/// Sync checkpoint for one mailbox
///
/// `last_uid` is only meaningful under the `uid_validity` it was recorded
/// with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MailboxState {
    pub name: String,
    pub uid_validity: u32,
    pub last_uid: u32,
    pub last_sync_unix: i64,
}

/// Metadata filters applied by the search engine
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchOptions {
    /// Substring of the sender address
    pub from: Option<String>,
    /// Substring of the subject
    pub subject: Option<String>,
    /// Inclusive lower bound, unix seconds
    pub since: Option<i64>,
    /// Exclusive upper bound, unix seconds
    pub before: Option<i64>,
    /// Result cap; 0 selects [`DEFAULT_SEARCH_LIMIT`]
    pub limit: usize,
}

impl SearchOptions {
    /// Cap actually applied to the query
    pub fn effective_limit(&self) -> usize {
        if self.limit == 0 {
            DEFAULT_SEARCH_LIMIT
        } else {
            self.limit
        }
    }
}

/// Answer to a cache query
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchResult {
    pub mailbox: String,
    /// Matches, newest first
    pub messages: Vec<CachedEnvelope>,
    /// Envelopes cached for the mailbox, regardless of filters
    pub total_cached: u64,
    /// Unix seconds of the last successful sync
    pub last_sync_unix: Option<i64>,
    /// Human-readable age of the cache
    pub freshness: String,
}

/// How a sync run populated the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// No usable checkpoint; every message fetched by sequence number
    Full,
    /// Only UIDs above the checkpoint fetched
    Incremental,
    /// UIDVALIDITY changed; cache discarded and rebuilt
    Resync,
    /// Server mailbox is empty; only the checkpoint was recorded
    Empty,
}

/// Outcome of one mailbox sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncResult {
    pub mailbox: String,
    pub mode: SyncMode,
    /// Envelopes fetched and cached by this run
    pub new_messages: usize,
    /// Envelopes cached for the mailbox after the run
    pub total_cached: u64,
    pub message: String,
}

/// Metadata included in all command responses
///
/// Provides timing information and current UTC timestamp.
#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    /// Current UTC timestamp in RFC 3339 format with milliseconds
    pub now_utc: String,
    /// Command execution duration in milliseconds
    pub duration_ms: u64,
}

impl Meta {
    /// Create metadata populated with current time and elapsed duration
    pub fn now(duration_ms: u64) -> Self {
        Self {
            now_utc: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            duration_ms,
        }
    }
}

/// Standard response envelope printed by every command
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutput<T> {
    /// Human-readable summary of the operation outcome
    pub summary: String,
    /// Command-specific data payload
    pub data: T,
    /// Execution metadata (timestamp, duration)
    pub meta: Meta,
}

/// Mailbox name as listed by the server
#[derive(Debug, Clone, Serialize)]
pub struct MailboxInfo {
    pub name: String,
    /// Hierarchy delimiter if supported by server (e.g., `/`, `.`)
    pub delimiter: Option<String>,
}

/// Cached envelope rendered for output
#[derive(Debug, Clone, Serialize)]
pub struct MessageSummary {
    pub mailbox: String,
    pub uid: u32,
    pub message_id: Option<String>,
    /// RFC 3339 date, absent when the cache holds timestamp 0
    pub date: Option<String>,
    pub from_address: String,
    pub from_name: Option<String>,
    pub subject: String,
}

impl From<CachedEnvelope> for MessageSummary {
    fn from(env: CachedEnvelope) -> Self {
        Self {
            date: format_unix(env.date),
            from_name: Some(env.from_name).filter(|n| !n.is_empty()),
            mailbox: env.mailbox,
            uid: env.uid,
            message_id: env.message_id,
            from_address: env.from_address,
            subject: env.subject,
        }
    }
}

/// Search answer rendered for output
#[derive(Debug, Clone, Serialize)]
pub struct SearchOutput {
    pub mailbox: String,
    pub freshness: String,
    pub last_sync: Option<String>,
    pub total_cached: u64,
    pub messages: Vec<MessageSummary>,
}

impl From<SearchResult> for SearchOutput {
    fn from(result: SearchResult) -> Self {
        Self {
            mailbox: result.mailbox,
            freshness: result.freshness,
            last_sync: result.last_sync_unix.and_then(format_unix),
            total_cached: result.total_cached,
            messages: result.messages.into_iter().map(MessageSummary::from).collect(),
        }
    }
}

/// Cache checkpoint rendered for `status`
#[derive(Debug, Clone, Serialize)]
pub struct MailboxCacheInfo {
    pub mailbox: String,
    pub uid_validity: u32,
    pub last_uid: u32,
    pub last_sync: Option<String>,
    pub freshness: String,
    pub total_cached: u64,
}

/// Attachment metadata
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentInfo {
    /// Filename if present in Content-Disposition or Content-Type
    pub filename: Option<String>,
    /// MIME content type (e.g., `application/pdf`, `image/jpeg`)
    pub content_type: String,
    /// Attachment size in bytes
    pub size_bytes: usize,
    /// Part ID for MIME structure (e.g., `1`, `2`, `3.1`)
    pub part_id: String,
}

/// Full message rendered for `show`
#[derive(Debug, Clone, Serialize)]
pub struct MessageDetail {
    pub mailbox: String,
    pub uid_validity: u32,
    pub uid: u32,
    pub message_id: Option<String>,
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    pub body_text: Option<String>,
    /// Sanitized HTML body, only with `--html`
    pub body_html: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Result of `download`
#[derive(Debug, Clone, Serialize)]
pub struct DownloadInfo {
    pub mailbox: String,
    pub uid: u32,
    pub path: String,
    pub size_bytes: usize,
}

/// Format unix seconds as RFC 3339, treating 0 as unknown
pub fn format_unix(secs: i64) -> Option<String> {
    if secs == 0 {
        return None;
    }
    DateTime::<Utc>::from_timestamp(secs, 0).map(|d| d.to_rfc3339_opts(SecondsFormat::Secs, true))
}
