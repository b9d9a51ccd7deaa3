//! Cache-only metadata search
//!
//! Queries never open a network session. Sender and subject filters are
//! ASCII case-insensitive substring matches; non-ASCII text compares exactly.
//! Results carry a freshness label so callers can decide whether to sync
//! before trusting them.

use chrono::NaiveDate;

use crate::errors::{AppError, AppResult};
use crate::models::{SearchOptions, SearchResult};
use crate::store::CacheStore;

/// Longest accepted sender or subject filter
const MAX_FILTER_CHARS: usize = 256;

/// Search the cached envelopes of one mailbox
///
/// # Errors
///
/// Returns `InvalidInput` for malformed filters, `Store` on cache failures.
pub async fn search_mailbox(
    store: &CacheStore,
    mailbox: &str,
    options: SearchOptions,
) -> AppResult<SearchResult> {
    let options = normalize(options)?;
    tracing::debug!(mailbox, ?options, "searching cache");
    store.search(mailbox, &options).await
}

/// Validate filters and drop blank ones
///
/// An empty or whitespace-only text filter counts as unset.
pub fn normalize(options: SearchOptions) -> AppResult<SearchOptions> {
    let from = clean_filter(options.from, "from")?;
    let subject = clean_filter(options.subject, "subject")?;
    if let (Some(since), Some(before)) = (options.since, options.before)
        && since >= before
    {
        return Err(AppError::InvalidInput(
            "since must be earlier than before".to_owned(),
        ));
    }
    Ok(SearchOptions {
        from,
        subject,
        ..options
    })
}

fn clean_filter(value: Option<String>, field: &str) -> AppResult<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    if trimmed.chars().count() > MAX_FILTER_CHARS {
        return Err(AppError::InvalidInput(format!(
            "{field} must be at most {MAX_FILTER_CHARS} characters"
        )));
    }
    if trimmed.chars().any(|ch| ch.is_control()) {
        return Err(AppError::InvalidInput(format!(
            "{field} must not contain control characters"
        )));
    }
    Ok(Some(trimmed.to_owned()))
}

/// Parse YYYY-MM-DD date string
pub fn parse_ymd(input: &str) -> AppResult<NaiveDate> {
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| AppError::InvalidInput(format!("invalid date '{input}', expected YYYY-MM-DD")))
}

/// Unix seconds at UTC midnight starting `input`
pub fn day_start_unix(input: &str) -> AppResult<i64> {
    let date = parse_ymd(input)?;
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .ok_or_else(|| AppError::InvalidInput(format!("invalid date '{input}'")))
}

/// Human-readable age of the last sync
pub fn describe_freshness(last_sync_unix: Option<i64>, now_unix: i64) -> String {
    let Some(last) = last_sync_unix else {
        return "never synced".to_owned();
    };
    let age = now_unix.saturating_sub(last);
    if age < 60 {
        return "just now".to_owned();
    }
    let (count, unit) = if age < 3_600 {
        (age / 60, "minute")
    } else if age < 86_400 {
        (age / 3_600, "hour")
    } else {
        (age / 86_400, "day")
    };
    let plural = if count == 1 { "" } else { "s" };
    format!("{count} {unit}{plural} ago")
}
