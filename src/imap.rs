//! IMAP transport and session operations
//!
//! Provides timeout-bounded wrappers around `async-imap` operations. Every
//! round trip is awaited on its own; one session never has two commands in
//! flight.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use async_imap::error::Error as ImapError;
use async_imap::types::Fetch;
use async_imap::{Client, Session};
use async_trait::async_trait;
use futures::TryStreamExt;
use secrecy::ExposeSecret;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{AccountConfig, AppConfig};
use crate::envelope;
use crate::errors::{AppError, AppResult};
use crate::models::{Envelope, MailboxInfo, MailboxStatus};
use crate::sync::MailSource;
use crate::transport::{self, MailStream};

/// Items requested for every envelope fetch
const ENVELOPE_QUERY: &str = "(UID ENVELOPE INTERNALDATE)";
/// Items requested for a complete message; `PEEK` keeps `\Seen` untouched
const FULL_MESSAGE_QUERY: &str = "(UID ENVELOPE INTERNALDATE BODY.PEEK[])";

/// Type alias for an authenticated IMAP session
pub type ImapSession = Session<MailStream>;

/// Session-scoped protocol client
///
/// Owns one authenticated session. After [`ImapClient::close`] every
/// operation fails with `Connection`.
pub struct ImapClient {
    session: Option<ImapSession>,
    socket_timeout: Duration,
    batch_size: u32,
}

impl ImapClient {
    /// Connect to IMAP server and authenticate
    ///
    /// Performs full connection sequence with timeouts:
    /// 1. TCP connect
    /// 2. TLS handshake with bundled root certificates (when `secure`)
    /// 3. Read IMAP greeting
    /// 4. LOGIN authentication
    ///
    /// # Timeouts
    ///
    /// - TCP connect: `connect_timeout_ms`
    /// - TLS handshake, greeting, LOGIN: `greeting_timeout_ms`
    ///
    /// # Errors
    ///
    /// - `InvalidInput` if the hostname is invalid for TLS SNI
    /// - `Timeout` if any connection phase times out
    /// - `Connection` for TCP, TLS, or greeting failures
    /// - `AuthFailed` if the server rejects the credentials
    pub async fn connect(config: &AppConfig, account: &AccountConfig) -> AppResult<Self> {
        let connect_duration = Duration::from_millis(config.connect_timeout_ms);
        let greeting_duration = Duration::from_millis(config.greeting_timeout_ms);

        let tcp = timeout(
            connect_duration,
            TcpStream::connect((account.host.as_str(), account.port)),
        )
        .await
        .map_err(|_| AppError::Timeout("tcp connect timeout".to_owned()))
        .and_then(|r| r.map_err(|e| AppError::Connection(format!("tcp connect failed: {e}"))))?;

        let stream = if account.secure {
            let server_name = transport::server_name(&account.host)?;
            let tls = timeout(
                greeting_duration,
                transport::tls_connector().connect(server_name, tcp),
            )
            .await
            .map_err(|_| AppError::Timeout("TLS handshake timeout".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Connection(format!("TLS handshake failed: {e}")))
            })?;
            MailStream::Tls(Box::new(tls))
        } else {
            MailStream::Plain(tcp)
        };
        let tls = stream.is_tls();

        let mut client = Client::new(stream);
        let greeting = timeout(greeting_duration, client.read_response())
            .await
            .map_err(|_| AppError::Timeout("IMAP greeting timeout".to_owned()))
            .and_then(|r| {
                r.map_err(|e| AppError::Connection(format!("IMAP greeting failed: {e}")))
            })?;

        if greeting.is_none() {
            return Err(AppError::Connection(
                "IMAP server closed connection before greeting".to_owned(),
            ));
        }

        let pass = account.pass.expose_secret();
        let session = timeout(greeting_duration, client.login(account.user.as_str(), pass))
            .await
            .map_err(|_| AppError::Timeout("IMAP login timeout".to_owned()))
            .and_then(|r| r.map_err(|(e, _)| login_error(e)))?;

        info!(account = %account.account_id, host = %account.host, tls, "IMAP session established");
        Ok(Self {
            session: Some(session),
            socket_timeout: Duration::from_millis(config.socket_timeout_ms),
            batch_size: config.sync_batch_size,
        })
    }

    fn session(&mut self) -> AppResult<&mut ImapSession> {
        self.session
            .as_mut()
            .ok_or_else(|| AppError::Connection("IMAP session is closed".to_owned()))
    }

    /// List all visible mailboxes/folders
    pub async fn list_mailboxes(&mut self) -> AppResult<Vec<MailboxInfo>> {
        let limit = self.socket_timeout;
        let session = self.session()?;
        let names = bounded(limit, "LIST", async {
            session
                .list(None, Some("*"))
                .await?
                .try_collect::<Vec<_>>()
                .await
        })
        .await?;

        Ok(names
            .iter()
            .map(|name| MailboxInfo {
                name: name.name().to_owned(),
                delimiter: name.delimiter().map(|d| d.to_string()),
            })
            .collect())
    }

    /// Select mailbox in read-only mode
    ///
    /// Uses `EXAMINE` so that neither sync nor `show` changes `\Seen`.
    /// Returns the message count and `UIDVALIDITY`.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the server refuses the mailbox
    /// - `Internal` if the server omits `UIDVALIDITY`
    pub async fn select_mailbox(&mut self, mailbox: &str) -> AppResult<MailboxStatus> {
        let limit = self.socket_timeout;
        let session = self.session()?;
        let selected = timeout(limit, session.examine(mailbox))
            .await
            .map_err(|_| AppError::Timeout(format!("EXAMINE timed out for mailbox '{mailbox}'")))?
            .map_err(|e| examine_error(mailbox, e))?;

        let uid_validity = selected
            .uid_validity
            .ok_or_else(|| AppError::Internal("mailbox missing UIDVALIDITY".to_owned()))?;
        debug!(mailbox, exists = selected.exists, uid_validity, "mailbox examined");
        Ok(MailboxStatus {
            num_messages: selected.exists,
            uid_validity,
        })
    }

    /// Fetch envelopes by message sequence number, `start..=end` (1-based)
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` for an empty or zero-based range.
    pub async fn fetch_envelopes_by_sequence_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> AppResult<Vec<Envelope>> {
        if start == 0 || start > end {
            return Err(AppError::invalid(format!(
                "invalid sequence range {start}:{end}"
            )));
        }
        let limit = self.socket_timeout;
        let session = self.session()?;
        let fetches: Vec<Fetch> = bounded(limit, "FETCH", async {
            session
                .fetch(format!("{start}:{end}"), ENVELOPE_QUERY)
                .await?
                .try_collect()
                .await
        })
        .await?;
        Ok(collect_envelopes(&fetches))
    }

    /// Fetch envelopes for an explicit UID set
    ///
    /// UIDs that no longer exist are omitted from the result. Large sets are
    /// split into `batch_size` UID FETCH round trips.
    pub async fn fetch_envelopes_by_uid(&mut self, uids: &[u32]) -> AppResult<Vec<Envelope>> {
        let unique: Vec<u32> = uids
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let limit = self.socket_timeout;
        let batch = usize::try_from(self.batch_size).unwrap_or(usize::MAX).max(1);

        let mut out = Vec::with_capacity(unique.len());
        for chunk in unique.chunks(batch) {
            let set = compress_uid_set(chunk);
            let session = self.session()?;
            let fetches: Vec<Fetch> = bounded(limit, "UID FETCH", async {
                session
                    .uid_fetch(set, ENVELOPE_QUERY)
                    .await?
                    .try_collect()
                    .await
            })
            .await?;
            out.extend(collect_envelopes(&fetches));
        }
        Ok(out)
    }

    /// Fetch envelopes for every message with a UID above `last_uid`
    ///
    /// Runs `UID SEARCH UID <last_uid+1>:*` and fetches the resulting set.
    /// `n:*` always matches the highest UID in the mailbox, so UIDs at or
    /// below `last_uid` are filtered out. An empty result means nothing new.
    pub async fn fetch_new_envelopes_since(&mut self, last_uid: u32) -> AppResult<Vec<Envelope>> {
        let Some(first) = last_uid.checked_add(1) else {
            return Ok(Vec::new());
        };
        let limit = self.socket_timeout;
        let session = self.session()?;
        let found = bounded(limit, "UID SEARCH", session.uid_search(format!("UID {first}:*")))
            .await?;

        let uids = uids_above(found, last_uid);
        if uids.is_empty() {
            debug!(last_uid, "no UIDs above checkpoint");
            return Ok(Vec::new());
        }
        debug!(last_uid, found = uids.len(), "UIDs above checkpoint");

        let mut envelopes = self.fetch_envelopes_by_uid(&uids).await?;
        envelopes.retain(|env| env.uid > last_uid);
        Ok(envelopes)
    }

    /// Fetch complete RFC822 source plus envelope for one UID
    ///
    /// # Errors
    ///
    /// - `NotFound` if the UID does not exist in the selected mailbox
    /// - `Internal` if the server returns no body
    pub async fn fetch_full_message(&mut self, uid: u32) -> AppResult<(Vec<u8>, Envelope)> {
        let limit = self.socket_timeout;
        let session = self.session()?;
        let fetches: Vec<Fetch> = bounded(limit, "UID FETCH", async {
            session
                .uid_fetch(uid.to_string(), FULL_MESSAGE_QUERY)
                .await?
                .try_collect()
                .await
        })
        .await?;

        let fetch = fetches
            .iter()
            .find(|f| f.uid == Some(uid))
            .ok_or_else(|| AppError::NotFound(format!("message uid {uid} not found")))?;
        let body = fetch
            .body()
            .ok_or_else(|| AppError::Internal("message has no body".to_owned()))?
            .to_vec();
        let envelope = envelope::from_fetch(fetch).unwrap_or_else(|| Envelope {
            uid,
            ..Envelope::default()
        });
        Ok((body, envelope))
    }

    /// Log out and release the session
    ///
    /// Safe to call more than once; later calls do nothing.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(mut session) = self.session.take() else {
            return Ok(());
        };
        if let Err(e) = bounded(self.socket_timeout, "LOGOUT", session.logout()).await {
            warn!(error = %e, "LOGOUT failed; dropping session");
        }
        Ok(())
    }
}

#[async_trait]
impl MailSource for ImapClient {
    async fn select_mailbox(&mut self, mailbox: &str) -> AppResult<MailboxStatus> {
        ImapClient::select_mailbox(self, mailbox).await
    }

    async fn fetch_envelopes_by_sequence_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> AppResult<Vec<Envelope>> {
        ImapClient::fetch_envelopes_by_sequence_range(self, start, end).await
    }

    async fn fetch_new_envelopes_since(&mut self, last_uid: u32) -> AppResult<Vec<Envelope>> {
        ImapClient::fetch_new_envelopes_since(self, last_uid).await
    }
}

/// Await an IMAP command under the socket timeout
async fn bounded<F, T>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = Result<T, ImapError>>,
{
    timeout(limit, fut)
        .await
        .map_err(|_| AppError::Timeout(format!("{what} timed out")))?
        .map_err(|e| classify(what, e))
}

/// Map a protocol error onto the application taxonomy
fn classify(what: &str, e: ImapError) -> AppError {
    match e {
        ImapError::Io(_) | ImapError::ConnectionLost => {
            AppError::Connection(format!("{what} failed: {e}"))
        }
        other => AppError::Internal(format!("{what} failed: {other}")),
    }
}

/// EXAMINE failures: only a tagged NO means the mailbox is unavailable
fn examine_error(mailbox: &str, e: ImapError) -> AppError {
    match e {
        ImapError::No(_) => AppError::NotFound(format!("cannot examine mailbox '{mailbox}': {e}")),
        other => classify("EXAMINE", other),
    }
}

/// Sorted UIDs strictly above `last_uid`
///
/// `UID n:*` matches the highest UID even when it is below `n`.
fn uids_above(found: impl IntoIterator<Item = u32>, last_uid: u32) -> Vec<u32> {
    let mut uids: Vec<u32> = found.into_iter().filter(|uid| *uid > last_uid).collect();
    uids.sort_unstable();
    uids
}

fn login_error(e: ImapError) -> AppError {
    match e {
        ImapError::No(_) => AppError::AuthFailed(e.to_string()),
        ImapError::Io(_) | ImapError::ConnectionLost => {
            AppError::Connection(format!("LOGIN failed: {e}"))
        }
        other => {
            let msg = other.to_string();
            if msg.to_ascii_lowercase().contains("auth") || msg.contains("LOGIN") {
                AppError::AuthFailed(msg)
            } else {
                AppError::Internal(msg)
            }
        }
    }
}

/// Decode envelopes, dropping responses without UID or ENVELOPE
fn collect_envelopes(fetches: &[Fetch]) -> Vec<Envelope> {
    let envelopes: Vec<Envelope> = fetches.iter().filter_map(envelope::from_fetch).collect();
    let dropped = fetches.len() - envelopes.len();
    if dropped > 0 {
        debug!(dropped, "skipped messages without a parseable envelope");
    }
    envelopes
}

/// Render sorted, deduplicated UIDs as a compact IMAP sequence set
///
/// `[1, 2, 3, 7, 9, 10]` becomes `1:3,7,9:10`.
pub fn compress_uid_set(uids: &[u32]) -> String {
    let mut parts = Vec::new();
    let mut iter = uids.iter().copied();
    let Some(mut start) = iter.next() else {
        return String::new();
    };
    let mut end = start;
    for uid in iter {
        if end.checked_add(1) == Some(uid) {
            end = uid;
            continue;
        }
        parts.push(range_atom(start, end));
        start = uid;
        end = uid;
    }
    parts.push(range_atom(start, end));
    parts.join(",")
}

fn range_atom(start: u32, end: u32) -> String {
    if start == end {
        start.to_string()
    } else {
        format!("{start}:{end}")
    }
}

#[cfg(test)]
mod tests {
    use async_imap::error::Error as ImapError;

    use super::{compress_uid_set, examine_error, uids_above};
    use crate::errors::AppError;

    #[test]
    fn compresses_consecutive_runs() {
        assert_eq!(compress_uid_set(&[1, 2, 3, 7, 9, 10]), "1:3,7,9:10");
    }

    #[test]
    fn single_and_empty_sets() {
        assert_eq!(compress_uid_set(&[42]), "42");
        assert_eq!(compress_uid_set(&[]), "");
    }

    #[test]
    fn sparse_uids_stay_separate() {
        assert_eq!(compress_uid_set(&[5, 10, 15]), "5,10,15");
    }

    #[test]
    fn does_not_overflow_at_u32_max() {
        assert_eq!(compress_uid_set(&[u32::MAX - 1, u32::MAX]), "4294967294:4294967295");
    }

    #[test]
    fn star_match_at_or_below_checkpoint_is_dropped() {
        assert!(uids_above([7], 7).is_empty());
        assert!(uids_above([5], 7).is_empty());
        assert_eq!(uids_above([12, 7, 9], 7), vec![9, 12]);
    }

    #[test]
    fn examine_no_is_not_found_but_bad_is_not() {
        let err = examine_error("Nope", ImapError::No("mailbox does not exist".to_owned()));
        assert!(matches!(err, AppError::NotFound(_)));

        let err = examine_error("Nope", ImapError::Bad("parse error".to_owned()));
        assert!(matches!(err, AppError::Internal(_)));
    }
}
