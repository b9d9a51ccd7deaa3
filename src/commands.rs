//! Command orchestration
//!
//! Validates user input, opens the account's cache and (when needed) an IMAP
//! session, runs one command, and wraps the answer in the standard
//! `{summary, data, meta}` envelope. Cache-only commands never connect.

use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use crate::cli::{Cli, Command, DEFAULT_MAILBOX};
use crate::config::{AccountConfig, AppConfig};
use crate::errors::{AppError, AppResult};
use crate::imap::ImapClient;
use crate::mime;
use crate::models::{
    CommandOutput, DownloadInfo, Envelope, MailboxCacheInfo, MailboxStatus, MessageDetail,
    MessageSummary, Meta, SearchOptions, SearchOutput, format_unix,
};
use crate::search;
use crate::store::CacheStore;
use crate::sync::{SyncSettings, sync_mailbox};

/// Run one parsed command and return its JSON envelope
///
/// # Errors
///
/// Propagates the first error of the command; nothing is printed here.
pub async fn run(cli: Cli, config: &AppConfig) -> AppResult<Value> {
    let started = Instant::now();
    validate_account_id(&cli.account)?;
    let account_id = cli.account.as_str();

    match cli.command {
        Command::Mailboxes => mailboxes(started, config, config.get_account(account_id)?).await,
        Command::Sync { mailboxes } => {
            sync(started, config, config.get_account(account_id)?, mailboxes).await
        }
        Command::Search {
            mailbox,
            from,
            subject,
            since,
            before,
            limit,
        } => {
            validate_mailbox(&mailbox)?;
            let options = SearchOptions {
                from,
                subject,
                since: since.as_deref().map(search::day_start_unix).transpose()?,
                before: before.as_deref().map(search::day_start_unix).transpose()?,
                limit,
            };
            let store = open_store(config, account_id)?;
            let result = search::search_mailbox(&store, &mailbox, options).await?;
            let output = SearchOutput::from(result);
            let summary = format!(
                "{} of {} cached message(s) matched in {} (synced {})",
                output.messages.len(),
                output.total_cached,
                output.mailbox,
                output.freshness
            );
            finalize(started, summary, output)
        }
        Command::Envelope { mailbox, uid } => {
            validate_mailbox(&mailbox)?;
            validate_uid(uid)?;
            let store = open_store(config, account_id)?;
            let envelope = store.get_envelope(&mailbox, uid).await?.ok_or_else(|| {
                AppError::NotFound(format!("uid {uid} is not cached for mailbox '{mailbox}'"))
            })?;
            let summary = format!("cached envelope {mailbox}/{uid}");
            finalize(started, summary, MessageSummary::from(envelope))
        }
        Command::Status => status(started, config, account_id).await,
        Command::Show {
            mailbox,
            uid,
            html,
            max_chars,
        } => {
            let account = config.get_account(account_id)?;
            show(started, config, account, &mailbox, uid, html, max_chars).await
        }
        Command::Download {
            mailbox,
            uid,
            output,
        } => {
            validate_mailbox(&mailbox)?;
            validate_uid(uid)?;
            let account = config.get_account(account_id)?;
            let store = open_store(config, account_id)?;
            let mut client = ImapClient::connect(config, account).await?;
            let fetched = fetch_message(&mut client, &store, &mailbox, uid).await;
            client.close().await?;
            let (raw, _, _) = fetched?;

            tokio::fs::write(&output, &raw).await.map_err(|e| {
                AppError::Internal(format!("failed to write {}: {e}", output.display()))
            })?;
            let info = DownloadInfo {
                mailbox,
                uid,
                path: output.display().to_string(),
                size_bytes: raw.len(),
            };
            let summary = format!("saved {} bytes to {}", info.size_bytes, info.path);
            finalize(started, summary, info)
        }
    }
}

async fn mailboxes(
    started: Instant,
    config: &AppConfig,
    account: &AccountConfig,
) -> AppResult<Value> {
    let mut client = ImapClient::connect(config, account).await?;
    let listed = client.list_mailboxes().await;
    client.close().await?;
    let listed = listed?;
    let summary = format!("{} mailbox(es)", listed.len());
    finalize(started, summary, listed)
}

async fn sync(
    started: Instant,
    config: &AppConfig,
    account: &AccountConfig,
    mut mailboxes: Vec<String>,
) -> AppResult<Value> {
    if mailboxes.is_empty() {
        mailboxes.push(DEFAULT_MAILBOX.to_owned());
    }
    for mailbox in &mailboxes {
        validate_mailbox(mailbox)?;
    }
    let store = open_store(config, &account.account_id)?;
    let settings = SyncSettings::from_config(config);

    let mut client = ImapClient::connect(config, account).await?;
    let mut results = Vec::with_capacity(mailboxes.len());
    let mut failure = None;
    for mailbox in &mailboxes {
        match sync_mailbox(&store, &mut client, mailbox, &settings).await {
            Ok(result) => results.push(result),
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }
    client.close().await?;
    if let Some(e) = failure {
        return Err(e);
    }

    let summary = results
        .iter()
        .map(|r| format!("{}: {}", r.mailbox, r.message))
        .collect::<Vec<_>>()
        .join("; ");
    finalize(started, summary, results)
}

async fn status(started: Instant, config: &AppConfig, account_id: &str) -> AppResult<Value> {
    let store = open_store(config, account_id)?;
    let now = Utc::now().timestamp();
    let mut infos = Vec::new();
    for state in store.list_mailbox_states().await? {
        let total_cached = store.count_envelopes(&state.name).await?;
        infos.push(MailboxCacheInfo {
            freshness: search::describe_freshness(Some(state.last_sync_unix), now),
            last_sync: format_unix(state.last_sync_unix),
            mailbox: state.name,
            uid_validity: state.uid_validity,
            last_uid: state.last_uid,
            total_cached,
        });
    }
    let summary = if infos.is_empty() {
        "no mailboxes cached yet".to_owned()
    } else {
        format!("{} cached mailbox(es)", infos.len())
    };
    finalize(started, summary, infos)
}

async fn show(
    started: Instant,
    config: &AppConfig,
    account: &AccountConfig,
    mailbox: &str,
    uid: u32,
    html: bool,
    max_chars: usize,
) -> AppResult<Value> {
    validate_mailbox(mailbox)?;
    validate_uid(uid)?;
    if max_chars == 0 {
        return Err(AppError::invalid("max-chars must be at least 1"));
    }
    let store = open_store(config, &account.account_id)?;
    let mut client = ImapClient::connect(config, account).await?;
    let fetched = fetch_message(&mut client, &store, mailbox, uid).await;
    client.close().await?;
    let (raw, envelope, status) = fetched?;

    let parsed = mime::parse_message(&raw, max_chars, html)?;
    let subject = parsed
        .subject
        .or_else(|| Some(envelope.subject).filter(|s| !s.is_empty()));
    let detail = MessageDetail {
        mailbox: mailbox.to_owned(),
        uid_validity: status.uid_validity,
        uid,
        message_id: envelope.message_id,
        date: format_unix(envelope.date).or(parsed.date),
        from: parsed.from,
        to: parsed.to,
        cc: parsed.cc,
        subject,
        body_text: parsed.body_text,
        body_html: parsed.body_html_sanitized,
        attachments: parsed.attachments,
    };
    let summary = format!(
        "message {mailbox}/{uid}: {}",
        detail.subject.as_deref().unwrap_or("(no subject)")
    );
    finalize(started, summary, detail)
}

/// Select the mailbox and fetch one message, checking the cache epoch
///
/// A UID taken from the cache is only meaningful under the UIDVALIDITY it
/// was cached with.
async fn fetch_message(
    client: &mut ImapClient,
    store: &CacheStore,
    mailbox: &str,
    uid: u32,
) -> AppResult<(Vec<u8>, Envelope, MailboxStatus)> {
    let status = client.select_mailbox(mailbox).await?;
    if let Some(state) = store.get_mailbox_state(mailbox).await?
        && state.uid_validity != status.uid_validity
    {
        return Err(AppError::Conflict(format!(
            "cache for '{mailbox}' is from UIDVALIDITY {} but the server reports {}; run sync first",
            state.uid_validity, status.uid_validity
        )));
    }
    let (raw, envelope) = client.fetch_full_message(uid).await?;
    Ok((raw, envelope, status))
}

/// Open the account's cache; needs no credentials
fn open_store(config: &AppConfig, account_id: &str) -> AppResult<CacheStore> {
    CacheStore::open(config.cache_path(account_id))
}

/// Calculate elapsed milliseconds
fn duration_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Wrap a command's data in the standard response envelope
fn finalize<T: Serialize>(started: Instant, summary: String, data: T) -> AppResult<Value> {
    let output = CommandOutput {
        summary,
        data,
        meta: Meta::now(duration_ms(started)),
    };
    serde_json::to_value(output).map_err(|e| {
        warn!(error = %e, "failed to serialize command output");
        AppError::Internal(format!("failed to serialize output: {e}"))
    })
}

/// Validate account_id format
fn validate_account_id(account_id: &str) -> AppResult<()> {
    if account_id.is_empty() || account_id.len() > 64 {
        return Err(AppError::InvalidInput(
            "account_id must be 1..64 characters".to_owned(),
        ));
    }
    if !account_id
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
    {
        return Err(AppError::InvalidInput(
            "account_id must match [A-Za-z0-9_-]+".to_owned(),
        ));
    }
    Ok(())
}

/// Validate mailbox name format
fn validate_mailbox(mailbox: &str) -> AppResult<()> {
    if mailbox.is_empty() || mailbox.len() > 256 {
        return Err(AppError::InvalidInput(
            "mailbox must be 1..256 characters".to_owned(),
        ));
    }
    if mailbox.chars().any(|ch| ch.is_ascii_control()) {
        return Err(AppError::InvalidInput(
            "mailbox must not contain control characters".to_owned(),
        ));
    }
    Ok(())
}

fn validate_uid(uid: u32) -> AppResult<()> {
    if uid == 0 {
        return Err(AppError::invalid("uid must be at least 1"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::time::Instant;

    use clap::Parser;

    use super::{finalize, run, validate_account_id, validate_mailbox, validate_uid};
    use crate::cli::Cli;
    use crate::config::AppConfig;
    use crate::errors::AppError;

    fn config_without_accounts(cache_dir: &Path) -> AppConfig {
        AppConfig {
            accounts: BTreeMap::new(),
            connect_timeout_ms: 1_000,
            greeting_timeout_ms: 1_000,
            socket_timeout_ms: 1_000,
            cache_dir: cache_dir.to_path_buf(),
            sync_batch_size: 100,
            sync_lock_ttl_seconds: 1_800,
        }
    }

    #[test]
    fn rejects_control_chars_in_mailbox() {
        let err = validate_mailbox("INBOX\r").expect_err("must fail");
        assert!(err.to_string().contains("control characters"));
        validate_mailbox("Archive/2024").expect("nested mailbox is valid");
    }

    #[test]
    fn rejects_malformed_account_ids() {
        validate_account_id("work-2").expect("valid id");
        let err = validate_account_id("work mail").expect_err("must fail");
        assert!(err.to_string().contains("[A-Za-z0-9_-]+"));
        assert!(validate_account_id("").is_err());
    }

    #[test]
    fn uid_zero_is_invalid() {
        assert!(validate_uid(0).is_err());
        validate_uid(1).expect("uid 1 is valid");
    }

    #[test]
    fn output_envelope_has_summary_data_and_meta() {
        let value = finalize(Instant::now(), "done".to_owned(), vec![1, 2]).expect("serialize");
        assert_eq!(value["summary"], "done");
        assert_eq!(value["data"], serde_json::json!([1, 2]));
        assert!(value["meta"]["now_utc"].is_string());
        assert!(value["meta"]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn cache_commands_run_without_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_without_accounts(dir.path());

        let cli = Cli::parse_from(["imap-mail-cache", "search", "--mailbox", "INBOX"]);
        let value = run(cli, &config).await.expect("search reads the cache only");
        assert_eq!(value["data"]["freshness"], "never synced");
        assert_eq!(value["data"]["total_cached"], 0);

        let cli = Cli::parse_from(["imap-mail-cache", "status"]);
        let value = run(cli, &config).await.expect("status reads the cache only");
        assert_eq!(value["summary"], "no mailboxes cached yet");

        let cli = Cli::parse_from([
            "imap-mail-cache",
            "envelope",
            "--mailbox",
            "INBOX",
            "--uid",
            "7",
        ]);
        let err = run(cli, &config).await.expect_err("nothing cached");
        assert!(err.to_string().contains("not cached"));
    }

    #[tokio::test]
    async fn server_commands_name_the_missing_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = config_without_accounts(dir.path());

        let cli = Cli::parse_from(["imap-mail-cache", "--account", "work", "mailboxes"]);
        let err = run(cli, &config).await.expect_err("no account configured");
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(err.to_string().contains("MAIL_IMAP_WORK_HOST"));
    }
}
