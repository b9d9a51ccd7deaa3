//! Mailbox synchronization engine
//!
//! Brings the cache for one mailbox up to date with the server:
//!
//! - No checkpoint (or a checkpoint at UID 0): full fetch by sequence number,
//!   in batches from the newest end of the mailbox backward.
//! - Checkpoint under the same UIDVALIDITY: incremental fetch of UIDs above it.
//! - UIDVALIDITY changed: the cached epoch is discarded and rebuilt in full.
//!
//! All network fetching happens before anything is written. The result is
//! published by [`CacheStore::commit_sync`] in one transaction, so a failure
//! part-way leaves the previous snapshot intact.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::models::{Envelope, MailboxStatus, SyncMode, SyncResult};
use crate::store::{CacheStore, SyncCommit, SyncLock};

/// Server operations the engine needs
///
/// Implemented by [`crate::imap::ImapClient`]; tests use a scripted fake.
#[async_trait]
pub trait MailSource: Send {
    /// Open the mailbox read-only and report its size and UIDVALIDITY
    async fn select_mailbox(&mut self, mailbox: &str) -> AppResult<MailboxStatus>;

    /// Envelopes for sequence numbers `start..=end` of the selected mailbox
    async fn fetch_envelopes_by_sequence_range(
        &mut self,
        start: u32,
        end: u32,
    ) -> AppResult<Vec<Envelope>>;

    /// Envelopes with a UID strictly above `last_uid`
    async fn fetch_new_envelopes_since(&mut self, last_uid: u32) -> AppResult<Vec<Envelope>>;
}

/// Tuning knobs for a sync run
#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    /// Messages per sequence-range FETCH during a full sync
    pub batch_size: u32,
    /// Age after which another run's lock counts as abandoned
    pub lock_ttl: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            batch_size: config.sync_batch_size,
            lock_ttl: config.sync_lock_ttl(),
        }
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            lock_ttl: Duration::from_secs(1800),
        }
    }
}

/// Inclusive sequence ranges covering `1..=total`, newest first
#[derive(Debug, Clone)]
pub struct SequenceBatches {
    next_end: u32,
    batch_size: u32,
}

impl SequenceBatches {
    pub fn new(total: u32, batch_size: u32) -> Self {
        Self {
            next_end: total,
            batch_size: batch_size.max(1),
        }
    }
}

impl Iterator for SequenceBatches {
    type Item = (u32, u32);

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_end == 0 {
            return None;
        }
        let end = self.next_end;
        let start = end.saturating_sub(self.batch_size - 1).max(1);
        self.next_end = start - 1;
        Some((start, end))
    }
}

/// Synchronize one mailbox into the cache
///
/// Holds the mailbox's sync lock for the whole run and releases it even when
/// the run fails.
///
/// # Errors
///
/// - `SyncInProgress` if another run holds the lock
/// - `NotFound` if the mailbox does not exist on the server
/// - any source or store error; the cache is left as it was
pub async fn sync_mailbox<S>(
    store: &CacheStore,
    source: &mut S,
    mailbox: &str,
    settings: &SyncSettings,
) -> AppResult<SyncResult>
where
    S: MailSource + ?Sized,
{
    let lock = store.acquire_sync_lock(mailbox, settings.lock_ttl).await?;
    let outcome = run_locked(store, source, &lock, settings).await;
    if let Err(e) = store.release_sync_lock(&lock).await {
        warn!(mailbox, error = %e, "failed to release sync lock");
    }
    match &outcome {
        Ok(result) => info!(
            mailbox,
            mode = ?result.mode,
            new_messages = result.new_messages,
            total_cached = result.total_cached,
            "sync finished"
        ),
        Err(e) => warn!(mailbox, error = %e, "sync failed; cache unchanged"),
    }
    outcome
}

async fn run_locked<S>(
    store: &CacheStore,
    source: &mut S,
    lock: &SyncLock,
    settings: &SyncSettings,
) -> AppResult<SyncResult>
where
    S: MailSource + ?Sized,
{
    let mailbox = lock.mailbox.as_str();
    let status = source.select_mailbox(mailbox).await?;
    let previous = store.get_mailbox_state(mailbox).await?;

    let invalidated_from = previous
        .as_ref()
        .map(|state| state.uid_validity)
        .filter(|old| *old != status.uid_validity);
    if let Some(old) = invalidated_from {
        info!(
            mailbox,
            old_uid_validity = old,
            new_uid_validity = status.uid_validity,
            "UIDVALIDITY changed; discarding cached epoch"
        );
    }
    let checkpoint = match (&previous, invalidated_from) {
        (Some(state), None) => state.last_uid,
        _ => 0,
    };

    let (mode, mut envelopes) = if status.num_messages == 0 {
        debug!(mailbox, "server mailbox is empty");
        (SyncMode::Empty, Vec::new())
    } else if checkpoint == 0 {
        let mode = if invalidated_from.is_some() {
            SyncMode::Resync
        } else {
            SyncMode::Full
        };
        let fetched =
            fetch_all(store, source, lock, status.num_messages, settings.batch_size).await?;
        (mode, fetched)
    } else {
        debug!(mailbox, last_uid = checkpoint, "incremental sync");
        let mut fetched = source.fetch_new_envelopes_since(checkpoint).await?;
        // `UID n:*` always matches the highest UID, even below `n`.
        fetched.retain(|env| env.uid > checkpoint);
        store.renew_sync_lock(lock).await?;
        (SyncMode::Incremental, fetched)
    };

    // Sequence numbers shift if the mailbox changes mid-fetch.
    envelopes.sort_unstable_by_key(|env| env.uid);
    envelopes.dedup_by_key(|env| env.uid);

    let last_uid = envelopes
        .last()
        .map_or(checkpoint, |env| env.uid.max(checkpoint));
    let new_messages = envelopes.len();

    store
        .commit_sync(
            lock,
            SyncCommit {
                mailbox: mailbox.to_owned(),
                uid_validity: status.uid_validity,
                last_uid,
                clear_first: invalidated_from.is_some(),
                envelopes,
            },
        )
        .await?;
    let total_cached = store.count_envelopes(mailbox).await?;

    Ok(SyncResult {
        mailbox: mailbox.to_owned(),
        mode,
        new_messages,
        total_cached,
        message: describe(mode, new_messages, invalidated_from, status.uid_validity),
    })
}

/// Fetch every message by sequence range, renewing the lease per batch
async fn fetch_all<S>(
    store: &CacheStore,
    source: &mut S,
    lock: &SyncLock,
    total: u32,
    batch_size: u32,
) -> AppResult<Vec<Envelope>>
where
    S: MailSource + ?Sized,
{
    let mailbox = lock.mailbox.as_str();
    info!(mailbox, total, batch_size, "full sync");
    let mut out = Vec::with_capacity(usize::try_from(total).unwrap_or_default());
    for (start, end) in SequenceBatches::new(total, batch_size) {
        let batch = source.fetch_envelopes_by_sequence_range(start, end).await?;
        debug!(mailbox, start, end, fetched = batch.len(), "fetched batch");
        out.extend(batch);
        store.renew_sync_lock(lock).await?;
    }
    Ok(out)
}

fn describe(mode: SyncMode, count: usize, invalidated_from: Option<u32>, uid_validity: u32) -> String {
    match (mode, invalidated_from) {
        (SyncMode::Empty, Some(_)) => {
            "mailbox is empty; stale cache discarded after UIDVALIDITY change".to_owned()
        }
        (SyncMode::Empty, None) => "mailbox is empty".to_owned(),
        (SyncMode::Resync, Some(old)) => format!(
            "UIDVALIDITY changed ({old} -> {uid_validity}); resynced {count} message(s)"
        ),
        (SyncMode::Incremental, _) if count == 0 => "already up to date".to_owned(),
        (SyncMode::Incremental, _) => format!("cached {count} new message(s)"),
        (_, _) => format!("full sync cached {count} message(s)"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::{MailSource, SequenceBatches, SyncSettings, sync_mailbox};
    use crate::errors::{AppError, AppResult};
    use crate::models::{Envelope, MailboxStatus, SearchOptions, SyncMode};
    use crate::store::CacheStore;

    /// Scripted server: `messages` is the mailbox in sequence order
    struct FakeSource {
        uid_validity: u32,
        messages: Vec<Envelope>,
        ranges: Vec<(u32, u32)>,
        since_calls: Vec<u32>,
        fail_after_batches: Option<usize>,
        /// Competing run that tries to take the INBOX lease on every batch
        rival: Option<CacheStore>,
        rival_rejected: Vec<bool>,
    }

    impl FakeSource {
        fn new(uid_validity: u32, uids: &[u32]) -> Self {
            Self {
                uid_validity,
                messages: uids.iter().map(|uid| env(*uid)).collect(),
                ranges: Vec::new(),
                since_calls: Vec::new(),
                fail_after_batches: None,
                rival: None,
                rival_rejected: Vec::new(),
            }
        }

        fn deliver(&mut self, uid: u32) {
            self.messages.push(env(uid));
        }
    }

    #[async_trait]
    impl MailSource for FakeSource {
        async fn select_mailbox(&mut self, mailbox: &str) -> AppResult<MailboxStatus> {
            if mailbox == "Missing" {
                return Err(AppError::NotFound(format!("mailbox '{mailbox}' not found")));
            }
            Ok(MailboxStatus {
                num_messages: u32::try_from(self.messages.len()).expect("fits"),
                uid_validity: self.uid_validity,
            })
        }

        async fn fetch_envelopes_by_sequence_range(
            &mut self,
            start: u32,
            end: u32,
        ) -> AppResult<Vec<Envelope>> {
            if self.fail_after_batches == Some(self.ranges.len()) {
                return Err(AppError::Connection("connection reset".to_owned()));
            }
            self.ranges.push((start, end));
            if let Some(rival) = self.rival.clone() {
                let attempt = rival.acquire_sync_lock("INBOX", Duration::from_secs(60)).await;
                self.rival_rejected
                    .push(matches!(attempt, Err(AppError::SyncInProgress(_))));
                // Pretend this batch took longer than the lease lifetime.
                rival
                    .backdate_sync_lock("INBOX", 1_000)
                    .await
                    .expect("age lease");
            }
            let lo = usize::try_from(start - 1).expect("fits");
            let hi = usize::try_from(end).expect("fits").min(self.messages.len());
            Ok(self.messages[lo..hi].to_vec())
        }

        /// Answers like a server running `UID last+1:*`, where `*` always
        /// matches the highest UID even when it is not above `last_uid`
        async fn fetch_new_envelopes_since(&mut self, last_uid: u32) -> AppResult<Vec<Envelope>> {
            self.since_calls.push(last_uid);
            let mut found: Vec<Envelope> = self
                .messages
                .iter()
                .filter(|m| m.uid > last_uid)
                .cloned()
                .collect();
            if let Some(highest) = self.messages.iter().max_by_key(|m| m.uid)
                && highest.uid <= last_uid
            {
                found.push(highest.clone());
            }
            Ok(found)
        }
    }

    fn env(uid: u32) -> Envelope {
        Envelope {
            uid,
            message_id: Some(format!("<{uid}@example.com>")),
            date: 1_700_000_000 + i64::from(uid),
            from_address: format!("sender{uid}@example.com"),
            from_name: String::new(),
            subject: format!("message {uid}"),
        }
    }

    fn settings(batch_size: u32) -> SyncSettings {
        SyncSettings {
            batch_size,
            lock_ttl: Duration::from_secs(600),
        }
    }

    async fn cached_uids(store: &CacheStore, mailbox: &str) -> Vec<u32> {
        let mut uids: Vec<u32> = store
            .search(
                mailbox,
                &SearchOptions {
                    limit: 10_000,
                    ..SearchOptions::default()
                },
            )
            .await
            .expect("search")
            .messages
            .into_iter()
            .map(|m| m.uid)
            .collect();
        uids.sort_unstable();
        uids
    }

    #[test]
    fn batches_cover_the_mailbox_from_the_end() {
        let batches: Vec<_> = SequenceBatches::new(250, 100).collect();
        assert_eq!(batches, vec![(151, 250), (51, 150), (1, 50)]);

        let exact: Vec<_> = SequenceBatches::new(200, 100).collect();
        assert_eq!(exact, vec![(101, 200), (1, 100)]);

        assert_eq!(SequenceBatches::new(0, 100).count(), 0);
        assert_eq!(SequenceBatches::new(3, 0).count(), 3);
    }

    #[tokio::test]
    async fn first_sync_caches_everything() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(100, &[1, 2, 3]);

        let result = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync");

        assert_eq!(result.mode, SyncMode::Full);
        assert_eq!(result.new_messages, 3);
        assert_eq!(result.total_cached, 3);
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!((state.uid_validity, state.last_uid), (100, 3));
    }

    #[tokio::test]
    async fn later_syncs_fetch_only_new_uids() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(100, &[1, 2, 3]);
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("first sync");

        source.deliver(4);
        let result = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("second sync");

        assert_eq!(result.mode, SyncMode::Incremental);
        assert_eq!(result.new_messages, 1);
        assert_eq!(result.total_cached, 4);
        assert_eq!(source.since_calls, vec![3]);
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!(state.last_uid, 4);
    }

    #[tokio::test]
    async fn star_match_on_highest_uid_is_not_new_mail() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(100, &[1, 2, 3]);
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("first sync");

        let again = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("second sync");

        assert_eq!(again.mode, SyncMode::Incremental);
        assert_eq!(again.new_messages, 0);
        assert_eq!(again.total_cached, 3);
        assert_eq!(source.since_calls, vec![3]);
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!(state.last_uid, 3);
    }

    #[tokio::test]
    async fn expunged_top_message_does_not_rewind_checkpoint() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(100, &[1, 2, 3]);
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("first sync");

        // The server now answers `UID 4:*` with UID 2.
        source.messages.pop();
        let result = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("second sync");

        assert_eq!(result.new_messages, 0);
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!(state.last_uid, 3);
    }

    #[tokio::test]
    async fn long_full_sync_keeps_its_lease() {
        let store = CacheStore::open_in_memory().expect("open");
        let uids: Vec<u32> = (1..=30).collect();
        let mut source = FakeSource::new(4, &uids);
        source.rival = Some(store.clone());
        let short_lease = SyncSettings {
            batch_size: 10,
            lock_ttl: Duration::from_secs(60),
        };

        let result = sync_mailbox(&store, &mut source, "INBOX", &short_lease)
            .await
            .expect("lease renewed after every batch");

        assert_eq!(result.total_cached, 30);
        assert_eq!(source.rival_rejected, vec![true, true, true]);
    }

    #[tokio::test]
    async fn uidvalidity_change_rebuilds_the_cache() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut old_epoch = FakeSource::new(100, &[1, 2, 3, 4, 5]);
        sync_mailbox(&store, &mut old_epoch, "INBOX", &settings(100))
            .await
            .expect("first sync");

        let mut new_epoch = FakeSource::new(200, &[1, 2]);
        new_epoch.messages[0].subject = "fresh one".to_owned();
        let result = sync_mailbox(&store, &mut new_epoch, "INBOX", &settings(100))
            .await
            .expect("resync");

        assert_eq!(result.mode, SyncMode::Resync);
        assert_eq!(result.total_cached, 2);
        assert!(result.message.contains("100 -> 200"));
        assert_eq!(cached_uids(&store, "INBOX").await, vec![1, 2]);
        let row = store
            .get_envelope("INBOX", 1)
            .await
            .expect("lookup")
            .expect("row");
        assert_eq!(row.subject, "fresh one");
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!((state.uid_validity, state.last_uid), (200, 2));
    }

    #[tokio::test]
    async fn full_sync_walks_batches_backward() {
        let store = CacheStore::open_in_memory().expect("open");
        let uids: Vec<u32> = (1..=250).collect();
        let mut source = FakeSource::new(7, &uids);

        let result = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync");

        assert_eq!(source.ranges, vec![(151, 250), (51, 150), (1, 50)]);
        assert_eq!(result.total_cached, 250);
    }

    #[tokio::test]
    async fn incremental_history_matches_full_sync() {
        let full_store = CacheStore::open_in_memory().expect("open");
        let mut full = FakeSource::new(9, &[2, 5, 8, 13, 21]);
        sync_mailbox(&full_store, &mut full, "INBOX", &settings(2))
            .await
            .expect("full sync");

        let step_store = CacheStore::open_in_memory().expect("open");
        let mut growing = FakeSource::new(9, &[2, 5]);
        sync_mailbox(&step_store, &mut growing, "INBOX", &settings(2))
            .await
            .expect("initial sync");
        for uid in [8, 13, 21] {
            growing.deliver(uid);
            sync_mailbox(&step_store, &mut growing, "INBOX", &settings(2))
                .await
                .expect("incremental sync");
        }

        let opts = SearchOptions::default();
        let a = full_store.search("INBOX", &opts).await.expect("search").messages;
        let b = step_store.search("INBOX", &opts).await.expect("search").messages;
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn checkpoint_tracks_sparse_uids() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(1, &[10, 20, 35]);
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync");

        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!(state.last_uid, 35);
    }

    #[tokio::test]
    async fn checkpoint_never_moves_backward() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(1, &[1, 2, 3]);
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync");

        let unchanged = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("resync");
        assert_eq!(unchanged.mode, SyncMode::Incremental);
        assert_eq!(unchanged.new_messages, 0);
        assert_eq!(unchanged.message, "already up to date");

        // Everything expunged on the server, same epoch.
        source.messages.clear();
        let emptied = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("empty sync");
        assert_eq!(emptied.mode, SyncMode::Empty);

        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!(state.last_uid, 3);
    }

    #[tokio::test]
    async fn empty_mailbox_records_a_zero_checkpoint() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(5, &[]);

        let result = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync");

        assert_eq!(result.mode, SyncMode::Empty);
        assert_eq!(result.total_cached, 0);
        let state = store
            .get_mailbox_state("INBOX")
            .await
            .expect("get")
            .expect("state");
        assert_eq!((state.uid_validity, state.last_uid), (5, 0));

        source.deliver(1);
        let next = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("sync after delivery");
        assert_eq!(next.mode, SyncMode::Full);
        assert_eq!(next.total_cached, 1);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_cache_untouched() {
        let store = CacheStore::open_in_memory().expect("open");
        let uids: Vec<u32> = (1..=30).collect();
        let mut source = FakeSource::new(3, &uids);
        source.fail_after_batches = Some(1);

        let err = sync_mailbox(&store, &mut source, "INBOX", &settings(10))
            .await
            .expect_err("second batch fails");
        assert!(matches!(err, AppError::Connection(_)));
        assert_eq!(store.count_envelopes("INBOX").await.expect("count"), 0);
        assert!(store.get_mailbox_state("INBOX").await.expect("get").is_none());

        source.fail_after_batches = None;
        let retried = sync_mailbox(&store, &mut source, "INBOX", &settings(10))
            .await
            .expect("lock was released");
        assert_eq!(retried.total_cached, 30);
    }

    #[tokio::test]
    async fn missing_mailbox_is_not_found() {
        let store = CacheStore::open_in_memory().expect("open");
        let mut source = FakeSource::new(1, &[1]);

        let err = sync_mailbox(&store, &mut source, "Missing", &settings(100))
            .await
            .expect_err("no such mailbox");
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn concurrent_sync_of_same_mailbox_is_rejected() {
        let store = CacheStore::open_in_memory().expect("open");
        let held = store
            .acquire_sync_lock("INBOX", Duration::from_secs(600))
            .await
            .expect("lock");
        let mut source = FakeSource::new(1, &[1, 2]);

        let err = sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect_err("lock is held");
        assert!(matches!(err, AppError::SyncInProgress(_)));
        assert!(source.ranges.is_empty());

        sync_mailbox(&store, &mut source, "Archive", &settings(100))
            .await
            .expect("other mailboxes proceed");

        store.release_sync_lock(&held).await.expect("release");
        sync_mailbox(&store, &mut source, "INBOX", &settings(100))
            .await
            .expect("lock released");
    }
}
