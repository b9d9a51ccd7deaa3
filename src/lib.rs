//! imap-mail-cache: offline IMAP envelope cache
//!
//! Mirrors message envelopes from IMAP mailboxes into a local SQLite cache,
//! incrementally by UID, and answers metadata searches from the cache
//! without touching the network.
//!
//! # Architecture
//!
//! - [`cli`]: `clap` argument definitions
//! - [`commands`]: Validation and per-command orchestration
//! - [`config`]: Environment-driven configuration for accounts and sync tuning
//! - [`errors`]: Application error model with exit-code mapping
//! - [`transport`]: Plaintext/TLS byte stream beneath a session
//! - [`imap`]: IMAP session operations with timeout wrappers
//! - [`envelope`]: ENVELOPE response decoding
//! - [`store`]: SQLite cache of checkpoints, envelopes and sync locks
//! - [`sync`]: Full, incremental and resync logic
//! - [`search`]: Cache-only queries and freshness labels
//! - [`mime`]: Message parsing for `show`
//! - [`models`]: Data model and output DTOs

pub mod cli;
pub mod commands;
pub mod config;
pub mod envelope;
pub mod errors;
pub mod imap;
pub mod mime;
pub mod models;
pub mod search;
pub mod store;
pub mod sync;
pub mod transport;
