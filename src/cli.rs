//! Command-line argument definitions
//!
//! All `clap` structures live here so that `main.rs` only dispatches.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default mailbox for `sync` when none is given
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// Default body length for `show`
pub const DEFAULT_MAX_CHARS: usize = 20_000;

/// Offline IMAP envelope cache
#[derive(Debug, Parser)]
#[command(
    name = "imap-mail-cache",
    version,
    about = "Mirror IMAP envelopes into a local cache and search them offline"
)]
pub struct Cli {
    /// Account to operate on (configured via MAIL_IMAP_<ID>_* variables)
    #[arg(long, global = true, default_value = "default")]
    pub account: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List mailboxes on the server
    Mailboxes,

    /// Pull new envelopes from the server into the cache
    Sync {
        /// Mailbox to sync; repeat for several (default: INBOX)
        #[arg(long = "mailbox", short = 'm')]
        mailboxes: Vec<String>,
    },

    /// Search cached envelopes without touching the network
    Search {
        #[arg(long, short = 'm')]
        mailbox: String,
        /// Substring of the sender address
        #[arg(long)]
        from: Option<String>,
        /// Substring of the subject
        #[arg(long)]
        subject: Option<String>,
        /// Earliest date, inclusive (YYYY-MM-DD, UTC)
        #[arg(long)]
        since: Option<String>,
        /// Latest date, exclusive (YYYY-MM-DD, UTC)
        #[arg(long)]
        before: Option<String>,
        /// Maximum results; 0 uses the default of 50
        #[arg(long, default_value_t = 0)]
        limit: usize,
    },

    /// Look up one cached envelope
    Envelope {
        #[arg(long, short = 'm')]
        mailbox: String,
        #[arg(long)]
        uid: u32,
    },

    /// Show cached mailboxes and how fresh they are
    Status,

    /// Fetch and display a full message from the server
    Show {
        #[arg(long, short = 'm')]
        mailbox: String,
        #[arg(long)]
        uid: u32,
        /// Include the sanitized HTML body
        #[arg(long)]
        html: bool,
        /// Truncate bodies to this many characters
        #[arg(long, default_value_t = DEFAULT_MAX_CHARS)]
        max_chars: usize,
    },

    /// Save a message's raw RFC822 source to a file
    Download {
        #[arg(long, short = 'm')]
        mailbox: String,
        #[arg(long)]
        uid: u32,
        #[arg(long, short = 'o')]
        output: PathBuf,
    },
}
