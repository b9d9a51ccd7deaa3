//! imap-mail-cache command-line entry point

use clap::Parser;
use tracing_subscriber::EnvFilter;

use imap_mail_cache::cli::Cli;
use imap_mail_cache::commands;
use imap_mail_cache::config::AppConfig;

/// Application entry point
///
/// Logs go to stderr (filtered by `RUST_LOG`); the command's JSON envelope
/// goes to stdout. Failures print `{"error": {...}}` and exit non-zero.
///
/// # Example
///
/// ```no_run
/// MAIL_IMAP_DEFAULT_HOST=imap.example.com \
/// MAIL_IMAP_DEFAULT_USER=user@example.com \
/// MAIL_IMAP_DEFAULT_PASS=secret \
/// imap-mail-cache sync --mailbox INBOX
/// ```
#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let outcome = match AppConfig::load_from_env() {
        Ok(config) => commands::run(cli, &config).await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(value) => println!("{value:#}"),
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            println!("{:#}", e.to_json());
            std::process::exit(e.exit_code());
        }
    }
}
