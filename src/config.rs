//! Configuration module for IMAP accounts, cache location and sync tuning
//!
//! All configuration is loaded from environment variables following the pattern
//! `MAIL_IMAP_<SEGMENT>_<KEY>`. Account segments are discovered by scanning for
//! `MAIL_IMAP_*_HOST` variables.

use std::collections::BTreeMap;
use std::env;
use std::env::VarError;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use secrecy::SecretString;
use tracing::warn;

use crate::errors::{AppError, AppResult};

/// Port used when TLS is enabled and no port is configured
const DEFAULT_TLS_PORT: u16 = 993;
/// Port used for plaintext sessions when no port is configured
const DEFAULT_PLAIN_PORT: u16 = 143;
/// Upper bound for messages requested in one FETCH round trip
const MAX_SYNC_BATCH_SIZE: u32 = 1_000;

/// IMAP account configuration
///
/// Holds connection details and credentials for a single IMAP account.
/// Passwords are stored using `SecretString` to prevent accidental logging.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Account identifier (lowercase, used as default `--account` value)
    pub account_id: String,
    /// IMAP server hostname
    pub host: String,
    /// IMAP server port (993 for TLS, 143 for plaintext by default)
    pub port: u16,
    /// Whether to wrap the session in TLS
    pub secure: bool,
    /// Username for authentication
    pub user: String,
    /// Password stored in a type that prevents accidental logging
    pub pass: SecretString,
}

/// Application-wide configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// All configured accounts, keyed by `account_id`
    pub accounts: BTreeMap<String, AccountConfig>,
    /// TCP connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// IMAP greeting/TLS handshake/LOGIN timeout in milliseconds
    pub greeting_timeout_ms: u64,
    /// Per-command socket timeout in milliseconds
    pub socket_timeout_ms: u64,
    /// Directory holding one cache database per account
    pub cache_dir: PathBuf,
    /// Messages per FETCH round trip during sync
    pub sync_batch_size: u32,
    /// Age after which an abandoned mailbox sync lock may be taken over
    pub sync_lock_ttl_seconds: u64,
}

impl AppConfig {
    /// Load all configuration from environment variables
    ///
    /// Discovers accounts by scanning for `MAIL_IMAP_*_HOST` patterns.
    /// No account is required here: commands that only read the cache run
    /// without credentials, and the others fail in [`AppConfig::get_account`].
    ///
    /// # Errors
    ///
    /// Returns `InvalidInput` if required environment variables are missing
    /// or malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_IMAP_DEFAULT_HOST=imap.gmail.com
    /// MAIL_IMAP_DEFAULT_USER=user@gmail.com
    /// MAIL_IMAP_DEFAULT_PASS=app-password
    /// MAIL_IMAP_WORK_HOST=outlook.office365.com
    /// MAIL_IMAP_WORK_USER=user@company.com
    /// MAIL_IMAP_WORK_PASS=work-pass
    /// MAIL_IMAP_CACHE_DIR=/var/cache/imap-mail-cache
    /// MAIL_IMAP_SYNC_BATCH_SIZE=200
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let mut accounts = BTreeMap::new();
        for seg in account_segments(env::vars().map(|(k, _)| k))? {
            let account = load_account(&seg)?;
            accounts.insert(account.account_id.clone(), account);
        }

        let sync_batch_size = parse_u32_env("MAIL_IMAP_SYNC_BATCH_SIZE", 100)?;
        if sync_batch_size == 0 || sync_batch_size > MAX_SYNC_BATCH_SIZE {
            return Err(AppError::InvalidInput(format!(
                "MAIL_IMAP_SYNC_BATCH_SIZE must be in range 1..{MAX_SYNC_BATCH_SIZE}"
            )));
        }

        Ok(Self {
            accounts,
            connect_timeout_ms: parse_u64_env("MAIL_IMAP_CONNECT_TIMEOUT_MS", 30_000)?,
            greeting_timeout_ms: parse_u64_env("MAIL_IMAP_GREETING_TIMEOUT_MS", 15_000)?,
            socket_timeout_ms: parse_u64_env("MAIL_IMAP_SOCKET_TIMEOUT_MS", 300_000)?,
            cache_dir: cache_dir_from_env()?,
            sync_batch_size,
            sync_lock_ttl_seconds: parse_u64_env("MAIL_IMAP_SYNC_LOCK_TTL_SECONDS", 1_800)?,
        })
    }

    /// Get account configuration by ID
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the account ID is not configured.
    pub fn get_account(&self, account_id: &str) -> AppResult<&AccountConfig> {
        self.accounts.get(account_id).ok_or_else(|| {
            let prefix = format!("MAIL_IMAP_{}_", sanitize_segment(account_id));
            AppError::NotFound(format!(
                "account '{account_id}' is not configured; set {prefix}HOST, {prefix}USER and {prefix}PASS"
            ))
        })
    }

    /// Path of the cache database for an account
    pub fn cache_path(&self, account_id: &str) -> PathBuf {
        cache_file(&self.cache_dir, account_id)
    }

    /// Lock TTL as a `Duration`
    pub fn sync_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.sync_lock_ttl_seconds)
    }
}

fn cache_file(dir: &Path, account_id: &str) -> PathBuf {
    dir.join(format!("{account_id}.sqlite3"))
}

/// Resolve the cache directory
///
/// `MAIL_IMAP_CACHE_DIR` wins; otherwise the platform data directory is used.
fn cache_dir_from_env() -> AppResult<PathBuf> {
    match env::var("MAIL_IMAP_CACHE_DIR") {
        Ok(v) if !v.trim().is_empty() => Ok(PathBuf::from(v)),
        Ok(_) | Err(VarError::NotPresent) => dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .map(|base| base.join("imap-mail-cache"))
            .ok_or_else(|| {
                AppError::InvalidInput(
                    "cannot determine a data directory; set MAIL_IMAP_CACHE_DIR".to_owned(),
                )
            }),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(
            "environment variable MAIL_IMAP_CACHE_DIR contains non-unicode data".to_owned(),
        )),
    }
}

/// Load a single account configuration from environment
///
/// Reads `MAIL_IMAP_<SEGMENT>_HOST`, `_USER`, `_PASS`, `_PORT`, and `_SECURE`.
/// Normalizes the segment name to lowercase for `account_id` (except `DEFAULT`
/// becomes `default`).
fn load_account(segment: &str) -> AppResult<AccountConfig> {
    let prefix = format!("MAIL_IMAP_{}_", sanitize_segment(segment));
    let host = required_env(&format!("{prefix}HOST"))?;
    let user = required_env(&format!("{prefix}USER"))?;
    let pass = required_env(&format!("{prefix}PASS"))?;
    let secure = parse_bool_env(&format!("{prefix}SECURE"), true)?;
    let account_id = if segment == "DEFAULT" {
        "default".to_owned()
    } else {
        segment.to_ascii_lowercase()
    };

    if !secure {
        warn!(account = %account_id, "plaintext IMAP configured; credentials travel unencrypted");
    }

    Ok(AccountConfig {
        account_id,
        host,
        port: parse_u16_env(&format!("{prefix}PORT"), default_port(secure))?,
        secure,
        user,
        pass: SecretString::new(pass.into()),
    })
}

/// Account segments named by `MAIL_IMAP_<SEGMENT>_HOST` keys, sorted
fn account_segments(keys: impl Iterator<Item = String>) -> AppResult<Vec<String>> {
    let account_pattern = Regex::new(r"^MAIL_IMAP_([A-Z0-9_]+)_HOST$")
        .map_err(|e| AppError::Internal(format!("invalid account regex: {e}")))?;
    let mut segments: Vec<String> = keys
        .filter_map(|k| {
            account_pattern
                .captures(&k)
                .and_then(|c| c.get(1).map(|m| m.as_str().to_owned()))
        })
        .collect();
    segments.sort();
    segments.dedup();
    Ok(segments)
}

fn default_port(secure: bool) -> u16 {
    if secure {
        DEFAULT_TLS_PORT
    } else {
        DEFAULT_PLAIN_PORT
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::InvalidInput(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Sanitize an account segment to uppercase alphanumeric/underscore
///
/// Non-alphanumeric characters are replaced with underscores, and leading/
/// trailing underscores are trimmed.
fn sanitize_segment(seg: &str) -> String {
    let mut out = String::with_capacity(seg.len());
    for ch in seg.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_uppercase());
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_owned()
}

/// Parse a boolean environment variable with flexible values
///
/// Accepts: `1`, `true`, `yes`, `y`, `on` (truthy) or `0`, `false`, `no`,
/// `n`, `off` (falsy). Case-insensitive. Returns `default` if unset.
fn parse_bool_env(key: &str, default: bool) -> AppResult<bool> {
    match read_env(key)? {
        Some(v) => parse_bool_value(&v).ok_or_else(|| {
            AppError::InvalidInput(format!("invalid boolean environment variable {key}: '{v}'"))
        }),
        None => Ok(default),
    }
}

fn parse_bool_value(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Some(true),
        "0" | "false" | "no" | "n" | "off" => Some(false),
        _ => None,
    }
}

/// Read an optional variable, rejecting non-unicode values
fn read_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) => Ok(Some(v)),
        Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::InvalidInput(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a numeric environment variable with default fallback
///
/// # Errors
///
/// Returns `InvalidInput` if the variable is set but does not parse as `T`.
fn parse_number_env<T>(key: &str, default: T, type_name: &str) -> AppResult<T>
where
    T: std::str::FromStr,
{
    match read_env(key)? {
        Some(v) => v.trim().parse::<T>().map_err(|_| {
            AppError::InvalidInput(format!(
                "invalid {type_name} environment variable {key}: '{v}'"
            ))
        }),
        None => Ok(default),
    }
}

fn parse_u16_env(key: &str, default: u16) -> AppResult<u16> {
    parse_number_env(key, default, "u16")
}

fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    parse_number_env(key, default, "u32")
}

fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    parse_number_env(key, default, "u64")
}
