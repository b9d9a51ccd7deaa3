//! Decoding of IMAP ENVELOPE responses into [`Envelope`]
//!
//! Envelope strings arrive as raw header bytes, possibly carrying RFC 2047
//! encoded words. They are decoded through `mailparse` so the cache stores
//! display text.

use async_imap::imap_proto::Address;
use async_imap::types::Fetch;

use crate::models::Envelope;

/// Convert one FETCH response into an envelope
///
/// Returns `None` when the response lacks a UID or an ENVELOPE; such
/// messages are dropped by callers instead of failing the whole fetch.
pub fn from_fetch(fetch: &Fetch) -> Option<Envelope> {
    let uid = fetch.uid?;
    let envelope = fetch.envelope()?;

    let date = envelope
        .date
        .as_deref()
        .and_then(parse_date)
        .or_else(|| fetch.internal_date().map(|d| d.timestamp()))
        .unwrap_or(0);

    let (from_address, from_name) = envelope
        .from
        .as_ref()
        .and_then(|addrs| addrs.first())
        .map(sender)
        .unwrap_or_default();

    Some(Envelope {
        uid,
        message_id: envelope
            .message_id
            .as_deref()
            .map(|id| String::from_utf8_lossy(id).trim().to_owned())
            .filter(|id| !id.is_empty()),
        date,
        from_address,
        from_name,
        subject: envelope.subject.as_deref().map(decode_words).unwrap_or_default(),
    })
}

/// First sender as `(address, display name)`
fn sender(addr: &Address<'_>) -> (String, String) {
    let address = format_address(addr.mailbox.as_deref(), addr.host.as_deref());
    let name = addr.name.as_deref().map(decode_words).unwrap_or_default();
    (address, name)
}

/// Join mailbox and host parts; either may be missing (group syntax, bare names)
pub fn format_address(mailbox: Option<&[u8]>, host: Option<&[u8]>) -> String {
    let mailbox = mailbox.map(String::from_utf8_lossy).unwrap_or_default();
    let host = host.map(String::from_utf8_lossy).unwrap_or_default();
    match (mailbox.is_empty(), host.is_empty()) {
        (false, false) => format!("{mailbox}@{host}"),
        (false, true) => mailbox.into_owned(),
        (true, _) => String::new(),
    }
}

/// Decode RFC 2047 encoded words
///
/// Falls back to the lossy UTF-8 text when the value cannot be parsed as a
/// header.
pub fn decode_words(raw: &[u8]) -> String {
    let text = String::from_utf8_lossy(raw);
    let fake_header = format!("X: {text}");
    match mailparse::parse_header(fake_header.as_bytes()) {
        Ok((header, _)) => header.get_value().trim().to_owned(),
        Err(_) => text.trim().to_owned(),
    }
}

/// Parse an RFC 5322 date into unix seconds
pub fn parse_date(raw: &[u8]) -> Option<i64> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    mailparse::dateparse(text).ok()
}

#[cfg(test)]
mod tests {
    use super::{decode_words, format_address, parse_date};

    #[test]
    fn decodes_encoded_word_subjects() {
        assert_eq!(decode_words(b"=?UTF-8?B?SGVsbG8gV29ybGQ=?="), "Hello World");
        assert_eq!(decode_words(b"=?ISO-8859-1?Q?Caf=E9?="), "Café");
    }

    #[test]
    fn plain_values_pass_through_trimmed() {
        assert_eq!(decode_words(b"  Weekly report "), "Weekly report");
    }

    #[test]
    fn parses_rfc5322_dates() {
        assert_eq!(
            parse_date(b"Wed, 1 Jan 2025 00:00:00 +0000"),
            Some(1_735_689_600)
        );
        assert_eq!(
            parse_date(b"Wed, 1 Jan 2025 01:00:00 +0100"),
            Some(1_735_689_600)
        );
    }

    #[test]
    fn empty_dates_are_unknown() {
        assert_eq!(parse_date(b""), None);
        assert_eq!(parse_date(b"   "), None);
    }

    #[test]
    fn formats_addresses_with_missing_parts() {
        assert_eq!(
            format_address(Some(&b"alice"[..]), Some(&b"x.com"[..])),
            "alice@x.com"
        );
        assert_eq!(format_address(Some(&b"undisclosed"[..]), None), "undisclosed");
        assert_eq!(format_address(None, Some(&b"x.com"[..])), "");
    }
}
