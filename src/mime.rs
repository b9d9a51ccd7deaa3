//! Message parsing for on-demand `show`
//!
//! Parses RFC822 source with `mailparse`, picks the first plain and HTML
//! bodies, and lists attachments. HTML is sanitized with `ammonia`; when a
//! message has no plain part the text body is rendered from HTML with
//! `html2text`.

use std::collections::BTreeMap;

use mailparse::{DispositionType, MailHeader, ParsedMail};

use crate::errors::{AppError, AppResult};
use crate::models::AttachmentInfo;

/// Line width used when rendering HTML-only messages as text
const HTML_TEXT_WIDTH: usize = 100;

/// Parsed message representation
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub cc: Option<String>,
    pub subject: Option<String>,
    /// Plain text body, truncated to the caller's limit
    pub body_text: Option<String>,
    /// Sanitized HTML body; only present when requested
    pub body_html_sanitized: Option<String>,
    pub attachments: Vec<AttachmentInfo>,
}

/// Parse RFC822 message into structured representation
///
/// # Errors
///
/// - `Internal` if `mailparse` fails or an attachment body cannot be decoded
pub fn parse_message(
    raw: &[u8],
    body_max_chars: usize,
    include_html: bool,
) -> AppResult<ParsedMessage> {
    let parsed = mailparse::parse_mail(raw)
        .map_err(|e| AppError::Internal(format!("failed to parse RFC822 message: {e}")))?;

    let mut bodies = Bodies::default();
    let mut attachments = Vec::new();
    walk_parts(&parsed, "1".to_owned(), &mut bodies, &mut attachments)?;

    let text = bodies
        .text
        .or_else(|| bodies.html.as_deref().and_then(html_to_text))
        .map(|t| truncate_chars(t, body_max_chars));
    let html = if include_html {
        bodies
            .html
            .map(|h| truncate_chars(ammonia::clean(&h), body_max_chars))
    } else {
        None
    };

    let header_map = to_header_map(&parsed.headers);
    Ok(ParsedMessage {
        date: header_map.get("date").cloned(),
        from: header_map.get("from").cloned(),
        to: header_map.get("to").cloned(),
        cc: header_map.get("cc").cloned(),
        subject: header_map.get("subject").cloned(),
        body_text: text,
        body_html_sanitized: html,
        attachments,
    })
}

#[derive(Default)]
struct Bodies {
    text: Option<String>,
    html: Option<String>,
}

/// Walk MIME part tree recursively
fn walk_parts(
    part: &ParsedMail<'_>,
    part_id: String,
    bodies: &mut Bodies,
    attachments: &mut Vec<AttachmentInfo>,
) -> AppResult<()> {
    if !part.subparts.is_empty() {
        for (idx, sub) in part.subparts.iter().enumerate() {
            walk_parts(sub, format!("{part_id}.{}", idx + 1), bodies, attachments)?;
        }
        return Ok(());
    }

    let ctype = part.ctype.mimetype.to_ascii_lowercase();
    let disp = part.get_content_disposition();
    let filename = attachment_filename(part, &disp.params);

    if disp.disposition == DispositionType::Attachment || filename.is_some() {
        let raw_body = part
            .get_body_raw()
            .map_err(|e| AppError::Internal(format!("failed decoding attachment body: {e}")))?;
        attachments.push(AttachmentInfo {
            filename,
            content_type: ctype,
            size_bytes: raw_body.len(),
            part_id,
        });
        return Ok(());
    }

    let slot = match ctype.as_str() {
        "text/plain" => &mut bodies.text,
        "text/html" => &mut bodies.html,
        _ => return Ok(()),
    };
    if slot.is_none()
        && let Ok(body) = part.get_body()
    {
        *slot = Some(body);
    }
    Ok(())
}

/// Filename from Content-Disposition, falling back to the Content-Type name
fn attachment_filename(
    part: &ParsedMail<'_>,
    disp_params: &BTreeMap<String, String>,
) -> Option<String> {
    disp_params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned())
}

fn html_to_text(html: &str) -> Option<String> {
    match html2text::from_read(html.as_bytes(), HTML_TEXT_WIDTH) {
        Ok(text) => Some(text.trim_end().to_owned()),
        Err(e) => {
            tracing::debug!(error = %e, "html body could not be rendered as text");
            None
        }
    }
}

/// First value of each header, keyed by lowercase name
fn to_header_map(headers: &[MailHeader<'_>]) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for h in headers {
        map.entry(h.get_key().to_ascii_lowercase())
            .or_insert_with(|| h.get_value());
    }
    map
}

/// Truncate string to maximum characters (Unicode-aware)
pub fn truncate_chars(input: String, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => input[..idx].to_owned(),
        None => input,
    }
}
