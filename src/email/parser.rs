//! Raw message parsing.
//!
//! The header block is unfolded by hand so original casing, order, and
//! duplicates survive. The MIME tree comes from `mail-parser`; each leaf's
//! raw body is then transfer-decoded and charset-decoded here, so a part whose
//! charset cannot be decoded is reported instead of silently mangled.

use mail_parser::{MessageParser, MimeHeaders, PartType};
use tracing::{debug, warn};

use crate::email::charset::{DecodeRoute, decode_text, decode_transfer};
use crate::email::html::strip_html;
use crate::email::types::{
    BodyPart, Disposition, InboundMessage, Payload, RawHeaders, TextSource,
    extract_addresses,
};
use crate::error::ParseError;

/// Parser behavior switches.
#[derive(Debug, Clone, Copy)]
pub struct ParserOptions {
    /// Accept any byte sequence through a windows-1252 decode as the last
    /// charset fallback.
    pub permissive_charset_fallback: bool,
}

impl Default for ParserOptions {
    fn default() -> Self {
        Self {
            permissive_charset_fallback: true,
        }
    }
}

/// Parse a raw email with default options.
pub fn parse(raw: &[u8]) -> Result<InboundMessage, ParseError> {
    parse_with(raw, ParserOptions::default())
}

/// Parse a raw email into an [`InboundMessage`].
pub fn parse_with(raw: &[u8], options: ParserOptions) -> Result<InboundMessage, ParseError> {
    let raw = skip_preamble(raw);
    if raw.iter().all(u8::is_ascii_whitespace) {
        return Err(malformed("empty input"));
    }

    let header_end = find_header_end(raw).unwrap_or(raw.len());
    let headers = unfold_headers(&decode_header_bytes(&raw[..header_end]));
    if headers.is_empty() {
        return Err(malformed("no header lines found"));
    }

    let parsed = MessageParser::default()
        .parse(raw)
        .ok_or_else(|| malformed("MIME structure could not be parsed"))?;

    let sender = extract_addresses(parsed.from()).into_iter().next();
    let reply_to = extract_addresses(parsed.reply_to()).into_iter().next();
    let recipients = extract_addresses(parsed.to())
        .into_iter()
        .chain(extract_addresses(parsed.cc()))
        .map(|a| a.address)
        .collect();

    let subject = parsed
        .subject()
        .map(|s| s.trim().to_string())
        .or_else(|| headers.get("Subject").map(|s| s.trim().to_string()));

    let message_id = headers
        .get("Message-ID")
        .and_then(|v| extract_angle_brackets(v).into_iter().next())
        .or_else(|| {
            headers
                .get("Message-ID")
                .map(str::trim)
                .filter(|v| !v.is_empty() && !v.contains(char::is_whitespace))
                .map(|v| format!("<{v}>"))
        });
    let in_reply_to = headers
        .get_all("In-Reply-To")
        .flat_map(extract_angle_brackets)
        .collect();
    let references = headers
        .get_all("References")
        .flat_map(extract_angle_brackets)
        .collect();

    let date = parsed
        .date()
        .and_then(|d| chrono::DateTime::from_timestamp(d.to_timestamp(), 0));

    let raw_message = parsed.raw_message();
    let mut parts = Vec::new();
    for part in &parsed.parts {
        if matches!(part.body, PartType::Multipart(_)) {
            continue;
        }
        parts.push(decode_part(part, raw_message, options)?);
    }

    let (text, text_source) = extract_text(&parts);

    debug!(
        sender = sender.as_ref().map(|s| s.address.as_str()).unwrap_or("-"),
        parts = parts.len(),
        text_source = ?text_source,
        text_chars = text.chars().count(),
        "Parsed inbound message"
    );

    Ok(InboundMessage {
        sender,
        reply_to,
        recipients,
        subject,
        message_id,
        in_reply_to,
        references,
        date,
        parts,
        headers,
        text,
        text_source,
    })
}

fn malformed(reason: &str) -> ParseError {
    ParseError::MalformedMessage {
        reason: reason.to_string(),
    }
}

/// Turn one leaf MIME part into a [`BodyPart`].
fn decode_part(
    part: &mail_parser::MessagePart<'_>,
    raw_message: &[u8],
    options: ParserOptions,
) -> Result<BodyPart, ParseError> {
    let (content_type, charset) = match MimeHeaders::content_type(part) {
        Some(ct) => (
            match ct.subtype() {
                Some(sub) => format!("{}/{}", ct.ctype(), sub).to_ascii_lowercase(),
                None => ct.ctype().to_ascii_lowercase(),
            },
            ct.attribute("charset").map(|c| c.to_string()),
        ),
        None => ("text/plain".to_string(), None),
    };
    let transfer_encoding =
        MimeHeaders::content_transfer_encoding(part).map(|e| e.trim().to_ascii_lowercase());
    let explicit_attachment = MimeHeaders::content_disposition(part)
        .is_some_and(|d| d.ctype().eq_ignore_ascii_case("attachment"));
    let filename = MimeHeaders::attachment_name(part).map(|n| n.to_string());

    let is_text = content_type.starts_with("text/");
    let disposition = if explicit_attachment || !is_text {
        Disposition::Attachment
    } else {
        Disposition::Inline
    };

    let start = part.raw_body_offset() as usize;
    let end = part.raw_end_offset() as usize;
    let decoded_bytes = raw_message
        .get(start..end.max(start))
        .and_then(|body| decode_transfer(body, transfer_encoding.as_deref()));

    let payload = if is_text {
        match decoded_bytes {
            Some(bytes) => {
                let (text, route) = decode_text(
                    &bytes,
                    charset.as_deref(),
                    options.permissive_charset_fallback,
                )
                .ok_or_else(|| ParseError::UnsupportedEncoding {
                    charset: charset.clone().unwrap_or_else(|| "(undeclared)".into()),
                    content_type: content_type.clone(),
                })?;
                if route != DecodeRoute::Declared {
                    warn!(
                        content_type = %content_type,
                        charset = charset.as_deref().unwrap_or("(undeclared)"),
                        route = ?route,
                        "Body part decoded through charset fallback"
                    );
                }
                Payload::Text(normalize_line_endings(text))
            }
            // Offsets unusable or transfer encoding broken: use mail-parser's own decode.
            None => Payload::Text(normalize_line_endings(
                String::from_utf8_lossy(part.contents()).into_owned(),
            )),
        }
    } else {
        Payload::Binary(decoded_bytes.unwrap_or_else(|| part.contents().to_vec()))
    };

    Ok(BodyPart {
        content_type,
        charset,
        transfer_encoding,
        disposition,
        filename,
        payload,
    })
}

/// Pick the prompt text: inline `text/plain` parts first, `text/html` only
/// as a fallback.
fn extract_text(parts: &[BodyPart]) -> (String, TextSource) {
    let plain: Vec<&str> = parts
        .iter()
        .filter(|p| p.is_plain_text())
        .filter_map(|p| p.payload.as_text())
        .filter(|t| !t.trim().is_empty())
        .collect();
    if !plain.is_empty() {
        return (plain.join("\n\n"), TextSource::Plain);
    }

    let html: Vec<String> = parts
        .iter()
        .filter(|p| p.is_html())
        .filter_map(|p| p.payload.as_text())
        .map(strip_html)
        .filter(|t| !t.is_empty())
        .collect();
    if !html.is_empty() {
        return (html.join("\n\n"), TextSource::Html);
    }

    (String::new(), TextSource::Empty)
}

/// CRLF and lone CR become LF; trailing line breaks are dropped. Leading
/// whitespace is content and stays.
fn normalize_line_endings(text: String) -> String {
    let mut text = if text.contains('\r') {
        text.replace("\r\n", "\n").replace('\r', "\n")
    } else {
        text
    };
    while text.ends_with('\n') {
        text.pop();
    }
    text
}

/// Skip a BOM and an mbox-style `From ` separator line.
fn skip_preamble(data: &[u8]) -> &[u8] {
    let data = data.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(data);
    if data.starts_with(b"From ")
        && let Some(pos) = data.iter().position(|&b| b == b'\n')
    {
        return &data[pos + 1..];
    }
    data
}

/// Find the byte offset where headers end (position of the first blank line).
fn find_header_end(data: &[u8]) -> Option<usize> {
    for i in 0..data.len().saturating_sub(1) {
        if data[i] == b'\n' && data[i + 1] == b'\n' {
            return Some(i);
        }
        if i + 3 < data.len()
            && data[i] == b'\r'
            && data[i + 1] == b'\n'
            && data[i + 2] == b'\r'
            && data[i + 3] == b'\n'
        {
            return Some(i);
        }
    }
    None
}

/// Decode raw header bytes: UTF-8 first, windows-1252 otherwise.
fn decode_header_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Unfold headers: join continuation lines with the previous header.
///
/// Lines that are neither continuations nor `Name: value` are skipped.
fn unfold_headers(text: &str) -> RawHeaders {
    let mut entries: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = entries.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon) = line.find(':') {
            let name = &line[..colon];
            if is_header_name(name) {
                entries.push((name.to_string(), line[colon + 1..].trim().to_string()));
            }
        }
    }

    let mut headers = RawHeaders::new();
    for (name, value) in entries {
        headers.push(name, value);
    }
    headers
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty() && name.bytes().all(|b| b.is_ascii_graphic() && b != b':')
}

/// Extract all `<…>` tokens from a header value.
pub fn extract_angle_brackets(s: &str) -> Vec<String> {
    let mut result = Vec::new();
    let mut remaining = s;
    while let Some(start) = remaining.find('<') {
        let Some(end) = remaining[start..].find('>') else {
            break;
        };
        let token = &remaining[start..start + end + 1];
        if token.len() > 2 {
            result.push(token.to_string());
        }
        remaining = &remaining[start + end + 1..];
    }
    result
}
