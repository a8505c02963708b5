//! Transfer-encoding removal and charset decoding for body parts.
//!
//! Charset fallback chain: declared charset (must decode cleanly), then
//! strict UTF-8, then a permissive windows-1252 decode that accepts every
//! byte. The permissive step can be turned off, in which case undecodable
//! text yields `None`.

use base64::Engine;
use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use tracing::debug;

/// Which step of the fallback chain produced the text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeRoute {
    Declared,
    Utf8,
    Permissive,
}

/// Decode text bytes following the fallback chain.
pub fn decode_text(
    bytes: &[u8],
    declared: Option<&str>,
    permissive: bool,
) -> Option<(String, DecodeRoute)> {
    if let Some(label) = declared.map(str::trim).filter(|l| !l.is_empty()) {
        match encoding_rs::Encoding::for_label(label.as_bytes()) {
            Some(encoding) => {
                let (decoded, _, had_errors) = encoding.decode(bytes);
                if !had_errors {
                    return Some((decoded.into_owned(), DecodeRoute::Declared));
                }
                debug!(charset = label, "Declared charset did not decode cleanly");
            }
            None => debug!(charset = label, "Unknown charset label"),
        }
    }

    if let Ok(text) = std::str::from_utf8(bytes) {
        return Some((text.to_string(), DecodeRoute::Utf8));
    }

    if permissive {
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
        return Some((decoded.into_owned(), DecodeRoute::Permissive));
    }

    None
}

/// Remove a `Content-Transfer-Encoding`.
///
/// Returns `None` when the payload claims base64 but is not valid base64.
pub fn decode_transfer(bytes: &[u8], encoding: Option<&str>) -> Option<Vec<u8>> {
    match encoding.map(|e| e.trim().to_ascii_lowercase()).as_deref() {
        Some("base64") => decode_base64(bytes),
        Some("quoted-printable") => Some(decode_quoted_printable(bytes)),
        _ => Some(bytes.to_vec()),
    }
}

fn decode_base64(bytes: &[u8]) -> Option<Vec<u8>> {
    let compact: Vec<u8> = bytes
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    let engine = GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    );
    engine.decode(compact).ok()
}

/// Quoted-printable decoding (RFC 2045 §6.7).
///
/// Malformed escapes are kept literally.
pub fn decode_quoted_printable(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b != b'=' {
            out.push(b);
            i += 1;
            continue;
        }

        // Soft line break: "=\r\n" or "=\n", possibly with trailing whitespace before it.
        let mut j = i + 1;
        while j < bytes.len() && (bytes[j] == b' ' || bytes[j] == b'\t') {
            j += 1;
        }
        if j < bytes.len() && bytes[j] == b'\n' {
            i = j + 1;
            continue;
        }
        if j + 1 < bytes.len() && bytes[j] == b'\r' && bytes[j + 1] == b'\n' {
            i = j + 2;
            continue;
        }
        if j == bytes.len() {
            break;
        }

        if i + 2 < bytes.len()
            && let (Some(hi), Some(lo)) = (hex_val(bytes[i + 1]), hex_val(bytes[i + 2]))
        {
            out.push((hi << 4) | lo);
            i += 3;
            continue;
        }

        out.push(b);
        i += 1;
    }
    out
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'A'..=b'F' => Some(c - b'A' + 10),
        b'a'..=b'f' => Some(c - b'a' + 10),
        _ => None,
    }
}
