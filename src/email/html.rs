//! HTML-to-text fallback for messages without a plain-text part.
//!
//! Simple tag stripping: script/style bodies are dropped, block-level tags
//! become line breaks, common entities are decoded, whitespace collapses.

/// Tags that end a visual line.
const BLOCK_TAGS: &[&str] = &[
    "br", "p", "div", "tr", "li", "h1", "h2", "h3", "h4", "h5", "h6", "blockquote", "table",
];

/// Strip HTML tags from content.
pub fn strip_html(html: &str) -> String {
    let lower = html.to_ascii_lowercase();
    let mut text = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel) = html[pos..].find('<') {
        let start = pos + rel;
        text.push_str(&html[pos..start]);

        let Some(end_rel) = html[start..].find('>') else {
            // Unterminated tag: drop the rest.
            pos = html.len();
            break;
        };
        let end = start + end_rel;
        let name = tag_name(&lower[start + 1..end]);

        if name == "script" || name == "style" {
            let closing = format!("</{name}");
            pos = match lower[end..].find(&closing) {
                Some(close_rel) => {
                    let close_start = end + close_rel;
                    lower[close_start..]
                        .find('>')
                        .map_or(html.len(), |gt| close_start + gt + 1)
                }
                None => html.len(),
            };
            continue;
        }

        if BLOCK_TAGS.contains(&name) {
            text.push('\n');
        }
        pos = end + 1;
    }
    if pos < html.len() {
        text.push_str(&html[pos..]);
    }

    let decoded = decode_entities(&text);
    decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Name of a tag from the text between `<` and `>`, without a leading `/`.
fn tag_name(inner: &str) -> &str {
    let inner = inner.trim_start().trim_start_matches('/');
    let end = inner
        .find(|c: char| c.is_whitespace() || c == '/')
        .unwrap_or(inner.len());
    &inner[..end]
}

/// Decode named and numeric character references.
fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after.find(';').filter(|&i| i > 0 && i <= 10);

        let decoded = semi.and_then(|i| decode_entity(&after[..i]).map(|c| (c, i)));
        match decoded {
            Some((c, i)) => {
                out.push(c);
                rest = &after[i + 1..];
            }
            None => {
                out.push('&');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

fn decode_entity(name: &str) -> Option<char> {
    if let Some(num) = name.strip_prefix('#') {
        let code = match num.strip_prefix('x').or_else(|| num.strip_prefix('X')) {
            Some(hex) => u32::from_str_radix(hex, 16).ok()?,
            None => num.parse().ok()?,
        };
        return char::from_u32(code);
    }
    match name {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" => Some('\''),
        "nbsp" => Some(' '),
        _ => None,
    }
}

/// Escape text for inclusion in HTML.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}
