//! Helpers for cleaning text before it is stored or logged.
//!
//! Span fields carry target URLs; these helpers make sure no credentials or
//! tracking parameters end up in traces.

use url::Url;

/// Cuts `text` to at most `max_chars` characters, never inside a UTF-8
/// sequence.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}

/// Owned variant of [`truncate_chars`] for optional fields.
pub fn truncate_optional(text: Option<&str>, max_chars: usize) -> Option<String> {
    text.map(|t| truncate_chars(t, max_chars).to_string())
}

/// Parses a scrape target, accepting only absolute http(s) URLs with a host.
pub fn parse_target_url(raw: &str) -> Option<Url> {
    let parsed = Url::parse(raw.trim()).ok()?;
    match parsed.scheme() {
        "http" | "https" if parsed.host_str().is_some() => Some(parsed),
        _ => None,
    }
}

/// Strips userinfo, query and fragment from a URL.
///
/// - `https://user:pw@www.linkedin.com/in/ada?trk=x` → `https://www.linkedin.com/in/ada`
/// - unparseable input → `<invalid url>`
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut parsed) => {
            // Both setters only fail for cannot-be-a-base URLs, which carry no userinfo.
            let _ = parsed.set_username("");
            let _ = parsed.set_password(None);
            parsed.set_query(None);
            parsed.set_fragment(None);
            parsed.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}
