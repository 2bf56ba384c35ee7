use std::sync::OnceLock;

use regex::Regex;

pub mod circuit_breaker;
pub mod logging;
pub mod retry;

fn whitespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+").expect("static regex"))
}

fn url_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\b(?:https?|ftp)://\S+").expect("static regex"))
}

/// Trims and collapses internal runs of whitespace to a single space.
pub fn normalize_whitespace(text: &str) -> String {
    whitespace_re().replace_all(text.trim(), " ").into_owned()
}

/// Removes links, which read badly when spoken aloud.
pub fn strip_urls(text: &str) -> String {
    normalize_whitespace(&url_re().replace_all(text, ""))
}

/// Cuts `text` to at most `max` characters, marking the cut with an ellipsis.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let keep = max.saturating_sub(1);
    let mut out: String = text.chars().take(keep).collect();
    out.push('…');
    out
}
