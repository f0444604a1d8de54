// src/text.rs
//! Canonical text cleanup applied by the scrapers.

use once_cell::sync::Lazy;
use regex::Regex;

/// Upper bound on canonical text, in chars.
pub const MAX_TEXT_CHARS: usize = 4000;

static RE_TAGS: Lazy<Option<Regex>> = Lazy::new(|| Regex::new(r"(?is)</?[a-z][^>]*>").ok());

/// Decode HTML entities, strip tags, fold typographic quotes, collapse whitespace and cap
/// the length. Punctuation is kept: "great!!!" and "great" do not read the same.
pub fn normalize_text(s: &str) -> String {
    let decoded = html_escape::decode_html_entities(s);
    let stripped = match RE_TAGS.as_ref() {
        Some(re) => re.replace_all(&decoded, " ").into_owned(),
        None => decoded.into_owned(),
    };
    let folded = stripped
        .replace(['\u{201C}', '\u{201D}', '\u{00AB}', '\u{00BB}'], "\"")
        .replace(['\u{2018}', '\u{2019}'], "'");

    let mut out = folded.split_whitespace().collect::<Vec<_>>().join(" ");
    if out.chars().count() > MAX_TEXT_CHARS {
        out = out.chars().take(MAX_TEXT_CHARS).collect();
    }
    out
}
