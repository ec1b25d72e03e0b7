//! Text processing utilities: whitespace, truncation, JSON extraction and
//! entity-name cleanup.

use regex::Regex;
use std::sync::OnceLock;
use url::Url;

static WHITESPACE_RE: OnceLock<Regex> = OnceLock::new();
static WRAPPER_RE: OnceLock<Regex> = OnceLock::new();
static ARTICLE_RE: OnceLock<Regex> = OnceLock::new();
static INTRO_RE: OnceLock<Regex> = OnceLock::new();

fn whitespace_re() -> &'static Regex {
    WHITESPACE_RE.get_or_init(|| Regex::new(r"\s+").expect("static regex is valid"))
}

fn wrapper_re() -> &'static Regex {
    WRAPPER_RE.get_or_init(|| {
        Regex::new(
            r"(?i)^(?:the|a|an)\s+(?:company|organization|organisation|firm|startup|person|user|website|site|app|application|platform|tool|library|framework|product|project|service|city|country|band|book|movie|film|concept|term|topic)\s+(?:called\s+|named\s+)?(.+)$",
        )
        .expect("static regex is valid")
    })
}

fn article_re() -> &'static Regex {
    ARTICLE_RE.get_or_init(|| Regex::new(r"(?i)^(?:the|a|an)\s+(.+)$").expect("static regex is valid"))
}

fn intro_re() -> &'static Regex {
    INTRO_RE.get_or_init(|| {
        Regex::new(r"(?i)^(?:(?:also\s+)?known\s+as|referred\s+to\s+as|called|named|aka)\s+(.+)$")
            .expect("static regex is valid")
    })
}

/// Replace consecutive whitespace with a single space and trim.
pub fn normalize_whitespace(s: &str) -> String {
    if s.is_empty() {
        return String::new();
    }
    whitespace_re().replace_all(s, " ").trim().to_string()
}

/// Truncate `s` to at most `max_len` characters, appending `"..."` if
/// truncation occurred. Counts characters, not bytes.
pub fn truncate_with_ellipsis(s: &str, max_len: usize) -> String {
    if max_len == 0 {
        return String::new();
    }
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    if max_len <= 3 {
        return ".".repeat(max_len);
    }

    let byte_offset = s
        .char_indices()
        .nth(max_len - 3)
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    format!("{}...", &s[..byte_offset])
}

/// Locate the JSON payload inside a possibly markdown-wrapped LLM response.
///
/// Tries a ```` ```json ```` fence, then a bare fence, then the outermost
/// `[...]`, then the outermost `{...}`. Arrays are preferred because every
/// stage asks for a list.
pub fn extract_json_block(s: &str) -> Option<&str> {
    if let Some(inner) = fenced_block(s, "```json") {
        return Some(inner);
    }
    if let Some(inner) = fenced_block(s, "```") {
        return Some(inner);
    }
    if let (Some(start), Some(end)) = (s.find('['), s.rfind(']')) {
        if end > start {
            return Some(&s[start..=end]);
        }
    }
    if let (Some(start), Some(end)) = (s.find('{'), s.rfind('}')) {
        if end > start {
            return Some(&s[start..=end]);
        }
    }
    None
}

fn fenced_block<'a>(s: &'a str, fence: &str) -> Option<&'a str> {
    let start = s.find(fence)?;
    let after_fence = start + fence.len();
    let newline = s[after_fence..].find('\n')?;
    let content_start = after_fence + newline + 1;
    let close = s[content_start..].find("```")?;
    let content = s[content_start..content_start + close].trim();

    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Strip straight, curly and angle quotes (and backticks) from both ends.
pub fn strip_quotes(s: &str) -> &str {
    const QUOTES: &[char] = &['"', '\'', '`', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00AB}', '\u{00BB}'];
    s.trim_matches(|c: char| QUOTES.contains(&c) || c.is_whitespace())
}

/// Lower-case, punctuation-free, whitespace-collapsed form of a name used for
/// fuzzy comparisons.
pub fn normalize_name(s: &str) -> String {
    let replaced: String = s
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    normalize_whitespace(&replaced).to_lowercase()
}

/// Clean a model-proposed entity name into its canonical display form.
///
/// - "The company Acme" becomes "Acme"
/// - "known as Bob" becomes "Bob"
/// - "https://github.com/tokio-rs/tokio" becomes "tokio"
/// - quotes and extra whitespace are removed
///
/// Never returns an empty string for non-empty input.
pub fn clean_entity_name(raw: &str) -> String {
    let original = normalize_whitespace(strip_quotes(raw));
    if original.is_empty() {
        return original;
    }

    if let Some(collapsed) = collapse_url(&original) {
        return collapsed;
    }

    let mut name = original.clone();
    loop {
        let next = if let Some(caps) = wrapper_re().captures(&name) {
            caps[1].to_string()
        } else if let Some(caps) = intro_re().captures(&name) {
            caps[1].to_string()
        } else if let Some(caps) = article_re().captures(&name) {
            caps[1].to_string()
        } else {
            break;
        };

        let next = normalize_whitespace(strip_quotes(&next));
        if next.is_empty() || next == name {
            break;
        }
        name = next;
    }

    if name.is_empty() {
        original
    } else {
        name
    }
}

/// Collapse a bare URL into its meaningful last path segment, or the domain
/// when the path carries nothing useful.
///
/// Returns `None` when the input is not a URL.
pub fn collapse_url(s: &str) -> Option<String> {
    const GENERIC_SEGMENTS: &[&str] = &[
        "index", "home", "default", "main", "en", "en-us", "www", "about", "page", "pages", "wiki",
        "blog", "post", "posts", "article", "articles", "amp",
    ];

    let candidate = s.trim();
    if candidate.contains(char::is_whitespace) {
        return None;
    }

    let lower = candidate.to_lowercase();
    let parsed = if lower.starts_with("http://") || lower.starts_with("https://") {
        Url::parse(candidate).ok()?
    } else if lower.starts_with("www.") {
        Url::parse(&format!("https://{}", candidate)).ok()?
    } else {
        return None;
    };

    let host = parsed.host_str()?.trim_start_matches("www.").to_string();

    let segment = parsed.path_segments().and_then(|segments| {
        let segments: Vec<&str> = segments.filter(|seg| !seg.is_empty()).collect();
        segments.into_iter().rev().find_map(|seg| {
            let stem = seg.split('.').next().unwrap_or(seg);
            let readable = normalize_whitespace(&stem.replace(['-', '_', '+'], " ").replace("%20", " "));
            let generic = GENERIC_SEGMENTS.contains(&readable.to_lowercase().as_str());
            let numeric = readable.chars().all(|c| c.is_ascii_digit() || c == ' ');
            if readable.chars().count() < 2 || generic || numeric {
                None
            } else {
                Some(readable)
            }
        })
    });

    Some(segment.unwrap_or(host))
}
