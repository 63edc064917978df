use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::graph::types::{ContentType, ItemBody, RemoteMessage};

/// A full body longer than this multiple of the unique body is taken as
/// carrying quoted thread content.
pub const DEFAULT_THREAD_RATIO: f64 = 1.2;

static TAG_RE: LazyLock<Result<Regex, regex::Error>> = LazyLock::new(|| Regex::new(r"<[^>]+>"));
static BLANK_LINES_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"\n\s*\n"));
static HORIZONTAL_WS_RE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"[ \t]+"));

const ENTITIES: [(&str, &str); 9] = [
    ("&nbsp;", " "),
    ("&amp;", "&"),
    ("&lt;", "<"),
    ("&gt;", ">"),
    ("&quot;", "\""),
    ("&#39;", "'"),
    ("&apos;", "'"),
    ("\r\n", "\n"),
    ("\r", "\n"),
];

/// Where the clean text of a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ContentSource {
    UniqueText,
    UniqueHtmlConverted,
    FullText,
    FullHtmlConverted,
    PreviewFallback,
    ErrorFallback,
}

impl ContentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentSource::UniqueText => "unique-text",
            ContentSource::UniqueHtmlConverted => "unique-html-converted",
            ContentSource::FullText => "full-text",
            ContentSource::FullHtmlConverted => "full-html-converted",
            ContentSource::PreviewFallback => "preview-fallback",
            ContentSource::ErrorFallback => "error-fallback",
        }
    }

    /// Text taken from the thread-free body variant.
    pub fn is_unique(&self) -> bool {
        matches!(
            self,
            ContentSource::UniqueText | ContentSource::UniqueHtmlConverted
        )
    }
}

impl std::fmt::Display for ContentSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedContent {
    pub clean_text: String,
    pub source: ContentSource,
    pub had_threads: bool,
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("invalid markup pattern: {0}")]
    Pattern(#[from] regex::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ContentNormalizer {
    thread_ratio: f64,
}

impl Default for ContentNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_THREAD_RATIO)
    }
}

impl ContentNormalizer {
    pub fn new(thread_ratio: f64) -> Self {
        Self { thread_ratio }
    }

    /// Never fails; internal errors fall back to the raw preview.
    pub fn normalize(&self, message: &RemoteMessage) -> NormalizedContent {
        match self.extract(message) {
            Ok(content) => content,
            Err(err) => {
                warn!(message_id = %message.id, error = %err, "content extraction failed, using preview");
                NormalizedContent {
                    clean_text: message.preview().to_string(),
                    source: ContentSource::ErrorFallback,
                    had_threads: false,
                }
            }
        }
    }

    fn extract(&self, message: &RemoteMessage) -> Result<NormalizedContent, NormalizeError> {
        let unique = message.unique_body.as_ref().and_then(ItemBody::trimmed);
        let full = message.body.as_ref().and_then(ItemBody::trimmed);

        let had_threads = match (unique, full) {
            (Some(unique), Some(full)) => detect_threads(
                unique.chars().count(),
                full.chars().count(),
                self.thread_ratio,
            ),
            _ => false,
        };
        if had_threads {
            debug!(message_id = %message.id, "thread content detected");
        }

        let candidates = [
            (
                message.unique_body.as_ref(),
                ContentSource::UniqueText,
                ContentSource::UniqueHtmlConverted,
            ),
            (
                message.body.as_ref(),
                ContentSource::FullText,
                ContentSource::FullHtmlConverted,
            ),
        ];

        for (body, text_source, html_source) in candidates {
            let Some(body) = body else { continue };
            let Some(content) = body.trimmed() else {
                continue;
            };
            let (clean_text, source) = match body.content_type {
                ContentType::Text => (content.to_string(), text_source),
                ContentType::Html => (html_to_text(content)?, html_source),
            };
            if !clean_text.is_empty() {
                return Ok(NormalizedContent {
                    clean_text,
                    source,
                    had_threads,
                });
            }
        }

        Ok(NormalizedContent {
            clean_text: message.preview().trim().to_string(),
            source: ContentSource::PreviewFallback,
            had_threads,
        })
    }
}

/// True when the unique body is non-empty and the full body exceeds it by
/// more than `ratio`.
pub fn detect_threads(unique_len: usize, full_len: usize, ratio: f64) -> bool {
    unique_len > 0 && full_len as f64 > unique_len as f64 * ratio
}

/// Strip tags, decode the common entities and squeeze whitespace.
pub fn html_to_text(html: &str) -> Result<String, NormalizeError> {
    if html.is_empty() {
        return Ok(String::new());
    }

    let tag_re = TAG_RE.as_ref().map_err(Clone::clone)?;
    let blank_lines_re = BLANK_LINES_RE.as_ref().map_err(Clone::clone)?;
    let horizontal_ws_re = HORIZONTAL_WS_RE.as_ref().map_err(Clone::clone)?;

    let mut text = tag_re.replace_all(html, "").into_owned();
    for (entity, replacement) in ENTITIES {
        text = text.replace(entity, replacement);
    }
    let text = blank_lines_re.replace_all(&text, "\n\n");
    let text = horizontal_ws_re.replace_all(&text, " ");
    Ok(text.trim().to_string())
}
