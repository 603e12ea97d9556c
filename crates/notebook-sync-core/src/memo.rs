//! Memo documents and their on-disk header envelope.
//!
//! A memo is stored as `Name: value` header lines, one blank line, then the
//! body:
//!
//! ```text
//! Content-Type: text/subtext
//! Created: 2024-05-01T10:00:00Z
//! Modified: 2024-05-02T08:30:00Z
//! Title: Groceries
//! File-Extension: subtext
//!
//! Eggs, milk, bread.
//! ```
//!
//! Headers this module does not know are preserved in order in
//! `additional_headers`. Text without a header block parses as a body-only
//! memo.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fingerprint::{datetime_seconds, seconds_to_datetime};
use crate::slug::Slug;

pub const DEFAULT_CONTENT_TYPE: &str = "text/subtext";
pub const DEFAULT_FILE_EXTENSION: &str = "subtext";

const CONTENT_TYPE: &str = "Content-Type";
const CREATED: &str = "Created";
const MODIFIED: &str = "Modified";
const TITLE: &str = "Title";
const FILE_EXTENSION: &str = "File-Extension";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MemoParseError {
    #[error("header `{name}` has an invalid timestamp: {value}")]
    InvalidTimestamp { name: String, value: String },
}

/// One `Name: value` header line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A note's content and metadata.
///
/// `modified` is owned by the store that persists the memo: writers stamp it
/// and then replace it with the store's own post-write value, so a caller's
/// value never survives a write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memo {
    pub content_type: String,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub title: String,
    pub file_extension: String,
    pub additional_headers: Vec<Header>,
    pub body: String,
}

impl Memo {
    /// A fresh subtext memo created and modified at `now`.
    pub fn new(title: impl Into<String>, body: impl Into<String>, now: DateTime<Utc>) -> Self {
        let now = seconds_to_datetime(datetime_seconds(now));
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            created: now,
            modified: now,
            title: title.into(),
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            additional_headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Body size in bytes. Used as the size component of sphere fingerprints.
    pub fn body_size(&self) -> u64 {
        self.body.len() as u64
    }

    /// Short plain-text excerpt of the body for listings.
    pub fn excerpt(&self, max_chars: usize) -> String {
        let first = self
            .body
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("");
        first.chars().take(max_chars).collect()
    }

    /// Appends another memo's body, separated by a blank line.
    pub fn append(&mut self, other: &Memo) {
        if other.body.is_empty() {
            return;
        }
        if !self.body.is_empty() {
            let trimmed = self.body.trim_end_matches('\n').len();
            self.body.truncate(trimmed);
            self.body.push_str("\n\n");
        }
        self.body.push_str(&other.body);
    }

    /// Serializes to the header envelope.
    pub fn to_file_string(&self) -> String {
        let mut out = String::new();
        push_header(&mut out, CONTENT_TYPE, &self.content_type);
        push_header(&mut out, CREATED, &format_ts(self.created));
        push_header(&mut out, MODIFIED, &format_ts(self.modified));
        push_header(&mut out, TITLE, &self.title);
        push_header(&mut out, FILE_EXTENSION, &self.file_extension);
        for header in &self.additional_headers {
            push_header(&mut out, &header.name, &header.value);
        }
        out.push('\n');
        out.push_str(&self.body);
        out
    }

    /// Parses the header envelope.
    ///
    /// Missing headers fall back to `slug` (title) and `fallback_time`
    /// (created/modified), which callers take from store metadata.
    pub fn parse(
        text: &str,
        slug: &Slug,
        fallback_time: DateTime<Utc>,
    ) -> Result<Self, MemoParseError> {
        let (headers, body) = split_headers(text);

        let mut memo = Memo {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            created: fallback_time,
            modified: fallback_time,
            title: slug.to_title(),
            file_extension: DEFAULT_FILE_EXTENSION.to_string(),
            additional_headers: Vec::new(),
            body: body.to_string(),
        };

        for header in headers {
            let name = header.name.to_ascii_lowercase();
            match name.as_str() {
                "content-type" => memo.content_type = header.value,
                "created" => memo.created = parse_ts(CREATED, &header.value)?,
                "modified" => memo.modified = parse_ts(MODIFIED, &header.value)?,
                "title" => memo.title = header.value,
                "file-extension" => memo.file_extension = header.value,
                _ => memo.additional_headers.push(header),
            }
        }

        Ok(memo)
    }
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    // header values are single-line
    out.push_str(&value.replace(['\n', '\r'], " "));
    out.push('\n');
}

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn parse_ts(name: &str, value: &str) -> Result<DateTime<Utc>, MemoParseError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| MemoParseError::InvalidTimestamp {
            name: name.to_string(),
            value: value.to_string(),
        })
}

/// Splits a header block from the body.
///
/// The block counts only if it is terminated by a blank line and every line
/// before it is a well-formed header; otherwise the whole text is body.
fn split_headers(text: &str) -> (Vec<Header>, &str) {
    let mut headers = Vec::new();
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        let content = line.trim_end_matches(['\n', '\r']);
        if content.is_empty() {
            if headers.is_empty() {
                return (Vec::new(), text);
            }
            return (headers, &text[offset + line.len()..]);
        }
        match parse_header_line(content) {
            Some(header) => headers.push(header),
            None => return (Vec::new(), text),
        }
        offset += line.len();
    }

    // No blank line: a lone "Word: text" line is prose, not a header block.
    (Vec::new(), text)
}

fn parse_header_line(line: &str) -> Option<Header> {
    let (name, value) = line.split_once(':')?;
    let valid_name = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if !valid_name {
        return None;
    }
    Some(Header::new(name, value.trim()))
}
