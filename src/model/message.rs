//! Message types flowing through the migration pipeline.
//!
//! ```text
//! RawMessageSpan ──decode──▶ ParsedMessage ──normalize──▶ NormalizedEnvelope ─┐
//!                                  │                                          ├─▶ PreparedMessage
//!                                  └────────classify────▶ Vec<ContentPart> ───┘
//! ```

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use super::address::AddressList;
use crate::error::PartError;

/// A contiguous byte range of the source archive believed to hold exactly one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessageSpan {
    /// Ordinal position in the source stream (0-based, strictly increasing).
    pub index: u64,

    /// Byte offset of the separator line (or of the payload if there is none).
    pub start_offset: u64,

    /// Exclusive end offset; equals the next span's `start_offset`.
    pub end_offset: u64,

    /// The `From ` separator line including its line terminator. Empty for
    /// data that precedes the first separator.
    pub separator: Vec<u8>,

    /// Message bytes between the separator line and the next separator.
    pub raw: Vec<u8>,
}

impl RawMessageSpan {
    /// Length of the span in the source, separator included.
    pub fn len(&self) -> u64 {
        self.end_offset - self.start_offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Date carried on the separator line (`From sender Thu Jan  4 10:00:00 2024`).
    pub fn separator_date(&self) -> Option<DateTime<Utc>> {
        crate::parser::header::parse_separator_date(&self.separator)
    }
}

/// Ordered header fields of a message or MIME part.
///
/// Names are matched case-insensitively and may repeat; every occurrence is
/// kept with its unfolded raw value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap {
    fields: Vec<(String, String)>,
}

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a field, keeping the name as written.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.fields.push((name.into(), value.into()));
    }

    /// First value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Every value for `name`, in source order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A decoded message: its top-level headers and MIME tree.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    pub headers: HeaderMap,
    pub root: MimeNode,
}

/// One node of the MIME tree.
#[derive(Debug, Clone)]
pub struct MimeNode {
    /// Lowercased `type/subtype`, `text/plain` when absent.
    pub content_type: String,
    /// Declared charset parameter, if any.
    pub charset: Option<String>,
    /// Lowercased disposition type (`attachment`, `inline`), if any.
    pub content_disposition: Option<String>,
    /// Filename from the disposition or content-type parameters, decoded.
    pub filename: Option<String>,
    /// Content-ID without angle brackets.
    pub content_id: Option<String>,
    /// Lowercased Content-Transfer-Encoding token, `7bit` when absent.
    pub transfer_encoding: String,
    pub body: MimeBody,
}

/// Payload of a [`MimeNode`]: either children or decoded bytes, never both.
#[derive(Debug, Clone)]
pub enum MimeBody {
    /// Non-empty ordered children of a multipart container.
    Multipart(Vec<MimeNode>),
    /// Transfer-decoded payload of a leaf, or why it could not be decoded.
    Leaf(std::result::Result<Vec<u8>, PartError>),
}

impl MimeNode {
    pub fn is_multipart(&self) -> bool {
        matches!(self.body, MimeBody::Multipart(_))
    }

    /// Children of a container; empty for leaves.
    pub fn children(&self) -> &[MimeNode] {
        match &self.body {
            MimeBody::Multipart(children) => children,
            MimeBody::Leaf(_) => &[],
        }
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.children().iter().map(MimeNode::node_count).sum::<usize>()
    }

    /// Decode failures of every leaf in this subtree, in document order.
    pub fn part_errors(&self) -> Vec<&PartError> {
        match &self.body {
            MimeBody::Multipart(children) => {
                children.iter().flat_map(MimeNode::part_errors).collect()
            }
            MimeBody::Leaf(Err(e)) => vec![e],
            MimeBody::Leaf(Ok(_)) => Vec::new(),
        }
    }
}

/// Normalized, destination-agnostic header data of one message.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize)]
pub struct NormalizedEnvelope {
    pub subject: String,
    pub sender_name: String,
    pub sender_address: String,
    /// `To:` recipients, unique by address.
    pub recipients: AddressList,
    /// `Cc:` recipients, unique by address.
    pub cc: AddressList,
    /// `None` is a normal outcome for archives with missing or broken dates.
    pub sent_date: Option<DateTime<Utc>>,
    /// Gmail labels, union of every `X-Gmail-Labels` occurrence.
    pub labels: BTreeSet<String>,
    pub message_id: Option<String>,
}

/// A piece of message content, in source-document order.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentPart {
    BodyText(String),
    BodyHtml(String),
    Attachment {
        filename: String,
        content_id: Option<String>,
        mime_type: String,
        /// Embedded content referenced from the HTML body (`cid:`).
        inline: bool,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
}

/// The unit handed to a [`Sink`](crate::store::sink::Sink).
#[derive(Debug, Clone, serde::Serialize)]
pub struct PreparedMessage {
    pub envelope: NormalizedEnvelope,
    pub parts: Vec<ContentPart>,
    pub source_index: u64,
}

impl PreparedMessage {
    /// All plain-text body parts concatenated, `None` if there are none.
    pub fn body_text(&self) -> Option<String> {
        concat_bodies(self.parts.iter().filter_map(|p| match p {
            ContentPart::BodyText(s) => Some(s.as_str()),
            _ => None,
        }))
    }

    /// All HTML body parts concatenated, `None` if there are none.
    pub fn body_html(&self) -> Option<String> {
        concat_bodies(self.parts.iter().filter_map(|p| match p {
            ContentPart::BodyHtml(s) => Some(s.as_str()),
            _ => None,
        }))
    }

    pub fn attachment_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, ContentPart::Attachment { .. }))
            .count()
    }
}

fn concat_bodies<'a>(bodies: impl Iterator<Item = &'a str>) -> Option<String> {
    let joined: String = bodies.collect();
    (!joined.is_empty()).then_some(joined)
}
