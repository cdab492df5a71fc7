//! Message decoding: header block, MIME tree and transfer-decoded leaves.
//!
//! Decoding is deliberately forgiving. Only a span that has no header block
//! at all is rejected; everything else degrades to defaults.

use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::model::message::{HeaderMap, MimeBody, MimeNode, ParsedMessage};
use crate::parser::content_type::{ContentDisposition, ContentType};
use crate::parser::header::{decode_encoded_words, decode_header_bytes, extract_angle_bracket};
use crate::parser::transfer::decode_transfer;

/// Maximum multipart nesting depth (to prevent stack overflow on adversarial input).
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Turns raw message bytes into a [`ParsedMessage`].
#[derive(Debug, Clone)]
pub struct MessageDecoder {
    max_depth: usize,
}

impl Default for MessageDecoder {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl MessageDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes nested deeper than `max_depth` below the root are dropped.
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Decode one message payload (the span without its separator line).
    pub fn decode(&self, raw: &[u8]) -> Result<ParsedMessage, DecodeError> {
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Err(DecodeError::Empty);
        }

        let raw = raw.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(raw);
        let (header_bytes, body) = split_header_body(raw);
        let headers = parse_header_block(header_bytes);
        if headers.is_empty() {
            return Err(DecodeError::NoHeaders);
        }

        let root = self.build_node(&headers, body, 0);
        Ok(ParsedMessage { headers, root })
    }

    fn build_node(&self, headers: &HeaderMap, body: &[u8], depth: usize) -> MimeNode {
        let content_type = match headers.get("content-type") {
            Some(value) => ContentType::parse(value).unwrap_or_else(|e| {
                debug!(error = %e, "Unusable Content-Type, treating as text/plain");
                ContentType::text_plain()
            }),
            None => ContentType::text_plain(),
        };
        let disposition = headers
            .get("content-disposition")
            .map(ContentDisposition::parse)
            .unwrap_or_default();

        let filename = disposition
            .filename()
            .or_else(|| content_type.name())
            .map(|name| decode_encoded_words(name).trim().to_string())
            .filter(|name| !name.is_empty());

        let content_id = headers
            .get("content-id")
            .map(extract_angle_bracket)
            .filter(|id| !id.is_empty());

        let transfer_encoding = headers
            .get("content-transfer-encoding")
            .map(|cte| cte.trim().to_ascii_lowercase())
            .filter(|cte| !cte.is_empty())
            .unwrap_or_else(|| "7bit".to_string());

        let mut node = MimeNode {
            content_type: content_type.mime_type(),
            charset: content_type.charset().map(str::to_string),
            content_disposition: (!disposition.kind.is_empty()).then_some(disposition.kind),
            filename,
            content_id,
            transfer_encoding,
            body: MimeBody::Multipart(Vec::new()),
        };

        if content_type.is_multipart() {
            let children = match content_type.boundary() {
                Some(boundary) => self.build_children(body, boundary, depth),
                None => {
                    debug!(content_type = %node.content_type, "Multipart without boundary");
                    Vec::new()
                }
            };
            if !children.is_empty() {
                node.body = MimeBody::Multipart(children);
                return node;
            }
            debug!(content_type = %node.content_type, "Multipart yielded no parts, treating as text");
            node.content_type = "text/plain".to_string();
        }

        node.body = MimeBody::Leaf(decode_transfer(&node.transfer_encoding, body));
        node
    }

    fn build_children(&self, body: &[u8], boundary: &str, depth: usize) -> Vec<MimeNode> {
        let parts = split_multipart(body, boundary);
        if depth + 1 > self.max_depth {
            if !parts.is_empty() {
                warn!(
                    depth = depth + 1,
                    dropped = parts.len(),
                    "MIME nesting too deep, dropping parts"
                );
            }
            return Vec::new();
        }

        parts
            .into_iter()
            .map(|part| {
                let (header_bytes, part_body) = split_header_body(part);
                let part_headers = parse_header_block(header_bytes);
                // A part whose "headers" parse to nothing is all body
                let part_body = if part_headers.is_empty() && !header_bytes.is_empty() {
                    part
                } else {
                    part_body
                };
                self.build_node(&part_headers, part_body, depth + 1)
            })
            .collect()
    }
}

/// Decode with the default depth limit.
pub fn decode(raw: &[u8]) -> Result<ParsedMessage, DecodeError> {
    MessageDecoder::default().decode(raw)
}

/// Split at the first empty line (`\n` or `\r\n`).
///
/// Without an empty line the whole input is the header block.
fn split_header_body(bytes: &[u8]) -> (&[u8], &[u8]) {
    let mut pos = 0;
    while pos < bytes.len() {
        let end = line_end(bytes, pos);
        let line = &bytes[pos..end];
        if line == b"\n" || line == b"\r\n" {
            return (&bytes[..pos], &bytes[end..]);
        }
        pos = end;
    }
    (bytes, &[])
}

/// Index just past the `\n` ending the line that starts at `pos`.
fn line_end(bytes: &[u8], pos: usize) -> usize {
    bytes[pos..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |i| pos + i + 1)
}

/// Parse and unfold a header block.
///
/// Continuation lines (leading space/tab) are joined to the previous field.
/// Lines that are neither a field nor a continuation are skipped.
pub fn parse_header_block(bytes: &[u8]) -> HeaderMap {
    let text = decode_header_bytes(bytes);
    let mut fields: Vec<(String, String)> = Vec::new();

    for line in text.lines() {
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = fields.last_mut() {
                last.1.push(' ');
                last.1.push_str(line.trim());
            }
        } else if let Some(colon_pos) = line.find(':') {
            let name = line[..colon_pos].trim_end();
            if name.is_empty() || name.contains(char::is_whitespace) {
                continue;
            }
            fields.push((name.to_string(), line[colon_pos + 1..].trim().to_string()));
        }
    }

    let mut headers = HeaderMap::new();
    for (name, value) in fields {
        headers.push(name, value);
    }
    headers
}

/// Split a multipart body on its boundary delimiter lines.
///
/// The preamble and epilogue are discarded. The line break before each
/// delimiter belongs to the delimiter. A missing closing delimiter ends the
/// last part at the end of the body.
fn split_multipart<'a>(body: &'a [u8], boundary: &str) -> Vec<&'a [u8]> {
    let delimiter = format!("--{boundary}");
    let mut parts = Vec::new();
    let mut part_start: Option<usize> = None;
    let mut pos = 0;

    while pos < body.len() {
        let end = line_end(body, pos);
        let line = trim_line(&body[pos..end]);
        if let Some(rest) = line.strip_prefix(delimiter.as_bytes()) {
            let closing = rest == b"--";
            if rest.is_empty() || closing {
                if let Some(start) = part_start.take() {
                    parts.push(strip_line_break(&body[start..pos]));
                }
                if closing {
                    return parts;
                }
                part_start = Some(end);
            }
        }
        pos = end;
    }

    if let Some(start) = part_start {
        if start < body.len() {
            parts.push(&body[start..]);
        }
    }
    parts
}

fn trim_line(line: &[u8]) -> &[u8] {
    let end = line
        .iter()
        .rposition(|b| !matches!(b, b'\r' | b'\n' | b' ' | b'\t'))
        .map_or(0, |i| i + 1);
    &line[..end]
}

fn strip_line_break(part: &[u8]) -> &[u8] {
    part.strip_suffix(b"\r\n")
        .or_else(|| part.strip_suffix(b"\n"))
        .unwrap_or(part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PartError;

    fn leaf_bytes(node: &MimeNode) -> &[u8] {
        match &node.body {
            MimeBody::Leaf(Ok(bytes)) => bytes,
            other => panic!("expected decoded leaf, got {other:?}"),
        }
    }

    #[test]
    fn test_simple_message() {
        let raw = b"From: a@b.com\r\nSubject: Hi\r\n  there\r\n\r\nBody line\r\n";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.headers.get("subject"), Some("Hi there"));
        assert_eq!(msg.root.content_type, "text/plain");
        assert_eq!(msg.root.transfer_encoding, "7bit");
        assert_eq!(leaf_bytes(&msg.root), b"Body line\r\n");
    }

    #[test]
    fn test_empty_and_headerless() {
        assert_eq!(decode(b"").unwrap_err(), DecodeError::Empty);
        assert_eq!(decode(b" \r\n\n").unwrap_err(), DecodeError::Empty);
        assert_eq!(
            decode(b"no header here\njust text\n").unwrap_err(),
            DecodeError::NoHeaders
        );
    }

    #[test]
    fn test_headers_only() {
        let msg = decode(b"Subject: only headers\n").unwrap();
        assert_eq!(leaf_bytes(&msg.root), b"");
    }

    #[test]
    fn test_latin1_header_bytes() {
        let msg = decode(b"Subject: caf\xe9\n\nx").unwrap();
        assert_eq!(msg.headers.get("subject"), Some("café"));
    }

    #[test]
    fn test_multipart_alternative_with_attachment() {
        let raw = b"Content-Type: multipart/mixed; boundary=\"outer\"\n\
\n\
preamble\n\
--outer\n\
Content-Type: multipart/alternative; boundary=inner\n\
\n\
--inner\n\
Content-Type: text/plain; charset=utf-8\n\
\n\
plain\n\
--inner\n\
Content-Type: text/html\n\
Content-Transfer-Encoding: quoted-printable\n\
\n\
<p>caf=C3=A9</p>\n\
--inner--\n\
--outer\n\
Content-Type: application/pdf; name=\"doc.pdf\"\n\
Content-Disposition: attachment\n\
Content-Transfer-Encoding: base64\n\
\n\
JVBERi0=\n\
--outer--\n\
epilogue\n";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.content_type, "multipart/mixed");
        assert_eq!(msg.root.node_count(), 5);

        let alt = &msg.root.children()[0];
        assert_eq!(alt.children().len(), 2);
        assert_eq!(alt.children()[0].charset.as_deref(), Some("utf-8"));
        assert_eq!(leaf_bytes(&alt.children()[0]), b"plain");
        assert_eq!(leaf_bytes(&alt.children()[1]), "<p>café</p>".as_bytes());

        let pdf = &msg.root.children()[1];
        assert_eq!(pdf.content_disposition.as_deref(), Some("attachment"));
        assert_eq!(pdf.filename.as_deref(), Some("doc.pdf"));
        assert_eq!(leaf_bytes(pdf), b"%PDF-");
    }

    #[test]
    fn test_missing_boundary_degrades_to_text() {
        let msg = decode(b"Content-Type: multipart/mixed\n\nraw body\n").unwrap();
        assert_eq!(msg.root.content_type, "text/plain");
        assert_eq!(leaf_bytes(&msg.root), b"raw body\n");
    }

    #[test]
    fn test_boundary_never_found_degrades_to_text() {
        let msg = decode(b"Content-Type: multipart/mixed; boundary=zz\n\nno parts\n").unwrap();
        assert!(!msg.root.is_multipart());
        assert_eq!(leaf_bytes(&msg.root), b"no parts\n");
    }

    #[test]
    fn test_unclosed_multipart_keeps_last_part() {
        let raw = b"Content-Type: multipart/mixed; boundary=b\n\n--b\n\nfirst\n--b\n\nsecond\n";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.children().len(), 2);
        assert_eq!(leaf_bytes(&msg.root.children()[1]), b"second\n");
    }

    #[test]
    fn test_bad_transfer_encoding_recorded_on_leaf() {
        let raw = b"Content-Transfer-Encoding: x-gzip64\n\nxxxx\n";
        let msg = decode(raw).unwrap();
        assert!(matches!(
            msg.root.body,
            MimeBody::Leaf(Err(PartError::UnsupportedEncoding(_)))
        ));
    }

    #[test]
    fn test_depth_limit_drops_nested_parts() {
        let mut raw = String::from("Content-Type: multipart/mixed; boundary=b0\n\n");
        for level in 1..=3 {
            raw.push_str(&format!(
                "--b{}\nContent-Type: multipart/mixed; boundary=b{level}\n\n",
                level - 1
            ));
        }
        raw.push_str("--b3\nContent-Type: text/plain\n\ndeep\n--b3--\n");

        let full = decode(raw.as_bytes()).unwrap();
        assert_eq!(full.root.node_count(), 5);

        let limited = MessageDecoder::new()
            .with_max_depth(2)
            .decode(raw.as_bytes())
            .unwrap();
        assert!(limited.root.node_count() < 5);
    }

    #[test]
    fn test_malformed_content_type_is_plain_text() {
        let raw = b"Content-Type: text; charset=utf-8\n\nhello";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.content_type, "text/plain");
        assert_eq!(leaf_bytes(&msg.root), b"hello");
    }

    #[test]
    fn test_rfc2231_filename() {
        let raw = b"Content-Type: application/octet-stream\n\
Content-Disposition: attachment; filename*=UTF-8''na%C3%AFve%20file.txt\n\
\n\
data";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.filename.as_deref(), Some("naïve file.txt"));
    }

    #[test]
    fn test_rfc2231_continuations() {
        let raw = concat!(
            "Content-Type: application/octet-stream;\n",
            " name*0*=utf-8''long%20;\n",
            "\tname*1=\"name.txt\"\n",
            "\n",
            "data"
        );
        let raw = raw.as_bytes();
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.filename.as_deref(), Some("long name.txt"));
    }

    #[test]
    fn test_encoded_word_filename_and_content_id() {
        let raw = b"Content-Type: image/png; name=\"=?UTF-8?Q?gr=C3=BC=C3=9Fe.png?=\"\n\
Content-ID: <img001@example.com>\n\
\n\
data";
        let msg = decode(raw).unwrap();
        assert_eq!(msg.root.filename.as_deref(), Some("grüße.png"));
        assert_eq!(msg.root.content_id.as_deref(), Some("img001@example.com"));
    }
}
