//! Classification of MIME leaves into body text, HTML and attachments.

use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::warn;

use crate::model::message::{ContentPart, MimeBody, MimeNode};
use crate::parser::header::decode_charset;

/// Longest filename (in characters) handed to a sink.
const MAX_FILENAME_LEN: usize = 200;

/// Flatten a MIME tree into content parts, depth-first in document order.
///
/// Containers contribute nothing themselves. Leaves whose payload could not
/// be transfer-decoded are logged and left out.
pub fn classify(root: &MimeNode) -> Vec<ContentPart> {
    let mut parts = Vec::new();
    classify_into(root, &mut parts);
    parts
}

fn classify_into(node: &MimeNode, parts: &mut Vec<ContentPart>) {
    let bytes = match &node.body {
        MimeBody::Multipart(children) => {
            for child in children {
                classify_into(child, parts);
            }
            return;
        }
        MimeBody::Leaf(Ok(bytes)) => bytes,
        MimeBody::Leaf(Err(e)) => {
            warn!(
                content_type = %node.content_type,
                encoding = %node.transfer_encoding,
                error = %e,
                "Skipping undecodable part"
            );
            return;
        }
    };

    if is_attachment(node) {
        parts.push(ContentPart::Attachment {
            filename: attachment_filename(node),
            content_id: node.content_id.clone(),
            mime_type: node.content_type.clone(),
            inline: node.content_disposition.as_deref() == Some("inline")
                || node.content_id.is_some(),
            bytes: bytes.clone(),
        });
        return;
    }

    let charset = node.charset.as_deref().unwrap_or("utf-8");
    let text = decode_charset(charset, bytes);
    if node.content_type == "text/html" {
        parts.push(ContentPart::BodyHtml(text));
    } else {
        parts.push(ContentPart::BodyText(text));
    }
}

/// A leaf is an attachment when it says so, has a filename, or is not a
/// text body type.
fn is_attachment(node: &MimeNode) -> bool {
    node.content_disposition.as_deref() == Some("attachment")
        || node.filename.is_some()
        || !matches!(node.content_type.as_str(), "text/plain" | "text/html")
}

fn attachment_filename(node: &MimeNode) -> String {
    node.filename
        .as_deref()
        .map(sanitize_filename)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| generated_filename(&node.content_type))
}

/// `attachment_<8 random alphanumerics><ext>`.
pub fn generated_filename(mime_type: &str) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("attachment_{suffix}{}", extension_for(mime_type))
}

/// Guess a file extension (with the dot) from a MIME type.
pub fn extension_for(mime_type: &str) -> &'static str {
    match mime_type {
        "application/pdf" => ".pdf",
        "application/zip" => ".zip",
        "application/gzip" | "application/x-gzip" => ".gz",
        "application/json" => ".json",
        "application/xml" | "text/xml" => ".xml",
        "application/msword" => ".doc",
        "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => ".docx",
        "application/vnd.ms-excel" => ".xls",
        "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => ".xlsx",
        "application/vnd.ms-powerpoint" => ".ppt",
        "application/vnd.openxmlformats-officedocument.presentationml.presentation" => ".pptx",
        "application/pgp-signature" => ".asc",
        "application/pkcs7-signature" | "application/x-pkcs7-signature" => ".p7s",
        "application/ics" | "text/calendar" => ".ics",
        "message/rfc822" => ".eml",
        "image/jpeg" | "image/jpg" | "image/pjpeg" => ".jpg",
        "image/png" => ".png",
        "image/gif" => ".gif",
        "image/bmp" => ".bmp",
        "image/webp" => ".webp",
        "image/svg+xml" => ".svg",
        "image/tiff" => ".tif",
        "audio/mpeg" => ".mp3",
        "audio/wav" | "audio/x-wav" => ".wav",
        "video/mp4" => ".mp4",
        "text/plain" => ".txt",
        "text/html" => ".html",
        "text/csv" => ".csv",
        "text/vcard" | "text/x-vcard" => ".vcf",
        _ => ".dat",
    }
}

/// Make a decoded filename safe to create on common filesystems.
///
/// Path separators, control and reserved characters become `_`; leading
/// and trailing dots and spaces are removed; the extension survives
/// truncation.
pub fn sanitize_filename(name: &str) -> String {
    let replaced: String = name
        .chars()
        .map(|c| {
            if c.is_control() || matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|')
            {
                '_'
            } else {
                c
            }
        })
        .collect();
    let trimmed = replaced.trim_matches(|c: char| c == '.' || c.is_whitespace());

    if trimmed.chars().count() <= MAX_FILENAME_LEN {
        return trimmed.to_string();
    }

    let (stem, ext) = match trimmed.rfind('.') {
        Some(dot) if trimmed.len() - dot <= 16 => trimmed.split_at(dot),
        _ => (trimmed, ""),
    };
    let keep = MAX_FILENAME_LEN.saturating_sub(ext.chars().count());
    let mut truncated: String = stem.chars().take(keep).collect();
    truncated.push_str(ext);
    truncated
}
