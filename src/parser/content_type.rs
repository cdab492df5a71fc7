//! `Content-Type` and `Content-Disposition` values with their parameters.
//!
//! Parameter values are resolved at parse time: quoted strings are
//! unquoted, and the RFC 2231 forms (`name*=charset''pct` and the
//! `name*0*=` / `name*1=` continuations) are decoded into a single value
//! that takes precedence over a plain `name=`.

use std::collections::HashMap;

use crate::error::PartError;
use crate::parser::header::decode_charset;

/// MIME content type with parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentType {
    /// Main type, lowercased (e.g. "text", "multipart").
    pub main_type: String,
    /// Subtype, lowercased (e.g. "plain", "mixed").
    pub sub_type: String,
    /// Parameters keyed by lowercased name.
    pub parameters: HashMap<String, String>,
}

impl ContentType {
    pub fn new(main_type: impl Into<String>, sub_type: impl Into<String>) -> Self {
        Self {
            main_type: main_type.into(),
            sub_type: sub_type.into(),
            parameters: HashMap::new(),
        }
    }

    /// `text/plain` without parameters, the type of a part that declares none.
    pub fn text_plain() -> Self {
        Self::new("text", "plain")
    }

    /// `main/sub`.
    pub fn mime_type(&self) -> String {
        format!("{}/{}", self.main_type, self.sub_type)
    }

    pub fn charset(&self) -> Option<&str> {
        self.parameters.get("charset").map(String::as_str)
    }

    pub fn boundary(&self) -> Option<&str> {
        self.parameters.get("boundary").map(String::as_str)
    }

    /// The `name` parameter, an older way of naming an attachment.
    pub fn name(&self) -> Option<&str> {
        self.parameters.get("name").map(String::as_str)
    }

    pub fn is_multipart(&self) -> bool {
        self.main_type == "multipart"
    }

    /// Parse `type/subtype; param1=value1; param2="value; 2"`.
    ///
    /// # Errors
    ///
    /// Returns [`PartError::InvalidContentType`] when the type or subtype is
    /// missing.
    pub fn parse(s: &str) -> Result<Self, PartError> {
        let mut segments = split_unquoted(s, ';').into_iter();
        let type_str = segments.next().unwrap_or_default().trim();
        if type_str.is_empty() {
            return Err(PartError::InvalidContentType("empty content type".to_string()));
        }

        let (main_type, sub_type) = type_str
            .split_once('/')
            .map(|(main, sub)| (main.trim(), sub.trim()))
            .filter(|(main, sub)| !main.is_empty() && !sub.is_empty())
            .ok_or_else(|| PartError::InvalidContentType(type_str.to_string()))?;

        Ok(Self {
            main_type: main_type.to_ascii_lowercase(),
            sub_type: sub_type.to_ascii_lowercase(),
            parameters: parse_parameters(segments),
        })
    }
}

/// `Content-Disposition` value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentDisposition {
    /// Lowercased disposition type ("inline", "attachment"), empty if absent.
    pub kind: String,
    pub parameters: HashMap<String, String>,
}

impl ContentDisposition {
    pub fn parse(s: &str) -> Self {
        let mut segments = split_unquoted(s, ';').into_iter();
        let kind = segments
            .next()
            .map(|v| v.trim().to_ascii_lowercase())
            .unwrap_or_default();
        Self {
            kind,
            parameters: parse_parameters(segments),
        }
    }

    pub fn filename(&self) -> Option<&str> {
        self.parameters.get("filename").map(String::as_str)
    }
}

/// How a raw parameter key contributes to the final value of its name.
enum ParamKey<'a> {
    Plain(&'a str),
    /// `name*=charset'lang'pct`
    Extended(&'a str),
    /// `name*N=` or `name*N*=`
    Section { name: &'a str, index: u32, encoded: bool },
}

fn classify_key(key: &str) -> ParamKey<'_> {
    let Some((name, rest)) = key.split_once('*') else {
        return ParamKey::Plain(key);
    };
    if rest.is_empty() {
        return ParamKey::Extended(name);
    }
    let (digits, encoded) = match rest.strip_suffix('*') {
        Some(digits) => (digits, true),
        None => (rest, false),
    };
    match digits.parse() {
        Ok(index) => ParamKey::Section {
            name,
            index,
            encoded,
        },
        Err(_) => ParamKey::Plain(key),
    }
}

fn parse_parameters<'a>(segments: impl Iterator<Item = &'a str>) -> HashMap<String, String> {
    let mut plain = HashMap::new();
    let mut extended = HashMap::new();
    let mut sections: HashMap<String, Vec<(u32, bool, String)>> = HashMap::new();

    for segment in segments {
        let Some((key, value)) = segment.split_once('=') else {
            continue;
        };
        let key = key.trim().to_ascii_lowercase();
        if key.is_empty() {
            continue;
        }
        let value = unquote(value.trim());
        match classify_key(&key) {
            ParamKey::Plain(name) => {
                plain.insert(name.to_string(), value);
            }
            ParamKey::Extended(name) => {
                extended.insert(name.to_string(), decode_extended_value(&value));
            }
            ParamKey::Section {
                name,
                index,
                encoded,
            } => sections
                .entry(name.to_string())
                .or_default()
                .push((index, encoded, value)),
        }
    }

    let mut parameters = plain;
    for (name, mut parts) in sections {
        parts.sort_by_key(|(index, _, _)| *index);
        parameters.insert(name, join_sections(&parts));
    }
    parameters.extend(extended);
    parameters
}

/// Concatenate continuation sections. Only the first encoded section may
/// carry the `charset'lang'` prefix.
fn join_sections(parts: &[(u32, bool, String)]) -> String {
    let mut charset = None;
    let mut bytes = Vec::new();
    for (i, (_, encoded, value)) in parts.iter().enumerate() {
        if !encoded {
            bytes.extend_from_slice(value.as_bytes());
            continue;
        }
        let mut value = value.as_str();
        if i == 0 {
            if let Some((cs, text)) = split_charset_prefix(value) {
                charset = Some(cs);
                value = text;
            }
        }
        bytes.extend(percent_decode(value));
    }
    decode_charset(charset.filter(|cs| !cs.is_empty()).unwrap_or("utf-8"), &bytes)
}

/// Decode `charset'lang'pct-encoded` (RFC 2231 §4).
fn decode_extended_value(value: &str) -> String {
    match split_charset_prefix(value) {
        Some((charset, text)) => {
            let charset = if charset.is_empty() { "utf-8" } else { charset };
            decode_charset(charset, &percent_decode(text))
        }
        None => decode_charset("utf-8", &percent_decode(value)),
    }
}

fn split_charset_prefix(value: &str) -> Option<(&str, &str)> {
    let (charset, rest) = value.split_once('\'')?;
    let (_lang, text) = rest.split_once('\'')?;
    Some((charset, text))
}

fn percent_decode(s: &str) -> Vec<u8> {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Some(byte) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Split on `sep` outside double quotes.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut out = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;
    for (i, ch) in s.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            c if c == sep && !in_quotes => {
                out.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn unquote(s: &str) -> String {
    match s.strip_prefix('"') {
        Some(inner) => inner
            .strip_suffix('"')
            .unwrap_or(inner)
            .replace("\\\"", "\"")
            .replace("\\\\", "\\"),
        None => s.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_parse() {
        let ct = ContentType::parse("Multipart/Mixed; BOUNDARY=\"a;b\"; charset=utf-8").unwrap();
        assert_eq!(ct.main_type, "multipart");
        assert_eq!(ct.sub_type, "mixed");
        assert_eq!(ct.mime_type(), "multipart/mixed");
        assert!(ct.is_multipart());
        assert_eq!(ct.boundary(), Some("a;b"));
        assert_eq!(ct.charset(), Some("utf-8"));
        assert_eq!(ct.name(), None);
    }

    #[test]
    fn test_content_type_parse_quoted() {
        let ct = ContentType::parse("multipart/mixed; boundary=\"----=_Part_123\"").unwrap();
        assert_eq!(ct.boundary(), Some("----=_Part_123"));
    }

    #[test]
    fn test_content_type_invalid() {
        assert!(matches!(
            ContentType::parse("text"),
            Err(PartError::InvalidContentType(_))
        ));
        assert!(ContentType::parse("   ").is_err());
        assert!(ContentType::parse("/plain").is_err());
    }

    #[test]
    fn test_extended_parameter_wins() {
        let ct = ContentType::parse(
            "application/pdf; name=\"fallback.pdf\"; name*=iso-8859-1'es'r%E9sum%E9.pdf",
        )
        .unwrap();
        assert_eq!(ct.name(), Some("résumé.pdf"));
    }

    #[test]
    fn test_continuations_join_in_order() {
        let cd = ContentDisposition::parse(
            "Attachment; filename*1=\"name.txt\"; filename*0*=utf-8''long%20",
        );
        assert_eq!(cd.kind, "attachment");
        assert_eq!(cd.filename(), Some("long name.txt"));
    }

    #[test]
    fn test_disposition_without_parameters() {
        let cd = ContentDisposition::parse("inline");
        assert_eq!(cd.kind, "inline");
        assert!(cd.parameters.is_empty());
        assert_eq!(ContentDisposition::parse("").kind, "");
    }
}
