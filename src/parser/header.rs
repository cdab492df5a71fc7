//! Header normalization: encoded-words (RFC 2047), addresses, labels and dates.
//!
//! Every function here is infallible. A field that cannot be decoded degrades
//! to best-effort text or to "absent"; it never fails the message.

use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::error::EncodingError;
use crate::model::address::{AddressList, EmailAddress};
use crate::model::message::{HeaderMap, NormalizedEnvelope};
use crate::parser::transfer;

/// Subject used when the header is missing or blank.
pub const NO_SUBJECT: &str = "(No Subject)";

/// Header carrying Gmail labels, one comma-separated list per occurrence.
pub const LABELS_HEADER: &str = "x-gmail-labels";

/// Build the [`NormalizedEnvelope`] of a message from its top-level headers.
///
/// `fallback_date` is used when `Date:` is missing or unparseable (usually
/// the date of the `From ` separator line).
pub fn normalize_envelope(
    headers: &HeaderMap,
    fallback_date: Option<DateTime<Utc>>,
) -> NormalizedEnvelope {
    let subject = headers
        .get("subject")
        .map(decode_encoded_words)
        .map(|s| collapse_whitespace(&s))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| NO_SUBJECT.to_string());

    let sender = headers
        .get("from")
        .or_else(|| headers.get("sender"))
        .map(parse_sender)
        .unwrap_or_default();

    let recipients = parse_address_headers(headers.get_all("to"));
    let cc = parse_address_headers(headers.get_all("cc"));

    let sent_date = headers
        .get("date")
        .and_then(parse_date)
        .or(fallback_date);

    let labels = parse_labels(headers.get_all(LABELS_HEADER));

    let message_id = headers
        .get("message-id")
        .map(extract_angle_bracket)
        .filter(|s| !s.is_empty());

    NormalizedEnvelope {
        subject,
        sender_name: sender.display_name,
        sender_address: sender.address,
        recipients,
        cc,
        sent_date,
        labels,
        message_id,
    }
}

/// Extract the canonical sender from a raw `From:` value.
///
/// The first parsed address wins. If no address can be found at all, the
/// whole decoded text becomes the display name.
pub fn parse_sender(raw: &str) -> EmailAddress {
    let first = EmailAddress::parse_all(raw).into_iter().map(decode_address).next();
    match first {
        Some(first) if !first.address.is_empty() => first,
        _ => EmailAddress {
            display_name: collapse_whitespace(&decode_encoded_words(raw)),
            address: String::new(),
        },
    }
}

/// Merge every occurrence of an address header.
///
/// Each value is split into pairs before its encoded-words are decoded, so
/// a decoded display name may contain commas.
pub fn parse_address_headers<'a>(values: impl Iterator<Item = &'a str>) -> AddressList {
    let mut list = AddressList::default();
    for value in values {
        list.extend(EmailAddress::parse_all(value).into_iter().map(decode_address));
    }
    list
}

fn decode_address(mut addr: EmailAddress) -> EmailAddress {
    if addr.display_name.contains("=?") {
        addr.display_name = collapse_whitespace(&decode_encoded_words(&addr.display_name));
    }
    if addr.address.is_empty() && addr.display_name.contains('@') {
        return EmailAddress::parse(&addr.display_name);
    }
    addr
}

/// Union of the labels in every occurrence of the labels header.
///
/// Labels are opaque, case-sensitive tokens; the result is sorted and unique.
pub fn parse_labels<'a>(values: impl Iterator<Item = &'a str>) -> BTreeSet<String> {
    let mut labels = BTreeSet::new();
    for value in values {
        let decoded = decode_encoded_words(value);
        for label in split_labels(&decoded) {
            labels.insert(label);
        }
    }
    labels
}

/// Split a label list on commas, honoring `"quoted, labels"`.
fn split_labels(s: &str) -> Vec<String> {
    let mut labels = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    for ch in s.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => labels.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    labels.push(current);
    labels
        .into_iter()
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

/// Decode RFC 2047 encoded-words in a header value.
///
/// Example: `"=?UTF-8?B?SG9sYQ==?= =?UTF-8?B?IG11bmRv?="` → `"Hola mundo"`
///
/// Words wrapped in an extra pair of quotes are decoded in place. If the
/// result still contains an encoded-word (double-encoding producers), the
/// pass runs once more. Words whose payload is corrupt are kept verbatim.
pub fn decode_encoded_words(input: &str) -> String {
    let once = decode_pass(input);
    if find_encoded_word(&once).is_some() {
        debug!("Header still encoded after first pass, decoding again");
        decode_pass(&once)
    } else {
        once
    }
}

fn decode_pass(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut remaining = input;
    let mut last_was_encoded = false;

    while let Some(start) = remaining.find("=?") {
        let before = &remaining[..start];
        let after_start = &remaining[start + 2..];

        match try_decode_one_word(after_start) {
            Some((decoded, consumed)) => {
                // Whitespace between two encoded words is dropped (RFC 2047 §6.2)
                if !last_was_encoded || !before.trim().is_empty() {
                    result.push_str(before);
                }
                match decoded {
                    Ok(text) => result.push_str(&text),
                    Err(e) => {
                        debug!(error = %e, "Keeping undecodable encoded-word as-is");
                        result.push_str(&remaining[start..start + 2 + consumed]);
                    }
                }
                remaining = &remaining[start + 2 + consumed..];
                last_was_encoded = true;
            }
            None => {
                result.push_str(before);
                result.push_str("=?");
                remaining = after_start;
                last_was_encoded = false;
            }
        }
    }

    result.push_str(remaining);
    result
}

/// Byte position of the first well-formed encoded-word in `s`.
fn find_encoded_word(s: &str) -> Option<usize> {
    let mut offset = 0;
    while let Some(pos) = s[offset..].find("=?") {
        let start = offset + pos;
        if let Some((Ok(_), _)) = try_decode_one_word(&s[start + 2..]) {
            return Some(start);
        }
        offset = start + 2;
    }
    None
}

/// Decode `charset?encoding?text?=` (the part after the leading `=?`).
///
/// Returns `None` if `s` does not have the encoded-word shape, otherwise the
/// decoded text (or why it failed) and the number of bytes consumed.
fn try_decode_one_word(s: &str) -> Option<(Result<String, EncodingError>, usize)> {
    let first_q = s.find('?')?;
    let charset = &s[..first_q];
    if charset.is_empty() || charset.contains(char::is_whitespace) {
        return None;
    }

    let rest = &s[first_q + 1..];
    let second_q = rest.find('?')?;
    let encoding = &rest[..second_q];

    let rest2 = &rest[second_q + 1..];
    let end = rest2.find("?=")?;
    let encoded_text = &rest2[..end];

    let consumed = first_q + 1 + second_q + 1 + end + 2;

    let bytes = match encoding {
        "B" | "b" => transfer::decode_base64(encoded_text.as_bytes())
            .map_err(|e| EncodingError::MalformedPayload(e.to_string())),
        "Q" | "q" => Ok(decode_q_encoding(encoded_text)),
        _ => return None,
    };

    Some((bytes.map(|b| decode_charset(charset, &b)), consumed))
}

/// Decode Q-encoding (RFC 2047): underscores → spaces, `=XX` → byte.
fn decode_q_encoding(input: &str) -> Vec<u8> {
    let mut result = Vec::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                result.push(b' ');
                i += 1;
            }
            b'=' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(byte) => {
                        result.push(byte);
                        i += 3;
                    }
                    None => {
                        result.push(b'=');
                        i += 1;
                    }
                }
            }
            b => {
                result.push(b);
                i += 1;
            }
        }
    }
    result
}

/// Decode bytes using a named charset.
///
/// Falls back to Windows-1252 (which accepts every byte) when the bytes are
/// invalid for the declared charset or the charset is unknown.
pub fn decode_charset(charset: &str, bytes: &[u8]) -> String {
    decode_charset_strict(charset, bytes).unwrap_or_else(|e| {
        debug!(error = %e, "Falling back to Windows-1252");
        let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
        decoded.into_owned()
    })
}

fn decode_charset_strict(charset: &str, bytes: &[u8]) -> Result<String, EncodingError> {
    // RFC 2231 language suffix: "utf-8*en"
    let label = charset.split('*').next().unwrap_or(charset).trim();
    let encoding = match encoding_rs::Encoding::for_label(label.as_bytes()) {
        Some(encoding) => encoding,
        None => {
            warn!(charset = label, "Unknown charset");
            encoding_rs::UTF_8
        }
    };
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|s| s.into_owned())
        .ok_or_else(|| EncodingError::InvalidCharset {
            charset: encoding.name().to_string(),
        })
}

/// Decode raw header bytes to a string.
///
/// Tries UTF-8 first, then falls back to Windows-1252 (which accepts every byte).
pub fn decode_header_bytes(bytes: &[u8]) -> String {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => {
            let (decoded, _, _) = encoding_rs::WINDOWS_1252.decode(bytes);
            decoded.into_owned()
        }
    }
}

/// Collapse runs of whitespace (left over from folding) into single spaces.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract content between `<` and `>` (for Message-ID, Content-ID).
pub fn extract_angle_bracket(s: &str) -> String {
    let trimmed = s.trim();
    if let Some(start) = trimmed.find('<') {
        if let Some(end) = trimmed[start..].find('>') {
            return trimmed[start + 1..start + end].trim().to_string();
        }
    }
    trimmed.to_string()
}

/// Parse an email date string in various common formats.
///
/// Supports RFC 2822, ISO 8601, and many broken real-world variants.
pub fn parse_date(date_str: &str) -> Option<DateTime<Utc>> {
    let trimmed = date_str.trim();
    if trimmed.is_empty() {
        return None;
    }

    // Trailing comments: "Thu, 04 Jan 2024 10:00:00 +0000 (UTC)"
    let without_comment = match trimmed.find(" (") {
        Some(pos) if trimmed.ends_with(')') => trimmed[..pos].trim(),
        _ => trimmed,
    };

    for candidate in [trimmed, without_comment] {
        if let Ok(dt) = DateTime::parse_from_rfc2822(candidate) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(candidate) {
            return Some(dt.with_timezone(&Utc));
        }
    }

    let no_dow = strip_day_of_week(without_comment);
    let imap_normalized = normalize_imap_date(&no_dow);

    const FORMATS: [&str; 10] = [
        "%d %b %Y %H:%M:%S %z",
        "%d %b %Y %H:%M:%S %Z",
        "%d %b %Y %H:%M:%S",
        "%b %d %H:%M:%S %Y",
        "%Y-%m-%dT%H:%M:%S%z",
        "%Y-%m-%dT%H:%M:%SZ",
        "%Y-%m-%d %H:%M:%S %z",
        "%Y-%m-%d %H:%M:%S",
        "%d/%m/%Y %H:%M:%S",
        "%m/%d/%Y %H:%M:%S",
    ];

    for candidate in [&no_dow, &imap_normalized] {
        for fmt in FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(candidate, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
            if let Ok(ndt) = NaiveDateTime::parse_from_str(candidate, fmt) {
                return Some(Utc.from_utc_datetime(&ndt));
            }
        }
    }

    // Named timezones → numeric offsets
    for candidate in [&no_dow, &imap_normalized] {
        let replaced = replace_named_tz(candidate);
        for fmt in FORMATS {
            if let Ok(dt) = DateTime::parse_from_str(&replaced, fmt) {
                return Some(dt.with_timezone(&Utc));
            }
        }
    }

    if let Some(dt) = mail_parser_date(trimmed) {
        return Some(dt);
    }

    debug!(date = trimmed, "Could not parse date");
    None
}

/// Parse the asctime date of an MBOX separator line.
///
/// Handles `From sender Thu Jan  4 10:00:00 2024` and the Gmail variant
/// with an offset before the year, `From id@xxx Thu Jan 04 10:00:00 +0000 2024`.
pub fn parse_separator_date(separator: &[u8]) -> Option<DateTime<Utc>> {
    let line = String::from_utf8_lossy(separator);
    let mut tokens = line.split_whitespace();
    if tokens.next() != Some("From") {
        return None;
    }
    tokens.next()?; // sender
    let rest: Vec<&str> = tokens.collect();

    match rest.as_slice() {
        [dow, mon, day, time, zone, year] if zone.starts_with(['+', '-']) => {
            let s = format!("{dow} {mon} {day} {time} {zone} {year}");
            DateTime::parse_from_str(&s, "%a %b %d %H:%M:%S %z %Y")
                .ok()
                .map(|dt| dt.with_timezone(&Utc))
        }
        [dow, mon, day, time, year, ..] => {
            let s = format!("{dow} {mon} {day} {time} {year}");
            NaiveDateTime::parse_from_str(&s, "%a %b %d %H:%M:%S %Y")
                .ok()
                .map(|ndt| Utc.from_utc_datetime(&ndt))
        }
        _ => None,
    }
}

/// Attempt to parse a date using `mail-parser`'s built-in parser.
fn mail_parser_date(input: &str) -> Option<DateTime<Utc>> {
    use mail_parser::MessageParser;

    // Wrap input in a minimal RFC 5322 message so mail-parser can parse it
    let fake_msg = format!("Date: {input}\n\n");
    let parsed = MessageParser::default().parse(fake_msg.as_bytes())?;
    let dt = parsed.date()?.to_rfc3339();
    DateTime::parse_from_rfc3339(&dt)
        .ok()
        .map(|d| d.with_timezone(&Utc))
}

/// Normalize IMAP-style dates: `"16-JUL-2025 03:01:03"` → `"16 Jul 2025 03:01:03"`.
fn normalize_imap_date(s: &str) -> String {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    if !s.contains('-') {
        return s.to_string();
    }
    for month in MONTHS {
        for variant in [month.to_uppercase(), month.to_lowercase(), month.to_string()] {
            let pattern = format!("-{variant}-");
            if s.contains(&pattern) {
                return s.replacen(&pattern, &format!(" {month} "), 1);
            }
        }
    }
    s.to_string()
}

/// Strip leading day-of-week prefix (e.g. "Thu, " or "Thu ").
fn strip_day_of_week(s: &str) -> String {
    const DAYS: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];
    for day in DAYS {
        if let Some(rest) = s.strip_prefix(day) {
            if rest.starts_with([',', ' ']) {
                return rest.trim_start_matches([',', ' ']).trim().to_string();
            }
        }
    }
    s.to_string()
}

/// Replace well-known timezone abbreviations with numeric offsets.
fn replace_named_tz(s: &str) -> String {
    const TZS: [(&str, &str); 13] = [
        ("CEST", "+0200"),
        ("EST", "-0500"),
        ("EDT", "-0400"),
        ("CST", "-0600"),
        ("CDT", "-0500"),
        ("MST", "-0700"),
        ("MDT", "-0600"),
        ("PST", "-0800"),
        ("PDT", "-0700"),
        ("GMT", "+0000"),
        ("UTC", "+0000"),
        ("CET", "+0100"),
        ("JST", "+0900"),
    ];
    for (name, offset) in TZS {
        if let Some(head) = s.strip_suffix(name) {
            return format!("{head}{offset}");
        }
    }
    s.to_string()
}
