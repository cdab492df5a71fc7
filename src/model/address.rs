//! Email address parsing (RFC 5322 §3.4) and deduplicated address lists.

use std::collections::HashSet;

/// A parsed email address.
///
/// # Examples
/// - `"Juan García <juan@ejemplo.com>"` → `display_name = "Juan García"`, `address = "juan@ejemplo.com"`
/// - `"user@example.com"` → `display_name = ""`, `address = "user@example.com"`
/// - `"Undisclosed recipients"` → `display_name = "Undisclosed recipients"`, `address = ""`
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct EmailAddress {
    /// Human-readable display name (may be empty).
    pub display_name: String,
    /// The bare email address (`user@domain`), empty if none was found.
    pub address: String,
}

impl EmailAddress {
    /// Parse a single email address from a header value.
    ///
    /// Supported formats:
    /// - `"user@domain.com"`
    /// - `"<user@domain.com>"`
    /// - `"Display Name <user@domain.com>"`
    /// - `"\"Display, Name\" <user@domain.com>"`
    /// - `"user@domain.com (Display Name)"`
    ///
    /// Text without any address becomes the display name. A display name
    /// that turns out to be an address is moved over to `address`.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Self::default();
        }

        let mut parsed = Self::parse_shape(trimmed);
        if parsed.address.is_empty() && parsed.display_name.contains('@') {
            parsed.address = parsed
                .display_name
                .trim_matches(|c| c == '<' || c == '>')
                .to_string();
            parsed.display_name.clear();
        }
        parsed
    }

    fn parse_shape(trimmed: &str) -> Self {
        // "Display Name <address>" or "<address>"
        if let Some(angle_start) = trimmed.rfind('<') {
            if let Some(angle_end) = trimmed.rfind('>') {
                if angle_end > angle_start {
                    let address = trimmed[angle_start + 1..angle_end].trim().to_string();
                    let display_name = strip_quotes(&trimmed[..angle_start]);
                    return Self {
                        display_name,
                        address,
                    };
                }
            }
        }

        // "address (Comment Name)"
        let (rest, comment) = split_comment(trimmed);
        let rest = strip_quotes(rest);

        if rest.contains('@') && !rest.contains(char::is_whitespace) {
            return Self {
                display_name: comment.map(strip_quotes).unwrap_or_default(),
                address: rest,
            };
        }

        Self {
            display_name: strip_quotes(trimmed),
            address: String::new(),
        }
    }

    /// Parse a comma-separated list of addresses, in source order.
    ///
    /// Handles quoted commas and commas inside comments:
    /// `"Last, First" <a@b.com>, other@c.com (Other, Person)`
    pub fn parse_all(raw: &str) -> Vec<Self> {
        split_address_list(raw)
            .iter()
            .map(|segment| Self::parse(segment))
            .filter(|addr| !addr.address.is_empty() || !addr.display_name.is_empty())
            .collect()
    }

    /// Format for display: `"Display Name <address>"` or just `"address"`.
    pub fn display(&self) -> String {
        if self.display_name.is_empty() {
            self.address.clone()
        } else if self.address.is_empty() {
            self.display_name.clone()
        } else {
            format!("{} <{}>", self.display_name, self.address)
        }
    }
}

impl std::fmt::Display for EmailAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display())
    }
}

/// An ordered address list whose addresses are unique case-insensitively.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AddressList(Vec<EmailAddress>);

impl AddressList {
    /// Parse and deduplicate an already-decoded address header.
    ///
    /// The first occurrence of each address wins, so
    /// `"A <x@y.com>, A2 <X@y.com>"` keeps only `A <x@y.com>`.
    pub fn parse(raw: &str) -> Self {
        let mut list = Self::default();
        list.extend(EmailAddress::parse_all(raw));
        list
    }

    /// Append addresses, skipping any whose address is already present.
    pub fn extend(&mut self, addrs: impl IntoIterator<Item = EmailAddress>) {
        let mut seen: HashSet<String> = self
            .0
            .iter()
            .filter(|a| !a.address.is_empty())
            .map(|a| a.address.to_lowercase())
            .collect();
        for addr in addrs {
            if addr.address.is_empty() || seen.insert(addr.address.to_lowercase()) {
                self.0.push(addr);
            }
        }
    }

    /// Canonical header form: every pair with an address, joined with `"; "`.
    pub fn to_header_string(&self) -> String {
        self.0
            .iter()
            .filter(|a| !a.address.is_empty())
            .map(EmailAddress::display)
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn iter(&self) -> std::slice::Iter<'_, EmailAddress> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'a> IntoIterator for &'a AddressList {
    type Item = &'a EmailAddress;
    type IntoIter = std::slice::Iter<'a, EmailAddress>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Split an address header on commas that are outside quotes, angle
/// brackets and comments.
fn split_address_list(raw: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut in_angle = false;
    let mut comment_depth = 0usize;
    let mut escaped = false;

    for ch in raw.chars() {
        if escaped {
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => {
                escaped = true;
                current.push(ch);
            }
            '"' if comment_depth == 0 => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            '(' if !in_quotes => {
                comment_depth += 1;
                current.push(ch);
            }
            ')' if !in_quotes && comment_depth > 0 => {
                comment_depth -= 1;
                current.push(ch);
            }
            '<' if !in_quotes && comment_depth == 0 => {
                in_angle = true;
                current.push(ch);
            }
            '>' if !in_quotes && comment_depth == 0 => {
                in_angle = false;
                current.push(ch);
            }
            ',' | ';' if !in_quotes && !in_angle && comment_depth == 0 => {
                segments.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Split `"addr (Comment)"` into `("addr", Some("Comment"))`.
fn split_comment(s: &str) -> (&str, Option<&str>) {
    match (s.find('('), s.rfind(')')) {
        (Some(open), Some(close)) if close > open => {
            let comment = s[open + 1..close].trim();
            let rest = s[..open].trim();
            let comment = (!comment.is_empty()).then_some(comment);
            (rest, comment)
        }
        _ => (s, None),
    }
}

/// Strip surrounding double-quotes, unescape `\"`, and trim whitespace.
fn strip_quotes(s: &str) -> String {
    let trimmed = s.trim();
    if trimmed.starts_with('"') && trimmed.ends_with('"') && trimmed.len() >= 2 {
        trimmed[1..trimmed.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
            .trim()
            .to_string()
    } else {
        trimmed.to_string()
    }
}
