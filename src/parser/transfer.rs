//! Content-Transfer-Encoding decoding for MIME leaves.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine;

use crate::error::PartError;

/// Base64 engine that accepts missing padding and non-canonical trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Decode a leaf payload according to its transfer-encoding token.
///
/// The token is expected lowercased and trimmed; an empty token means 7bit.
pub fn decode_transfer(encoding: &str, raw: &[u8]) -> Result<Vec<u8>, PartError> {
    match encoding {
        "" | "7bit" | "8bit" | "binary" | "7-bit" | "8-bit" => Ok(raw.to_vec()),
        "base64" => decode_base64(raw).map_err(|e| PartError::InvalidBase64(e.to_string())),
        "quoted-printable" => Ok(decode_quoted_printable(raw)),
        other => Err(PartError::UnsupportedEncoding(other.to_string())),
    }
}

/// Decode base64, ignoring line breaks and other whitespace.
pub fn decode_base64(raw: &[u8]) -> Result<Vec<u8>, base64::DecodeError> {
    let cleaned: Vec<u8> = raw
        .iter()
        .copied()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    LENIENT_BASE64.decode(cleaned)
}

/// Decode quoted-printable (RFC 2045 §6.7) leniently.
///
/// Soft line breaks are removed, `=XX` escapes are decoded, and anything
/// that is not a valid escape is kept literally.
pub fn decode_quoted_printable(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'=' {
            out.push(raw[i]);
            i += 1;
            continue;
        }

        let rest = &raw[i + 1..];
        // Soft line break, possibly with trailing whitespace before the newline
        let ws = rest
            .iter()
            .take_while(|&&b| b == b' ' || b == b'\t')
            .count();
        if rest[ws..].starts_with(b"\r\n") {
            i += 1 + ws + 2;
            continue;
        }
        if rest[ws..].starts_with(b"\n") {
            i += 1 + ws + 1;
            continue;
        }

        match rest {
            [hi, lo, ..] if hi.is_ascii_hexdigit() && lo.is_ascii_hexdigit() => {
                out.push((hex_val(*hi) << 4) | hex_val(*lo));
                i += 3;
            }
            _ => {
                out.push(b'=');
                i += 1;
            }
        }
    }
    out
}

fn hex_val(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_encodings() {
        assert_eq!(decode_transfer("7bit", b"abc").unwrap(), b"abc");
        assert_eq!(decode_transfer("", b"abc").unwrap(), b"abc");
        assert_eq!(decode_transfer("binary", &[0, 255]).unwrap(), vec![0, 255]);
    }

    #[test]
    fn test_base64_with_line_breaks() {
        let decoded = decode_transfer("base64", b"SGVsbG8s\r\nIFdvcmxk\nIQ==\n").unwrap();
        assert_eq!(decoded, b"Hello, World!");
    }

    #[test]
    fn test_base64_missing_padding() {
        assert_eq!(decode_transfer("base64", b"SGk").unwrap(), b"Hi");
    }

    #[test]
    fn test_base64_garbage() {
        assert!(matches!(
            decode_transfer("base64", b"!!!not*base64$$$"),
            Err(PartError::InvalidBase64(_))
        ));
    }

    #[test]
    fn test_unsupported_encoding() {
        assert_eq!(
            decode_transfer("x-uuencode", b"begin 644 a"),
            Err(PartError::UnsupportedEncoding("x-uuencode".into()))
        );
    }

    #[test]
    fn test_quoted_printable() {
        let decoded = decode_quoted_printable(b"Caf=C3=A9 con le=\r\n=C3=B1a=\nx");
        assert_eq!(String::from_utf8(decoded).unwrap(), "Café con leñax");
    }

    #[test]
    fn test_quoted_printable_invalid_escape_kept() {
        assert_eq!(decode_quoted_printable(b"a=zzb="), b"a=zzb=");
        assert_eq!(decode_quoted_printable(b"50=25 off"), b"50% off");
    }
}
