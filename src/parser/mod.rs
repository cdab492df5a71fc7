//! Email parsing: MBOX boundary scanning, MIME decoding, header normalization
//! and content classification.

pub mod classify;
pub mod content_type;
pub mod decoder;
pub mod header;
pub mod mbox;
pub mod transfer;

use crate::error::DecodeError;
use crate::model::message::{PreparedMessage, RawMessageSpan};

use decoder::MessageDecoder;

/// Run one span through decode → normalize → classify.
pub fn prepare(
    span: &RawMessageSpan,
    decoder: &MessageDecoder,
) -> Result<PreparedMessage, DecodeError> {
    let parsed = decoder.decode(&span.raw)?;
    let envelope = header::normalize_envelope(&parsed.headers, span.separator_date());
    let parts = classify::classify(&parsed.root);
    Ok(PreparedMessage {
        envelope,
        parts,
        source_index: span.index,
    })
}
