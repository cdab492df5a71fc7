//! Core data model types for spans, decoded messages, envelopes and content parts.

pub mod address;
pub mod message;
