//! `mboxmigrate`: resumable migration of large MBOX archives into a mail store.
//!
//! This crate provides the core library for streaming an MBOX file one
//! message at a time, decoding each message into a normalized envelope and
//! content parts, and writing them to a destination [`store::sink::Sink`]
//! with a durable checkpoint so interrupted runs can resume.

pub mod config;
pub mod error;
pub mod migrate;
pub mod model;
pub mod parser;
pub mod store;
