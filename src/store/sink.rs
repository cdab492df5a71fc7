//! The destination protocol a migration writes through.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};

use crate::error::SinkError;
use crate::model::address::AddressList;

/// One field set on a draft, borrowed from the message being written.
#[derive(Debug, Clone, Copy)]
pub enum Field<'a> {
    Subject(&'a str),
    Sender {
        name: &'a str,
        address: &'a str,
    },
    Recipients(&'a AddressList),
    Cc(&'a AddressList),
    /// Labels of the message, already registered with [`Sink::ensure_category`].
    Categories(&'a BTreeSet<String>),
    BodyHtml(&'a str),
    BodyText(&'a str),
    Attachment {
        filename: &'a str,
        content_id: Option<&'a str>,
        mime_type: &'a str,
        inline: bool,
        bytes: &'a [u8],
    },
}

impl Field<'_> {
    /// Short name used in logs and rejection messages.
    pub fn name(&self) -> &'static str {
        match self {
            Field::Subject(_) => "subject",
            Field::Sender { .. } => "sender",
            Field::Recipients(_) => "recipients",
            Field::Cc(_) => "cc",
            Field::Categories(_) => "categories",
            Field::BodyHtml(_) => "body_html",
            Field::BodyText(_) => "body_text",
            Field::Attachment { .. } => "attachment",
        }
    }
}

/// A destination mail store.
///
/// Per message the migrator calls `create_draft`, then `set_field` for every
/// field, then `commit` and finally `move_to`. A draft that fails half-way
/// is handed to `discard`.
pub trait Sink {
    /// Per-draft state owned by the caller between calls.
    type Handle;

    /// Make sure a category with this name exists in the store.
    fn ensure_category(&mut self, name: &str) -> Result<(), SinkError>;

    /// Start a new, empty message in a staging area.
    fn create_draft(&mut self) -> Result<Self::Handle, SinkError>;

    fn set_field(&mut self, handle: &mut Self::Handle, field: Field<'_>) -> Result<(), SinkError>;

    /// Persist the draft, stamping it with the original sent date when known.
    fn commit(
        &mut self,
        handle: &mut Self::Handle,
        sent: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError>;

    /// Move a committed draft into its final folder.
    fn move_to(&mut self, handle: Self::Handle, folder: &str) -> Result<(), SinkError>;

    /// Drop a draft that will not be completed.
    fn discard(&mut self, handle: Self::Handle) {
        drop(handle);
    }
}
