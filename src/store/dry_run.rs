//! A sink that accepts everything and writes nothing.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::error::SinkError;
use crate::store::sink::{Field, Sink};

/// Logs every call at debug level. Used by `migrate --dry-run`.
#[derive(Debug, Default)]
pub struct DryRunSink {
    next_id: u64,
    committed: u64,
    attachments: u64,
}

impl DryRunSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drafts that made it through `commit`.
    pub fn committed(&self) -> u64 {
        self.committed
    }

    pub fn attachments(&self) -> u64 {
        self.attachments
    }
}

impl Sink for DryRunSink {
    type Handle = u64;

    fn ensure_category(&mut self, name: &str) -> Result<(), SinkError> {
        debug!(category = name, "dry-run: ensure category");
        Ok(())
    }

    fn create_draft(&mut self) -> Result<u64, SinkError> {
        self.next_id += 1;
        Ok(self.next_id)
    }

    fn set_field(&mut self, handle: &mut u64, field: Field<'_>) -> Result<(), SinkError> {
        match field {
            Field::Subject(subject) => debug!(draft = *handle, subject, "dry-run: subject"),
            Field::Attachment {
                filename, bytes, ..
            } => {
                self.attachments += 1;
                debug!(draft = *handle, filename, size = bytes.len(), "dry-run: attachment");
            }
            other => debug!(draft = *handle, field = other.name(), "dry-run: set field"),
        }
        Ok(())
    }

    fn commit(&mut self, handle: &mut u64, sent: Option<DateTime<Utc>>) -> Result<(), SinkError> {
        self.committed += 1;
        debug!(draft = *handle, sent = ?sent, "dry-run: commit");
        Ok(())
    }

    fn move_to(&mut self, handle: u64, folder: &str) -> Result<(), SinkError> {
        debug!(draft = handle, folder, "dry-run: move");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_commits_and_attachments() {
        let mut sink = DryRunSink::new();
        let mut draft = sink.create_draft().unwrap();
        sink.set_field(&mut draft, Field::Subject("x")).unwrap();
        sink.set_field(
            &mut draft,
            Field::Attachment {
                filename: "a.bin",
                content_id: None,
                mime_type: "application/octet-stream",
                inline: false,
                bytes: &[0, 1],
            },
        )
        .unwrap();
        sink.commit(&mut draft, None).unwrap();
        sink.move_to(draft, "Inbox").unwrap();
        assert_eq!(sink.committed(), 1);
        assert_eq!(sink.attachments(), 1);
    }
}
