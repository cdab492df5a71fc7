//! The migration loop: scan → prepare → write through a [`Sink`] → checkpoint.
//!
//! Messages are handled strictly one at a time. A message that cannot be
//! decoded or is refused by the sink is counted and skipped; the run only
//! stops early when the error budget is exhausted, the sink becomes
//! unavailable, or the per-run message limit is reached.

pub mod checkpoint;

use std::collections::HashSet;
use std::io::Read;
use std::time::{Duration, Instant};

use tracing::{debug, debug_span, info, trace, warn};

use crate::config::Config;
use crate::error::{FatalError, MessageError, Result, SinkError};
use crate::model::message::{ContentPart, PreparedMessage, RawMessageSpan};
use crate::parser::decoder::{MessageDecoder, DEFAULT_MAX_DEPTH};
use crate::parser::mbox::MboxScanner;
use crate::parser::prepare;
use crate::store::sink::{Field, Sink};

use checkpoint::CheckpointStore;

/// Tunables of one migration run.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationOptions {
    /// Destination folder every committed message is moved into.
    pub folder: String,
    /// Start from the stored checkpoint instead of the first message.
    pub resume: bool,
    /// Stop after attempting this many messages in this run.
    pub limit: Option<u64>,
    /// Commits between checkpoint writes; also the progress log interval.
    pub checkpoint_interval: u64,
    /// Abort once more than this many messages have failed.
    pub max_errors: u64,
    /// Messages between throttle pauses (0 disables throttling).
    pub throttle_every: u64,
    pub throttle_delay: Duration,
    pub max_mime_depth: usize,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            folder: "Gmail Archive".to_string(),
            resume: true,
            limit: None,
            checkpoint_interval: 100,
            max_errors: 500,
            throttle_every: 100,
            throttle_delay: Duration::from_millis(50),
            max_mime_depth: DEFAULT_MAX_DEPTH,
        }
    }
}

impl MigrationOptions {
    /// Options from the `[migration]` and `[performance]` config sections.
    pub fn from_config(config: &Config) -> Self {
        let m = &config.migration;
        Self {
            folder: m.default_folder.clone(),
            checkpoint_interval: m.checkpoint_interval.max(1),
            max_errors: m.max_errors,
            throttle_every: m.throttle_every,
            throttle_delay: Duration::from_millis(m.throttle_delay_ms),
            max_mime_depth: config.performance.max_mime_depth,
            ..Self::default()
        }
    }
}

/// Lifecycle of one source message.
///
/// `Pending → Prepared → Committed`, or `Failed` from either earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Prepared,
    Committed,
    Failed,
}

/// Outcome of [`Migrator::run`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MigrationSummary {
    /// Messages attempted in this run.
    pub processed: u64,
    pub committed: u64,
    pub failed: u64,
    /// Messages below the resume point that were passed over.
    pub skipped: u64,
    /// Resume point persisted at the end of the run.
    pub checkpoint: u64,
    /// Why the run stopped early, if it did.
    pub abort: Option<FatalError>,
    pub elapsed: Duration,
}

impl MigrationSummary {
    /// Messages per second over the whole run.
    pub fn rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.processed as f64 / secs
        } else {
            0.0
        }
    }
}

/// Drives a migration from an MBOX scanner into a [`Sink`].
pub struct Migrator<S: Sink, C: CheckpointStore> {
    options: MigrationOptions,
    categories: HashSet<String>,
    sink: S,
    checkpoint: C,
    decoder: MessageDecoder,
}

impl<S: Sink, C: CheckpointStore> Migrator<S, C> {
    /// `known_categories` are the category names the sink already has; only
    /// labels missing from this set are sent to [`Sink::ensure_category`].
    pub fn new(
        options: MigrationOptions,
        known_categories: HashSet<String>,
        sink: S,
        checkpoint: C,
    ) -> Self {
        let decoder = MessageDecoder::new().with_max_depth(options.max_mime_depth);
        Self {
            options,
            categories: known_categories,
            sink,
            checkpoint,
            decoder,
        }
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    /// Category names known after the run, including newly created ones.
    pub fn known_categories(&self) -> &HashSet<String> {
        &self.categories
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn checkpoint(&self) -> &C {
        &self.checkpoint
    }

    pub fn into_parts(self) -> (S, C, HashSet<String>) {
        (self.sink, self.checkpoint, self.categories)
    }

    /// Index of the first message this run will attempt.
    pub fn resume_point(&mut self) -> Result<u64> {
        if !self.options.resume {
            return Ok(0);
        }
        self.stored_checkpoint()
    }

    fn stored_checkpoint(&mut self) -> Result<u64> {
        Ok(self.checkpoint.load()?.unwrap_or(0))
    }

    /// Migrate every span the scanner yields from the resume point onwards.
    ///
    /// `progress` receives `(bytes_scanned, messages_processed)` after each
    /// message. Message-level failures never surface here; an `Err` means
    /// the source or the checkpoint could not be read or written.
    pub fn run<R: Read>(
        &mut self,
        scanner: MboxScanner<'_, R>,
        progress: Option<&dyn Fn(u64, u64)>,
    ) -> Result<MigrationSummary> {
        let started = Instant::now();
        // The stored value never goes down, even when this run starts over
        let stored = self.stored_checkpoint()?;
        let resume = if self.options.resume { stored } else { 0 };
        if resume > 0 {
            info!(resume, "Resuming from checkpoint");
        } else if stored > 0 {
            info!(stored, "Starting from the first message, keeping stored checkpoint");
        }

        let mut scanner = scanner.skip_to(resume);
        let mut summary = MigrationSummary::default();
        let mut checkpoint = stored;
        let mut unsaved_commits = 0u64;

        loop {
            if let Some(limit) = self.options.limit {
                if summary.processed >= limit {
                    info!(limit, "Message limit reached");
                    break;
                }
            }

            let span = match scanner.next() {
                Some(Ok(span)) => span,
                Some(Err(e)) => {
                    self.save_checkpoint(checkpoint)?;
                    return Err(e);
                }
                None => break,
            };
            if span.index < resume {
                continue;
            }

            summary.processed += 1;
            let index = span.index;
            let state = {
                let _guard = debug_span!("message", index).entered();
                let mut state = MessageState::Pending;
                match self.migrate_one(&span, &mut state) {
                    Ok(()) => state,
                    Err(e) => {
                        warn!(index, stage = ?state, error = %e, "Message failed");
                        if let MessageError::Sink(SinkError::Unavailable(reason)) = &e {
                            summary.abort = Some(FatalError::SinkUnavailable(reason.clone()));
                        }
                        MessageState::Failed
                    }
                }
            };

            match state {
                MessageState::Committed => {
                    summary.committed += 1;
                    checkpoint = checkpoint.max(index + 1);
                    unsaved_commits += 1;
                    if unsaved_commits >= self.options.checkpoint_interval {
                        self.save_checkpoint(checkpoint)?;
                        unsaved_commits = 0;
                    }
                }
                _ => summary.failed += 1,
            }

            if let Some(cb) = progress {
                cb(scanner.position(), summary.processed);
            }

            if summary.processed % self.options.checkpoint_interval.max(1) == 0 {
                let elapsed = started.elapsed().as_secs_f64();
                info!(
                    processed = summary.processed,
                    committed = summary.committed,
                    failed = summary.failed,
                    rate = %format!("{:.1}/s", summary.processed as f64 / elapsed.max(f64::EPSILON)),
                    "Progress"
                );
            }

            if summary.abort.is_some() {
                break;
            }
            if summary.failed > self.options.max_errors {
                summary.abort = Some(FatalError::TooManyErrors {
                    count: summary.failed,
                });
                break;
            }

            if self.options.throttle_every > 0
                && summary.processed % self.options.throttle_every == 0
                && !self.options.throttle_delay.is_zero()
            {
                trace!(delay_ms = self.options.throttle_delay.as_millis() as u64, "Throttling");
                std::thread::sleep(self.options.throttle_delay);
            }
        }

        self.save_checkpoint(checkpoint)?;

        summary.skipped = scanner.skipped();
        summary.checkpoint = checkpoint;
        summary.elapsed = started.elapsed();

        match &summary.abort {
            Some(reason) => warn!(
                error = %reason,
                committed = summary.committed,
                checkpoint,
                "Migration aborted"
            ),
            None => info!(
                processed = summary.processed,
                committed = summary.committed,
                failed = summary.failed,
                checkpoint,
                "Migration finished"
            ),
        }
        Ok(summary)
    }

    /// Decode one span and push it through the sink protocol.
    fn migrate_one(
        &mut self,
        span: &RawMessageSpan,
        state: &mut MessageState,
    ) -> std::result::Result<(), MessageError> {
        let message = prepare(span, &self.decoder)?;
        *state = MessageState::Prepared;
        debug!(
            subject = %message.envelope.subject,
            parts = message.parts.len(),
            "Prepared message"
        );

        self.register_categories(&message)?;

        let mut draft = self.sink.create_draft()?;
        if let Err(e) = self.write_draft(&mut draft, &message) {
            self.sink.discard(draft);
            return Err(e.into());
        }
        self.sink.move_to(draft, &self.options.folder)?;
        *state = MessageState::Committed;
        Ok(())
    }

    /// Create categories for labels the sink does not know yet.
    fn register_categories(
        &mut self,
        message: &PreparedMessage,
    ) -> std::result::Result<(), MessageError> {
        for label in &message.envelope.labels {
            if !self.categories.contains(label) {
                self.sink.ensure_category(label)?;
                self.categories.insert(label.clone());
            }
        }
        Ok(())
    }

    fn write_draft(
        &mut self,
        draft: &mut S::Handle,
        message: &PreparedMessage,
    ) -> std::result::Result<(), SinkError> {
        let env = &message.envelope;
        self.sink.set_field(draft, Field::Subject(&env.subject))?;
        self.sink.set_field(
            draft,
            Field::Sender {
                name: &env.sender_name,
                address: &env.sender_address,
            },
        )?;
        self.sink.set_field(draft, Field::Recipients(&env.recipients))?;
        self.sink.set_field(draft, Field::Cc(&env.cc))?;
        if !env.labels.is_empty() {
            self.sink.set_field(draft, Field::Categories(&env.labels))?;
        }

        // HTML wins over plain text when both exist
        if let Some(html) = message.body_html() {
            self.sink.set_field(draft, Field::BodyHtml(&html))?;
        } else if let Some(text) = message.body_text() {
            self.sink.set_field(draft, Field::BodyText(&text))?;
        }

        for part in &message.parts {
            if let ContentPart::Attachment {
                filename,
                content_id,
                mime_type,
                inline,
                bytes,
            } = part
            {
                self.sink.set_field(
                    draft,
                    Field::Attachment {
                        filename,
                        content_id: content_id.as_deref(),
                        mime_type,
                        inline: *inline,
                        bytes,
                    },
                )?;
            }
        }

        self.sink.commit(draft, env.sent_date)
    }

    fn save_checkpoint(&mut self, value: u64) -> Result<()> {
        self.checkpoint.save(value)?;
        debug!(checkpoint = value, "Checkpoint persisted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::checkpoint::MemoryCheckpoint;
    use crate::store::dry_run::DryRunSink;

    fn mbox_of(count: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for i in 0..count {
            out.extend_from_slice(
                format!(
                    "From a@b.com Thu Jan  4 10:00:00 2024\nFrom: a@b.com\nSubject: m{i}\n\nbody {i}\n\n"
                )
                .as_bytes(),
            );
        }
        out
    }

    fn options() -> MigrationOptions {
        MigrationOptions {
            throttle_every: 0,
            checkpoint_interval: 10,
            ..MigrationOptions::default()
        }
    }

    #[test]
    fn test_migrates_everything() {
        let data = mbox_of(25);
        let mut migrator = Migrator::new(
            options(),
            HashSet::new(),
            DryRunSink::new(),
            MemoryCheckpoint::default(),
        );
        let summary = migrator.run(MboxScanner::new(&data[..]), None).unwrap();
        assert_eq!(summary.processed, 25);
        assert_eq!(summary.committed, 25);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.checkpoint, 25);
        assert!(summary.abort.is_none());
        assert_eq!(migrator.checkpoint().history, vec![10, 20, 25]);
        assert_eq!(migrator.sink().committed(), 25);
    }

    #[test]
    fn test_limit_counts_attempted_messages() {
        let data = mbox_of(25);
        let mut migrator = Migrator::new(
            MigrationOptions {
                limit: Some(7),
                ..options()
            },
            HashSet::new(),
            DryRunSink::new(),
            MemoryCheckpoint::starting_at(3),
        );
        let summary = migrator.run(MboxScanner::new(&data[..]), None).unwrap();
        assert_eq!(summary.processed, 7);
        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.checkpoint, 10);
    }

    #[test]
    fn test_no_resume_ignores_checkpoint() {
        let data = mbox_of(5);
        let mut migrator = Migrator::new(
            MigrationOptions {
                resume: false,
                ..options()
            },
            HashSet::new(),
            DryRunSink::new(),
            MemoryCheckpoint::starting_at(4),
        );
        let summary = migrator.run(MboxScanner::new(&data[..]), None).unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.checkpoint, 5);
    }

    #[test]
    fn test_no_resume_never_lowers_checkpoint() {
        let data = mbox_of(5);
        let mut migrator = Migrator::new(
            MigrationOptions {
                resume: false,
                checkpoint_interval: 2,
                ..options()
            },
            HashSet::new(),
            DryRunSink::new(),
            MemoryCheckpoint::starting_at(100),
        );
        let summary = migrator.run(MboxScanner::new(&data[..]), None).unwrap();
        assert_eq!(summary.processed, 5);
        assert_eq!(summary.committed, 5);
        assert_eq!(summary.checkpoint, 100);
        assert_eq!(migrator.checkpoint().value, Some(100));
        assert!(migrator.checkpoint().history.iter().all(|&v| v == 100));
    }

    #[test]
    fn test_progress_callback() {
        let data = mbox_of(3);
        let calls = std::cell::RefCell::new(Vec::new());
        let cb = |bytes: u64, processed: u64| calls.borrow_mut().push((bytes, processed));
        let mut migrator = Migrator::new(
            options(),
            HashSet::new(),
            DryRunSink::new(),
            MemoryCheckpoint::default(),
        );
        migrator.run(MboxScanner::new(&data[..]), Some(&cb)).unwrap();
        let calls = calls.into_inner();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].1, 3);
        assert!(calls.windows(2).all(|w| w[0].0 <= w[1].0));
    }

    #[test]
    fn test_options_from_config() {
        let mut config = Config::default();
        config.migration.default_folder = "Archive".to_string();
        config.migration.throttle_delay_ms = 0;
        let opts = MigrationOptions::from_config(&config);
        assert_eq!(opts.folder, "Archive");
        assert!(opts.throttle_delay.is_zero());
        assert!(opts.resume);
    }
}
