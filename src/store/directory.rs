//! A file-backed mail store: one directory per message.
//!
//! ```text
//! root/
//!   categories.json
//!   .drafts/<id>/              staged, not yet moved
//!   <folder>/<id>/message.json
//!   <folder>/<id>/<attachment files>
//! ```

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SinkError;
use crate::model::address::{AddressList, EmailAddress};
use crate::parser::classify::sanitize_filename;
use crate::store::sink::{Field, Sink};
use crate::store::write_atomic;

const DRAFTS_DIR: &str = ".drafts";
const CATEGORIES_FILE: &str = "categories.json";
const MESSAGE_FILE: &str = "message.json";

/// Stores every migrated message as a directory holding `message.json` plus
/// its attachments.
pub struct DirectorySink {
    root: PathBuf,
    categories: BTreeSet<String>,
    next_id: u64,
    session: String,
}

/// A message being assembled in `root/.drafts/<id>/`.
#[derive(Debug)]
pub struct DraftHandle {
    id: String,
    dir: PathBuf,
    record: MessageRecord,
    committed: bool,
}

impl DraftHandle {
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// The JSON document written for each message.
#[derive(Debug, Default, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageRecord {
    pub subject: String,
    pub sender: EmailAddress,
    pub to: AddressList,
    pub cc: AddressList,
    pub categories: Vec<String>,
    pub body_html: Option<String>,
    pub body_text: Option<String>,
    pub attachments: Vec<AttachmentRecord>,
    pub sent_date: Option<DateTime<Utc>>,
    /// Sent date, or the commit time when the message has none.
    pub received: Option<DateTime<Utc>>,
}

/// Manifest entry for one attachment file stored next to `message.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentRecord {
    /// Name of the file inside the message directory.
    pub file: String,
    pub mime_type: String,
    pub content_id: Option<String>,
    pub inline: bool,
    pub size: u64,
}

impl DirectorySink {
    /// Open (or create) a store rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self, SinkError> {
        let root = root.as_ref().to_path_buf();
        let drafts = root.join(DRAFTS_DIR);
        fs::create_dir_all(&drafts).map_err(|e| SinkError::io(&drafts, e))?;

        let categories_path = root.join(CATEGORIES_FILE);
        let categories = match fs::read(&categories_path) {
            Ok(data) => serde_json::from_slice(&data).unwrap_or_else(|e| {
                warn!(path = %categories_path.display(), error = %e, "Ignoring unreadable category list");
                BTreeSet::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeSet::new(),
            Err(e) => return Err(SinkError::io(&categories_path, e)),
        };

        debug!(root = %root.display(), categories = categories.len(), "Opened directory store");
        Ok(Self {
            root,
            categories,
            next_id: 0,
            session: Utc::now().format("%Y%m%d%H%M%S%3f").to_string(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Categories known to the store, including ones from earlier runs.
    pub fn categories(&self) -> &BTreeSet<String> {
        &self.categories
    }

    fn save_categories(&self) -> Result<(), SinkError> {
        let path = self.root.join(CATEGORIES_FILE);
        let data = serde_json::to_vec_pretty(&self.categories).map_err(|e| SinkError::Rejected {
            operation: "ensure_category",
            reason: e.to_string(),
        })?;
        write_atomic(&path, &data).map_err(|e| SinkError::io(&path, e))
    }

    fn write_attachment(
        &self,
        handle: &DraftHandle,
        filename: &str,
        bytes: &[u8],
    ) -> Result<String, SinkError> {
        let mut name = sanitize_filename(filename);
        if name.is_empty() || name == MESSAGE_FILE {
            name = format!("attachment_{}", handle.record.attachments.len() + 1);
        }
        let path = unique_path(&handle.dir.join(&name));
        fs::write(&path, bytes).map_err(|e| SinkError::io(&path, e))?;
        Ok(path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or(name))
    }
}

impl Sink for DirectorySink {
    type Handle = DraftHandle;

    fn ensure_category(&mut self, name: &str) -> Result<(), SinkError> {
        if self.categories.insert(name.to_string()) {
            debug!(category = name, "Adding category");
            self.save_categories()?;
        }
        Ok(())
    }

    fn create_draft(&mut self) -> Result<DraftHandle, SinkError> {
        let drafts = self.root.join(DRAFTS_DIR);
        if !drafts.is_dir() {
            return Err(SinkError::Unavailable(format!(
                "staging directory '{}' is gone",
                drafts.display()
            )));
        }

        loop {
            self.next_id += 1;
            let id = format!("{}-{:06}", self.session, self.next_id);
            let dir = drafts.join(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    return Ok(DraftHandle {
                        id,
                        dir,
                        record: MessageRecord::default(),
                        committed: false,
                    })
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(SinkError::io(&dir, e)),
            }
        }
    }

    fn set_field(&mut self, handle: &mut DraftHandle, field: Field<'_>) -> Result<(), SinkError> {
        if handle.committed {
            return Err(SinkError::Rejected {
                operation: "set_field",
                reason: format!("draft {} is already committed", handle.id),
            });
        }

        let record = &mut handle.record;
        match field {
            Field::Subject(subject) => record.subject = subject.to_string(),
            Field::Sender { name, address } => {
                record.sender = EmailAddress {
                    display_name: name.to_string(),
                    address: address.to_string(),
                }
            }
            Field::Recipients(list) => record.to = list.clone(),
            Field::Cc(list) => record.cc = list.clone(),
            Field::Categories(labels) => record.categories = labels.iter().cloned().collect(),
            Field::BodyHtml(html) => record.body_html = Some(html.to_string()),
            Field::BodyText(text) => record.body_text = Some(text.to_string()),
            Field::Attachment {
                filename,
                content_id,
                mime_type,
                inline,
                bytes,
            } => {
                let file = self.write_attachment(handle, filename, bytes)?;
                handle.record.attachments.push(AttachmentRecord {
                    file,
                    mime_type: mime_type.to_string(),
                    content_id: content_id.map(str::to_string),
                    inline,
                    size: bytes.len() as u64,
                });
            }
        }
        Ok(())
    }

    fn commit(
        &mut self,
        handle: &mut DraftHandle,
        sent: Option<DateTime<Utc>>,
    ) -> Result<(), SinkError> {
        handle.record.sent_date = sent;
        handle.record.received = Some(sent.unwrap_or_else(Utc::now));

        let path = handle.dir.join(MESSAGE_FILE);
        let data = serde_json::to_vec_pretty(&handle.record).map_err(|e| SinkError::Rejected {
            operation: "commit",
            reason: e.to_string(),
        })?;
        fs::write(&path, data).map_err(|e| SinkError::io(&path, e))?;
        handle.committed = true;
        Ok(())
    }

    fn move_to(&mut self, handle: DraftHandle, folder: &str) -> Result<(), SinkError> {
        if !handle.committed {
            return Err(SinkError::Rejected {
                operation: "move_to",
                reason: format!("draft {} was never committed", handle.id),
            });
        }

        let folder_dir = self.root.join(folder_path(folder));
        let moved = fs::create_dir_all(&folder_dir)
            .map_err(|e| SinkError::io(&folder_dir, e))
            .and_then(|()| {
                let target = unique_path(&folder_dir.join(&handle.id));
                fs::rename(&handle.dir, &target).map_err(|e| SinkError::io(&target, e))
            });
        match moved {
            Ok(()) => {
                debug!(id = %handle.id, folder, "Moved message");
                Ok(())
            }
            Err(e) => {
                // The move failed, so the draft is abandoned
                self.discard(handle);
                Err(e)
            }
        }
    }

    fn discard(&mut self, handle: DraftHandle) {
        if let Err(e) = fs::remove_dir_all(&handle.dir) {
            warn!(id = %handle.id, error = %e, "Could not remove abandoned draft");
        }
    }
}

/// Folder name to relative path. `/` separates nested folders; each
/// segment is sanitized and empty or dot segments are dropped.
fn folder_path(folder: &str) -> PathBuf {
    let path: PathBuf = folder
        .split('/')
        .map(sanitize_filename)
        .filter(|segment| !segment.is_empty() && segment != DRAFTS_DIR)
        .collect();
    if path.as_os_str().is_empty() {
        PathBuf::from("Inbox")
    } else {
        path
    }
}

/// If `path` already exists, append a counter to make it unique.
fn unique_path(path: &Path) -> PathBuf {
    if !path.exists() {
        return path.to_path_buf();
    }

    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("file");
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let parent = path.parent().unwrap_or(Path::new("."));

    let mut i = 1u32;
    loop {
        let candidate = if ext.is_empty() {
            parent.join(format!("{stem}_{i}"))
        } else {
            parent.join(format!("{stem}_{i}.{ext}"))
        };
        if !candidate.exists() {
            return candidate;
        }
        i += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_record(dir: &Path) -> MessageRecord {
        let data = fs::read(dir.join(MESSAGE_FILE)).unwrap();
        serde_json::from_slice(&data).unwrap()
    }

    #[test]
    fn test_draft_lifecycle() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();

        let mut draft = sink.create_draft().unwrap();
        let id = draft.id().to_string();
        let to = AddressList::parse("Bob <bob@example.com>");
        sink.set_field(&mut draft, Field::Subject("Hello")).unwrap();
        sink.set_field(&mut draft, Field::Recipients(&to)).unwrap();
        sink.set_field(&mut draft, Field::BodyText("body")).unwrap();
        for _ in 0..2 {
            sink.set_field(
                &mut draft,
                Field::Attachment {
                    filename: "notes.txt",
                    content_id: None,
                    mime_type: "text/plain",
                    inline: false,
                    bytes: b"abc",
                },
            )
            .unwrap();
        }
        sink.commit(&mut draft, None).unwrap();
        sink.move_to(draft, "Gmail Archive").unwrap();

        let dir = tmp.path().join("Gmail Archive").join(&id);
        let record = read_record(&dir);
        assert_eq!(record.subject, "Hello");
        assert_eq!(record.to, to);
        assert_eq!(record.body_text.as_deref(), Some("body"));
        assert!(record.sent_date.is_none());
        assert!(record.received.is_some());

        let files: Vec<&str> = record.attachments.iter().map(|a| a.file.as_str()).collect();
        assert_eq!(files, vec!["notes.txt", "notes_1.txt"]);
        assert_eq!(fs::read(dir.join("notes_1.txt")).unwrap(), b"abc");
        assert!(!tmp.path().join(DRAFTS_DIR).join(&id).exists());
    }

    #[test]
    fn test_move_requires_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();
        let draft = sink.create_draft().unwrap();
        assert!(matches!(
            sink.move_to(draft, "Inbox"),
            Err(SinkError::Rejected { operation: "move_to", .. })
        ));
    }

    #[test]
    fn test_discard_removes_draft() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();
        let draft = sink.create_draft().unwrap();
        let dir = draft.dir.clone();
        assert!(dir.exists());
        sink.discard(draft);
        assert!(!dir.exists());
    }

    #[test]
    fn test_categories_persist() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut sink = DirectorySink::open(tmp.path()).unwrap();
            sink.ensure_category("Work").unwrap();
            sink.ensure_category("Inbox").unwrap();
            sink.ensure_category("Work").unwrap();
        }
        let sink = DirectorySink::open(tmp.path()).unwrap();
        let names: Vec<&str> = sink.categories().iter().map(String::as_str).collect();
        assert_eq!(names, vec!["Inbox", "Work"]);
    }

    #[test]
    fn test_categories_written_without_leftovers() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();
        sink.ensure_category("Work").unwrap();
        sink.ensure_category("Inbox").unwrap();

        let data = fs::read(tmp.path().join(CATEGORIES_FILE)).unwrap();
        let stored: Vec<String> = serde_json::from_slice(&data).unwrap();
        assert_eq!(stored, vec!["Inbox", "Work"]);
        assert!(!tmp.path().join("categories.json.tmp").exists());
    }

    #[test]
    fn test_failed_move_removes_draft() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();
        // A plain file where the folder should go
        fs::write(tmp.path().join("Archive"), b"in the way").unwrap();

        let mut draft = sink.create_draft().unwrap();
        sink.set_field(&mut draft, Field::Subject("Stuck")).unwrap();
        sink.commit(&mut draft, None).unwrap();
        let dir = draft.dir.clone();

        assert!(sink.move_to(draft, "Archive/2024").is_err());
        assert!(!dir.exists());
        assert!(fs::read_dir(tmp.path().join(DRAFTS_DIR)).unwrap().next().is_none());
    }

    #[test]
    fn test_missing_staging_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let mut sink = DirectorySink::open(tmp.path()).unwrap();
        fs::remove_dir_all(tmp.path().join(DRAFTS_DIR)).unwrap();
        let err = sink.create_draft().unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_folder_path() {
        assert_eq!(folder_path("Archive/2024"), PathBuf::from("Archive").join("2024"));
        assert_eq!(folder_path("../.."), PathBuf::from("Inbox"));
        assert_eq!(folder_path(""), PathBuf::from("Inbox"));
    }
}
