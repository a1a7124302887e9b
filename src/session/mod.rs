//! Append-only, branchable session storage.
//!
//! A session is a `.jsonl` file: one [`SessionEntry`] per line, written only
//! by appending. Nothing is ever rewritten in place, which keeps concurrent
//! readers safe (a reader may see a truncated last line and must tolerate it)
//! and makes crash recovery trivial (the partial tail line is simply
//! discarded on reopen).
//!
//! Grounded on the trait-based repository architecture in
//! `querymt`'s `agent::session::store::SessionStore`, adapted from a
//! SQL-backed store to the flat-file format this system requires.

pub mod compaction;

use crate::types::Message;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::fs;
use tokio::io::AsyncWriteExt;

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Reasoning-effort level attached to a session at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    /// No extended thinking requested.
    Off,
    /// Low reasoning effort.
    Low,
    /// Medium reasoning effort.
    Medium,
    /// High reasoning effort.
    High,
}

impl Default for ThinkingLevel {
    fn default() -> Self {
        ThinkingLevel::Off
    }
}

/// First entry of every session file, always at index 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    /// Unique id for this session (a fresh uuid per session, including
    /// branches).
    pub id: String,
    /// When this session was created, RFC 3339.
    pub timestamp: String,
    /// Working directory this session belongs to, used for
    /// [`FileSessionStore::continue_recent`] and directory placement.
    pub cwd: String,
    /// For a branched session, the parent session file's path.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branched_from: Option<String>,
}

/// A thinking-level change recorded mid-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingLevelChangeEntry {
    /// The new level.
    pub level: ThinkingLevel,
}

/// A model change recorded mid-session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelChangeEntry {
    /// Newly selected provider name.
    pub provider: String,
    /// Newly selected model id.
    pub model: String,
    /// Newly selected adapter api.
    pub api: String,
}

/// A compaction marker, appended by [`compaction::compact`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionEntryData {
    /// Plain-text summary of everything before `first_kept_entry_index`.
    pub summary: String,
    /// Index into the session's entry list of the first entry still kept
    /// verbatim in the projected context.
    pub first_kept_entry_index: usize,
    /// Estimated token count of the entries being summarized away, recorded
    /// for telemetry/debugging.
    pub tokens_before: u64,
}

/// The tagged union of everything that can appear as one line of a session
/// file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEntryKind {
    /// The session header; always entry 0.
    SessionHeader(SessionHeader),
    /// A conversation message.
    Message(Message),
    /// A thinking-level change.
    ThinkingLevelChange(ThinkingLevelChangeEntry),
    /// A model change.
    ModelChange(ModelChangeEntry),
    /// A compaction marker.
    Compaction(CompactionEntryData),
}

/// One line of a session file: a timestamped [`SessionEntryKind`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEntry {
    /// RFC 3339 timestamp for when this entry was appended.
    pub timestamp: String,
    /// The entry's payload.
    #[serde(flatten)]
    pub kind: SessionEntryKind,
}

impl SessionEntry {
    fn new(kind: SessionEntryKind) -> Self {
        Self {
            timestamp: now_rfc3339(),
            kind,
        }
    }
}

/// The derived, LLM-visible view of a session: never the raw entries
/// themselves (see [`compaction::project`]).
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    /// The conversation the model should see, oldest first.
    pub messages: Vec<Message>,
    /// Reasoning-effort level in effect at the end of the entry list.
    pub thinking_level: ThinkingLevel,
    /// `(provider, model, api)` in effect at the end of the entry list, if
    /// any assistant message or explicit model change has occurred yet.
    pub model: Option<(String, String, String)>,
}

/// Summary metadata for one session file, as returned by
/// [`SessionStore::list_sessions`] without parsing the whole file.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    /// Path to the session file.
    pub path: PathBuf,
    /// The session's header (always readable without parsing the rest).
    pub header: SessionHeader,
    /// Last-modified time of the file, used for recency ordering.
    pub modified: std::time::SystemTime,
}

/// An in-memory handle on one session: the entries accumulated so far, and
/// whether they have been flushed to disk yet.
///
/// Only one [`FileSessionStore`] handle should own a given `Session` at a
/// time; nothing in this type itself enforces that (see `SPEC_FULL.md` §3
/// "Ownership").
#[derive(Debug, Clone)]
pub struct Session {
    path: PathBuf,
    cwd: PathBuf,
    entries: Vec<SessionEntry>,
    flushed: bool,
}

impl Session {
    /// Returns the session's id (from its header).
    pub fn id(&self) -> &str {
        match &self.header().kind {
            SessionEntryKind::SessionHeader(h) => &h.id,
            _ => unreachable!("entry 0 is always a SessionHeader"),
        }
    }

    /// Returns the header entry (always present, always at index 0).
    pub fn header(&self) -> &SessionEntry {
        &self.entries[0]
    }

    /// Returns every entry in append order.
    pub fn entries(&self) -> &[SessionEntry] {
        &self.entries
    }

    /// Returns the file path this session will be (or already is) persisted
    /// at.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns `true` once the header and all entries so far have been
    /// written to disk at least once.
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }
}

/// Async trait for session persistence.
///
/// Modeled on `querymt`'s `SessionStore` trait shape, but backed by
/// append-only `.jsonl` files per `SPEC_FULL.md` §4.2.1 rather than SQL.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Creates a new session for `cwd`. The header is *not* written to disk
    /// yet (see `SPEC_FULL.md` §4.2.2's lazy-flush policy); nothing appears
    /// on disk until the first assistant message is appended.
    async fn create(&self, cwd: &Path) -> Result<Session>;

    /// Opens the most recently modified session file for `cwd`, or creates a
    /// new one if none exists.
    async fn continue_recent(&self, cwd: &Path) -> Result<Session>;

    /// Reads an existing session file in full.
    async fn open(&self, path: &Path) -> Result<Session>;

    /// Lists sessions under `cwd`, most recently modified first, reading
    /// only each file's header line.
    async fn list_sessions(&self, cwd: &Path) -> Result<Vec<SessionSummary>>;

    /// Appends one entry. Performs the lazy header+backlog flush on the
    /// first assistant message; appends a single line otherwise.
    async fn append(&self, session: &mut Session, kind: SessionEntryKind) -> Result<()>;

    /// Creates a new session whose entries are a copy of
    /// `session.entries()[0..branch_before_index)`, with a fresh id and
    /// `branched_from` set to `session`'s path. Does not modify `session`.
    async fn branch(&self, session: &Session, branch_before_index: usize) -> Result<Session>;
}

/// Encodes a cwd into one filesystem-safe path segment.
///
/// Every literal `-` already present in the path is doubled first (so it
/// reads as "a real dash"), then every path separator becomes a single `-`
/// (so it reads as "a directory boundary"). The result is deterministic and
/// collision-resistant in practice, but is a one-way key: it is never
/// decoded back into a path.
fn encode_cwd(cwd: &Path) -> String {
    let raw = cwd.to_string_lossy();
    let escaped = raw.replace('-', "--");
    escaped.replace(['/', '\\'], "-")
}

/// `.jsonl`-backed [`SessionStore`] rooted at `<agent_dir>/sessions/`.
pub struct FileSessionStore {
    agent_dir: PathBuf,
}

impl FileSessionStore {
    /// Creates a store rooted at `agent_dir` (the directory's `sessions/`
    /// subdirectory is created lazily on first flush).
    pub fn new(agent_dir: impl Into<PathBuf>) -> Self {
        Self {
            agent_dir: agent_dir.into(),
        }
    }

    fn sessions_dir(&self, cwd: &Path) -> PathBuf {
        self.agent_dir.join("sessions").join(encode_cwd(cwd))
    }

    fn new_session_filename() -> String {
        let millis = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        format!("{millis}_{}.jsonl", uuid::Uuid::new_v4())
    }

    async fn read_all_entries(path: &Path) -> Result<Vec<SessionEntry>> {
        let contents = fs::read_to_string(path)
            .await
            .map_err(|e| Error::session_persistence(format!("reading {path:?}: {e}")))?;
        let mut entries = Vec::new();
        for line in contents.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SessionEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(_) => continue, // tolerate a truncated/malformed tail line
            }
        }
        Ok(entries)
    }

    async fn flush_all(path: &Path, entries: &[SessionEntry]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::session_persistence(format!("creating {parent:?}: {e}")))?;
        }
        let mut body = String::new();
        for entry in entries {
            let line = serde_json::to_string(entry)?;
            body.push_str(&line);
            body.push('\n');
        }
        fs::write(path, body)
            .await
            .map_err(|e| Error::session_persistence(format!("writing {path:?}: {e}")))?;
        Ok(())
    }

    async fn append_line(path: &Path, entry: &SessionEntry) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::session_persistence(format!("opening {path:?}: {e}")))?;
        let line = serde_json::to_string(entry)?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| Error::session_persistence(format!("appending {path:?}: {e}")))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| Error::session_persistence(format!("appending {path:?}: {e}")))?;
        Ok(())
    }

    fn is_assistant_message(kind: &SessionEntryKind) -> bool {
        matches!(
            kind,
            SessionEntryKind::Message(m) if m.role == crate::types::MessageRole::Assistant
        )
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn create(&self, cwd: &Path) -> Result<Session> {
        let header = SessionHeader {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now_rfc3339(),
            cwd: cwd.to_string_lossy().into_owned(),
            branched_from: None,
        };
        let path = self.sessions_dir(cwd).join(Self::new_session_filename());
        Ok(Session {
            path,
            cwd: cwd.to_path_buf(),
            entries: vec![SessionEntry::new(SessionEntryKind::SessionHeader(header))],
            flushed: false,
        })
    }

    async fn continue_recent(&self, cwd: &Path) -> Result<Session> {
        let dir = self.sessions_dir(cwd);
        let mut newest: Option<(PathBuf, std::time::SystemTime)> = None;
        if let Ok(mut read_dir) = fs::read_dir(&dir).await {
            while let Ok(Some(entry)) = read_dir.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                    continue;
                }
                if let Ok(meta) = entry.metadata().await {
                    if let Ok(modified) = meta.modified() {
                        let is_newer = match &newest {
                            Some((_, m)) => modified > *m,
                            None => true,
                        };
                        if is_newer {
                            newest = Some((path, modified));
                        }
                    }
                }
            }
        }
        match newest {
            Some((path, _)) => self.open(&path).await,
            None => self.create(cwd).await,
        }
    }

    async fn open(&self, path: &Path) -> Result<Session> {
        let entries = Self::read_all_entries(path).await?;
        if entries.is_empty() {
            return Err(Error::session_persistence(format!(
                "{path:?} has no entries"
            )));
        }
        let SessionEntryKind::SessionHeader(header) = &entries[0].kind else {
            return Err(Error::session_persistence(format!(
                "{path:?} does not begin with a session header"
            )));
        };
        let cwd = PathBuf::from(&header.cwd);
        Ok(Session {
            path: path.to_path_buf(),
            cwd,
            entries,
            flushed: true,
        })
    }

    async fn list_sessions(&self, cwd: &Path) -> Result<Vec<SessionSummary>> {
        let dir = self.sessions_dir(cwd);
        let mut summaries = Vec::new();
        let mut read_dir = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(_) => return Ok(summaries), // no sessions yet for this cwd
        };
        while let Ok(Some(entry)) = read_dir.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            let Ok(modified) = meta.modified() else {
                continue;
            };
            let Ok(contents) = fs::read_to_string(&path).await else {
                continue;
            };
            let Some(first_line) = contents.lines().next() else {
                continue;
            };
            let Ok(header_entry) = serde_json::from_str::<SessionEntry>(first_line) else {
                continue;
            };
            let SessionEntryKind::SessionHeader(header) = header_entry.kind else {
                continue;
            };
            summaries.push(SessionSummary {
                path,
                header,
                modified,
            });
        }
        summaries.sort_by(|a, b| b.modified.cmp(&a.modified));
        Ok(summaries)
    }

    async fn append(&self, session: &mut Session, kind: SessionEntryKind) -> Result<()> {
        let triggers_flush = !session.flushed && Self::is_assistant_message(&kind);
        let entry = SessionEntry::new(kind);
        session.entries.push(entry.clone());

        if session.flushed {
            Self::append_line(&session.path, &entry).await?;
        } else if triggers_flush {
            Self::flush_all(&session.path, &session.entries).await?;
            session.flushed = true;
        }
        // else: buffered in memory only, per the lazy-flush policy.
        Ok(())
    }

    async fn branch(&self, session: &Session, branch_before_index: usize) -> Result<Session> {
        let kept = &session.entries[..branch_before_index.min(session.entries.len())];
        let mut entries: Vec<SessionEntry> = kept.to_vec();
        if let Some(first) = entries.first_mut() {
            if let SessionEntryKind::SessionHeader(header) = &mut first.kind {
                header.id = uuid::Uuid::new_v4().to_string();
                header.branched_from = Some(session.path.to_string_lossy().into_owned());
            }
        }
        let path = self
            .sessions_dir(&session.cwd)
            .join(Self::new_session_filename());
        Ok(Session {
            path,
            cwd: session.cwd.clone(),
            entries,
            flushed: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Message;

    fn temp_agent_dir() -> tempfile::TempDir {
        tempfile::tempdir().expect("tempdir")
    }

    #[test]
    fn test_encode_cwd_replaces_separators() {
        let encoded = encode_cwd(Path::new("/Users/alice/project"));
        assert!(!encoded.contains('/'));
        assert_eq!(encoded, "-Users-alice-project");
    }

    #[test]
    fn test_encode_cwd_escapes_literal_dash() {
        let encoded = encode_cwd(Path::new("/my-repo/sub"));
        assert_eq!(encoded, "-my--repo-sub");
    }

    #[tokio::test]
    async fn test_create_does_not_write_until_first_assistant_message() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let session = store.create(cwd).await.unwrap();
        assert!(!session.is_flushed());
        assert!(!session.path().exists());
    }

    #[tokio::test]
    async fn test_lazy_flush_on_first_assistant_message() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let mut session = store.create(cwd).await.unwrap();

        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::user("hi")),
            )
            .await
            .unwrap();
        assert!(!session.is_flushed());
        assert!(!session.path().exists());

        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();
        assert!(session.is_flushed());
        assert!(session.path().exists());

        let reopened = store.open(session.path()).await.unwrap();
        assert_eq!(reopened.entries().len(), 3); // header + user + assistant
    }

    #[tokio::test]
    async fn test_append_after_flush_is_a_single_line_append() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let mut session = store.create(cwd).await.unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::user("more")),
            )
            .await
            .unwrap();
        let reopened = store.open(session.path()).await.unwrap();
        assert_eq!(reopened.entries().len(), 3);
    }

    #[tokio::test]
    async fn test_continue_recent_picks_most_recently_modified() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");

        let mut first = store.create(cwd).await.unwrap();
        store
            .append(
                &mut first,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let mut second = store.create(cwd).await.unwrap();
        store
            .append(
                &mut second,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        let resumed = store.continue_recent(cwd).await.unwrap();
        assert_eq!(resumed.path(), second.path());
    }

    #[tokio::test]
    async fn test_continue_recent_creates_when_none_exist() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let session = store.continue_recent(cwd).await.unwrap();
        assert!(!session.is_flushed());
    }

    #[tokio::test]
    async fn test_branch_copies_prefix_with_fresh_header() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let mut session = store.create(cwd).await.unwrap();
        for _ in 0..3 {
            store
                .append(
                    &mut session,
                    SessionEntryKind::Message(Message::assistant(vec![])),
                )
                .await
                .unwrap();
        }
        assert_eq!(session.entries().len(), 4); // header + 3 assistant messages

        let branched = store.branch(&session, 3).await.unwrap();
        assert_eq!(branched.entries().len(), 3);
        assert_ne!(branched.id(), session.id());

        let parent_before = fs::read_to_string(session.path()).await.unwrap();
        store
            .append(
                &mut branched.clone(),
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();
        let parent_after = fs::read_to_string(session.path()).await.unwrap();
        assert_eq!(parent_before, parent_after);
    }

    #[tokio::test]
    async fn test_list_sessions_sorted_most_recent_first() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");

        let mut a = store.create(cwd).await.unwrap();
        store
            .append(
                &mut a,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let mut b = store.create(cwd).await.unwrap();
        store
            .append(
                &mut b,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        let summaries = store.list_sessions(cwd).await.unwrap();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].path, b.path());
    }

    #[tokio::test]
    async fn test_open_tolerates_truncated_tail_line() {
        let dir = temp_agent_dir();
        let store = FileSessionStore::new(dir.path());
        let cwd = Path::new("/work/proj");
        let mut session = store.create(cwd).await.unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(session.path())
            .await
            .unwrap();
        file.write_all(b"{\"timestamp\":\"trunc").await.unwrap();

        let reopened = store.open(session.path()).await.unwrap();
        assert_eq!(reopened.entries().len(), 2);
    }
}
