//! Session Context projection and LLM-driven compaction.
//!
//! [`project`] is the pure function the rest of the system relies on to turn
//! a session's raw, append-only entries into the message list an adapter is
//! actually allowed to see (`SPEC_FULL.md` §4.2.4). [`compact`] is the only
//! thing that ever shrinks that view: it asks a caller-supplied summarizer
//! for a plain-text digest of everything before a chosen index and appends a
//! `compaction` marker recording the cut.
//!
//! Grounded on `querymt`'s `agent::session::compaction::SessionCompaction`
//! (`process`/`build_compaction_messages`/retry-wrapped LLM call), adapted so
//! the LLM call itself is injected by the caller rather than owned here —
//! this module has no adapter dependency, matching `SPEC_FULL.md` §9's
//! "pass a projector function into the Agent Loop rather than the
//! SessionStore" resolution for the Session/Agent cyclic-reference problem.

use super::{Session, SessionContext, SessionEntryKind, SessionStore, ThinkingLevel};
use crate::types::{ContentBlock, Context, Message, MessageRole, TextBlock};
use crate::{Error, Result};
use std::future::Future;

/// Prepended to a compaction summary when it is reintroduced as a message.
pub const SUMMARY_PREFIX: &str =
    "The conversation history above this point was compacted. Here is a summary of what happened:\n\n";

/// Appended after the summary, re-orienting the model to the live tail.
pub const SUMMARY_SUFFIX: &str =
    "\n\nContinue the conversation using the above summary as context for everything before it.";

/// Default prompt used to ask the model to summarize a prefix of a session.
pub const COMPACTION_PROMPT: &str = "Summarize the conversation above so it can replace this \
history. Focus on: what was done, what is currently in progress, what still needs to happen, \
and any constraints or preferences the user expressed that must persist. Be comprehensive but \
concise — this summary replaces everything above it.";

/// Builds the user-role message that stands in for a compacted prefix.
fn summary_message(summary: &str) -> Message {
    Message::new(
        MessageRole::User,
        vec![ContentBlock::Text(TextBlock::new(format!(
            "{SUMMARY_PREFIX}{summary}{SUMMARY_SUFFIX}"
        )))],
    )
}

/// Projects a session's raw entries into the view an adapter is handed.
///
/// Pure function of `entries` (`SPEC_FULL.md` §4.2.4 invariant): walks left
/// to right tracking the last-seen thinking level and model, finds the
/// latest `compaction` entry (if any), and returns either every message in
/// order (no compaction yet) or `[summary] ++ tail` (one or more
/// compactions, only the latest of which matters).
///
/// `model` is only updated by an explicit `model_change` entry, not inferred
/// from assistant messages: [`Message`] carries no provider/model/api
/// provenance of its own (only [`crate::types::AssistantMessage`] does, and
/// that is never itself stored), so the Agent Loop is responsible for
/// appending a `model_change` entry whenever the active model changes,
/// including on a session's very first turn.
pub fn project(entries: &[super::SessionEntry]) -> SessionContext {
    let mut thinking_level = ThinkingLevel::default();
    let mut model = None;
    let mut latest_compaction: Option<(usize, &super::CompactionEntryData)> = None;

    for (index, entry) in entries.iter().enumerate() {
        match &entry.kind {
            SessionEntryKind::ThinkingLevelChange(change) => thinking_level = change.level,
            SessionEntryKind::ModelChange(change) => {
                model = Some((
                    change.provider.clone(),
                    change.model.clone(),
                    change.api.clone(),
                ));
            }
            SessionEntryKind::Compaction(data) => latest_compaction = Some((index, data)),
            SessionEntryKind::SessionHeader(_) | SessionEntryKind::Message(_) => {}
        }
    }

    let messages = match latest_compaction {
        None => entries
            .iter()
            .filter_map(|entry| match &entry.kind {
                SessionEntryKind::Message(m) => Some(m.clone()),
                _ => None,
            })
            .collect(),
        Some((_, data)) => {
            let mut messages = vec![summary_message(&data.summary)];
            messages.extend(entries[data.first_kept_entry_index..].iter().filter_map(
                |entry| match &entry.kind {
                    SessionEntryKind::Message(m) => Some(m.clone()),
                    _ => None,
                },
            ));
            messages
        }
    };

    SessionContext {
        messages,
        thinking_level,
        model,
    }
}

/// Summarizes `session.entries()[0..first_kept_entry_index)` and appends a
/// `compaction` marker, via a caller-supplied `summarize` callback that
/// performs the actual LLM call (typically one adapter's `stream`, collected
/// to a final text).
///
/// On `summarize` failure, appends nothing: the session remains usable at
/// its previous state and the error is surfaced to the caller, per
/// `SPEC_FULL.md` §4.2.5's failure policy.
pub async fn compact<F, Fut>(
    store: &dyn SessionStore,
    session: &mut Session,
    first_kept_entry_index: usize,
    summarize: F,
) -> Result<()>
where
    F: FnOnce(Context) -> Fut,
    Fut: Future<Output = Result<String>>,
{
    if first_kept_entry_index == 0 || first_kept_entry_index > session.entries().len() {
        return Err(Error::invalid_input(format!(
            "first_kept_entry_index {first_kept_entry_index} out of range for a session with {} entries",
            session.entries().len()
        )));
    }
    if let Some((prior_index, _)) = session
        .entries()
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, e)| match &e.kind {
            SessionEntryKind::Compaction(_) => Some((i, ())),
            _ => None,
        })
    {
        if first_kept_entry_index <= prior_index {
            return Err(Error::invalid_input(
                "first_kept_entry_index must be strictly after the latest compaction",
            ));
        }
    }

    let prefix = &session.entries()[..first_kept_entry_index];
    let projected = project(prefix);
    let tokens_before = crate::context::estimate_tokens(&projected.messages) as u64;

    let context = Context::new(projected.messages).with_system_prompt(COMPACTION_PROMPT);
    let summary = summarize(context).await?;

    store
        .append(
            session,
            SessionEntryKind::Compaction(super::CompactionEntryData {
                summary,
                first_kept_entry_index,
                tokens_before,
            }),
        )
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{FileSessionStore, ModelChangeEntry, ThinkingLevelChangeEntry};
    use crate::types::Message;

    fn temp_store() -> (tempfile::TempDir, FileSessionStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FileSessionStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_project_no_compaction_returns_all_messages_in_order() {
        let (_dir, store) = temp_store();
        let mut session = store.create(std::path::Path::new("/work")).await.unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::user("hi")),
            )
            .await
            .unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        let projected = project(session.entries());
        assert_eq!(projected.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_project_tracks_thinking_level_and_model_change() {
        let (_dir, store) = temp_store();
        let mut session = store.create(std::path::Path::new("/work")).await.unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::ThinkingLevelChange(ThinkingLevelChangeEntry {
                    level: ThinkingLevel::High,
                }),
            )
            .await
            .unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::ModelChange(ModelChangeEntry {
                    provider: "anthropic".into(),
                    model: "claude-sonnet-4-5".into(),
                    api: "anthropic".into(),
                }),
            )
            .await
            .unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();

        let projected = project(session.entries());
        assert_eq!(projected.thinking_level, ThinkingLevel::High);
        assert_eq!(
            projected.model,
            Some((
                "anthropic".to_string(),
                "claude-sonnet-4-5".to_string(),
                "anthropic".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_compact_then_project_yields_summary_plus_tail() {
        let (_dir, store) = temp_store();
        let mut session = store.create(std::path::Path::new("/work")).await.unwrap();
        // header(0) + 4 user/assistant pairs = 9 entries total
        for i in 0..4 {
            store
                .append(
                    &mut session,
                    SessionEntryKind::Message(Message::user(format!("q{i}"))),
                )
                .await
                .unwrap();
            store
                .append(
                    &mut session,
                    SessionEntryKind::Message(Message::assistant(vec![])),
                )
                .await
                .unwrap();
        }
        assert_eq!(session.entries().len(), 9);

        compact(&store, &mut session, 5, |_ctx| async {
            Ok("did some things".to_string())
        })
        .await
        .unwrap();

        let projected = project(session.entries());
        // summary + entries[5..] messages (2 user/assistant pairs = 4 messages)
        assert_eq!(projected.messages.len(), 1 + 4);
        match &projected.messages[0].content[0] {
            ContentBlock::Text(t) => assert!(t.text.starts_with(SUMMARY_PREFIX)),
            _ => panic!("expected text block"),
        }
    }

    #[tokio::test]
    async fn test_compact_failure_appends_nothing() {
        let (_dir, store) = temp_store();
        let mut session = store.create(std::path::Path::new("/work")).await.unwrap();
        store
            .append(
                &mut session,
                SessionEntryKind::Message(Message::assistant(vec![])),
            )
            .await
            .unwrap();
        let before = session.entries().len();

        let result = compact(&store, &mut session, 1, |_ctx| async {
            Err(Error::api("summarizer unavailable"))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(session.entries().len(), before);
    }

    #[tokio::test]
    async fn test_compact_rejects_index_before_latest_compaction() {
        let (_dir, store) = temp_store();
        let mut session = store.create(std::path::Path::new("/work")).await.unwrap();
        for i in 0..4 {
            store
                .append(
                    &mut session,
                    SessionEntryKind::Message(Message::user(format!("q{i}"))),
                )
                .await
                .unwrap();
        }
        compact(&store, &mut session, 2, |_ctx| async { Ok("s1".to_string()) })
            .await
            .unwrap();

        let result = compact(&store, &mut session, 2, |_ctx| async { Ok("s2".to_string()) }).await;
        assert!(result.is_err());
    }
}
