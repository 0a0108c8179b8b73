//! Session history stores.
//!
//! The gateway reads a session's past messages to build context and appends
//! each completed exchange. Neither direction is allowed to fail a request:
//! callers log [`HistoryError`]s and carry on without history.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sluice_abstraction::ChatMessage;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Errors from a history store.
#[derive(Debug, Error)]
pub enum HistoryError {
    /// The store cannot be reached.
    #[error("history store unavailable: {0}")]
    Unavailable(String),

    /// The session id cannot be used as a storage key.
    #[error("invalid session id '{0}'")]
    InvalidSession(String),

    /// IO error
    #[error("history IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persistence for per-session conversation history.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Loads up to `limit` most recent messages of a session, oldest first.
    ///
    /// An unknown session yields an empty list.
    async fn load_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, HistoryError>;

    /// Appends one message to a session.
    async fn append_message(&self, session_id: &str, message: ChatMessage) -> Result<(), HistoryError>;
}

fn tail(mut messages: Vec<ChatMessage>, limit: usize) -> Vec<ChatMessage> {
    let start = messages.len().saturating_sub(limit);
    messages.drain(..start);
    messages
}

/// History kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryHistoryStore {
    sessions: RwLock<HashMap<String, Vec<ChatMessage>>>,
}

impl InMemoryHistoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages stored for a session.
    pub fn message_count(&self, session_id: &str) -> usize {
        self.sessions.read().get(session_id).map_or(0, Vec::len)
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistoryStore {
    async fn load_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, HistoryError> {
        let messages = self.sessions.read().get(session_id).cloned().unwrap_or_default();
        Ok(tail(messages, limit))
    }

    async fn append_message(&self, session_id: &str, message: ChatMessage) -> Result<(), HistoryError> {
        self.sessions.write().entry(session_id.to_string()).or_default().push(message);
        Ok(())
    }
}

/// One line of a `messages.jsonl` file.
#[derive(Debug, Serialize, Deserialize)]
struct StoredMessage {
    role: String,
    content: String,
    timestamp: DateTime<Utc>,
}

/// History persisted as `<root>/<session_id>/messages.jsonl`, one message per line.
#[derive(Debug)]
pub struct JsonlHistoryStore {
    root: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonlHistoryStore {
    /// Creates a store rooted at `root`; directories are created on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), write_lock: tokio::sync::Mutex::new(()) }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn messages_path(&self, session_id: &str) -> Result<PathBuf, HistoryError> {
        let valid = !session_id.is_empty()
            && session_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && session_id != "."
            && session_id != "..";
        if !valid {
            return Err(HistoryError::InvalidSession(session_id.to_string()));
        }
        Ok(self.root.join(session_id).join("messages.jsonl"))
    }
}

#[async_trait]
impl HistoryStore for JsonlHistoryStore {
    async fn load_history(&self, session_id: &str, limit: usize) -> Result<Vec<ChatMessage>, HistoryError> {
        let path = self.messages_path(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredMessage>(line) {
                Ok(stored) => messages.push(ChatMessage::new(stored.role, stored.content)),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        line = line_num + 1,
                        error = %e,
                        "Skipping malformed history line"
                    );
                }
            }
        }

        debug!(session_id, loaded = messages.len(), "Loaded session history");
        Ok(tail(messages, limit))
    }

    async fn append_message(&self, session_id: &str, message: ChatMessage) -> Result<(), HistoryError> {
        let path = self.messages_path(session_id)?;
        let record = StoredMessage { role: message.role, content: message.content, timestamp: Utc::now() };
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new().create(true).append(true).open(&path).await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_in_memory_round_trip_and_limit() {
        let store = InMemoryHistoryStore::new();
        for i in 0..5 {
            store.append_message("s1", ChatMessage::user(format!("m{i}"))).await.unwrap();
        }

        let last_two = store.load_history("s1", 2).await.unwrap();
        assert_eq!(last_two, vec![ChatMessage::user("m3"), ChatMessage::user("m4")]);
        assert!(store.load_history("unknown", 10).await.unwrap().is_empty());
        assert_eq!(store.message_count("s1"), 5);
    }

    #[tokio::test]
    async fn test_jsonl_round_trip() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path());

        store.append_message("session-1", ChatMessage::user("Hi")).await.unwrap();
        store.append_message("session-1", ChatMessage::assistant("Hello!")).await.unwrap();

        let history = store.load_history("session-1", 50).await.unwrap();
        assert_eq!(history, vec![ChatMessage::user("Hi"), ChatMessage::assistant("Hello!")]);
        assert!(temp.path().join("session-1").join("messages.jsonl").exists());
    }

    #[tokio::test]
    async fn test_jsonl_missing_session_is_empty() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path());
        assert!(store.load_history("nobody", 50).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_jsonl_skips_malformed_lines() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path());
        store.append_message("s", ChatMessage::user("good")).await.unwrap();

        let path = temp.path().join("s").join("messages.jsonl");
        let mut content = std::fs::read_to_string(&path).unwrap();
        content.push_str("{not json}\n");
        std::fs::write(&path, content).unwrap();
        store.append_message("s", ChatMessage::assistant("also good")).await.unwrap();

        let history = store.load_history("s", 50).await.unwrap();
        assert_eq!(history, vec![ChatMessage::user("good"), ChatMessage::assistant("also good")]);
    }

    #[tokio::test]
    async fn test_jsonl_rejects_path_traversal() {
        let temp = TempDir::new().unwrap();
        let store = JsonlHistoryStore::new(temp.path());

        for bad in ["", "..", "../etc", "a/b"] {
            assert!(matches!(
                store.append_message(bad, ChatMessage::user("x")).await,
                Err(HistoryError::InvalidSession(_))
            ));
        }
    }
}
