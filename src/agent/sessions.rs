//! Persistent agent sessions
//!
//! Each run's task, plan and transcript can be saved to disk as JSON and
//! listed or reloaded later.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::llm::ConversationMessage;

/// A saved agent run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    /// Unique session ID (UUID v7, so ids sort by creation time)
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// The task that started this session
    pub task: String,
    /// The approved plan
    #[serde(default)]
    pub plan: String,
    /// Model used for this session
    pub model: String,
    /// Execution transcript
    pub messages: Vec<ConversationMessage>,
    /// Model turns taken
    pub iterations: usize,
    /// Whether the run reached the completion token
    pub complete: bool,
}

impl Session {
    pub fn new(task: impl Into<String>, model: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::now_v7().to_string(),
            created_at: now,
            updated_at: now,
            task: task.into(),
            plan: String::new(),
            model: model.into(),
            messages: Vec::new(),
            iterations: 0,
            complete: false,
        }
    }

    pub fn set_plan(&mut self, plan: impl Into<String>) {
        self.plan = plan.into();
        self.touch();
    }

    /// Replace the stored transcript with the run's transcript
    pub fn record_transcript(&mut self, messages: &[ConversationMessage], iterations: usize) {
        self.messages = messages.to_vec();
        self.iterations = iterations;
        self.touch();
    }

    pub fn add_message(&mut self, message: ConversationMessage) {
        self.messages.push(message);
        self.touch();
    }

    pub fn mark_complete(&mut self) {
        self.complete = true;
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Session storage manager
pub struct SessionStore {
    base_dir: PathBuf,
}

impl SessionStore {
    /// Create a session store, creating its directory if needed
    pub fn new(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    /// Create with the default directory (~/.cellpilot/sessions)
    pub fn default_store() -> std::io::Result<Self> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self::new(PathBuf::from(home).join(".cellpilot").join("sessions"))
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn save(&self, session: &Session) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(session)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(self.session_path(&session.id), json)
    }

    pub fn load(&self, session_id: &str) -> std::io::Result<Session> {
        load_from_path(&self.session_path(session_id))
    }

    /// List all sessions, newest first
    ///
    /// Files that fail to parse are skipped.
    pub fn list(&self) -> std::io::Result<Vec<SessionSummary>> {
        let mut sessions = Vec::new();
        for entry in std::fs::read_dir(&self.base_dir)? {
            let path = entry?.path();
            if path.extension().map(|e| e == "json").unwrap_or(false) {
                if let Ok(session) = load_from_path(&path) {
                    sessions.push(SessionSummary {
                        id: session.id,
                        task: truncate(&session.task, 50),
                        created_at: session.created_at,
                        iterations: session.iterations,
                        complete: session.complete,
                    });
                }
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.id.cmp(&a.id)));
        Ok(sessions)
    }

    pub fn delete(&self, session_id: &str) -> std::io::Result<()> {
        std::fs::remove_file(self.session_path(session_id))
    }

    fn session_path(&self, session_id: &str) -> PathBuf {
        self.base_dir.join(format!("{}.json", session_id))
    }
}

fn load_from_path(path: &Path) -> std::io::Result<Session> {
    let json = std::fs::read_to_string(path)?;
    serde_json::from_str(&json).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

/// Summary of a session for listing
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub task: String,
    pub created_at: DateTime<Utc>,
    pub iterations: usize,
    pub complete: bool,
}

/// Truncate to at most `max_chars` characters, adding an ellipsis if cut
fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new("Send a Discord message", "gpt-4.1");
        assert!(!session.id.is_empty());
        assert_eq!(session.task, "Send a Discord message");
        assert_eq!(session.model, "gpt-4.1");
        assert!(session.plan.is_empty());
        assert!(session.messages.is_empty());
        assert!(!session.complete);
    }

    #[test]
    fn test_save_load_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("sessions")).unwrap();

        let mut session = Session::new("Task", "model");
        session.set_plan("1. do it");
        session.add_message(ConversationMessage::user("Hello"));
        session.mark_complete();
        store.save(&session).unwrap();

        let loaded = store.load(&session.id).unwrap();
        assert_eq!(loaded.plan, "1. do it");
        assert_eq!(loaded.messages, vec![ConversationMessage::user("Hello")]);
        assert!(loaded.complete);

        store.delete(&session.id).unwrap();
        assert!(store.load(&session.id).is_err());
    }

    #[test]
    fn test_list_newest_first_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path()).unwrap();

        let first = Session::new("first", "m");
        let second = Session::new("second", "m");
        store.save(&first).unwrap();
        store.save(&second).unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert_eq!(listed[1].id, first.id);
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééééééé", 5), "éé...");
    }
}
