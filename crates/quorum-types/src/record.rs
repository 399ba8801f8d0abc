//! Persistent store records and the `(ref_type, ref_id)` registry.
//!
//! One struct per content table. Identifiers are server-assigned opaque
//! UUIDs; timestamps are UTC and serialize as RFC-3339 text.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Arbitrary JSON metadata attached to most records.
pub type Metadata = HashMap<String, serde_json::Value>;

/// The polymorphic reference registry: which content table an embedding row
/// (or a search hit) points into.
///
/// This is the *only* place the ref-type → table mapping lives; the read
/// (hydration) and write (embedding upsert) paths both dispatch through it
/// so they cannot silently diverge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefType {
    Document,
    DocumentChunk,
    ConversationTurn,
    Event,
    Task,
}

impl RefType {
    /// All ref types, in registry order.
    pub const ALL: [RefType; 5] = [
        RefType::Document,
        RefType::DocumentChunk,
        RefType::ConversationTurn,
        RefType::Event,
        RefType::Task,
    ];

    /// The stored string form of this ref type.
    pub fn as_str(&self) -> &'static str {
        match self {
            RefType::Document => "document",
            RefType::DocumentChunk => "document_chunk",
            RefType::ConversationTurn => "conversation_turn",
            RefType::Event => "event",
            RefType::Task => "task",
        }
    }

    /// The content table this ref type resolves to.
    pub fn table(&self) -> &'static str {
        match self {
            RefType::Document => "documents",
            RefType::DocumentChunk => "document_chunks",
            RefType::ConversationTurn => "conversation_turns",
            RefType::Event => "events",
            RefType::Task => "tasks",
        }
    }

    /// Parse a stored string form; unknown values are a miss, not an error.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "document" => Some(RefType::Document),
            "document_chunk" => Some(RefType::DocumentChunk),
            "conversation_turn" => Some(RefType::ConversationTurn),
            "event" => Some(RefType::Event),
            "task" => Some(RefType::Task),
            _ => None,
        }
    }
}

impl std::fmt::Display for RefType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who authored a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            _ => None,
        }
    }
}

/// Task lifecycle status.
///
/// `pending ⇄ in_progress → done`, plus `cancelled` (terminal). `completed`
/// is a legacy synonym for `done` that still appears in stored rows; the
/// `Other` variant tolerates statuses written by humans or future agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Done,
    Completed,
    Cancelled,
    #[serde(untagged)]
    Other(String),
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Done => "done",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Other(s) => s,
        }
    }

    /// Parse a stored status string. Never fails; unknown values are kept
    /// verbatim so a later write round-trips them unchanged.
    pub fn parse(s: &str) -> Self {
        match s {
            "pending" => TaskStatus::Pending,
            "in_progress" => TaskStatus::InProgress,
            "done" => TaskStatus::Done,
            "completed" => TaskStatus::Completed,
            "cancelled" => TaskStatus::Cancelled,
            other => TaskStatus::Other(other.to_string()),
        }
    }

    /// Whether the task still counts as open for verification purposes.
    pub fn is_open(&self) -> bool {
        !matches!(
            self,
            TaskStatus::Done | TaskStatus::Completed | TaskStatus::Cancelled
        )
    }

    /// Whether this status closes the task (stamps `completed_at`).
    pub fn is_terminal_done(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Completed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single harness invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

/// A stored document. Immutable once embedded except by explicit re-store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub doc_type: String,
    /// Name of the agent that stored this document.
    pub source: String,
    pub title: String,
    pub content: String,
    pub metadata: Metadata,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A chunk of a document too large to embed whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentChunk {
    pub id: Uuid,
    pub document_id: Uuid,
    /// 0-based, unique and contiguous per document.
    pub chunk_index: u32,
    pub content: String,
    pub metadata: Metadata,
}

/// A single conversational turn, produced by the external conversation
/// collaborator. Read-only from this crate's perspective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub role: TurnRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// An append-only audit/notification record. Never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub event_type: String,
    /// Name of the agent that emitted this event.
    pub actor: String,
    pub title: String,
    pub description: String,
    pub ref_ids: Vec<Uuid>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// A unit of work tracked across agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    /// 1 (highest) to 5 (lowest).
    pub priority: i32,
    pub owner: Option<String>,
    pub created_by: String,
    pub due_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
    pub created_at: DateTime<Utc>,
}

/// The append-only audit row proving an agent executed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRun {
    pub id: Uuid,
    pub agent_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub status: RunStatus,
    pub summary: String,
    pub metadata: Metadata,
}

/// A hydrated content row, produced by dispatching a search hit through the
/// [`RefType`] registry.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryContent {
    Document(Document),
    DocumentChunk(DocumentChunk),
    ConversationTurn(ConversationTurn),
    Event(Event),
    Task(Task),
}

/// A single semantic-search result: the hit key, its similarity score, and
/// the hydrated content row.
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub ref_type: RefType,
    pub ref_id: Uuid,
    /// Cosine similarity: `1 - distance`, higher is closer.
    pub score: f32,
    pub content: MemoryContent,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_type_registry_round_trip() {
        for rt in RefType::ALL {
            assert_eq!(RefType::parse(rt.as_str()), Some(rt));
        }
        assert_eq!(RefType::parse("unknown"), None);
    }

    #[test]
    fn test_ref_type_table_mapping() {
        assert_eq!(RefType::Document.table(), "documents");
        assert_eq!(RefType::DocumentChunk.table(), "document_chunks");
        assert_eq!(RefType::ConversationTurn.table(), "conversation_turns");
        assert_eq!(RefType::Event.table(), "events");
        assert_eq!(RefType::Task.table(), "tasks");
    }

    #[test]
    fn test_task_status_openness() {
        assert!(TaskStatus::Pending.is_open());
        assert!(TaskStatus::InProgress.is_open());
        assert!(TaskStatus::Other("blocked".into()).is_open());
        assert!(!TaskStatus::Done.is_open());
        assert!(!TaskStatus::Completed.is_open());
        assert!(!TaskStatus::Cancelled.is_open());
    }

    #[test]
    fn test_task_status_round_trips_unknown_values() {
        let status = TaskStatus::parse("waiting_on_reply");
        assert_eq!(status.as_str(), "waiting_on_reply");
        assert!(status.is_open());
    }

    #[test]
    fn test_task_status_serde() {
        let json = serde_json::to_string(&TaskStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
        let parsed: TaskStatus = serde_json::from_str("\"done\"").unwrap();
        assert_eq!(parsed, TaskStatus::Done);
        let other: TaskStatus = serde_json::from_str("\"blocked\"").unwrap();
        assert_eq!(other, TaskStatus::Other("blocked".to_string()));
    }
}
