//! Typed accessors over the persistent store.
//!
//! One SQLite connection per [`Store`], shared behind a mutex. All reads
//! and writes on the six content tables, the embeddings table, and the
//! agent-run audit log go through here; nothing else in the workspace
//! issues SQL.

use chrono::{DateTime, Utc};
use quorum_types::record::{
    AgentRun, ConversationTurn, Document, DocumentChunk, Event, MemoryContent, Metadata, RefType,
    RunStatus, Task, TaskStatus, TurnRole,
};
use quorum_types::{QuorumError, QuorumResult};
use rusqlite::types::Type;
use rusqlite::{params, Connection, Row};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;
use uuid::Uuid;

/// Metadata key under which the Closer records verification notes.
pub const VERIFICATION_NOTES_KEY: &str = "verification_notes";

/// Metadata key that flags an event for a named set of agents.
pub const CONSIDERED_AGENTS_KEY: &str = "considered_agents";

/// Fields for a new document insert.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub doc_type: String,
    /// Name of the storing agent.
    pub source: String,
    pub title: String,
    pub content: String,
    pub metadata: Metadata,
    pub tags: Vec<String>,
}

/// Fields for a new task insert.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub priority: i32,
    pub owner: Option<String>,
    pub created_by: String,
    pub due_at: Option<DateTime<Utc>>,
    pub metadata: Metadata,
}

/// Handle on the persistent store. Cheap to clone; all clones share one
/// connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and bring the schema up to
    /// date.
    pub fn open(path: &Path) -> QuorumResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(sql_err)?;
        crate::migration::run_migrations(&conn).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (tests and ephemeral runs).
    pub fn open_in_memory() -> QuorumResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        crate::migration::run_migrations(&conn).map_err(sql_err)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> QuorumResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| QuorumError::Storage(format!("connection lock poisoned: {e}")))
    }

    // ------------------------------------------------------------------
    // Documents
    // ------------------------------------------------------------------

    /// Insert a document and its embedding in one transaction.
    ///
    /// The vector is computed by the caller *before* this runs, so a failed
    /// embedding call never leaves a document row behind without its
    /// embedding: either both rows commit or neither does.
    pub fn insert_document_with_embedding(
        &self,
        doc: &NewDocument,
        vector: &[f32],
        model_name: &str,
    ) -> QuorumResult<Uuid> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let id = Uuid::new_v4();

        tx.execute(
            "INSERT INTO documents (id, doc_type, source, title, content, metadata, tags, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                doc.doc_type,
                doc.source,
                doc.title,
                doc.content,
                to_json(&doc.metadata)?,
                to_json(&doc.tags)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;

        upsert_embedding_in(&tx, RefType::Document, id, vector, model_name)?;
        tx.commit().map_err(sql_err)?;
        debug!(%id, doc_type = %doc.doc_type, "Stored document with embedding");
        Ok(id)
    }

    /// Fetch one document by id.
    pub fn document(&self, id: Uuid) -> QuorumResult<Option<Document>> {
        let conn = self.lock()?;
        optional(
            conn.query_row(
                "SELECT id, doc_type, source, title, content, metadata, tags, created_at
                 FROM documents WHERE id = ?1",
                params![id.to_string()],
                row_to_document,
            ),
        )
    }

    /// Delete documents whose `doc_type` starts with `prefix`, along with
    /// their chunks and every associated embedding row. This is the
    /// onboarding-reset path, the only delete across agent ownership.
    pub fn delete_documents_by_type_prefix(&self, prefix: &str) -> QuorumResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        // The prefix is literal text; escape every LIKE metacharacter.
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let pattern = format!("{escaped}%");

        let doc_ids: Vec<String> = {
            let mut stmt = tx
                .prepare("SELECT id FROM documents WHERE doc_type LIKE ?1 ESCAPE '\\'")
                .map_err(sql_err)?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get::<_, String>(0))
                .map_err(sql_err)?;
            rows.filter_map(|r| r.ok()).collect()
        };

        for doc_id in &doc_ids {
            let chunk_ids: Vec<String> = {
                let mut stmt = tx
                    .prepare("SELECT id FROM document_chunks WHERE document_id = ?1")
                    .map_err(sql_err)?;
                let rows = stmt
                    .query_map(params![doc_id], |row| row.get::<_, String>(0))
                    .map_err(sql_err)?;
                rows.filter_map(|r| r.ok()).collect()
            };
            for chunk_id in &chunk_ids {
                tx.execute(
                    "DELETE FROM embeddings WHERE ref_type = ?1 AND ref_id = ?2",
                    params![RefType::DocumentChunk.as_str(), chunk_id],
                )
                .map_err(sql_err)?;
            }
            tx.execute(
                "DELETE FROM document_chunks WHERE document_id = ?1",
                params![doc_id],
            )
            .map_err(sql_err)?;
            tx.execute(
                "DELETE FROM embeddings WHERE ref_type = ?1 AND ref_id = ?2",
                params![RefType::Document.as_str(), doc_id],
            )
            .map_err(sql_err)?;
            tx.execute("DELETE FROM documents WHERE id = ?1", params![doc_id])
                .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(doc_ids.len())
    }

    // ------------------------------------------------------------------
    // Document chunks
    // ------------------------------------------------------------------

    /// Insert a chunk and its embedding in one transaction.
    pub fn insert_chunk_with_embedding(
        &self,
        document_id: Uuid,
        chunk_index: u32,
        content: &str,
        metadata: &Metadata,
        vector: &[f32],
        model_name: &str,
    ) -> QuorumResult<Uuid> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;
        let id = Uuid::new_v4();

        tx.execute(
            "INSERT INTO document_chunks (id, document_id, chunk_index, content, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                document_id.to_string(),
                chunk_index,
                content,
                to_json(metadata)?,
            ],
        )
        .map_err(sql_err)?;

        upsert_embedding_in(&tx, RefType::DocumentChunk, id, vector, model_name)?;
        tx.commit().map_err(sql_err)?;
        Ok(id)
    }

    /// All chunks of a document, ordered by chunk index.
    pub fn chunks_for_document(&self, document_id: Uuid) -> QuorumResult<Vec<DocumentChunk>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, document_id, chunk_index, content, metadata
                 FROM document_chunks WHERE document_id = ?1 ORDER BY chunk_index",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![document_id.to_string()], row_to_chunk)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    // ------------------------------------------------------------------
    // Conversation turns
    // ------------------------------------------------------------------

    /// Insert a conversation turn. Turns are produced by the external
    /// conversation collaborator, which supplies its own timestamps.
    pub fn insert_turn(
        &self,
        conversation_id: Uuid,
        role: TurnRole,
        content: &str,
        created_at: DateTime<Utc>,
    ) -> QuorumResult<Uuid> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO conversation_turns (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                id.to_string(),
                conversation_id.to_string(),
                role.as_str(),
                content,
                created_at.to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(id)
    }

    /// Recent turns, newest first.
    pub fn turns_since(
        &self,
        since: DateTime<Utc>,
        limit: usize,
    ) -> QuorumResult<Vec<ConversationTurn>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, conversation_id, role, content, created_at
                 FROM conversation_turns WHERE created_at >= ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![since.to_rfc3339(), limit], row_to_turn)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Recent user turns whose content matches any of the given lowercase
    /// substring patterns, newest first.
    pub fn user_turns_matching(
        &self,
        patterns: &[&str],
        since: DateTime<Utc>,
        limit: usize,
    ) -> QuorumResult<Vec<ConversationTurn>> {
        if patterns.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;

        let mut sql = String::from(
            "SELECT id, conversation_id, role, content, created_at
             FROM conversation_turns
             WHERE role = 'user' AND created_at >= ?1 AND (",
        );
        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(since.to_rfc3339())];
        for (i, pattern) in patterns.iter().enumerate() {
            if i > 0 {
                sql.push_str(" OR ");
            }
            sql.push_str(&format!("LOWER(content) LIKE ?{}", i + 2));
            params_vec.push(Box::new(format!("%{pattern}%")));
        }
        sql.push_str(&format!(
            ") ORDER BY created_at DESC LIMIT {}",
            limit
        ));

        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_turn)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Append an event. Events are never mutated.
    pub fn insert_event(
        &self,
        actor: &str,
        event_type: &str,
        title: &str,
        description: &str,
        ref_ids: &[Uuid],
        metadata: &Metadata,
    ) -> QuorumResult<Uuid> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        let ref_id_strings: Vec<String> = ref_ids.iter().map(|u| u.to_string()).collect();
        conn.execute(
            "INSERT INTO events (id, event_type, actor, title, description, ref_ids, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                id.to_string(),
                event_type,
                actor,
                title,
                description,
                to_json(&ref_id_strings)?,
                to_json(metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(id)
    }

    /// Fetch one event by id.
    pub fn event(&self, id: Uuid) -> QuorumResult<Option<Event>> {
        let conn = self.lock()?;
        optional(conn.query_row(
            "SELECT id, event_type, actor, title, description, ref_ids, metadata, created_at
             FROM events WHERE id = ?1",
            params![id.to_string()],
            row_to_event,
        ))
    }

    /// Recent events, newest first.
    pub fn events_since(&self, since: DateTime<Utc>, limit: usize) -> QuorumResult<Vec<Event>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, event_type, actor, title, description, ref_ids, metadata, created_at
                 FROM events WHERE created_at >= ?1
                 ORDER BY created_at DESC LIMIT ?2",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![since.to_rfc3339(), limit], row_to_event)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Recent events produced by any of the named peer agents, newest
    /// first. This is the cross-agent context channel.
    pub fn events_by_actors(
        &self,
        actors: &[&str],
        since: DateTime<Utc>,
        limit: usize,
    ) -> QuorumResult<Vec<Event>> {
        if actors.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.lock()?;

        let placeholders: Vec<String> =
            (0..actors.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "SELECT id, event_type, actor, title, description, ref_ids, metadata, created_at
             FROM events WHERE created_at >= ?1 AND actor IN ({})
             ORDER BY created_at DESC LIMIT {}",
            placeholders.join(", "),
            limit
        );

        let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> =
            vec![Box::new(since.to_rfc3339())];
        for actor in actors {
            params_vec.push(Box::new(actor.to_string()));
        }

        let mut stmt = conn.prepare(&sql).map_err(sql_err)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params_vec.iter().map(|p| p.as_ref()).collect();
        let rows = stmt
            .query_map(param_refs.as_slice(), row_to_event)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Recent events explicitly flagged for `agent` via the
    /// `considered_agents` metadata array, newest first.
    pub fn events_flagged_for(
        &self,
        agent: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> QuorumResult<Vec<Event>> {
        let candidates = self.events_since(since, 500)?;
        let mut flagged: Vec<Event> = candidates
            .into_iter()
            .filter(|e| {
                e.metadata
                    .get(CONSIDERED_AGENTS_KEY)
                    .and_then(|v| v.as_array())
                    .map(|arr| arr.iter().any(|a| a.as_str() == Some(agent)))
                    .unwrap_or(false)
            })
            .collect();
        flagged.truncate(limit);
        Ok(flagged)
    }

    // ------------------------------------------------------------------
    // Tasks
    // ------------------------------------------------------------------

    /// Insert a task.
    pub fn insert_task(&self, task: &NewTask) -> QuorumResult<Uuid> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO tasks
                 (id, title, description, status, priority, owner, created_by, due_at, completed_at, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, ?9, ?10)",
            params![
                id.to_string(),
                task.title,
                task.description,
                task.status.as_str(),
                task.priority,
                task.owner,
                task.created_by,
                task.due_at.map(|d| d.to_rfc3339()),
                to_json(&task.metadata)?,
                Utc::now().to_rfc3339(),
            ],
        )
        .map_err(sql_err)?;
        Ok(id)
    }

    /// Fetch one task by id.
    pub fn task(&self, id: Uuid) -> QuorumResult<Option<Task>> {
        let conn = self.lock()?;
        optional(conn.query_row(
            "SELECT id, title, description, status, priority, owner, created_by, due_at, completed_at, metadata, created_at
             FROM tasks WHERE id = ?1",
            params![id.to_string()],
            row_to_task,
        ))
    }

    /// All tasks not yet closed, highest priority first.
    pub fn open_tasks(&self, limit: usize) -> QuorumResult<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, title, description, status, priority, owner, created_by, due_at, completed_at, metadata, created_at
                 FROM tasks WHERE status NOT IN ('done', 'cancelled', 'completed')
                 ORDER BY priority, created_at LIMIT ?1",
            )
            .map_err(sql_err)?;
        let rows = stmt.query_map(params![limit], row_to_task).map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }

    /// Update a task's status, merging `note` into its metadata under
    /// [`VERIFICATION_NOTES_KEY`]. A status that closes the task also
    /// stamps `completed_at`.
    pub fn update_task_status(
        &self,
        id: Uuid,
        status: &TaskStatus,
        note: &str,
    ) -> QuorumResult<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(sql_err)?;

        let metadata_json: String = tx
            .query_row(
                "SELECT metadata FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => {
                    QuorumError::Storage(format!("task not found: {id}"))
                }
                other => sql_err(other),
            })?;
        let mut metadata: Metadata = serde_json::from_str(&metadata_json).unwrap_or_default();
        metadata.insert(
            VERIFICATION_NOTES_KEY.to_string(),
            serde_json::Value::String(note.to_string()),
        );

        if status.is_terminal_done() {
            tx.execute(
                "UPDATE tasks SET status = ?1, completed_at = ?2, metadata = ?3 WHERE id = ?4",
                params![
                    status.as_str(),
                    Utc::now().to_rfc3339(),
                    to_json(&metadata)?,
                    id.to_string(),
                ],
            )
            .map_err(sql_err)?;
        } else {
            tx.execute(
                "UPDATE tasks SET status = ?1, metadata = ?2 WHERE id = ?3",
                params![status.as_str(), to_json(&metadata)?, id.to_string()],
            )
            .map_err(sql_err)?;
        }

        tx.commit().map_err(sql_err)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Embeddings
    // ------------------------------------------------------------------

    /// Insert or overwrite the embedding for `(ref_type, ref_id)`.
    /// Last write wins; at most one row per key ever exists.
    pub fn upsert_embedding(
        &self,
        ref_type: RefType,
        ref_id: Uuid,
        vector: &[f32],
        model_name: &str,
    ) -> QuorumResult<()> {
        let conn = self.lock()?;
        upsert_embedding_in(&conn, ref_type, ref_id, vector, model_name)
    }

    /// Fetch the stored embedding for a key, if any.
    pub fn embedding(&self, ref_type: RefType, ref_id: Uuid) -> QuorumResult<Option<Vec<f32>>> {
        let conn = self.lock()?;
        optional(conn.query_row(
            "SELECT embedding FROM embeddings WHERE ref_type = ?1 AND ref_id = ?2",
            params![ref_type.as_str(), ref_id.to_string()],
            |row| {
                let bytes: Vec<u8> = row.get(0)?;
                Ok(quorum_providers::embedding_from_bytes(&bytes))
            },
        ))
    }

    /// All embedding rows, optionally restricted to one ref type. These are
    /// the nearest-neighbor candidates the substrate ranks.
    pub fn embedding_candidates(
        &self,
        ref_type: Option<RefType>,
    ) -> QuorumResult<Vec<(RefType, Uuid, Vec<f32>)>> {
        let conn = self.lock()?;
        let (sql, filter) = match ref_type {
            Some(rt) => (
                "SELECT ref_type, ref_id, embedding FROM embeddings WHERE ref_type = ?1",
                Some(rt.as_str()),
            ),
            None => ("SELECT ref_type, ref_id, embedding FROM embeddings", None),
        };
        let mut stmt = conn.prepare(sql).map_err(sql_err)?;

        let map_row = |row: &Row<'_>| -> rusqlite::Result<(String, String, Vec<u8>)> {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?))
        };
        let raw: Vec<(String, String, Vec<u8>)> = match filter {
            Some(rt) => stmt
                .query_map(params![rt], map_row)
                .map_err(sql_err)?
                .collect::<Result<_, _>>()
                .map_err(sql_err)?,
            None => stmt
                .query_map([], map_row)
                .map_err(sql_err)?
                .collect::<Result<_, _>>()
                .map_err(sql_err)?,
        };

        let mut out = Vec::with_capacity(raw.len());
        for (rt_str, id_str, bytes) in raw {
            // Unknown ref types or mangled ids are misses, not errors.
            let Some(rt) = RefType::parse(&rt_str) else {
                continue;
            };
            let Ok(id) = Uuid::parse_str(&id_str) else {
                continue;
            };
            out.push((rt, id, quorum_providers::embedding_from_bytes(&bytes)));
        }
        Ok(out)
    }

    /// Total number of embedding rows (uniqueness checks in tests).
    pub fn embedding_count(&self) -> QuorumResult<usize> {
        let conn = self.lock()?;
        conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
            .map(|n: i64| n as usize)
            .map_err(sql_err)
    }

    /// Hydrate the content row behind `(ref_type, ref_id)` via the registry.
    /// A missing backing row is a non-fatal miss (`Ok(None)`).
    pub fn fetch_content(
        &self,
        ref_type: RefType,
        ref_id: Uuid,
    ) -> QuorumResult<Option<MemoryContent>> {
        Ok(match ref_type {
            RefType::Document => self.document(ref_id)?.map(MemoryContent::Document),
            RefType::DocumentChunk => self.document_chunk(ref_id)?.map(MemoryContent::DocumentChunk),
            RefType::ConversationTurn => self.turn(ref_id)?.map(MemoryContent::ConversationTurn),
            RefType::Event => self.event(ref_id)?.map(MemoryContent::Event),
            RefType::Task => self.task(ref_id)?.map(MemoryContent::Task),
        })
    }

    /// Fetch one chunk by id.
    pub fn document_chunk(&self, id: Uuid) -> QuorumResult<Option<DocumentChunk>> {
        let conn = self.lock()?;
        optional(conn.query_row(
            "SELECT id, document_id, chunk_index, content, metadata
             FROM document_chunks WHERE id = ?1",
            params![id.to_string()],
            row_to_chunk,
        ))
    }

    /// Fetch one turn by id.
    pub fn turn(&self, id: Uuid) -> QuorumResult<Option<ConversationTurn>> {
        let conn = self.lock()?;
        optional(conn.query_row(
            "SELECT id, conversation_id, role, content, created_at
             FROM conversation_turns WHERE id = ?1",
            params![id.to_string()],
            row_to_turn,
        ))
    }

    // ------------------------------------------------------------------
    // Agent runs
    // ------------------------------------------------------------------

    /// Append an audit row. One per harness invocation; never updated.
    pub fn insert_agent_run(
        &self,
        agent_name: &str,
        started_at: DateTime<Utc>,
        status: RunStatus,
        summary: &str,
        metadata: &Metadata,
    ) -> QuorumResult<Uuid> {
        let conn = self.lock()?;
        let id = Uuid::new_v4();
        conn.execute(
            "INSERT INTO agent_runs (id, agent_name, started_at, completed_at, status, summary, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                agent_name,
                started_at.to_rfc3339(),
                Utc::now().to_rfc3339(),
                status.as_str(),
                summary,
                to_json(metadata)?,
            ],
        )
        .map_err(sql_err)?;
        Ok(id)
    }

    /// Audit rows for one agent, newest first.
    pub fn runs_for_agent(&self, agent_name: &str) -> QuorumResult<Vec<AgentRun>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, agent_name, started_at, completed_at, status, summary, metadata
                 FROM agent_runs WHERE agent_name = ?1 ORDER BY started_at DESC",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![agent_name], row_to_run)
            .map_err(sql_err)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(sql_err)
    }
}

/// Upsert inside an existing transaction or connection.
fn upsert_embedding_in(
    conn: &Connection,
    ref_type: RefType,
    ref_id: Uuid,
    vector: &[f32],
    model_name: &str,
) -> QuorumResult<()> {
    conn.execute(
        "INSERT INTO embeddings (ref_type, ref_id, embedding, model_name)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (ref_type, ref_id)
             DO UPDATE SET embedding = excluded.embedding, model_name = excluded.model_name",
        params![
            ref_type.as_str(),
            ref_id.to_string(),
            quorum_providers::embedding_to_bytes(vector),
            model_name,
        ],
    )
    .map_err(sql_err)?;
    Ok(())
}

// ------------------------------------------------------------------
// Row mapping
// ------------------------------------------------------------------

fn sql_err(e: rusqlite::Error) -> QuorumError {
    QuorumError::Storage(e.to_string())
}

fn optional<T>(result: rusqlite::Result<T>) -> QuorumResult<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(sql_err(e)),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> QuorumResult<String> {
    serde_json::to_string(value).map_err(|e| QuorumError::Storage(e.to_string()))
}

fn get_uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Stored timestamps are written by this crate as RFC-3339; tolerate
/// anything else by falling back to now rather than failing the whole read.
fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    let metadata_json: String = row.get(5)?;
    let tags_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(Document {
        id: get_uuid(row, 0)?,
        doc_type: row.get(1)?,
        source: row.get(2)?,
        title: row.get(3)?,
        content: row.get(4)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        created_at: parse_dt(&created_at),
    })
}

fn row_to_chunk(row: &Row<'_>) -> rusqlite::Result<DocumentChunk> {
    let metadata_json: String = row.get(4)?;
    Ok(DocumentChunk {
        id: get_uuid(row, 0)?,
        document_id: get_uuid(row, 1)?,
        chunk_index: row.get(2)?,
        content: row.get(3)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

fn row_to_turn(row: &Row<'_>) -> rusqlite::Result<ConversationTurn> {
    let role: String = row.get(2)?;
    let created_at: String = row.get(4)?;
    Ok(ConversationTurn {
        id: get_uuid(row, 0)?,
        conversation_id: get_uuid(row, 1)?,
        role: TurnRole::parse(&role).unwrap_or(TurnRole::User),
        content: row.get(3)?,
        created_at: parse_dt(&created_at),
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<Event> {
    let ref_ids_json: String = row.get(5)?;
    let metadata_json: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    let ref_id_strings: Vec<String> = serde_json::from_str(&ref_ids_json).unwrap_or_default();
    Ok(Event {
        id: get_uuid(row, 0)?,
        event_type: row.get(1)?,
        actor: row.get(2)?,
        title: row.get(3)?,
        description: row.get(4)?,
        ref_ids: ref_id_strings
            .iter()
            .filter_map(|s| Uuid::parse_str(s).ok())
            .collect(),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_dt(&created_at),
    })
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(3)?;
    let due_at: Option<String> = row.get(7)?;
    let completed_at: Option<String> = row.get(8)?;
    let metadata_json: String = row.get(9)?;
    let created_at: String = row.get(10)?;
    Ok(Task {
        id: get_uuid(row, 0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        status: TaskStatus::parse(&status),
        priority: row.get(4)?,
        owner: row.get(5)?,
        created_by: row.get(6)?,
        due_at: due_at.as_deref().map(parse_dt),
        completed_at: completed_at.as_deref().map(parse_dt),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
        created_at: parse_dt(&created_at),
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<AgentRun> {
    let started_at: String = row.get(2)?;
    let completed_at: String = row.get(3)?;
    let status: String = row.get(4)?;
    let metadata_json: String = row.get(6)?;
    Ok(AgentRun {
        id: get_uuid(row, 0)?,
        agent_name: row.get(1)?,
        started_at: parse_dt(&started_at),
        completed_at: parse_dt(&completed_at),
        status: if status == "failed" {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        },
        summary: row.get(5)?,
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn new_doc(doc_type: &str, title: &str, content: &str) -> NewDocument {
        NewDocument {
            doc_type: doc_type.to_string(),
            source: "test".to_string(),
            title: title.to_string(),
            content: content.to_string(),
            metadata: Metadata::new(),
            tags: vec!["test".to_string()],
        }
    }

    fn new_task(title: &str, status: TaskStatus) -> NewTask {
        NewTask {
            title: title.to_string(),
            description: String::new(),
            status,
            priority: 3,
            owner: None,
            created_by: "test".to_string(),
            due_at: None,
            metadata: Metadata::new(),
        }
    }

    #[test]
    fn test_document_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document_with_embedding(&new_doc("note", "Title", "Body"), &[1.0, 0.0], "m")
            .unwrap();
        let doc = store.document(id).unwrap().unwrap();
        assert_eq!(doc.title, "Title");
        assert_eq!(doc.source, "test");
        assert_eq!(doc.tags, vec!["test"]);
        assert!(store.embedding(RefType::Document, id).unwrap().is_some());
    }

    #[test]
    fn test_embedding_upsert_overwrites() {
        let store = Store::open_in_memory().unwrap();
        let id = store
            .insert_document_with_embedding(&new_doc("note", "T", "C"), &[1.0, 0.0], "m")
            .unwrap();
        store
            .upsert_embedding(RefType::Document, id, &[0.0, 1.0], "m2")
            .unwrap();

        assert_eq!(store.embedding_count().unwrap(), 1);
        let vec = store.embedding(RefType::Document, id).unwrap().unwrap();
        assert_eq!(vec, vec![0.0, 1.0]);
    }

    #[test]
    fn test_delete_documents_by_type_prefix() {
        let store = Store::open_in_memory().unwrap();
        let kept = store
            .insert_document_with_embedding(&new_doc("note", "Keep", "c"), &[1.0], "m")
            .unwrap();
        let dropped = store
            .insert_document_with_embedding(&new_doc("onboarding_goal", "Drop", "c"), &[1.0], "m")
            .unwrap();
        store
            .insert_chunk_with_embedding(dropped, 0, "chunk", &Metadata::new(), &[1.0], "m")
            .unwrap();

        let deleted = store.delete_documents_by_type_prefix("onboarding").unwrap();
        assert_eq!(deleted, 1);
        assert!(store.document(dropped).unwrap().is_none());
        assert!(store.document(kept).unwrap().is_some());
        assert!(store.chunks_for_document(dropped).unwrap().is_empty());
        // Only the kept document's embedding remains.
        assert_eq!(store.embedding_count().unwrap(), 1);
    }

    #[test]
    fn test_delete_prefix_underscore_is_literal() {
        let store = Store::open_in_memory().unwrap();
        let matched = store
            .insert_document_with_embedding(&new_doc("onboarding_goal", "A", "c"), &[1.0], "m")
            .unwrap();
        let near_miss = store
            .insert_document_with_embedding(&new_doc("onboardingXgoal", "B", "c"), &[1.0], "m")
            .unwrap();

        let deleted = store.delete_documents_by_type_prefix("onboarding_").unwrap();
        assert_eq!(deleted, 1);
        assert!(store.document(matched).unwrap().is_none());
        assert!(store.document(near_miss).unwrap().is_some());
    }

    #[test]
    fn test_user_turns_matching() {
        let store = Store::open_in_memory().unwrap();
        let conv = Uuid::new_v4();
        let now = Utc::now();
        store
            .insert_turn(conv, TurnRole::User, "I finished the report", now)
            .unwrap();
        store
            .insert_turn(conv, TurnRole::Assistant, "I finished thinking", now)
            .unwrap();
        store
            .insert_turn(conv, TurnRole::User, "what's for lunch?", now)
            .unwrap();
        store
            .insert_turn(
                conv,
                TurnRole::User,
                "Shipped it yesterday",
                now - Duration::hours(48),
            )
            .unwrap();

        let since = now - Duration::hours(24);
        let hits = store
            .user_turns_matching(&["i finished", "shipped"], since, 100)
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].content, "I finished the report");
    }

    #[test]
    fn test_open_tasks_excludes_closed() {
        let store = Store::open_in_memory().unwrap();
        store.insert_task(&new_task("open", TaskStatus::Pending)).unwrap();
        store
            .insert_task(&new_task("doing", TaskStatus::InProgress))
            .unwrap();
        store.insert_task(&new_task("done", TaskStatus::Done)).unwrap();
        store
            .insert_task(&new_task("legacy", TaskStatus::Completed))
            .unwrap();
        store
            .insert_task(&new_task("axed", TaskStatus::Cancelled))
            .unwrap();

        let open = store.open_tasks(500).unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|t| t.status.is_open()));
    }

    #[test]
    fn test_update_task_status_done_stamps_completion() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_task(&new_task("t", TaskStatus::Pending)).unwrap();
        store
            .update_task_status(id, &TaskStatus::Done, "Verified by closer: evidence")
            .unwrap();

        let task = store.task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.completed_at.is_some());
        assert_eq!(
            task.metadata.get(VERIFICATION_NOTES_KEY),
            Some(&json!("Verified by closer: evidence"))
        );
    }

    #[test]
    fn test_update_task_status_progress_keeps_completed_at_empty() {
        let store = Store::open_in_memory().unwrap();
        let id = store.insert_task(&new_task("t", TaskStatus::Pending)).unwrap();
        store
            .update_task_status(id, &TaskStatus::InProgress, "partial")
            .unwrap();

        let task = store.task(id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.completed_at.is_none());
    }

    #[test]
    fn test_events_by_actors_and_flagging() {
        let store = Store::open_in_memory().unwrap();
        let mut flagged_meta = Metadata::new();
        flagged_meta.insert(
            CONSIDERED_AGENTS_KEY.to_string(),
            json!(["closer", "executor"]),
        );
        store
            .insert_event("executor", "task_update", "E1", "", &[], &flagged_meta)
            .unwrap();
        store
            .insert_event("strategist", "reflection", "E2", "", &[], &Metadata::new())
            .unwrap();

        let since = Utc::now() - Duration::hours(1);
        let from_executor = store.events_by_actors(&["executor"], since, 20).unwrap();
        assert_eq!(from_executor.len(), 1);
        assert_eq!(from_executor[0].title, "E1");

        let for_closer = store.events_flagged_for("closer", since, 20).unwrap();
        assert_eq!(for_closer.len(), 1);
        let for_opportunist = store.events_flagged_for("opportunist", since, 20).unwrap();
        assert!(for_opportunist.is_empty());
    }

    #[test]
    fn test_fetch_content_dispatches_every_ref_type() {
        let store = Store::open_in_memory().unwrap();
        let doc_id = store
            .insert_document_with_embedding(&new_doc("note", "D", "c"), &[1.0], "m")
            .unwrap();
        let chunk_id = store
            .insert_chunk_with_embedding(doc_id, 0, "c", &Metadata::new(), &[1.0], "m")
            .unwrap();
        let turn_id = store
            .insert_turn(Uuid::new_v4(), TurnRole::User, "hi", Utc::now())
            .unwrap();
        let event_id = store
            .insert_event("a", "t", "E", "", &[], &Metadata::new())
            .unwrap();
        let task_id = store.insert_task(&new_task("T", TaskStatus::Pending)).unwrap();

        for (rt, id) in [
            (RefType::Document, doc_id),
            (RefType::DocumentChunk, chunk_id),
            (RefType::ConversationTurn, turn_id),
            (RefType::Event, event_id),
            (RefType::Task, task_id),
        ] {
            assert!(store.fetch_content(rt, id).unwrap().is_some(), "{rt}");
        }
        // Missing backing row is a miss, not an error.
        assert!(store
            .fetch_content(RefType::Task, Uuid::new_v4())
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_agent_run_audit_rows() {
        let store = Store::open_in_memory().unwrap();
        store
            .insert_agent_run("closer", Utc::now(), RunStatus::Completed, "ok", &Metadata::new())
            .unwrap();
        store
            .insert_agent_run("closer", Utc::now(), RunStatus::Failed, "boom", &Metadata::new())
            .unwrap();

        let runs = store.runs_for_agent("closer").unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().any(|r| r.status == RunStatus::Failed));
        assert!(store.runs_for_agent("other").unwrap().is_empty());
    }
}
