//! The Closer: completion-verification agent.
//!
//! Scans recent user turns for completion claims, cross-references them
//! against open tasks and recent activity, asks the inference backend for a
//! structured verdict, and applies the verdict to the task list. Closing a
//! task requires explicit evidence at or above the confidence threshold;
//! anything weaker becomes a partial update or a follow-up flag.

use crate::harness::{Agent, AgentContext};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use quorum_types::record::{ConversationTurn, Event, Metadata, Task, TaskStatus};
use quorum_types::QuorumResult;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashSet;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lowercase substrings that mark a user turn as a possible completion
/// claim. Matching is recall-oriented; the verdict step filters noise.
pub const COMPLETION_MARKERS: &[&str] = &[
    "i did",
    "i have done",
    "i've done",
    "i finished",
    "i've finished",
    "i completed",
    "i've completed",
    "done with",
    "finished the",
    "completed the",
    "took care of",
    "handled",
    "shipped",
    "merged",
    "pushed",
    "submitted",
    "uploaded",
    "published",
    "sent the",
    "wrapped up",
];

/// Minimum confidence required before a verified completion closes a task.
const CONFIDENCE_THRESHOLD: f64 = 0.7;

/// How far back the Closer looks by default.
const DEFAULT_LOOKBACK_HOURS: i64 = 24;

/// Peer agents whose events provide cross-checking context.
const PEER_AGENTS: &[&str] = &[
    "executor",
    "strategist",
    "connector",
    "devils_advocate",
    "opportunist",
];

// Fetch windows and payload caps. Fetch wide, include narrow.
const CLAIMS_FETCH: usize = 100;
const CLAIMS_CAP: usize = 50;
const TASKS_FETCH: usize = 500;
const TASKS_CAP: usize = 100;
const EVENTS_FETCH: usize = 200;
const EVENTS_CAP: usize = 100;
const TURNS_FETCH: usize = 200;
const TURNS_CAP: usize = 50;
const PEER_EVENTS_CAP: usize = 30;
const FLAGGED_CAP: usize = 20;

/// Max characters of any single turn or event body placed in the payload.
const SNIPPET_LIMIT: usize = 500;

const SYSTEM_PROMPT: &str = "You are the Closer, a completion-verification agent. \
You receive completion claims made by the user, the list of open tasks, and \
recent activity for cross-reference. Decide which open tasks the evidence \
actually shows as finished. Be conservative: only report a verified \
completion when the claim and the surrounding activity clearly support it.\n\
\n\
Respond with JSON only, no prose, in this shape:\n\
{\n\
  \"verified_completions\": [{\"task_id\": \"...\", \"evidence_found\": \"...\", \"confidence\": 0.0}],\n\
  \"partial_updates\": [{\"task_id\": \"...\", \"progress_notes\": \"...\", \"new_status\": \"in_progress\"}],\n\
  \"follow_up_flags\": [{\"claim\": \"...\", \"reason_undetermined\": \"...\", \"suggested_action\": \"...\"}],\n\
  \"verification_events\": [{\"title\": \"...\", \"description\": \"...\", \"considered_agents\": [\"executor\"]}]\n\
}";

/// Structured verdict returned by the model. Every field defaults so a
/// partially-shaped response still applies cleanly.
#[derive(Debug, Default, Deserialize)]
pub struct CloserVerdict {
    #[serde(default)]
    pub verified_completions: Vec<VerifiedCompletion>,
    #[serde(default)]
    pub partial_updates: Vec<PartialUpdate>,
    #[serde(default)]
    pub follow_up_flags: Vec<FollowUpFlag>,
    #[serde(default)]
    pub verification_events: Vec<VerificationEvent>,
}

#[derive(Debug, Deserialize)]
pub struct VerifiedCompletion {
    pub task_id: String,
    #[serde(default)]
    pub evidence_found: String,
    #[serde(default)]
    pub confidence: f64,
}

#[derive(Debug, Deserialize)]
pub struct PartialUpdate {
    pub task_id: String,
    #[serde(default)]
    pub progress_notes: String,
    #[serde(default = "default_progress_status")]
    pub new_status: String,
}

fn default_progress_status() -> String {
    "in_progress".to_string()
}

#[derive(Debug, Deserialize)]
pub struct FollowUpFlag {
    #[serde(default)]
    pub claim: String,
    #[serde(default)]
    pub reason_undetermined: String,
    #[serde(default)]
    pub suggested_action: String,
}

#[derive(Debug, Deserialize)]
pub struct VerificationEvent {
    #[serde(default = "default_notice_title")]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_considered_agents")]
    pub considered_agents: Vec<String>,
}

fn default_notice_title() -> String {
    "Verification notice".to_string()
}

fn default_considered_agents() -> Vec<String> {
    vec!["executor".to_string()]
}

/// Strip a Markdown code fence wrapper, if any, and return the body.
pub(crate) fn strip_code_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip an optional language tag on the fence line.
    let rest = match rest.find('\n') {
        Some(idx) => &rest[idx + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

/// Decode the model's verdict. Anything undecodable is an empty verdict;
/// a confused model must not corrupt the task list.
fn parse_verdict(raw: &str) -> CloserVerdict {
    let body = strip_code_fences(raw);
    match serde_json::from_str(body) {
        Ok(verdict) => verdict,
        Err(e) => {
            warn!(error = %e, "Undecodable verdict, treating as empty");
            CloserVerdict::default()
        }
    }
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(SNIPPET_LIMIT) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

fn turn_payload(turn: &ConversationTurn) -> serde_json::Value {
    json!({
        "role": turn.role.as_str(),
        "content": snippet(&turn.content),
        "at": turn.created_at.to_rfc3339(),
    })
}

fn event_payload(event: &Event) -> serde_json::Value {
    json!({
        "actor": event.actor,
        "type": event.event_type,
        "title": event.title,
        "description": snippet(&event.description),
        "at": event.created_at.to_rfc3339(),
    })
}

fn task_payload(task: &Task) -> serde_json::Value {
    json!({
        "task_id": task.id.to_string(),
        "title": task.title,
        "description": snippet(&task.description),
        "status": task.status.as_str(),
        "priority": task.priority,
        "owner": task.owner,
    })
}

/// The completion-verification agent.
pub struct CloserAgent {
    lookback_hours: i64,
}

impl Default for CloserAgent {
    fn default() -> Self {
        Self {
            lookback_hours: DEFAULT_LOOKBACK_HOURS,
        }
    }
}

impl CloserAgent {
    pub fn new(lookback_hours: i64) -> Self {
        Self { lookback_hours }
    }

    /// Apply a verdict against the store. Each item commits independently;
    /// one bad item never blocks the rest.
    fn apply_verdict(
        &self,
        ctx: &AgentContext,
        verdict: &CloserVerdict,
        open_ids: &HashSet<Uuid>,
    ) -> QuorumResult<(usize, usize, usize, usize)> {
        let mut verified = 0;
        let mut partial = 0;
        let mut flags = 0;
        let mut notices = 0;

        for completion in &verdict.verified_completions {
            if completion.confidence < CONFIDENCE_THRESHOLD {
                debug!(
                    task_id = %completion.task_id,
                    confidence = completion.confidence,
                    "Below confidence threshold, skipping"
                );
                continue;
            }
            let Ok(task_id) = Uuid::parse_str(&completion.task_id) else {
                warn!(task_id = %completion.task_id, "Unparseable task id in verdict");
                continue;
            };
            // Closed tasks stay closed, whatever the model says.
            if !open_ids.contains(&task_id) {
                debug!(%task_id, "Not an open task, skipping");
                continue;
            }
            let note = format!("Verified by Closer: {}", completion.evidence_found);
            match ctx
                .memory
                .update_task_status(task_id, &TaskStatus::Done, &note)
            {
                Ok(()) => {
                    info!(%task_id, "Task verified complete");
                    verified += 1;
                }
                Err(e) => warn!(%task_id, error = %e, "Failed to close task"),
            }
        }

        for update in &verdict.partial_updates {
            let Ok(task_id) = Uuid::parse_str(&update.task_id) else {
                warn!(task_id = %update.task_id, "Unparseable task id in verdict");
                continue;
            };
            if !open_ids.contains(&task_id) {
                continue;
            }
            // Partial updates may move a task forward but never close it.
            let status = TaskStatus::parse(&update.new_status);
            let status = if status.is_open() {
                status
            } else {
                TaskStatus::InProgress
            };
            let note = format!("Partial progress by Closer: {}", update.progress_notes);
            match ctx.memory.update_task_status(task_id, &status, &note) {
                Ok(()) => partial += 1,
                Err(e) => warn!(%task_id, error = %e, "Failed to update task"),
            }
        }

        for flag in &verdict.follow_up_flags {
            let description = format!(
                "Claim: {}\n\nReason: {}\n\nSuggested: {}",
                flag.claim, flag.reason_undetermined, flag.suggested_action
            );
            // Flag the agents that can act on an unresolved claim.
            let mut metadata = Metadata::new();
            metadata.insert(
                quorum_memory::store::CONSIDERED_AGENTS_KEY.to_string(),
                json!(["executor", "strategist"]),
            );
            match ctx.memory.store_event(
                "closer",
                "follow_up",
                "Verification follow-up needed",
                &description,
                &[],
                &metadata,
            ) {
                Ok(_) => flags += 1,
                Err(e) => warn!(error = %e, "Failed to store follow-up event"),
            }
        }

        for notice in &verdict.verification_events {
            let mut metadata = Metadata::new();
            metadata.insert(
                quorum_memory::store::CONSIDERED_AGENTS_KEY.to_string(),
                json!(notice.considered_agents),
            );
            match ctx.memory.store_event(
                "closer",
                "verification",
                &notice.title,
                &notice.description,
                &[],
                &metadata,
            ) {
                Ok(_) => notices += 1,
                Err(e) => warn!(error = %e, "Failed to store verification notice"),
            }
        }

        Ok((verified, partial, flags, notices))
    }
}

#[async_trait]
impl Agent for CloserAgent {
    fn name(&self) -> &str {
        "closer"
    }

    async fn run(&mut self, ctx: &AgentContext) -> QuorumResult<String> {
        let since = Utc::now() - Duration::hours(self.lookback_hours);
        let store = ctx.memory.store();

        let mut claims = store.user_turns_matching(COMPLETION_MARKERS, since, CLAIMS_FETCH)?;
        claims.truncate(CLAIMS_CAP);
        if claims.is_empty() {
            return Ok(format!(
                "No completion claims in the last {}h; nothing to verify.",
                self.lookback_hours
            ));
        }

        let mut open_tasks = store.open_tasks(TASKS_FETCH)?;
        open_tasks.truncate(TASKS_CAP);
        let open_ids: HashSet<Uuid> = open_tasks.iter().map(|t| t.id).collect();

        let mut recent_events = store.events_since(since, EVENTS_FETCH)?;
        recent_events.truncate(EVENTS_CAP);
        let mut recent_turns = store.turns_since(since, TURNS_FETCH)?;
        recent_turns.truncate(TURNS_CAP);
        let peer_events = store.events_by_actors(PEER_AGENTS, since, PEER_EVENTS_CAP)?;
        let flagged = store.events_flagged_for(self.name(), since, FLAGGED_CAP)?;

        let payload = json!({
            "completion_claims": claims.iter().map(turn_payload).collect::<Vec<_>>(),
            "open_tasks": open_tasks.iter().map(task_payload).collect::<Vec<_>>(),
            "recent_events": recent_events.iter().map(event_payload).collect::<Vec<_>>(),
            "recent_conversation": recent_turns.iter().map(turn_payload).collect::<Vec<_>>(),
            "peer_agent_events": peer_events.iter().map(event_payload).collect::<Vec<_>>(),
            "events_flagged_for_me": flagged.iter().map(event_payload).collect::<Vec<_>>(),
        });
        let payload_text = serde_json::to_string_pretty(&payload)
            .map_err(|e| quorum_types::QuorumError::Parse(e.to_string()))?;

        info!(
            claims = claims.len(),
            open_tasks = open_tasks.len(),
            "Requesting verification verdict"
        );
        let raw = ctx.llm.complete(SYSTEM_PROMPT, &payload_text).await?;
        let verdict = parse_verdict(&raw);

        let (verified, partial, flags, notices) = self.apply_verdict(ctx, &verdict, &open_ids)?;
        Ok(format!(
            "Verified {verified} completions, {partial} partial updates, \
             {flags} follow-up flags, {notices} notices from {} claims.",
            claims.len()
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::AgentContext;
    use quorum_memory::{MemorySubstrate, NewTask, Store};
    use quorum_providers::{EmbeddingDriver, LlmDriver};
    use quorum_types::record::TurnRole;
    use quorum_types::{QuorumConfig, QuorumResult};
    use std::sync::Arc;

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingDriver for StubEmbedder {
        async fn embed(&self, _text: &str) -> QuorumResult<Vec<f32>> {
            Ok(vec![0.0; 4])
        }

        fn model_name(&self) -> &str {
            "stub"
        }
    }

    struct CannedLlm {
        response: String,
    }

    #[async_trait]
    impl LlmDriver for CannedLlm {
        async fn complete_turns(
            &self,
            _system_prompt: &str,
            _turns: &[quorum_providers::ChatTurn],
        ) -> QuorumResult<String> {
            Ok(self.response.clone())
        }

        fn model_name(&self) -> &str {
            "canned"
        }
    }

    fn context_with(store: Store, response: &str) -> AgentContext {
        AgentContext {
            config: QuorumConfig::default(),
            memory: MemorySubstrate::new(store, Arc::new(StubEmbedder)),
            llm: Arc::new(CannedLlm {
                response: response.to_string(),
            }),
        }
    }

    fn seed_claim(store: &Store) {
        store
            .insert_turn(
                Uuid::new_v4(),
                TurnRole::User,
                "I finished the quarterly report",
                Utc::now(),
            )
            .unwrap();
    }

    fn seed_task(store: &Store) -> Uuid {
        store
            .insert_task(&NewTask {
                title: "Quarterly report".to_string(),
                description: String::new(),
                status: TaskStatus::InProgress,
                priority: 2,
                owner: Some("user".to_string()),
                created_by: "executor".to_string(),
                due_at: None,
                metadata: Metadata::new(),
            })
            .unwrap()
    }

    fn completion_verdict(task_id: Uuid, confidence: f64) -> String {
        json!({
            "verified_completions": [{
                "task_id": task_id.to_string(),
                "evidence_found": "report attached in conversation",
                "confidence": confidence,
            }]
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_confident_verdict_closes_task() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let task_id = seed_task(&store);
        let ctx = context_with(store.clone(), &completion_verdict(task_id, 0.7));

        let summary = CloserAgent::default().run(&ctx).await.unwrap();
        assert!(summary.starts_with("Verified 1 completions"));

        let task = store.task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Done);
        assert!(task.completed_at.is_some());
        let note = task
            .metadata
            .get(quorum_memory::store::VERIFICATION_NOTES_KEY)
            .and_then(|v| v.as_str())
            .unwrap();
        assert!(note.contains("report attached"));
    }

    #[tokio::test]
    async fn test_low_confidence_leaves_task_open() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let task_id = seed_task(&store);
        let ctx = context_with(store.clone(), &completion_verdict(task_id, 0.69));

        CloserAgent::default().run(&ctx).await.unwrap();

        let task = store.task(task_id).unwrap().unwrap();
        assert!(task.status.is_open());
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_second_run_does_not_reopen_closed_task() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let task_id = seed_task(&store);
        let ctx = context_with(store.clone(), &completion_verdict(task_id, 0.95));

        CloserAgent::default().run(&ctx).await.unwrap();
        let first = store.task(task_id).unwrap().unwrap();
        let first_completed_at = first.completed_at;

        // Same verdict again; the task is no longer open so nothing changes.
        let summary = CloserAgent::default().run(&ctx).await.unwrap();
        assert!(summary.starts_with("Verified 0 completions"));
        let second = store.task(task_id).unwrap().unwrap();
        assert_eq!(second.completed_at, first_completed_at);
    }

    #[tokio::test]
    async fn test_partial_update_never_closes() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let task_id = seed_task(&store);
        let verdict = json!({
            "partial_updates": [{
                "task_id": task_id.to_string(),
                "progress_notes": "draft exists, not yet sent",
                "new_status": "done",
            }]
        })
        .to_string();
        let ctx = context_with(store.clone(), &verdict);

        CloserAgent::default().run(&ctx).await.unwrap();

        let task = store.task(task_id).unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
        assert!(task.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_follow_up_flag_creates_event() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let verdict = json!({
            "follow_up_flags": [{
                "claim": "I finished the quarterly report",
                "reason_undetermined": "no matching open task",
                "suggested_action": "ask which task this refers to",
            }]
        })
        .to_string();
        let ctx = context_with(store.clone(), &verdict);

        CloserAgent::default().run(&ctx).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let events = store.events_since(since, 10).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].actor, "closer");
        assert_eq!(events[0].event_type, "follow_up");
        assert_eq!(events[0].title, "Verification follow-up needed");
        assert!(events[0].description.contains("no matching open task"));

        // Follow-ups surface through the flagged-events channel.
        assert_eq!(store.events_flagged_for("executor", since, 10).unwrap().len(), 1);
        assert_eq!(store.events_flagged_for("strategist", since, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_verification_event_flags_peers() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let verdict = json!({
            "verification_events": [{
                "title": "Report confirmed done",
                "description": "Stop working on the quarterly report.",
                "considered_agents": ["executor", "strategist"],
            }]
        })
        .to_string();
        let ctx = context_with(store.clone(), &verdict);

        CloserAgent::default().run(&ctx).await.unwrap();

        let since = Utc::now() - Duration::hours(1);
        let for_executor = store.events_flagged_for("executor", since, 10).unwrap();
        assert_eq!(for_executor.len(), 1);
        assert!(store.events_flagged_for("connector", since, 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_claims_skips_model_call() {
        struct PanickingLlm;

        #[async_trait]
        impl LlmDriver for PanickingLlm {
            async fn complete_turns(
                &self,
                _system_prompt: &str,
                _turns: &[quorum_providers::ChatTurn],
            ) -> QuorumResult<String> {
                panic!("model must not be called without claims");
            }

            fn model_name(&self) -> &str {
                "panicking"
            }
        }

        let store = Store::open_in_memory().unwrap();
        let ctx = AgentContext {
            config: QuorumConfig::default(),
            memory: MemorySubstrate::new(store, Arc::new(StubEmbedder)),
            llm: Arc::new(PanickingLlm),
        };

        let summary = CloserAgent::default().run(&ctx).await.unwrap();
        assert!(summary.contains("nothing to verify"));
    }

    #[tokio::test]
    async fn test_fenced_and_garbage_verdicts() {
        let store = Store::open_in_memory().unwrap();
        seed_claim(&store);
        let task_id = seed_task(&store);

        // Fenced JSON still applies.
        let fenced = format!(
            "```json\n{}\n```",
            completion_verdict(task_id, 0.9)
        );
        let ctx = context_with(store.clone(), &fenced);
        CloserAgent::default().run(&ctx).await.unwrap();
        assert_eq!(
            store.task(task_id).unwrap().unwrap().status,
            TaskStatus::Done
        );

        // Garbage is an empty verdict, not an error.
        let store2 = Store::open_in_memory().unwrap();
        seed_claim(&store2);
        seed_task(&store2);
        let ctx2 = context_with(store2.clone(), "I could not determine anything.");
        let summary = CloserAgent::default().run(&ctx2).await.unwrap();
        assert!(summary.starts_with("Verified 0 completions"));
    }

    #[test]
    fn test_strip_code_fences() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }
}
