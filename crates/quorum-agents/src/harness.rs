//! Run lifecycle for agents: connect, execute, audit, disconnect.
//!
//! Every invocation leaves exactly one row in `agent_runs`, whether the
//! agent succeeded or failed. Audit-write failures after a successful run
//! are themselves recorded as failed runs where possible, and surfaced to
//! the caller; a run that cannot be audited did not cleanly complete.

use async_trait::async_trait;
use chrono::Utc;
use quorum_memory::{MemorySubstrate, Store};
use quorum_providers::{create_embedding_driver, create_llm_driver, EmbeddingDriver, LlmDriver};
use quorum_types::record::{Metadata, RunStatus};
use quorum_types::{QuorumConfig, QuorumResult};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Everything an agent gets for one run.
pub struct AgentContext {
    pub config: QuorumConfig,
    pub memory: MemorySubstrate,
    pub llm: Arc<dyn LlmDriver + Send + Sync>,
}

/// A runnable agent. Returns a one-line summary of what it did; the
/// harness writes that summary into the audit row.
#[async_trait]
pub trait Agent: Send {
    fn name(&self) -> &str;

    async fn run(&mut self, ctx: &AgentContext) -> QuorumResult<String>;
}

/// Owns the store connection and runs agents through the full lifecycle.
///
/// The connection opens lazily when a run starts and is released when the
/// run finishes, whatever the outcome; the next run reconnects.
pub struct Harness {
    config: QuorumConfig,
    store: Option<Store>,
}

impl Harness {
    pub fn new(config: QuorumConfig) -> Self {
        Self {
            config,
            store: None,
        }
    }

    fn connect(&mut self) -> QuorumResult<Store> {
        if let Some(store) = &self.store {
            return Ok(store.clone());
        }
        let store = Store::open(&self.config.db_path)?;
        info!(db_path = %self.config.db_path.display(), "Connected to store");
        self.store = Some(store.clone());
        Ok(store)
    }

    /// Drop the store connection. The next run reconnects.
    pub fn disconnect(&mut self) {
        self.store = None;
    }

    /// Run one agent end to end. The original agent error always wins over
    /// secondary audit failures; the connection is released whatever the
    /// outcome.
    pub async fn execute(&mut self, agent: &mut dyn Agent) -> QuorumResult<String> {
        let started_at = Utc::now();

        // Drivers first: a config error must not leave a connection behind.
        let embedder: Arc<dyn EmbeddingDriver + Send + Sync> =
            Arc::from(create_embedding_driver(&self.config)?);
        let llm: Arc<dyn LlmDriver + Send + Sync> = Arc::from(create_llm_driver(&self.config)?);

        let store = self.connect()?;
        let ctx = AgentContext {
            config: self.config.clone(),
            memory: MemorySubstrate::new(store.clone(), embedder),
            llm,
        };

        info!(agent = agent.name(), "Agent run started");
        let result = agent.run(&ctx).await;
        drop(ctx);

        let outcome = match result {
            Ok(summary) => {
                let audit = store.insert_agent_run(
                    agent.name(),
                    started_at,
                    RunStatus::Completed,
                    &summary,
                    &Metadata::new(),
                );
                match audit {
                    Ok(_) => {
                        info!(agent = agent.name(), %summary, "Agent run completed");
                        Ok(summary)
                    }
                    Err(audit_err) => {
                        // Best effort; the audit error is what the caller sees.
                        if let Err(e) = store.insert_agent_run(
                            agent.name(),
                            started_at,
                            RunStatus::Failed,
                            &format!("audit write failed: {audit_err}"),
                            &Metadata::new(),
                        ) {
                            warn!(agent = agent.name(), error = %e, "Failure audit also failed");
                        }
                        error!(agent = agent.name(), error = %audit_err, "Audit write failed");
                        Err(audit_err)
                    }
                }
            }
            Err(err) => {
                if let Err(e) = store.insert_agent_run(
                    agent.name(),
                    started_at,
                    RunStatus::Failed,
                    &err.to_string(),
                    &Metadata::new(),
                ) {
                    warn!(agent = agent.name(), error = %e, "Failure audit write failed");
                }
                error!(agent = agent.name(), error = %err, "Agent run failed");
                Err(err)
            }
        };

        self.disconnect();
        outcome
    }
}
