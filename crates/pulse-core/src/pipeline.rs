use crate::{deserialize_opt_f64, deserialize_opt_progress};
use crate::events::PipelineUpdate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Ceiling for progress while an agent is still running; only a
/// `completed` update reaches 100.
pub const RUNNING_PROGRESS_CAP: u8 = 90;
/// Increment applied to a running update that carries no progress hint.
pub const RUNNING_PROGRESS_STEP: u8 = 10;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    #[serde(alias = "queued")]
    Pending,
    #[serde(alias = "in_progress", alias = "in-progress")]
    Running,
    #[serde(alias = "done", alias = "success")]
    Completed,
    #[serde(alias = "error")]
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
}

impl Default for AgentStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Running => "running",
            AgentStatus::Completed => "completed",
            AgentStatus::Failed => "failed",
            AgentStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AgentStatus::Completed | AgentStatus::Failed | AgentStatus::Cancelled
        )
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateMeta {
    pub progress: Option<u8>,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    pub at: Option<DateTime<Utc>>,
}

impl From<&PipelineUpdate> for UpdateMeta {
    fn from(update: &PipelineUpdate) -> Self {
        Self {
            progress: update.progress,
            execution_time: update.execution_time,
            error_message: update.error_message.clone(),
            at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AgentProgress {
    pub agent_type: String,
    pub status: AgentStatus,
    pub progress: u8,
    pub execution_time: Option<f64>,
    pub error_message: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
    pub restarts: u32,
}

impl AgentProgress {
    fn pending(agent_type: &str) -> Self {
        Self {
            agent_type: agent_type.to_string(),
            status: AgentStatus::Pending,
            progress: 0,
            execution_time: None,
            error_message: None,
            updated_at: None,
            restarts: 0,
        }
    }

    fn restart(&mut self) {
        self.status = AgentStatus::Pending;
        self.progress = 0;
        self.execution_time = None;
        self.error_message = None;
        self.restarts += 1;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("agent {agent_type} on post {post_id} is {current}; {attempted} needs a restart first")]
    Terminal {
        post_id: String,
        agent_type: String,
        current: AgentStatus,
        attempted: AgentStatus,
    },
}

/// Agent execution log row as served by the pipeline REST endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentLogEntry {
    pub agent_type: String,
    pub status: AgentStatus,
    #[serde(default, deserialize_with = "deserialize_opt_f64")]
    pub execution_time: Option<f64>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default, deserialize_with = "deserialize_opt_progress")]
    pub progress: Option<u8>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Per-post agent state machines. Agents keep first-seen order.
#[derive(Debug, Default)]
pub struct PipelineTracker {
    posts: HashMap<String, Vec<AgentProgress>>,
}

impl PipelineTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies one status update in arrival order.
    ///
    /// Terminal states reject everything except a repeat of the same terminal
    /// state (idempotent) or `pending`, which restarts the agent at 0.
    pub fn apply_update(
        &mut self,
        post_id: &str,
        agent_type: &str,
        status: AgentStatus,
        meta: UpdateMeta,
    ) -> Result<AgentProgress, TransitionError> {
        let agents = self.posts.entry(post_id.to_string()).or_default();
        let idx = match agents.iter().position(|a| a.agent_type == agent_type) {
            Some(idx) => idx,
            None => {
                agents.push(AgentProgress::pending(agent_type));
                agents.len() - 1
            }
        };
        let agent = &mut agents[idx];

        if agent.status.is_terminal() && status != AgentStatus::Pending {
            if agent.status == status {
                return Ok(agent.clone());
            }
            return Err(TransitionError::Terminal {
                post_id: post_id.to_string(),
                agent_type: agent_type.to_string(),
                current: agent.status,
                attempted: status,
            });
        }

        match status {
            AgentStatus::Pending => {
                if agent.status != AgentStatus::Pending {
                    agent.restart();
                }
            }
            AgentStatus::Running => {
                let target = match meta.progress {
                    Some(hint) => hint.min(RUNNING_PROGRESS_CAP),
                    None => agent
                        .progress
                        .saturating_add(RUNNING_PROGRESS_STEP)
                        .min(RUNNING_PROGRESS_CAP),
                };
                agent.progress = agent.progress.max(target);
                agent.status = AgentStatus::Running;
            }
            AgentStatus::Completed => {
                agent.progress = 100;
                agent.status = AgentStatus::Completed;
                agent.execution_time = meta.execution_time.or(agent.execution_time);
            }
            AgentStatus::Failed => {
                agent.status = AgentStatus::Failed;
                agent.execution_time = meta.execution_time.or(agent.execution_time);
                agent.error_message = meta.error_message.clone();
            }
            AgentStatus::Cancelled => {
                agent.status = AgentStatus::Cancelled;
            }
        }
        if meta.at.is_some() {
            agent.updated_at = meta.at;
        }
        Ok(agent.clone())
    }

    pub fn apply(&mut self, update: &PipelineUpdate) -> Result<AgentProgress, TransitionError> {
        self.apply_update(
            &update.post_id,
            &update.agent_type,
            update.status,
            UpdateMeta::from(update),
        )
    }

    /// Replays REST execution logs in order; rejected transitions are skipped.
    pub fn seed_from_logs(&mut self, post_id: &str, logs: &[AgentLogEntry]) -> usize {
        logs.iter()
            .filter(|entry| {
                let meta = UpdateMeta {
                    progress: entry.progress,
                    execution_time: entry.execution_time,
                    error_message: entry.error_message.clone(),
                    at: entry.created_at,
                };
                self.apply_update(post_id, &entry.agent_type, entry.status, meta)
                    .is_ok()
            })
            .count()
    }

    pub fn agents(&self, post_id: &str) -> &[AgentProgress] {
        self.posts.get(post_id).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn agent(&self, post_id: &str, agent_type: &str) -> Option<&AgentProgress> {
        self.agents(post_id).iter().find(|a| a.agent_type == agent_type)
    }

    /// Mean of known agents' progress, 0 when none are known.
    pub fn overall_progress(&self, post_id: &str) -> u8 {
        let agents = self.agents(post_id);
        if agents.is_empty() {
            return 0;
        }
        let sum = agents.iter().map(|a| a.progress as u32).sum::<u32>();
        (sum as f64 / agents.len() as f64).round() as u8
    }
}
