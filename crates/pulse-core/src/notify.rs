use crate::events::{
    AlertLevel, DomainEvent, PipelineUpdate, ScheduleNotification, ScheduleNotificationType,
    SystemAlert, Urgency,
};
use crate::pipeline::AgentStatus;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_QUEUE_CAPACITY: usize = 5;
pub const DEFAULT_REAPER_INTERVAL_MS: u64 = 1_000;

pub const DURATION_DEFAULT_MS: u64 = 5_000;
pub const DURATION_DEADLINE_MS: u64 = 7_000;
pub const DURATION_OVERDUE_MS: u64 = 10_000;
pub const DURATION_PIPELINE_FAILED_MS: u64 = 8_000;
pub const DURATION_ALERT_MS: u64 = 6_000;
pub const DURATION_ALERT_CRITICAL_MS: u64 = 10_000;
pub const DURATION_CONNECTED_MS: u64 = 3_000;
pub const DURATION_UNREACHABLE_MS: u64 = 10_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Success => "success",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    DeadlineApproaching,
    Overdue,
    PriorityChanged,
    StageCompleted,
    PipelineQueued,
    PipelineStarted,
    PipelineCompleted,
    PipelineFailed,
    PipelineCancelled,
    SystemAlert,
    Connectivity,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NotificationAction {
    pub label: String,
    pub href: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<NotificationAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_id: Option<String>,
}

impl Notification {
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.created_at + Duration::milliseconds(self.duration_ms as i64)
    }
}

/// Transport state changes that surface as synthetic notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Connected,
    Lost,
    /// Handshakes keep failing and no link has been established.
    Unreachable,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NotificationPolicy {
    pub capacity: usize,
    /// How often expired notifications are swept out of the queue.
    pub reaper_interval_ms: u64,
}

impl Default for NotificationPolicy {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_QUEUE_CAPACITY,
            reaper_interval_ms: DEFAULT_REAPER_INTERVAL_MS,
        }
    }
}

impl NotificationPolicy {
    pub fn reaper_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.reaper_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeriveError {
    #[error("{event} is missing required field {field}")]
    MissingField {
        event: &'static str,
        field: &'static str,
    },
}

/// Maps one domain event to exactly one notification. Identical events are
/// never merged.
pub fn derive(event: &DomainEvent, now: DateTime<Utc>) -> Result<Notification, DeriveError> {
    match event {
        DomainEvent::ScheduleNotification(payload) => derive_schedule(payload, now),
        DomainEvent::PipelineUpdate(payload) => derive_pipeline(payload, now),
        DomainEvent::SystemAlert(payload) => derive_alert(payload, now),
    }
}

pub fn derive_connectivity(change: Connectivity, now: DateTime<Utc>) -> Notification {
    let (title, message, severity, duration_ms) = match change {
        Connectivity::Connected => (
            "Real-time connected",
            "Live schedule and pipeline updates are on",
            Severity::Success,
            DURATION_CONNECTED_MS,
        ),
        Connectivity::Lost => (
            "Connection lost",
            "Live updates paused; reconnecting",
            Severity::Warning,
            DURATION_DEFAULT_MS,
        ),
        Connectivity::Unreachable => (
            "Real-time unavailable",
            "Cannot reach the live update service; retrying in the background",
            Severity::Error,
            DURATION_UNREACHABLE_MS,
        ),
    };
    Notification {
        id: notification_id(now),
        kind: NotificationKind::Connectivity,
        title: title.to_string(),
        message: message.to_string(),
        severity,
        created_at: now,
        duration_ms,
        action: None,
        post_id: None,
    }
}

fn derive_schedule(
    payload: &ScheduleNotification,
    now: DateTime<Utc>,
) -> Result<Notification, DeriveError> {
    require("schedule_notification", "post_id", &payload.post_id)?;
    let stage = payload.stage_label();
    let base = payload.message.trim();

    let (kind, severity, duration_ms, title, message) = match payload.kind {
        ScheduleNotificationType::DeadlineApproaching => {
            let severity = if payload.urgency == Some(Urgency::High) {
                Severity::Warning
            } else {
                Severity::Info
            };
            let title = match &stage {
                Some(stage) => format!("Deadline approaching: {stage}"),
                None => "Deadline approaching".to_string(),
            };
            let message = match (base.is_empty(), payload.hours_remaining) {
                (false, _) => base.to_string(),
                (true, Some(hours)) => {
                    format!("Post {} is due in {:.0}h", payload.post_id, hours.max(0.0))
                }
                (true, None) => format!("Post {} is due soon", payload.post_id),
            };
            (
                NotificationKind::DeadlineApproaching,
                severity,
                DURATION_DEADLINE_MS,
                title,
                message,
            )
        }
        ScheduleNotificationType::Overdue => {
            let title = match &stage {
                Some(stage) => format!("Overdue: {stage}"),
                None => "Post overdue".to_string(),
            };
            let mut message = if base.is_empty() {
                format!("Post {} missed its deadline", payload.post_id)
            } else {
                base.to_string()
            };
            if let Some(days) = payload.delay_days {
                let unit = if days == 1 { "day" } else { "days" };
                message.push_str(&format!(" ({days} {unit} overdue)"));
            }
            (
                NotificationKind::Overdue,
                Severity::Error,
                DURATION_OVERDUE_MS,
                title,
                message,
            )
        }
        ScheduleNotificationType::PriorityChanged => (
            NotificationKind::PriorityChanged,
            Severity::Warning,
            DURATION_DEFAULT_MS,
            "Priority changed".to_string(),
            or_fallback(base, || format!("Priority changed for post {}", payload.post_id)),
        ),
        ScheduleNotificationType::StageCompleted => (
            NotificationKind::StageCompleted,
            Severity::Success,
            DURATION_DEFAULT_MS,
            match &stage {
                Some(stage) => format!("Stage completed: {stage}"),
                None => "Stage completed".to_string(),
            },
            or_fallback(base, || format!("Post {} moved to the next stage", payload.post_id)),
        ),
    };

    Ok(Notification {
        id: notification_id(now),
        kind,
        title,
        message,
        severity,
        created_at: now,
        duration_ms,
        action: Some(NotificationAction {
            label: "View post".to_string(),
            href: format!("/posts/{}", payload.post_id),
        }),
        post_id: Some(payload.post_id.clone()),
    })
}

fn derive_pipeline(payload: &PipelineUpdate, now: DateTime<Utc>) -> Result<Notification, DeriveError> {
    require("pipeline_update", "post_id", &payload.post_id)?;
    require("pipeline_update", "agent_type", &payload.agent_type)?;
    let agent = payload.agent_type.trim();

    let (kind, severity, duration_ms, title, message) = match payload.status {
        AgentStatus::Pending => (
            NotificationKind::PipelineQueued,
            Severity::Info,
            DURATION_DEFAULT_MS,
            "Pipeline queued",
            format!("{agent} queued"),
        ),
        AgentStatus::Running => (
            NotificationKind::PipelineStarted,
            Severity::Info,
            DURATION_DEFAULT_MS,
            "Pipeline running",
            format!("{agent} started"),
        ),
        AgentStatus::Completed => (
            NotificationKind::PipelineCompleted,
            Severity::Success,
            DURATION_DEFAULT_MS,
            "Pipeline step completed",
            match payload.execution_time {
                Some(secs) => format!("{agent} completed in {secs:.1}s"),
                None => format!("{agent} completed"),
            },
        ),
        AgentStatus::Failed => (
            NotificationKind::PipelineFailed,
            Severity::Error,
            DURATION_PIPELINE_FAILED_MS,
            "Pipeline step failed",
            format!(
                "{agent} failed: {}",
                payload
                    .error_message
                    .as_deref()
                    .map(str::trim)
                    .filter(|msg| !msg.is_empty())
                    .unwrap_or("unknown error")
            ),
        ),
        AgentStatus::Cancelled => (
            NotificationKind::PipelineCancelled,
            Severity::Warning,
            DURATION_DEFAULT_MS,
            "Pipeline step cancelled",
            format!("{agent} cancelled"),
        ),
    };

    let action = (payload.status == AgentStatus::Failed).then(|| NotificationAction {
        label: "View logs".to_string(),
        href: format!("/posts/{}/logs", payload.post_id),
    });

    Ok(Notification {
        id: notification_id(now),
        kind,
        title: title.to_string(),
        message,
        severity,
        created_at: now,
        duration_ms,
        action,
        post_id: Some(payload.post_id.clone()),
    })
}

fn derive_alert(payload: &SystemAlert, now: DateTime<Utc>) -> Result<Notification, DeriveError> {
    require("system_alert", "alert_type", &payload.alert_type)?;
    let (severity, duration_ms) = match payload.level {
        AlertLevel::Warning => (Severity::Warning, DURATION_ALERT_MS),
        AlertLevel::Critical => (Severity::Error, DURATION_ALERT_CRITICAL_MS),
        AlertLevel::Info | AlertLevel::Other => (Severity::Info, DURATION_ALERT_MS),
    };
    Ok(Notification {
        id: notification_id(now),
        kind: NotificationKind::SystemAlert,
        title: format!("System alert: {}", payload.alert_type.trim()),
        message: payload.message.clone(),
        severity,
        created_at: now,
        duration_ms,
        action: None,
        post_id: None,
    })
}

fn require(event: &'static str, field: &'static str, value: &str) -> Result<(), DeriveError> {
    if value.trim().is_empty() {
        return Err(DeriveError::MissingField { event, field });
    }
    Ok(())
}

fn or_fallback(base: &str, fallback: impl FnOnce() -> String) -> String {
    if base.is_empty() {
        fallback()
    } else {
        base.to_string()
    }
}

fn notification_id(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("notif-{}-{}", now.timestamp_millis(), &suffix[..8])
}

/// Newest-first bounded notification list.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    capacity: usize,
    items: VecDeque<Notification>,
}

impl Default for NotificationQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Inserts at the front; returns the oldest entry when it was evicted.
    pub fn push(&mut self, notification: Notification) -> Option<Notification> {
        self.items.push_front(notification);
        if self.items.len() > self.capacity {
            return self.items.pop_back();
        }
        None
    }

    pub fn dismiss(&mut self, id: &str) -> bool {
        match self.items.iter().position(|n| n.id == id) {
            Some(idx) => self.items.remove(idx).is_some(),
            None => false,
        }
    }

    /// Drops every notification whose TTL elapsed at `now`.
    pub fn expire(&mut self, now: DateTime<Utc>) -> Vec<Notification> {
        let mut expired = Vec::new();
        self.items.retain(|n| {
            if n.expires_at() <= now {
                expired.push(n.clone());
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.items.iter()
    }

    pub fn snapshot(&self) -> Vec<Notification> {
        self.items.iter().cloned().collect()
    }
}
