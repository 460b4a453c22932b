use crate::pipeline::AgentStatus;
use crate::schedule::Stage;
use crate::{deserialize_id, deserialize_opt_f64, deserialize_opt_progress};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleNotificationType {
    DeadlineApproaching,
    Overdue,
    PriorityChanged,
    StageCompleted,
}

impl ScheduleNotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleNotificationType::DeadlineApproaching => "deadline_approaching",
            ScheduleNotificationType::Overdue => "overdue",
            ScheduleNotificationType::PriorityChanged => "priority_changed",
            ScheduleNotificationType::StageCompleted => "stage_completed",
        }
    }
}

impl fmt::Display for ScheduleNotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
    #[serde(other)]
    Other,
}

impl Default for AlertLevel {
    fn default() -> Self {
        Self::Info
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduleNotification {
    #[serde(deserialize_with = "deserialize_id")]
    pub post_id: String,
    #[serde(rename = "type")]
    pub kind: ScheduleNotificationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_days: Option<i64>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub hours_remaining: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub urgency: Option<Urgency>,
    #[serde(default)]
    pub message: String,
}

impl ScheduleNotification {
    /// Parsed stage, when the backend sent one of the six known stage keys.
    pub fn stage(&self) -> Option<Stage> {
        self.stage.as_deref().and_then(|raw| raw.parse().ok())
    }

    /// Human label for the stage: the known label, else the raw value.
    pub fn stage_label(&self) -> Option<String> {
        match (self.stage(), self.stage.as_deref()) {
            (Some(stage), _) => Some(stage.label().to_string()),
            (None, Some(raw)) if !raw.trim().is_empty() => Some(raw.trim().to_string()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineUpdate {
    #[serde(deserialize_with = "deserialize_id")]
    pub post_id: String,
    pub agent_type: String,
    pub status: AgentStatus,
    /// Seconds.
    #[serde(
        default,
        deserialize_with = "deserialize_opt_f64",
        skip_serializing_if = "Option::is_none"
    )]
    pub execution_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_progress",
        skip_serializing_if = "Option::is_none"
    )]
    pub progress: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemAlert {
    pub alert_type: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub level: AlertLevel,
}

/// A typed event received from the backend. Immutable once received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum DomainEvent {
    ScheduleNotification(ScheduleNotification),
    PipelineUpdate(PipelineUpdate),
    SystemAlert(SystemAlert),
}

impl DomainEvent {
    pub fn name(&self) -> &'static str {
        match self {
            DomainEvent::ScheduleNotification(_) => "schedule_notification",
            DomainEvent::PipelineUpdate(_) => "pipeline_update",
            DomainEvent::SystemAlert(_) => "system_alert",
        }
    }

    /// The post this event is about; system alerts are global.
    pub fn post_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ScheduleNotification(payload) => Some(&payload.post_id),
            DomainEvent::PipelineUpdate(payload) => Some(&payload.post_id),
            DomainEvent::SystemAlert(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_notification_parses_optional_fields() {
        let event: DomainEvent = serde_json::from_str(
            r#"{
                "event": "schedule_notification",
                "data": {
                    "post_id": 118,
                    "type": "deadline_approaching",
                    "stage": "admin_review",
                    "hours_remaining": "5.5",
                    "urgency": "high",
                    "message": "admin review due soon"
                }
            }"#,
        )
        .expect("parse schedule notification");

        let DomainEvent::ScheduleNotification(payload) = &event else {
            panic!("unexpected variant: {event:?}");
        };
        assert_eq!(payload.post_id, "118");
        assert_eq!(payload.kind, ScheduleNotificationType::DeadlineApproaching);
        assert_eq!(payload.stage(), Some(Stage::AdminReview));
        assert_eq!(payload.hours_remaining, Some(5.5));
        assert_eq!(payload.urgency, Some(Urgency::High));
        assert_eq!(payload.delay_days, None);
        assert_eq!(event.post_id(), Some("118"));
    }

    #[test]
    fn unknown_urgency_and_level_fall_back() {
        let schedule: ScheduleNotification = serde_json::from_str(
            r#"{"post_id":"p1","type":"overdue","urgency":"extreme","message":"late"}"#,
        )
        .expect("parse");
        assert_eq!(schedule.urgency, Some(Urgency::Unknown));

        let alert: SystemAlert =
            serde_json::from_str(r#"{"alert_type":"quota","message":"m","level":"notice"}"#)
                .expect("parse alert");
        assert_eq!(alert.level, AlertLevel::Other);

        let no_level: SystemAlert =
            serde_json::from_str(r#"{"alert_type":"quota","message":"m"}"#).expect("parse");
        assert_eq!(no_level.level, AlertLevel::Info);
    }

    #[test]
    fn unknown_schedule_type_is_rejected() {
        let result = serde_json::from_str::<ScheduleNotification>(
            r#"{"post_id":"p1","type":"moon_phase","message":"?"}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn unrecognised_stage_keeps_raw_label() {
        let payload: ScheduleNotification = serde_json::from_str(
            r#"{"post_id":"p1","type":"stage_completed","stage":"legal_check","message":""}"#,
        )
        .expect("parse");
        assert_eq!(payload.stage(), None);
        assert_eq!(payload.stage_label().as_deref(), Some("legal_check"));
    }
}
