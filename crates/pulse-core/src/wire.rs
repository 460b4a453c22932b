use crate::events::{DomainEvent, PipelineUpdate, ScheduleNotification, SystemAlert};
use crate::{deserialize_opt_id, EntityKind};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// Frames sent by the backend, discriminated by `event`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum ServerMsg {
    ScheduleNotification(ScheduleNotification),
    PipelineUpdate(PipelineUpdate),
    SystemAlert(SystemAlert),
    Ping(PingPayload),
    Pong(PingPayload),
    Subscribed(SubscriptionTarget),
}

impl ServerMsg {
    /// Splits domain events from transport chatter.
    pub fn into_domain_event(self) -> Option<DomainEvent> {
        match self {
            ServerMsg::ScheduleNotification(payload) => {
                Some(DomainEvent::ScheduleNotification(payload))
            }
            ServerMsg::PipelineUpdate(payload) => Some(DomainEvent::PipelineUpdate(payload)),
            ServerMsg::SystemAlert(payload) => Some(DomainEvent::SystemAlert(payload)),
            ServerMsg::Ping(_) | ServerMsg::Pong(_) | ServerMsg::Subscribed(_) => None,
        }
    }
}

impl From<DomainEvent> for ServerMsg {
    fn from(event: DomainEvent) -> Self {
        match event {
            DomainEvent::ScheduleNotification(payload) => ServerMsg::ScheduleNotification(payload),
            DomainEvent::PipelineUpdate(payload) => ServerMsg::PipelineUpdate(payload),
            DomainEvent::SystemAlert(payload) => ServerMsg::SystemAlert(payload),
        }
    }
}

/// Frames sent by the client, discriminated by `action`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlMsg {
    Subscribe(SubscriptionTarget),
    Unsubscribe(SubscriptionTarget),
    Ping(PingPayload),
    Pong(PingPayload),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SubscriptionTarget {
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub post_id: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_opt_id",
        skip_serializing_if = "Option::is_none"
    )]
    pub campaign_id: Option<String>,
}

impl SubscriptionTarget {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        match kind {
            EntityKind::Post => Self {
                post_id: Some(id.into()),
                campaign_id: None,
            },
            EntityKind::Campaign => Self {
                post_id: None,
                campaign_id: Some(id.into()),
            },
        }
    }

    pub fn entity(&self) -> Option<(EntityKind, &str)> {
        match (&self.post_id, &self.campaign_id) {
            (Some(post_id), None) => Some((EntityKind::Post, post_id)),
            (None, Some(campaign_id)) => Some((EntityKind::Campaign, campaign_id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct PingPayload {
    /// Unix millis at the sender.
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = text.trim_end_matches(&['\r', '\n'][..]);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}
