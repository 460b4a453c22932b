use crate::dispatcher::{ConnectionEvent, Dispatch, EventDispatcher, HandlerId, Topic};
use anyhow::Context;
use chrono::{DateTime, Utc};
use pulse_core::events::DomainEvent;
use pulse_core::notify::{
    derive, derive_connectivity, Connectivity, Notification, NotificationPolicy, NotificationQueue,
};
use pulse_core::pipeline::{AgentLogEntry, AgentProgress, PipelineTracker};
use pulse_core::schedule::{
    CampaignScheduleOverview, PostSchedule, SchedulePolicy, ScheduleBoard, StatusChange,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct MonitorState {
    notifications: Mutex<NotificationQueue>,
    tracker: Mutex<PipelineTracker>,
    board: Mutex<ScheduleBoard>,
    /// Set once a failed handshake has been reported; cleared by any
    /// connect or disconnect so the next failure streak reports again.
    unreachable_reported: AtomicBool,
}

/// Local view fed by dispatcher handlers: the visible notification list,
/// per-post agent progress and the schedule board.
#[derive(Clone)]
pub struct Monitor {
    state: Arc<MonitorState>,
}

impl Monitor {
    pub fn new(notifications: &NotificationPolicy, schedule: SchedulePolicy) -> Self {
        Self {
            state: Arc::new(MonitorState {
                notifications: Mutex::new(NotificationQueue::new(notifications.capacity)),
                tracker: Mutex::new(PipelineTracker::new()),
                board: Mutex::new(ScheduleBoard::new(schedule)),
                unreachable_reported: AtomicBool::new(false),
            }),
        }
    }

    /// Registers one handler per topic the monitor cares about.
    pub fn attach(&self, dispatcher: &EventDispatcher) -> Vec<HandlerId> {
        [
            Topic::Connected,
            Topic::Disconnected,
            Topic::Error,
            Topic::ScheduleNotification,
            Topic::PipelineUpdate,
            Topic::SystemAlert,
        ]
        .into_iter()
        .map(|topic| {
            let monitor = self.clone();
            dispatcher.on(topic, move |dispatch| monitor.handle_at(dispatch, Utc::now()))
        })
        .collect()
    }

    pub fn handle_at(&self, dispatch: &Dispatch, now: DateTime<Utc>) -> anyhow::Result<()> {
        match dispatch {
            Dispatch::Connection(event) => {
                self.on_connection(event, now);
                Ok(())
            }
            Dispatch::Domain(event) => self.on_domain(event, now),
        }
    }

    fn on_connection(&self, event: &ConnectionEvent, now: DateTime<Utc>) {
        let change = match event {
            ConnectionEvent::Connected => {
                self.state.unreachable_reported.store(false, Ordering::SeqCst);
                Connectivity::Connected
            }
            ConnectionEvent::Disconnected { will_retry, .. } => {
                self.state.unreachable_reported.store(false, Ordering::SeqCst);
                if !will_retry {
                    return;
                }
                Connectivity::Lost
            }
            ConnectionEvent::Error { message } => {
                if self.state.unreachable_reported.swap(true, Ordering::SeqCst) {
                    debug!(event = "transport_error_suppressed", error = %message);
                    return;
                }
                Connectivity::Unreachable
            }
        };
        self.push(derive_connectivity(change, now));
    }

    fn on_domain(&self, event: &DomainEvent, now: DateTime<Utc>) -> anyhow::Result<()> {
        match event {
            DomainEvent::ScheduleNotification(payload) => {
                if let Some(change) = lock(&self.state.board).apply_event(payload, now) {
                    debug!(
                        event = "schedule_status_change",
                        post_id = %change.post_id,
                        from = change.from.as_str(),
                        to = change.to.as_str()
                    );
                }
            }
            DomainEvent::PipelineUpdate(payload) => {
                lock(&self.state.tracker)
                    .apply(payload)
                    .with_context(|| format!("dropping {} update", payload.status.as_str()))?;
            }
            DomainEvent::SystemAlert(_) => {}
        }
        let notification = derive(event, now)
            .with_context(|| format!("dropping {} event", event.name()))?;
        self.push(notification);
        Ok(())
    }

    pub fn push(&self, notification: Notification) {
        info!(
            event = "notification",
            id = %notification.id,
            severity = notification.severity.as_str(),
            title = %notification.title,
            message = %notification.message
        );
        if let Some(evicted) = lock(&self.state.notifications).push(notification) {
            debug!(event = "notification_evicted", id = %evicted.id);
        }
    }

    /// Newest first.
    pub fn notifications(&self) -> Vec<Notification> {
        lock(&self.state.notifications).snapshot()
    }

    pub fn dismiss(&self, id: &str) -> bool {
        lock(&self.state.notifications).dismiss(id)
    }

    pub fn expire(&self, now: DateTime<Utc>) -> Vec<Notification> {
        lock(&self.state.notifications).expire(now)
    }

    pub fn overall_progress(&self, post_id: &str) -> u8 {
        lock(&self.state.tracker).overall_progress(post_id)
    }

    pub fn agents(&self, post_id: &str) -> Vec<AgentProgress> {
        lock(&self.state.tracker).agents(post_id).to_vec()
    }

    pub fn seed_agent_logs(&self, post_id: &str, logs: &[AgentLogEntry]) -> usize {
        lock(&self.state.tracker).seed_from_logs(post_id, logs)
    }

    pub fn seed_schedules(&self, schedules: impl IntoIterator<Item = PostSchedule>) -> usize {
        lock(&self.state.board).seed(schedules)
    }

    pub fn schedule(&self, post_id: &str) -> Option<PostSchedule> {
        lock(&self.state.board).get(post_id).cloned()
    }

    pub fn refresh_schedules(&self, now: DateTime<Utc>) -> Vec<StatusChange> {
        lock(&self.state.board).refresh(now)
    }

    pub fn overview(&self, now: DateTime<Utc>) -> CampaignScheduleOverview {
        lock(&self.state.board).overview(now)
    }

    pub fn campaign_overview(&self, campaign_id: &str, now: DateTime<Utc>) -> CampaignScheduleOverview {
        lock(&self.state.board).campaign_overview(campaign_id, now)
    }
}
