use crate::config::ClientConfig;
use crate::connection::{ConnError, ConnectionManager, ConnectionStatus};
use crate::dispatcher::{dispatch_channel, Dispatch, DispatchSender, EventDispatcher, HandlerId, Topic};
use crate::monitor::Monitor;
use crate::snapshot::{SnapshotClient, SnapshotError};
use chrono::Utc;
use pulse_core::events::DomainEvent;
use pulse_core::notify::Notification;
use pulse_core::pipeline::AgentProgress;
use pulse_core::schedule::CampaignScheduleOverview;
use pulse_core::EntityKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Wires the connection, dispatcher and monitor together and owns their
/// background tasks. Must be started inside a tokio runtime.
pub struct PulseClient {
    dispatcher: Arc<EventDispatcher>,
    sender: DispatchSender,
    connection: ConnectionManager,
    monitor: Monitor,
    snapshots: SnapshotClient,
    shutdown: watch::Sender<bool>,
    dispatch_task: JoinHandle<()>,
    reaper_task: JoinHandle<()>,
}

impl PulseClient {
    pub fn start(config: ClientConfig) -> Self {
        let dispatcher = Arc::new(EventDispatcher::new());
        let monitor = Monitor::new(&config.notifications, config.schedule.clone());
        monitor.attach(&dispatcher);

        let (sender, receiver) = dispatch_channel();
        let dispatch_task = tokio::spawn(dispatcher.clone().run(receiver));
        let connection = ConnectionManager::new(&config, sender.clone());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let reaper_task = spawn_reaper(
            monitor.clone(),
            config.notifications.reaper_interval(),
            shutdown_rx,
        );

        info!(
            event = "pulse_client_start",
            client_id = %config.client_id,
            ws_url = %config.ws_url,
            api_base = %config.api_base
        );
        Self {
            dispatcher,
            sender,
            connection,
            monitor,
            snapshots: SnapshotClient::new(config.api_base),
            shutdown,
            dispatch_task,
            reaper_task,
        }
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&Dispatch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.dispatcher.on(topic, handler)
    }

    pub fn off(&self, id: HandlerId) -> bool {
        self.dispatcher.off(id)
    }

    pub async fn connect(&self) -> Result<(), ConnError> {
        self.connection.connect().await
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub async fn subscribe(&self, kind: EntityKind, id: &str) -> Result<(), ConnError> {
        self.connection.subscribe(kind, id).await
    }

    pub async fn unsubscribe(&self, kind: EntityKind, id: &str) {
        self.connection.unsubscribe(kind, id).await;
    }

    pub fn status(&self) -> ConnectionStatus {
        self.connection.status()
    }

    /// Queues an event behind anything already received, so a manual event
    /// never races live traffic.
    pub async fn inject(&self, event: DomainEvent) -> anyhow::Result<()> {
        self.sender
            .send(Dispatch::Domain(event))
            .await
            .map_err(|_| anyhow::anyhow!("dispatcher stopped"))
    }

    pub fn monitor(&self) -> &Monitor {
        &self.monitor
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.monitor.notifications()
    }

    pub fn dismiss(&self, id: &str) -> bool {
        self.monitor.dismiss(id)
    }

    pub fn overall_progress(&self, post_id: &str) -> u8 {
        self.monitor.overall_progress(post_id)
    }

    pub fn agents(&self, post_id: &str) -> Vec<AgentProgress> {
        self.monitor.agents(post_id)
    }

    pub fn campaign_overview(&self, campaign_id: &str) -> CampaignScheduleOverview {
        self.monitor.campaign_overview(campaign_id, Utc::now())
    }

    /// Loads every post schedule of a campaign into the board.
    pub async fn seed_campaign(&self, campaign_id: &str) -> Result<usize, SnapshotError> {
        let schedules = self.snapshots.campaign_schedules(campaign_id).await?;
        let seeded = self.monitor.seed_schedules(schedules);
        self.monitor.refresh_schedules(Utc::now());
        info!(event = "snapshot_seeded", campaign_id, posts = seeded);
        Ok(seeded)
    }

    /// Loads one post's schedule and replays its agent logs.
    pub async fn seed_post(&self, post_id: &str) -> Result<usize, SnapshotError> {
        let schedule = self.snapshots.post_schedule(post_id).await?;
        self.monitor.seed_schedules([schedule]);
        self.monitor.refresh_schedules(Utc::now());
        let logs = self.snapshots.agent_logs(post_id).await?;
        let applied = self.monitor.seed_agent_logs(post_id, &logs);
        info!(event = "snapshot_seeded", post_id, agent_logs = applied);
        Ok(applied)
    }

    /// Disconnects, stops the reaper and drains queued dispatches.
    pub async fn shutdown(self) {
        self.connection.disconnect().await;
        self.shutdown.send_replace(true);
        if let Err(err) = self.reaper_task.await {
            warn!(event = "pulse_reaper_join_error", error = %err);
        }
        drop(self.connection);
        drop(self.sender);
        if let Err(err) = self.dispatch_task.await {
            warn!(event = "pulse_dispatch_join_error", error = %err);
        }
        info!(event = "pulse_client_stop");
    }
}

fn spawn_reaper(
    monitor: Monitor,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let now = Utc::now();
                    let expired = monitor.expire(now);
                    if !expired.is_empty() {
                        debug!(event = "notification_expired", count = expired.len());
                    }
                    for change in monitor.refresh_schedules(now) {
                        info!(
                            event = "schedule_status_change",
                            post_id = %change.post_id,
                            from = change.from.as_str(),
                            to = change.to.as_str()
                        );
                    }
                }
            }
        }
    })
}
