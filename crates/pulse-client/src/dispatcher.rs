use pulse_core::events::DomainEvent;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, PoisonError, RwLock,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const DISPATCH_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    Connected,
    Disconnected,
    Error,
    ScheduleNotification,
    PipelineUpdate,
    SystemAlert,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::Connected => "connected",
            Topic::Disconnected => "disconnected",
            Topic::Error => "error",
            Topic::ScheduleNotification => "schedule_notification",
            Topic::PipelineUpdate => "pipeline_update",
            Topic::SystemAlert => "system_alert",
        }
    }
}

/// Meta events raised by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected { reason: String, will_retry: bool },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Dispatch {
    Connection(ConnectionEvent),
    Domain(DomainEvent),
}

impl Dispatch {
    pub fn topic(&self) -> Topic {
        match self {
            Dispatch::Connection(ConnectionEvent::Connected) => Topic::Connected,
            Dispatch::Connection(ConnectionEvent::Disconnected { .. }) => Topic::Disconnected,
            Dispatch::Connection(ConnectionEvent::Error { .. }) => Topic::Error,
            Dispatch::Domain(DomainEvent::ScheduleNotification(_)) => Topic::ScheduleNotification,
            Dispatch::Domain(DomainEvent::PipelineUpdate(_)) => Topic::PipelineUpdate,
            Dispatch::Domain(DomainEvent::SystemAlert(_)) => Topic::SystemAlert,
        }
    }
}

pub type DispatchSender = mpsc::Sender<Dispatch>;
pub type DispatchReceiver = mpsc::Receiver<Dispatch>;

/// Producers (socket task, manual injection) share the sender; the
/// dispatcher's `run` loop is the only consumer.
pub fn dispatch_channel() -> (DispatchSender, DispatchReceiver) {
    mpsc::channel(DISPATCH_QUEUE_CAPACITY)
}

pub type Handler = Arc<dyn Fn(&Dispatch) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

struct Registration {
    id: HandlerId,
    topic: Topic,
    handler: Handler,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
}

/// Topic-keyed observer list. Delivery follows registration order and one
/// failing handler never blocks the next. Nothing is buffered for late
/// registrations.
#[derive(Default)]
pub struct EventDispatcher {
    next_id: AtomicU64,
    registrations: RwLock<Vec<Registration>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on<F>(&self, topic: Topic, handler: F) -> HandlerId
    where
        F: Fn(&Dispatch) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Registration {
                id,
                topic,
                handler: Arc::new(handler),
            });
        id
    }

    pub fn off(&self, id: HandlerId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|r| r.id != id);
        registrations.len() != before
    }

    pub fn handler_count(&self, topic: Topic) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.topic == topic)
            .count()
    }

    pub fn emit(&self, dispatch: &Dispatch) -> DeliveryReport {
        let topic = dispatch.topic();
        let handlers = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|r| r.topic == topic)
            .map(|r| (r.id, r.handler.clone()))
            .collect::<Vec<_>>();

        let mut report = DeliveryReport::default();
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(dispatch))) {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    warn!(
                        event = "dispatch_handler_error",
                        topic = topic.as_str(),
                        handler = id.0,
                        error = %err
                    );
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(event = "dispatch_handler_panic", topic = topic.as_str(), handler = id.0);
                }
            }
        }
        report
    }

    /// Drains the queue in arrival order until every sender is dropped.
    pub async fn run(self: Arc<Self>, mut rx: DispatchReceiver) {
        while let Some(dispatch) = rx.recv().await {
            self.emit(&dispatch);
        }
        debug!(event = "dispatch_loop_stop");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::events::SystemAlert;
    use std::sync::Mutex;

    fn alert(message: &str) -> Dispatch {
        Dispatch::Domain(DomainEvent::SystemAlert(SystemAlert {
            alert_type: "quota".to_string(),
            message: message.to_string(),
            level: Default::default(),
        }))
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(&Dispatch) -> anyhow::Result<()> {
        let log = log.clone();
        move |dispatch| {
            let message = match dispatch {
                Dispatch::Domain(DomainEvent::SystemAlert(alert)) => alert.message.clone(),
                other => format!("{:?}", other.topic()),
            };
            log.lock().expect("log lock").push(format!("{tag}:{message}"));
            Ok(())
        }
    }

    #[test]
    fn delivers_in_registration_order_per_topic() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(Topic::SystemAlert, recorder(&log, "first"));
        dispatcher.on(Topic::Connected, recorder(&log, "conn"));
        dispatcher.on(Topic::SystemAlert, recorder(&log, "second"));

        let report = dispatcher.emit(&alert("a"));
        assert_eq!(report, DeliveryReport { delivered: 2, failed: 0 });
        assert_eq!(*log.lock().expect("log"), vec!["first:a", "second:a"]);
    }

    #[test]
    fn failing_and_panicking_handlers_are_isolated() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(Topic::SystemAlert, |_| Err(anyhow::anyhow!("boom")));
        dispatcher.on(Topic::SystemAlert, |_| panic!("handler bug"));
        dispatcher.on(Topic::SystemAlert, recorder(&log, "last"));

        let report = dispatcher.emit(&alert("x"));
        assert_eq!(report, DeliveryReport { delivered: 1, failed: 2 });
        assert_eq!(*log.lock().expect("log"), vec!["last:x"]);
    }

    #[test]
    fn off_removes_only_that_handler() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = dispatcher.on(Topic::SystemAlert, recorder(&log, "first"));
        dispatcher.on(Topic::SystemAlert, recorder(&log, "second"));

        assert!(dispatcher.off(first));
        assert!(!dispatcher.off(first));
        assert_eq!(dispatcher.handler_count(Topic::SystemAlert), 1);
        dispatcher.emit(&alert("y"));
        assert_eq!(*log.lock().expect("log"), vec!["second:y"]);
    }

    #[test]
    fn late_handlers_do_not_see_earlier_events() {
        let dispatcher = EventDispatcher::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        assert_eq!(dispatcher.emit(&alert("early")).delivered, 0);
        dispatcher.on(Topic::SystemAlert, recorder(&log, "late"));
        dispatcher.emit(&alert("later"));
        assert_eq!(*log.lock().expect("log"), vec!["late:later"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn run_loop_preserves_arrival_order_across_producers() {
        let dispatcher = Arc::new(EventDispatcher::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        dispatcher.on(Topic::SystemAlert, recorder(&log, "h"));
        dispatcher.on(Topic::Disconnected, recorder(&log, "h"));

        let (tx, rx) = dispatch_channel();
        let runner = tokio::spawn(dispatcher.clone().run(rx));
        for idx in 0..20 {
            tx.send(alert(&idx.to_string())).await.expect("send");
        }
        tx.send(Dispatch::Connection(ConnectionEvent::Disconnected {
            reason: "closed".to_string(),
            will_retry: false,
        }))
        .await
        .expect("send meta");
        drop(tx);
        runner.await.expect("runner");

        let log = log.lock().expect("log");
        assert_eq!(log.len(), 21);
        let expected = (0..20).map(|idx| format!("h:{idx}")).collect::<Vec<_>>();
        assert_eq!(&log[..20], expected.as_slice());
        assert_eq!(log[20], "h:Disconnected");
    }
}
