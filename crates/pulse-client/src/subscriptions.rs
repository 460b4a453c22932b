use pulse_core::wire::{ControlMsg, SubscriptionTarget};
use pulse_core::EntityKind;
use std::collections::BTreeMap;

/// Reference-counted interest in posts and campaigns. Wire messages are only
/// produced on the 0 -> 1 and 1 -> 0 transitions.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<(EntityKind, String), usize>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, kind: EntityKind, id: &str) -> Option<ControlMsg> {
        let count = self.entries.entry((kind, id.to_string())).or_insert(0);
        *count += 1;
        (*count == 1).then(|| ControlMsg::Subscribe(SubscriptionTarget::new(kind, id)))
    }

    pub fn unsubscribe(&mut self, kind: EntityKind, id: &str) -> Option<ControlMsg> {
        let key = (kind, id.to_string());
        let count = self.entries.get_mut(&key)?;
        *count -= 1;
        if *count > 0 {
            return None;
        }
        self.entries.remove(&key);
        Some(ControlMsg::Unsubscribe(SubscriptionTarget::new(kind, id)))
    }

    pub fn refcount(&self, kind: EntityKind, id: &str) -> usize {
        self.entries
            .get(&(kind, id.to_string()))
            .copied()
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Subscribe frames for everything currently active, resent after a
    /// reconnect. Posts sort before campaigns; ids sort lexically.
    pub fn active_messages(&self) -> Vec<ControlMsg> {
        self.entries
            .keys()
            .map(|(kind, id)| ControlMsg::Subscribe(SubscriptionTarget::new(*kind, id.as_str())))
            .collect()
    }

    /// Whether events for `post_id` should reach consumers: the post itself
    /// is subscribed, or any campaign is (events carry no campaign id).
    pub fn covers_post(&self, post_id: &str) -> bool {
        self.entries.contains_key(&(EntityKind::Post, post_id.to_string()))
            || self.entries.keys().any(|(kind, _)| *kind == EntityKind::Campaign)
    }
}
