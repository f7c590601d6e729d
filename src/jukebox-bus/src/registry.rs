//! Worker handles and the subscription index.
//!
//! Both live in one [`Registry`] so that removing a worker drops its
//! subscriptions in the same call. Subscribers of one event name are kept in
//! registration order, which is the order events fan out in.

use crate::worker::{Activity, Phase, WorkerHandle};
use jukebox_core::{names, Payload, PayloadValue, WorkerId};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("worker '{0}' is already registered")]
    DuplicateWorker(WorkerId),
    #[error("worker '{0}' is not registered")]
    UnknownWorker(WorkerId),
    #[error("subscription index references removed worker '{worker}' for '{event}'")]
    DanglingSubscription { event: String, worker: WorkerId },
}

/// A malformed `register`/`unregister` payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubscriptionError {
    #[error("payload has no '{}' field", names::EVENTS_FIELD)]
    MissingEvents,
    #[error("'{}' must be a string or a list of strings", names::EVENTS_FIELD)]
    WrongType,
    #[error("event names must not be blank")]
    BlankName,
    #[error("'{0}' cannot be subscribed to")]
    Reserved(String),
}

/// Extract the event names of a `register`/`unregister` payload. Either all
/// names are valid or none are returned.
pub fn parse_subscription(payload: &Payload) -> Result<Vec<String>, SubscriptionError> {
    let events = match payload.get(names::EVENTS_FIELD) {
        None => return Err(SubscriptionError::MissingEvents),
        Some(PayloadValue::Text(name)) => vec![name.clone()],
        Some(PayloadValue::List(list)) => list.clone(),
        Some(_) => return Err(SubscriptionError::WrongType),
    };
    for name in &events {
        if name.trim().is_empty() {
            return Err(SubscriptionError::BlankName);
        }
        if names::is_unsubscribable(name) {
            return Err(SubscriptionError::Reserved(name.clone()));
        }
    }
    Ok(events)
}

#[derive(Debug, Default)]
pub struct Registry {
    handles: BTreeMap<WorkerId, WorkerHandle>,
    index: BTreeMap<String, Vec<WorkerId>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.handles.contains_key(worker)
    }

    pub fn get(&self, worker: &WorkerId) -> Option<&WorkerHandle> {
        self.handles.get(worker)
    }

    pub fn get_mut(&mut self, worker: &WorkerId) -> Option<&mut WorkerHandle> {
        self.handles.get_mut(worker)
    }

    pub fn handles(&self) -> impl Iterator<Item = &WorkerHandle> {
        self.handles.values()
    }

    pub fn handles_mut(&mut self) -> impl Iterator<Item = &mut WorkerHandle> {
        self.handles.values_mut()
    }

    pub fn insert(&mut self, handle: WorkerHandle) -> Result<(), RegistryError> {
        if self.handles.contains_key(handle.id()) {
            return Err(RegistryError::DuplicateWorker(handle.id().clone()));
        }
        self.handles.insert(handle.id().clone(), handle);
        Ok(())
    }

    /// Returns `false` if the worker was already subscribed.
    pub fn subscribe(&mut self, worker: &WorkerId, event: &str) -> Result<bool, RegistryError> {
        if !self.handles.contains_key(worker) {
            return Err(RegistryError::UnknownWorker(worker.clone()));
        }
        let subscribers = self.index.entry(event.to_string()).or_default();
        if subscribers.contains(worker) {
            return Ok(false);
        }
        subscribers.push(worker.clone());
        Ok(true)
    }

    /// Returns `false` if the worker was not subscribed.
    pub fn unsubscribe(&mut self, worker: &WorkerId, event: &str) -> bool {
        let Some(subscribers) = self.index.get_mut(event) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|id| id != worker);
        let removed = subscribers.len() != before;
        if subscribers.is_empty() {
            self.index.remove(event);
        }
        removed
    }

    /// Subscribers of `event` in registration order.
    pub fn subscribers(&self, event: &str) -> &[WorkerId] {
        self.index.get(event).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn subscriptions_of(&self, worker: &WorkerId) -> Vec<&str> {
        self.index
            .iter()
            .filter(|(_, subscribers)| subscribers.contains(worker))
            .map(|(event, _)| event.as_str())
            .collect()
    }

    /// Remove a worker together with all of its subscriptions.
    pub fn remove(&mut self, worker: &WorkerId) -> Option<WorkerHandle> {
        let handle = self.handles.remove(worker)?;
        self.index.retain(|_, subscribers| {
            subscribers.retain(|id| id != worker);
            !subscribers.is_empty()
        });
        Some(handle)
    }

    /// Check that every indexed subscriber has a live handle.
    pub fn verify(&self) -> Result<(), RegistryError> {
        for (event, subscribers) in &self.index {
            if let Some(worker) = subscribers.iter().find(|id| !self.handles.contains_key(*id)) {
                return Err(RegistryError::DanglingSubscription {
                    event: event.clone(),
                    worker: worker.clone(),
                });
            }
        }
        Ok(())
    }

    /// Every remaining worker last reported idle. Unknown activity counts as
    /// busy; an empty registry is idle.
    pub fn all_idle(&self) -> bool {
        self.handles
            .values()
            .all(|handle| handle.activity() == Activity::Idle)
    }

    /// Workers that have not sent `ready` yet.
    pub fn starting(&self) -> impl Iterator<Item = &WorkerId> {
        self.handles
            .values()
            .filter(|handle| handle.phase() == Phase::Starting)
            .map(WorkerHandle::id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jukebox_plugin::{Execution, WorkerChannel};

    fn handle(id: &str) -> WorkerHandle {
        let (channel, _rx) = WorkerChannel::detached(1);
        WorkerHandle::new(WorkerId::new(id), channel, Execution::Thread(None), None)
    }

    fn registry_with(ids: &[&str]) -> Registry {
        let mut registry = Registry::new();
        for id in ids {
            registry.insert(handle(id)).unwrap();
        }
        registry
    }

    #[test]
    fn subscribing_twice_is_idempotent() {
        let mut registry = registry_with(&["mpdclient"]);
        let worker = WorkerId::new("mpdclient");
        assert!(registry.subscribe(&worker, "load_source").unwrap());
        assert!(!registry.subscribe(&worker, "load_source").unwrap());
        assert_eq!(registry.subscribers("load_source"), &[worker]);
    }

    #[test]
    fn subscribers_keep_registration_order() {
        let mut registry = registry_with(&["a", "b", "c"]);
        for id in ["c", "a", "b"] {
            registry.subscribe(&WorkerId::new(id), "beep").unwrap();
        }
        let order: Vec<_> = registry
            .subscribers("beep")
            .iter()
            .map(WorkerId::as_str)
            .collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn unknown_workers_cannot_subscribe() {
        let mut registry = Registry::new();
        assert_eq!(
            registry.subscribe(&WorkerId::new("ghost"), "beep"),
            Err(RegistryError::UnknownWorker(WorkerId::new("ghost")))
        );
        assert!(registry.subscribers("beep").is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut registry = registry_with(&["mpdclient"]);
        assert!(matches!(
            registry.insert(handle("mpdclient")),
            Err(RegistryError::DuplicateWorker(_))
        ));
    }

    #[test]
    fn removal_drops_every_subscription() {
        let mut registry = registry_with(&["mpdclient", "sound"]);
        let mpd = WorkerId::new("mpdclient");
        let sound = WorkerId::new("sound");
        registry.subscribe(&mpd, "load_source").unwrap();
        registry.subscribe(&mpd, "beep").unwrap();
        registry.subscribe(&sound, "beep").unwrap();

        assert!(registry.remove(&mpd).is_some());
        assert!(registry.subscriptions_of(&mpd).is_empty());
        assert!(registry.subscribers("load_source").is_empty());
        assert_eq!(registry.subscribers("beep"), &[sound]);
        assert!(registry.verify().is_ok());
        assert!(registry.remove(&mpd).is_none());
    }

    #[test]
    fn unsubscribe_reports_whether_anything_changed() {
        let mut registry = registry_with(&["mpdclient"]);
        let mpd = WorkerId::new("mpdclient");
        registry.subscribe(&mpd, "beep").unwrap();
        assert!(registry.unsubscribe(&mpd, "beep"));
        assert!(!registry.unsubscribe(&mpd, "beep"));
        assert!(registry.subscriptions_of(&mpd).is_empty());
    }

    #[test]
    fn verify_detects_dangling_subscribers() {
        let mut registry = registry_with(&["mpdclient"]);
        registry
            .index
            .entry("beep".into())
            .or_default()
            .push(WorkerId::new("ghost"));
        assert_eq!(
            registry.verify(),
            Err(RegistryError::DanglingSubscription {
                event: "beep".into(),
                worker: WorkerId::new("ghost"),
            })
        );
    }

    #[test]
    fn unknown_activity_is_not_idle() {
        let mut registry = registry_with(&["a", "b"]);
        assert!(!registry.all_idle());
        for handle in registry.handles_mut() {
            handle.activity = Activity::Idle;
        }
        assert!(registry.all_idle());
        registry.get_mut(&WorkerId::new("b")).unwrap().activity = Activity::Busy;
        assert!(!registry.all_idle());
        registry.remove(&WorkerId::new("b"));
        assert!(registry.all_idle());
    }

    #[test]
    fn subscription_payloads() {
        let mut payload = Payload::new();
        assert_eq!(
            parse_subscription(&payload),
            Err(SubscriptionError::MissingEvents)
        );

        payload.insert(names::EVENTS_FIELD.into(), "beep".into());
        assert_eq!(parse_subscription(&payload).unwrap(), vec!["beep"]);

        payload.insert(
            names::EVENTS_FIELD.into(),
            PayloadValue::List(vec!["beep".into(), "load_source".into()]),
        );
        assert_eq!(parse_subscription(&payload).unwrap().len(), 2);

        payload.insert(names::EVENTS_FIELD.into(), PayloadValue::Integer(3));
        assert_eq!(
            parse_subscription(&payload),
            Err(SubscriptionError::WrongType)
        );

        payload.insert(
            names::EVENTS_FIELD.into(),
            PayloadValue::List(vec!["beep".into(), "tick".into()]),
        );
        assert_eq!(
            parse_subscription(&payload),
            Err(SubscriptionError::Reserved("tick".into()))
        );

        payload.insert(names::EVENTS_FIELD.into(), " ".into());
        assert_eq!(
            parse_subscription(&payload),
            Err(SubscriptionError::BlankName)
        );
    }
}
