//! Session lifecycle events and the pub/sub contract.
//!
//! [`SessionEvent`] is what a [`DeviceSession`](crate::device::DeviceSession)
//! announces about itself. [`DeviceEvent`] is an application event published
//! by a device or forwarded to one through an [`EventPublisher`].

use crate::constants::DEFAULT_EVENT_TTL;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace};

/// Lifecycle notifications broadcast by a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Ready,
    Disconnected { reason: String },
    FlashStarted,
    FlashSucceeded,
    FlashFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceEvent {
    pub name: String,
    /// Hex device ID of the publisher, absent for events from the cloud side.
    pub device_id: Option<String>,
    pub is_public: bool,
    pub data: Option<String>,
    pub ttl: u32,
    pub published_at: DateTime<Utc>,
}

impl DeviceEvent {
    pub fn new(name: impl Into<String>, data: Option<String>, is_public: bool) -> Self {
        Self {
            name: name.into(),
            device_id: None,
            is_public,
            data,
            ttl: DEFAULT_EVENT_TTL,
            published_at: Utc::now(),
        }
    }

    pub fn from_device(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = Some(device_id.into());
        self
    }

    pub fn with_ttl(mut self, ttl: u32) -> Self {
        self.ttl = ttl;
        self
    }
}

/// Which events a subscriber receives besides the name prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Identifies the subscriber so all its subscriptions can be dropped together.
    pub owner: String,
    /// Only events published by this device.
    pub device_id: Option<String>,
    /// Also deliver private events.
    pub include_private: bool,
}

impl SubscriptionFilter {
    pub fn owned_by(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }

    fn accepts(&self, event: &DeviceEvent) -> bool {
        if !event.is_public && !self.include_private {
            return false;
        }
        match &self.device_id {
            Some(id) => event.device_id.as_deref() == Some(id.as_str()),
            None => true,
        }
    }
}

pub type EventHandler = Arc<dyn Fn(&DeviceEvent) + Send + Sync>;

/// Publish/subscribe contract sessions use to exchange application events.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: DeviceEvent);

    /// Deliver events whose name starts with `prefix` and that pass `filter`.
    fn subscribe(&self, prefix: &str, filter: SubscriptionFilter, handler: EventHandler);

    fn unsubscribe_by_owner(&self, owner: &str);
}

struct Subscriber {
    prefix: String,
    filter: SubscriptionFilter,
    handler: EventHandler,
}

/// In-process publisher with prefix matching.
#[derive(Default)]
pub struct LocalPublisher {
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl EventPublisher for LocalPublisher {
    fn publish(&self, event: DeviceEvent) {
        // Handlers run outside the lock so they may publish or subscribe themselves.
        let handlers: Vec<EventHandler> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| event.name.starts_with(&s.prefix) && s.filter.accepts(&event))
            .map(|s| Arc::clone(&s.handler))
            .collect();
        trace!("Publishing '{}' to {} subscribers", event.name, handlers.len());
        for handler in handlers {
            handler(&event);
        }
    }

    fn subscribe(&self, prefix: &str, filter: SubscriptionFilter, handler: EventHandler) {
        debug!("{} subscribed to '{}'", filter.owner, prefix);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscriber {
                prefix: prefix.to_string(),
                filter,
                handler,
            });
    }

    fn unsubscribe_by_owner(&self, owner: &str) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.filter.owner != owner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counter() -> (Arc<AtomicUsize>, EventHandler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (
            hits,
            Arc::new(move |_: &DeviceEvent| {
                h.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn prefix_and_privacy_filtering() {
        let publisher = LocalPublisher::new();
        let (public_hits, public_handler) = counter();
        let (private_hits, private_handler) = counter();
        publisher.subscribe("temp", SubscriptionFilter::owned_by("a"), public_handler);
        publisher.subscribe(
            "temp",
            SubscriptionFilter {
                include_private: true,
                ..SubscriptionFilter::owned_by("b")
            },
            private_handler,
        );

        publisher.publish(DeviceEvent::new("temperature", Some("21".into()), true));
        publisher.publish(DeviceEvent::new("temperature", None, false));
        publisher.publish(DeviceEvent::new("humidity", None, true));

        assert_eq!(public_hits.load(Ordering::SeqCst), 1);
        assert_eq!(private_hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn device_filter_and_unsubscribe() {
        let publisher = LocalPublisher::new();
        let (hits, handler) = counter();
        publisher.subscribe(
            "",
            SubscriptionFilter {
                device_id: Some("abc".into()),
                ..SubscriptionFilter::owned_by("conn")
            },
            handler,
        );

        publisher.publish(DeviceEvent::new("x", None, true).from_device("abc"));
        publisher.publish(DeviceEvent::new("x", None, true).from_device("def"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        publisher.unsubscribe_by_owner("conn");
        assert_eq!(publisher.subscriber_count(), 0);
    }

    #[test]
    fn serializes_camel_case() {
        let event = DeviceEvent::new("spark/status", Some("online".into()), false).from_device("0011");
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["deviceId"], "0011");
        assert_eq!(json["isPublic"], false);
        assert_eq!(json["ttl"], 60);
        assert!(json.get("publishedAt").is_some());
    }
}
