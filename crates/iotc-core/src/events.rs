// ── Event subscription registry ──
//
// One listener per category, optionally narrowed to a single property or
// command name. Registering again replaces the previous listener.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use strum::{Display, EnumString};
use tracing::debug;

use crate::error::CoreError;
use crate::protocol::{CommandEvent, PropertyEvent};

/// Listener categories accepted by [`EventRegistry::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum EventCategory {
    Properties,
    Commands,
}

/// An inbound event handed to an application callback.
#[derive(Debug)]
pub enum DeviceEvent {
    Property(PropertyEvent),
    Command(CommandEvent),
}

/// Application callback. The dispatcher awaits the returned future before
/// taking the next inbound frame.
pub type EventCallback = Arc<dyn Fn(DeviceEvent) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure as an [`EventCallback`].
pub fn callback<F, Fut>(f: F) -> EventCallback
where
    F: Fn(DeviceEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| f(event).boxed())
}

#[derive(Clone)]
struct Subscription {
    filter: Option<String>,
    callback: EventCallback,
}

/// Parse `Properties`, `Commands`, `Properties.<name>` or `Commands.<name>`.
pub fn parse_event_name(name: &str) -> Result<(EventCategory, Option<String>), CoreError> {
    let invalid = || CoreError::InvalidEventName {
        name: name.to_owned(),
    };
    let (category, filter) = match name.split_once('.') {
        Some((category, filter)) => (category, Some(filter)),
        None => (name, None),
    };
    let category: EventCategory = category.parse().map_err(|_| invalid())?;
    match filter {
        None => Ok((category, None)),
        Some(filter) if !filter.is_empty() && !filter.chars().any(char::is_whitespace) => {
            Ok((category, Some(filter.to_owned())))
        }
        Some(_) => Err(invalid()),
    }
}

/// Listener table, at most one entry per [`EventCategory`].
#[derive(Default)]
pub struct EventRegistry {
    subscriptions: RwLock<HashMap<EventCategory, Subscription>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `event_name`, replacing any listener already
    /// registered for the same category.
    pub fn on(&self, event_name: &str, callback: EventCallback) -> Result<(), CoreError> {
        let (category, filter) = parse_event_name(event_name)?;
        debug!(%category, filter = filter.as_deref(), "listener registered");
        self.subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(category, Subscription { filter, callback });
        Ok(())
    }

    /// The callback that should receive an event named `name`, if any.
    pub fn listener(&self, category: EventCategory, name: &str) -> Option<EventCallback> {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let subscription = subscriptions.get(&category)?;
        match subscription.filter.as_deref() {
            Some(filter) if filter != name => None,
            _ => Some(Arc::clone(&subscription.callback)),
        }
    }

    pub fn has_listener(&self, category: EventCategory) -> bool {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&category)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscriptions = self
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut map = f.debug_map();
        for (category, subscription) in subscriptions.iter() {
            map.entry(category, &subscription.filter);
        }
        map.finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn noop() -> EventCallback {
        callback(|_| async {})
    }

    #[test]
    fn event_name_grammar() {
        assert_eq!(
            parse_event_name("Properties").unwrap(),
            (EventCategory::Properties, None)
        );
        assert_eq!(
            parse_event_name("Commands.reboot").unwrap(),
            (EventCategory::Commands, Some("reboot".into()))
        );
        assert_eq!(
            parse_event_name("Properties.fan.speed").unwrap(),
            (EventCategory::Properties, Some("fan.speed".into()))
        );
        for bad in ["", "Telemetry", "properties", "Commands.", "Commands.re boot"] {
            assert!(
                matches!(parse_event_name(bad), Err(CoreError::InvalidEventName { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn filter_narrows_listener() {
        let registry = EventRegistry::new();
        registry.on("Commands.reboot", noop()).unwrap();

        assert!(registry.listener(EventCategory::Commands, "reboot").is_some());
        assert!(registry.listener(EventCategory::Commands, "blink").is_none());
        assert!(registry.listener(EventCategory::Properties, "reboot").is_none());
    }

    #[tokio::test]
    async fn last_registration_wins() {
        let registry = EventRegistry::new();
        let first = Arc::new(AtomicU32::new(0));
        let second = Arc::new(AtomicU32::new(0));

        let counter = Arc::clone(&first);
        registry
            .on(
                "Properties",
                callback(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();
        let counter = Arc::clone(&second);
        registry
            .on(
                "Properties.temp",
                callback(move |_| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                }),
            )
            .unwrap();

        assert!(registry.listener(EventCategory::Properties, "humidity").is_none());
        let listener = registry.listener(EventCategory::Properties, "temp").unwrap();
        let event = DeviceEvent::Command(CommandEvent::detached("noop", "1", None));
        listener(event).await;

        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
