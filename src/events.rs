//! Process-wide named events with synchronous fan-out.
//!
//! Listeners are invoked inline by the publisher, one after another; a
//! panicking listener is caught and logged so it cannot block the others
//! or unwind into the publisher.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    AbortRequested,
    SettingsChanged,
    VideoLibraryUpdated,
    ExceptionsChanged,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventKind::AbortRequested => "ABORT_REQUESTED",
            EventKind::SettingsChanged => "SETTINGS_CHANGED",
            EventKind::VideoLibraryUpdated => "VIDEO_LIBRARY_UPDATED",
            EventKind::ExceptionsChanged => "EXCEPTIONS_CHANGED",
        };
        f.write_str(name)
    }
}

type Listener = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<Listener>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, kind: EventKind, listener: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.listeners
            .write()
            .entry(kind)
            .or_default()
            .push(Arc::new(listener));
    }

    /// Invoke every listener registered for `kind`, catching panics per
    /// listener.
    pub fn publish(&self, kind: EventKind) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .get(&kind)
            .map(|v| v.to_vec())
            .unwrap_or_default();

        debug!(event = %kind, listeners = listeners.len(), "publishing event");
        for listener in listeners {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| listener())) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(event = %kind, panic = %msg, "event listener panicked");
            }
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.listeners
            .read()
            .get(&kind)
            .map(|v| v.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fan_out_reaches_every_listener() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            bus.subscribe(EventKind::SettingsChanged, move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(EventKind::SettingsChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        bus.publish(EventKind::AbortRequested);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        bus.subscribe(EventKind::ExceptionsChanged, || panic!("bad listener"));
        let h = hits.clone();
        bus.subscribe(EventKind::ExceptionsChanged, move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(EventKind::ExceptionsChanged);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
