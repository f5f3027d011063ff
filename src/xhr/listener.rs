use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

use super::event::ProgressEvent;
use crate::js::environment::ActiveScript;

static NEXT_LISTENER_ID: AtomicU32 = AtomicU32::new(1);

/// Process-unique identifier handed out for every registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u32);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that can receive upload events.
///
/// `active` is set when the dispatch originates from inside a running script,
/// so script-backed listeners can reuse that context instead of re-entering it.
pub trait EventListener {
    fn handle_event(&self, event: &ProgressEvent, active: Option<&ActiveScript<'_, '_>>)
        -> Result<()>;
}

/// Adapts a plain Rust closure into an [`EventListener`].
pub struct NativeListener<F>(F);

impl<F> EventListener for NativeListener<F>
where
    F: Fn(&ProgressEvent),
{
    fn handle_event(
        &self,
        event: &ProgressEvent,
        _active: Option<&ActiveScript<'_, '_>>,
    ) -> Result<()> {
        (self.0)(event);
        Ok(())
    }
}

pub fn native<F>(callback: F) -> Rc<dyn EventListener>
where
    F: Fn(&ProgressEvent) + 'static,
{
    Rc::new(NativeListener(callback))
}

struct ListenerEntry {
    id: ListenerId,
    listener: Rc<dyn EventListener>,
}

/// Ordered listener lists keyed by event name.
#[derive(Default)]
pub struct EventListenerManager {
    listeners: HashMap<String, Vec<ListenerEntry>>,
    count: usize,
}

impl EventListenerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener` for `event_type`. Adding the same listener object
    /// twice for one type keeps the first registration.
    pub fn add(&mut self, event_type: &str, listener: Rc<dyn EventListener>) -> ListenerId {
        let entries = self.listeners.entry(event_type.to_string()).or_default();
        if let Some(existing) = entries
            .iter()
            .find(|entry| Rc::ptr_eq(&entry.listener, &listener))
        {
            return existing.id;
        }

        let id = ListenerId::next();
        entries.push(ListenerEntry { id, listener });
        self.count += 1;
        tracing::trace!(target: "xhr", %id, event_type, "listener added");
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        let mut emptied = None;
        let mut removed = false;
        for (event_type, entries) in self.listeners.iter_mut() {
            if let Some(index) = entries.iter().position(|entry| entry.id == id) {
                entries.remove(index);
                removed = true;
                if entries.is_empty() {
                    emptied = Some(event_type.clone());
                }
                break;
            }
        }
        if let Some(event_type) = emptied {
            self.listeners.remove(&event_type);
        }
        if removed {
            self.count -= 1;
            tracing::trace!(target: "xhr", %id, "listener removed");
        }
        removed
    }

    pub fn has_listeners(&self) -> bool {
        self.count > 0
    }

    pub fn contains(&self, id: ListenerId) -> bool {
        self.listeners
            .values()
            .any(|entries| entries.iter().any(|entry| entry.id == id))
    }

    /// Snapshot of the listeners for `event_type` in registration order.
    pub fn listeners_for(&self, event_type: &str) -> Vec<(ListenerId, Rc<dyn EventListener>)> {
        self.listeners
            .get(event_type)
            .map(|entries| {
                entries
                    .iter()
                    .map(|entry| (entry.id, Rc::clone(&entry.listener)))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn tracks_count_across_types() {
        let mut manager = EventListenerManager::new();
        assert!(!manager.has_listeners());

        let progress = manager.add("progress", native(|_| {}));
        let load = manager.add("load", native(|_| {}));
        assert_eq!(manager.listeners_for("progress").len(), 1);

        assert!(manager.remove(progress));
        assert!(manager.listeners_for("progress").is_empty());
        assert!(manager.has_listeners());

        assert!(manager.remove(load));
        assert!(!manager.has_listeners());
        assert!(!manager.remove(load));
    }

    #[test]
    fn duplicate_registration_keeps_first_id() {
        let mut manager = EventListenerManager::new();
        let listener = native(|_| {});
        let first = manager.add("progress", Rc::clone(&listener));
        let second = manager.add("progress", Rc::clone(&listener));
        assert_eq!(first, second);
        assert_eq!(manager.listeners_for("progress").len(), 1);

        // Same object under another name is a separate registration.
        let other = manager.add("load", Rc::clone(&listener));
        assert_ne!(first, other);

        assert!(manager.remove(first));
        assert!(manager.contains(other));
        assert!(!manager.contains(first));
    }

    #[test]
    fn snapshot_preserves_registration_order() {
        let order = Rc::new(Cell::new(0u32));
        let mut manager = EventListenerManager::new();
        for expected in 0..3u32 {
            let order = Rc::clone(&order);
            manager.add(
                "progress",
                native(move |_| {
                    assert_eq!(order.get(), expected);
                    order.set(expected + 1);
                }),
            );
        }

        let event = ProgressEvent::simple("progress");
        for (_, listener) in manager.listeners_for("progress") {
            listener.handle_event(&event, None).unwrap();
        }
        assert_eq!(order.get(), 3);
        assert!(manager.listeners_for("load").is_empty());
    }
}
