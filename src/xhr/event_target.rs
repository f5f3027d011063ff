use std::cell::RefCell;
use std::ops::AddAssign;
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use super::event::ProgressEvent;
use super::listener::{EventListener, EventListenerManager, ListenerId};
use super::request::XmlHttpRequest;
use crate::js::environment::ActiveScript;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub invoked: usize,
    pub failed: usize,
}

impl AddAssign for DispatchOutcome {
    fn add_assign(&mut self, other: Self) {
        self.invoked += other.invoked;
        self.failed += other.failed;
    }
}

/// Listener registration and dispatch shared by every event target.
pub trait EventTarget {
    fn add_event_listener(&self, event_type: &str, listener: Rc<dyn EventListener>) -> ListenerId;

    fn remove_event_listener(&self, id: ListenerId) -> bool;

    fn dispatch_event(
        &self,
        event: &ProgressEvent,
        active: Option<&ActiveScript<'_, '_>>,
    ) -> DispatchOutcome;
}

/// Concrete event target state: a registry that only exists once somebody
/// listens, plus an optional non-owning link to the request it belongs to.
#[derive(Default)]
pub struct EventTargetHelper {
    listener_manager: RefCell<Option<EventListenerManager>>,
    owner: RefCell<Option<Weak<XmlHttpRequest>>>,
}

impl EventTargetHelper {
    pub fn new(owner: Option<Weak<XmlHttpRequest>>) -> Self {
        Self {
            owner: RefCell::new(owner),
            ..Self::default()
        }
    }

    /// Attach an owner after construction. Replaces any previous owner.
    pub fn bind_to_owner(&self, owner: Weak<XmlHttpRequest>) {
        *self.owner.borrow_mut() = Some(owner);
    }

    pub fn has_owner(&self) -> bool {
        self.owner.borrow().is_some()
    }

    pub fn owner(&self) -> Option<Rc<XmlHttpRequest>> {
        self.owner.borrow().as_ref().and_then(Weak::upgrade)
    }

    pub fn listener_manager_created(&self) -> bool {
        self.listener_manager.borrow().is_some()
    }

    pub fn has_listeners(&self) -> bool {
        self.listener_manager
            .borrow()
            .as_ref()
            .is_some_and(EventListenerManager::has_listeners)
    }

    pub fn is_registered(&self, id: ListenerId) -> bool {
        self.listener_manager
            .borrow()
            .as_ref()
            .is_some_and(|manager| manager.contains(id))
    }
}

impl EventTarget for EventTargetHelper {
    fn add_event_listener(&self, event_type: &str, listener: Rc<dyn EventListener>) -> ListenerId {
        let mut slot = self.listener_manager.borrow_mut();
        let manager = slot.get_or_insert_with(|| {
            debug!(target: "xhr", event_type, "creating listener manager");
            EventListenerManager::new()
        });
        manager.add(event_type, listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        match self.listener_manager.borrow_mut().as_mut() {
            Some(manager) => manager.remove(id),
            None => false,
        }
    }

    fn dispatch_event(
        &self,
        event: &ProgressEvent,
        active: Option<&ActiveScript<'_, '_>>,
    ) -> DispatchOutcome {
        let snapshot = match self.listener_manager.borrow().as_ref() {
            Some(manager) => manager.listeners_for(&event.event_type),
            None => return DispatchOutcome::default(),
        };

        let mut outcome = DispatchOutcome::default();
        for (id, listener) in snapshot {
            // Skip listeners removed by an earlier listener in this dispatch.
            if !self.is_registered(id) {
                continue;
            }
            outcome.invoked += 1;
            if let Err(err) = listener.handle_event(event, active) {
                outcome.failed += 1;
                warn!(
                    target: "xhr",
                    listener = %id,
                    event_type = %event.event_type,
                    error = %err,
                    "upload listener failed"
                );
            }
        }
        outcome
    }
}
