use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;

use super::event::ProgressEvent;
use super::event_target::{DispatchOutcome, EventTarget, EventTargetHelper};
use super::listener::{EventListener, ListenerId};
use super::request::XmlHttpRequest;
use crate::js::environment::{ActiveScript, JsXhrEnvironment, ScriptHandle};

static NEXT_TARGET_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetId(u32);

impl TargetId {
    fn next() -> Self {
        Self(NEXT_TARGET_ID.fetch_add(1, Ordering::SeqCst))
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// The upload side of a request: where scripts hang progress, load, error
/// and abort listeners for the outgoing body.
pub struct XmlHttpRequestUpload {
    id: TargetId,
    target: EventTargetHelper,
}

impl XmlHttpRequestUpload {
    pub fn new(owner: Weak<XmlHttpRequest>) -> Self {
        Self {
            id: TargetId::next(),
            target: EventTargetHelper::new(Some(owner)),
        }
    }

    /// An upload target with no owning request. The request attaches itself
    /// later through [`EventTargetHelper::bind_to_owner`].
    pub fn unbound() -> Self {
        Self {
            id: TargetId::next(),
            target: EventTargetHelper::new(None),
        }
    }

    /// Cheap gate for the owning request: false means nobody could observe an
    /// upload event, so building one can be skipped.
    pub fn has_listeners(&self) -> bool {
        self.target.has_listeners()
    }

    pub fn owner(&self) -> Option<Rc<XmlHttpRequest>> {
        self.target.owner()
    }

    pub fn target_id(&self) -> TargetId {
        self.id
    }

    pub fn event_target(&self) -> &EventTargetHelper {
        &self.target
    }

    /// Produce the script-visible object for this upload inside `environment`.
    /// Repeated calls for the same environment refer to the same object.
    pub fn script_handle(self: &Rc<Self>, environment: &JsXhrEnvironment) -> Result<ScriptHandle> {
        environment.wrap_upload(self)
    }
}

impl EventTarget for XmlHttpRequestUpload {
    fn add_event_listener(&self, event_type: &str, listener: Rc<dyn EventListener>) -> ListenerId {
        self.target.add_event_listener(event_type, listener)
    }

    fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.target.remove_event_listener(id)
    }

    fn dispatch_event(
        &self,
        event: &ProgressEvent,
        active: Option<&ActiveScript<'_, '_>>,
    ) -> DispatchOutcome {
        self.target.dispatch_event(event, active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhr::listener::native;
    use std::cell::Cell;

    #[test]
    fn fresh_targets_report_no_listeners_without_allocating() {
        for upload in [XmlHttpRequestUpload::unbound(), XmlHttpRequestUpload::new(Weak::new())] {
            assert!(!upload.has_listeners());
            assert!(!upload.event_target().listener_manager_created());
        }
    }

    #[test]
    fn unbound_upload_has_no_owner() {
        let upload = XmlHttpRequestUpload::unbound();
        assert!(!upload.event_target().has_owner());
        assert!(upload.owner().is_none());
    }

    #[test]
    fn targets_get_distinct_ids() {
        let first = XmlHttpRequestUpload::unbound();
        let second = XmlHttpRequestUpload::unbound();
        assert_ne!(first.target_id(), second.target_id());
    }

    #[test]
    fn progress_listener_sees_single_dispatch() {
        let upload = XmlHttpRequestUpload::unbound();
        assert!(!upload.has_listeners());

        let calls = Rc::new(Cell::new(0));
        let seen = Rc::clone(&calls);
        upload.add_event_listener("progress", native(move |_| seen.set(seen.get() + 1)));
        assert!(upload.has_listeners());

        let outcome = upload.dispatch_event(&ProgressEvent::new("progress", 5, 10), None);
        assert_eq!(outcome, DispatchOutcome { invoked: 1, failed: 0 });
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn dropping_upload_releases_listeners() {
        let token = Rc::new(());
        let upload = XmlHttpRequestUpload::unbound();
        let held = Rc::clone(&token);
        upload.add_event_listener("load", native(move |_| {
            let _ = &held;
        }));
        assert_eq!(Rc::strong_count(&token), 2);
        drop(upload);
        assert_eq!(Rc::strong_count(&token), 1);
    }
}
