use std::cell::RefCell;
use std::rc::Rc;
use std::time::Instant;

use tracing::{debug, trace};

use super::config::XhrConfig;
use super::event::{ProgressEvent, UploadEventType};
use super::event_target::{DispatchOutcome, EventTarget};
use super::upload::XmlHttpRequestUpload;

/// Why an upload stopped before the body was fully sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadFailure {
    Error,
    Abort,
    Timeout,
}

impl UploadFailure {
    fn event_type(self) -> UploadEventType {
        match self {
            UploadFailure::Error => UploadEventType::Error,
            UploadFailure::Abort => UploadEventType::Abort,
            UploadFailure::Timeout => UploadEventType::Timeout,
        }
    }
}

#[derive(Debug, Default)]
struct UploadState {
    started: bool,
    complete: bool,
    loaded: u64,
    total: u64,
    last_progress: Option<Instant>,
}

/// Request object owning an upload channel. Transport is driven elsewhere;
/// this type only turns body transfer milestones into upload events.
pub struct XmlHttpRequest {
    config: XhrConfig,
    upload: Rc<XmlHttpRequestUpload>,
    state: RefCell<UploadState>,
}

impl XmlHttpRequest {
    pub fn new(config: XhrConfig) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self {
            config,
            upload: Rc::new(XmlHttpRequestUpload::new(weak.clone())),
            state: RefCell::new(UploadState::default()),
        })
    }

    /// Adopt an upload target that was created without an owner.
    pub fn with_upload(config: XhrConfig, upload: Rc<XmlHttpRequestUpload>) -> Rc<Self> {
        Rc::new_cyclic(|weak| {
            upload.event_target().bind_to_owner(weak.clone());
            Self {
                config,
                upload,
                state: RefCell::new(UploadState::default()),
            }
        })
    }

    pub fn upload(&self) -> &Rc<XmlHttpRequestUpload> {
        &self.upload
    }

    pub fn upload_complete(&self) -> bool {
        self.state.borrow().complete
    }

    pub fn start_upload(&self, total: u64) -> DispatchOutcome {
        {
            let mut state = self.state.borrow_mut();
            if state.started || state.complete {
                return DispatchOutcome::default();
            }
            state.started = true;
            state.total = total;
        }
        debug!(target: "xhr", total, "upload started");
        self.fire(UploadEventType::LoadStart, 0, total)
    }

    /// Record that `loaded` body bytes have been sent. `progress` fires at most
    /// once per configured interval, except for the final byte.
    pub fn report_upload_progress(&self, loaded: u64) -> DispatchOutcome {
        let total = {
            let mut state = self.state.borrow_mut();
            if !state.started || state.complete {
                return DispatchOutcome::default();
            }
            state.loaded = loaded;
            let now = Instant::now();
            let finished = state.total > 0 && loaded >= state.total;
            let throttled = state
                .last_progress
                .is_some_and(|last| now.duration_since(last) < self.config.progress_interval());
            if throttled && !finished {
                trace!(target: "xhr", loaded, "upload progress throttled");
                return DispatchOutcome::default();
            }
            state.last_progress = Some(now);
            state.total
        };
        self.fire(UploadEventType::Progress, loaded, total)
    }

    pub fn complete_upload(&self) -> DispatchOutcome {
        let total = {
            let mut state = self.state.borrow_mut();
            if state.complete {
                return DispatchOutcome::default();
            }
            state.complete = true;
            state.loaded = state.total;
            state.total
        };
        debug!(target: "xhr", total, "upload complete");
        let mut outcome = self.fire(UploadEventType::Progress, total, total);
        outcome += self.fire(UploadEventType::Load, total, total);
        outcome += self.fire(UploadEventType::LoadEnd, total, total);
        outcome
    }

    pub fn fail_upload(&self, failure: UploadFailure) -> DispatchOutcome {
        {
            let mut state = self.state.borrow_mut();
            if state.complete {
                return DispatchOutcome::default();
            }
            state.complete = true;
        }
        debug!(target: "xhr", ?failure, "upload failed");
        let mut outcome = self.fire(failure.event_type(), 0, 0);
        outcome += self.fire(UploadEventType::LoadEnd, 0, 0);
        outcome
    }

    fn fire(&self, kind: UploadEventType, loaded: u64, total: u64) -> DispatchOutcome {
        if !self.upload.has_listeners() {
            trace!(target: "xhr", event_type = kind.as_str(), "no upload listeners; skipping event");
            return DispatchOutcome::default();
        }
        let event = ProgressEvent::upload(kind, loaded, total);
        self.upload.dispatch_event(&event, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::xhr::listener::native;

    fn recording_request(config: XhrConfig) -> (Rc<XmlHttpRequest>, Rc<RefCell<Vec<ProgressEvent>>>) {
        let request = XmlHttpRequest::new(config);
        let seen = Rc::new(RefCell::new(Vec::new()));
        for kind in UploadEventType::ALL {
            let seen = Rc::clone(&seen);
            request
                .upload()
                .add_event_listener(kind.as_str(), native(move |event| {
                    seen.borrow_mut().push(event.clone())
                }));
        }
        (request, seen)
    }

    fn types(events: &[ProgressEvent]) -> Vec<&str> {
        events.iter().map(|event| event.event_type.as_str()).collect()
    }

    #[test]
    fn bound_upload_points_back_at_request() {
        let request = XmlHttpRequest::new(XhrConfig::default());
        let owner = request.upload().owner().expect("owner");
        assert!(Rc::ptr_eq(&owner, &request));
    }

    #[test]
    fn upload_does_not_keep_request_alive() {
        let request = XmlHttpRequest::new(XhrConfig::default());
        let upload = Rc::clone(request.upload());
        drop(request);
        assert!(upload.event_target().has_owner());
        assert!(upload.owner().is_none());
    }

    #[test]
    fn adopted_upload_is_bound() {
        let upload = Rc::new(XmlHttpRequestUpload::unbound());
        assert!(upload.owner().is_none());
        let request = XmlHttpRequest::with_upload(XhrConfig::default(), Rc::clone(&upload));
        assert!(Rc::ptr_eq(request.upload(), &upload));
        assert!(upload.owner().is_some_and(|owner| Rc::ptr_eq(&owner, &request)));
    }

    #[test]
    fn events_are_skipped_without_listeners() {
        let request = XmlHttpRequest::new(XhrConfig::default());
        assert_eq!(request.start_upload(10), DispatchOutcome::default());
        assert_eq!(request.complete_upload(), DispatchOutcome::default());
        assert!(request.upload_complete());
        assert!(!request.upload().event_target().listener_manager_created());
    }

    #[test]
    fn start_upload_fires_only_loadstart() {
        let (request, seen) = recording_request(XhrConfig::default());
        let outcome = request.start_upload(100);
        assert_eq!(outcome.invoked, 1);

        let events = seen.borrow();
        assert_eq!(types(&events), ["loadstart"]);
        assert_eq!(events[0].loaded, 0);
        assert_eq!(events[0].total, 100);
    }

    #[test]
    fn successful_upload_sequence() {
        let (request, seen) = recording_request(XhrConfig {
            progress_interval_ms: 0,
        });
        request.start_upload(100);
        request.report_upload_progress(40);
        let outcome = request.complete_upload();
        assert_eq!(outcome.invoked, 3);

        let events = seen.borrow();
        assert_eq!(
            types(&events),
            ["loadstart", "progress", "progress", "load", "loadend"]
        );
        assert_eq!(events[1].loaded, 40);
        assert!(events[1].length_computable);
        assert_eq!(events[4].loaded, 100);
    }

    #[test]
    fn progress_is_throttled_except_final_byte() {
        let (request, seen) = recording_request(XhrConfig {
            progress_interval_ms: 60_000,
        });
        request.start_upload(100);
        request.report_upload_progress(10);
        request.report_upload_progress(20);
        request.report_upload_progress(100);

        let events = seen.borrow();
        assert_eq!(types(&events), ["loadstart", "progress", "progress"]);
        assert_eq!(events[2].loaded, 100);
    }

    #[test]
    fn failure_fires_once_then_ignores_later_notifications() {
        let (request, seen) = recording_request(XhrConfig::default());
        request.start_upload(100);
        request.fail_upload(UploadFailure::Abort);
        request.fail_upload(UploadFailure::Error);
        request.report_upload_progress(50);
        request.complete_upload();

        let events = seen.borrow();
        assert_eq!(types(&events), ["loadstart", "abort", "loadend"]);
        assert!(!events[1].length_computable);
    }
}
