pub mod config;
pub mod event;
pub mod event_target;
pub mod listener;
pub mod request;
pub mod upload;

pub use config::{XhrConfig, XhrConfigError};
pub use event::{ProgressEvent, UploadEventType};
pub use event_target::{DispatchOutcome, EventTarget, EventTargetHelper};
pub use listener::{native, EventListener, EventListenerManager, ListenerId, NativeListener};
pub use request::{UploadFailure, XmlHttpRequest};
pub use upload::{TargetId, XmlHttpRequestUpload};
