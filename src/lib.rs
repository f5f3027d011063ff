// Library exports for the upload event target and its script bindings

pub mod js;
pub mod xhr;

// Re-export commonly used types for tests
pub use js::{BindingStats, JsXhrEnvironment, ScriptHandle};
pub use xhr::{EventTarget, ProgressEvent, XhrConfig, XmlHttpRequest, XmlHttpRequestUpload};
