pub mod environment;
pub mod runtime;

pub use environment::{ActiveScript, BindingStats, ContextId, JsXhrEnvironment, ScriptHandle};
pub use runtime::QuickJsEngine;
