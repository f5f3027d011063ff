use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::{anyhow, bail, Result};
use rquickjs::{Ctx, Function, Object, Value};
use serde_json::to_string as to_json_string;
use tracing::{debug, trace};

use super::runtime::QuickJsEngine;
use crate::xhr::event::ProgressEvent;
use crate::xhr::event_target::EventTarget;
use crate::xhr::listener::{EventListener, ListenerId};
use crate::xhr::upload::{TargetId, XmlHttpRequestUpload};

static NEXT_CONTEXT_ID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextId(u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A script call currently on the stack, handed to listeners so they can run
/// script callbacks without re-entering the context.
pub struct ActiveScript<'a, 'js> {
    pub context: ContextId,
    pub ctx: &'a Ctx<'js>,
}

/// Identifies the script-visible object of one upload target inside one
/// context. Two handles compare equal when they name the same object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScriptHandle {
    context: ContextId,
    target: TargetId,
}

impl ScriptHandle {
    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn target(&self) -> TargetId {
        self.target
    }

    /// Look up the JS object. `ctx` must belong to the handle's context.
    pub fn resolve<'js>(&self, ctx: &Ctx<'js>) -> rquickjs::Result<Object<'js>> {
        let frontier: Object = ctx.globals().get("frontier")?;
        let wrap: Function = frontier.get("__uploadHandle")?;
        wrap.call((self.target.as_u32(),))
    }
}

/// How much upload state the script side is currently holding.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BindingStats {
    pub handles: usize,
    pub listeners: usize,
}

type TargetTable = Rc<RefCell<HashMap<TargetId, Weak<XmlHttpRequestUpload>>>>;
type ReleaseQueue = Rc<RefCell<Vec<u32>>>;

/// Binding layer between upload targets and one QuickJS context.
///
/// Scripts see `XMLHttpRequestUpload` objects whose listeners are tracked in
/// the Rust registry; the callbacks themselves stay in the JS heap and are
/// looked up by token when an event is dispatched. Script state belonging to
/// dropped uploads is released the next time Rust enters the context.
pub struct JsXhrEnvironment {
    engine: Rc<QuickJsEngine>,
    context_id: ContextId,
    targets: TargetTable,
    releases: ReleaseQueue,
}

impl JsXhrEnvironment {
    pub fn new() -> Result<Self> {
        let engine = Rc::new(QuickJsEngine::new()?);
        let context_id = ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst));
        let targets: TargetTable = Rc::new(RefCell::new(HashMap::new()));
        let releases: ReleaseQueue = Rc::new(RefCell::new(Vec::new()));
        install_upload_bindings(
            &engine,
            context_id,
            Rc::clone(&targets),
            &releases,
        )?;
        debug!(target: "quickjs", context = %context_id, "xhr bindings installed");
        Ok(Self {
            engine,
            context_id,
            targets,
            releases,
        })
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.flush_releases()?;
        self.engine.eval(source, filename)
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        self.flush_releases()?;
        self.engine.eval_with(source, filename)
    }

    pub fn with_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        self.enter_context(f)
    }

    pub(crate) fn wrap_upload(&self, upload: &Rc<XmlHttpRequestUpload>) -> Result<ScriptHandle> {
        let target = upload.target_id();
        self.targets
            .borrow_mut()
            .insert(target, Rc::downgrade(upload));
        let handle = ScriptHandle {
            context: self.context_id,
            target,
        };
        self.enter_context(|ctx| handle.resolve(&ctx).map(|_| ()))?;
        trace!(target: "quickjs", context = %self.context_id, upload = target.as_u32(), "upload wrapped");
        Ok(handle)
    }

    /// Publish the handle's object as a global named `name`.
    pub fn expose(&self, handle: &ScriptHandle, name: &str) -> Result<()> {
        self.ensure_local(handle)?;
        let handle = *handle;
        let name = name.to_string();
        self.enter_context(move |ctx| {
            let object = handle.resolve(&ctx)?;
            ctx.globals().set(name, object)
        })
    }

    /// Run `f` with the handle's object.
    pub fn with_handle<T, F>(&self, handle: &ScriptHandle, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>, Object<'js>) -> rquickjs::Result<T>,
    {
        self.ensure_local(handle)?;
        let handle = *handle;
        self.enter_context(move |ctx| {
            let object = handle.resolve(&ctx)?;
            f(ctx, object)
        })
    }

    pub fn binding_stats(&self) -> Result<BindingStats> {
        let (handles, listeners) = self.enter_context(|ctx| {
            let frontier: Object = ctx.globals().get("frontier")?;
            let stats: Function = frontier.get("__uploadBindingStats")?;
            let counts: Object = stats.call(())?;
            Ok((
                counts.get::<_, u32>("handles")?,
                counts.get::<_, u32>("listeners")?,
            ))
        })?;
        Ok(BindingStats {
            handles: handles as usize,
            listeners: listeners as usize,
        })
    }

    fn flush_releases(&self) -> Result<()> {
        self.enter_context(|_ctx| Ok(()))
    }

    fn enter_context<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'js> FnOnce(Ctx<'js>) -> rquickjs::Result<T>,
    {
        let targets = &self.targets;
        let releases = &self.releases;
        self.engine.with_context(move |ctx| {
            release_detached(&ctx, targets, releases)?;
            f(ctx)
        })
    }

    fn ensure_local(&self, handle: &ScriptHandle) -> Result<()> {
        if handle.context != self.context_id {
            bail!(
                "script handle belongs to context {} but was used in context {}",
                handle.context,
                self.context_id
            );
        }
        Ok(())
    }
}

/// Registry entry standing in for a script callback.
struct ScriptListener {
    engine: Weak<QuickJsEngine>,
    releases: Weak<RefCell<Vec<u32>>>,
    context: ContextId,
    token: u32,
}

impl EventListener for ScriptListener {
    fn handle_event(
        &self,
        event: &ProgressEvent,
        active: Option<&ActiveScript<'_, '_>>,
    ) -> Result<()> {
        let detail = to_json_string(event)?;
        let failure = match active {
            Some(active) if active.context == self.context => {
                invoke_script_listener(active.ctx, self.token, &detail)?
            }
            _ => {
                let Some(engine) = self.engine.upgrade() else {
                    trace!(target: "quickjs", context = %self.context, "context gone; listener skipped");
                    return Ok(());
                };
                let token = self.token;
                let result =
                    engine.with_context(move |ctx| invoke_script_listener(&ctx, token, &detail));
                engine.run_pending_jobs();
                result?
            }
        };
        match failure {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

impl Drop for ScriptListener {
    fn drop(&mut self) {
        // The context may be executing here; the callback is freed on the next entry.
        if let Some(releases) = self.releases.upgrade() {
            releases.borrow_mut().push(self.token);
        }
    }
}

/// Returns the exception text when the callback threw.
fn invoke_script_listener(ctx: &Ctx<'_>, token: u32, detail: &str) -> rquickjs::Result<Option<String>> {
    let frontier: Object = ctx.globals().get("frontier")?;
    let invoke: Function = frontier.get("__invokeUploadListener")?;
    let detail: Value = ctx.json_parse(detail.as_bytes())?;
    invoke.call((token, detail))
}

/// Drop the script-side callbacks and handle objects of listeners and uploads
/// released since the last entry.
fn release_detached(ctx: &Ctx<'_>, targets: &TargetTable, releases: &ReleaseQueue) -> rquickjs::Result<()> {
    let tokens = mem::take(&mut *releases.borrow_mut());
    let dead: Vec<TargetId> = {
        let mut targets = targets.borrow_mut();
        let dead: Vec<TargetId> = targets
            .iter()
            .filter(|(_, upload)| upload.strong_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        for id in &dead {
            targets.remove(id);
        }
        dead
    };
    if tokens.is_empty() && dead.is_empty() {
        return Ok(());
    }

    let frontier: Object = ctx.globals().get("frontier")?;
    if !tokens.is_empty() {
        let release: Function = frontier.get("__releaseUploadListener")?;
        for token in &tokens {
            release.call::<_, ()>((*token,))?;
        }
    }
    if !dead.is_empty() {
        let release: Function = frontier.get("__releaseUploadTarget")?;
        for target in &dead {
            release.call::<_, ()>((target.as_u32(),))?;
        }
    }
    trace!(
        target: "quickjs",
        listeners = tokens.len(),
        targets = dead.len(),
        "released script state"
    );
    Ok(())
}

fn lookup_target(targets: &TargetTable, target: u32) -> Option<Rc<XmlHttpRequestUpload>> {
    targets
        .borrow()
        .get(&TargetId::from_raw(target))
        .and_then(Weak::upgrade)
}

fn install_upload_bindings(
    engine: &Rc<QuickJsEngine>,
    context_id: ContextId,
    targets: TargetTable,
    releases: &ReleaseQueue,
) -> Result<()> {
    let weak_engine = Rc::downgrade(engine);
    let weak_releases = Rc::downgrade(releases);
    engine.with_context(move |ctx| {
        let global = ctx.globals();

        // Bridge functions are captured by the bootstrap and removed from the global object.
        {
            let targets = Rc::clone(&targets);
            let func = Function::new(
                ctx.clone(),
                move |target: u32, event_type: String, token: u32| -> rquickjs::Result<Option<u32>> {
                    let Some(upload) = lookup_target(&targets, target) else {
                        return Ok(None);
                    };
                    let listener = Rc::new(ScriptListener {
                        engine: weak_engine.clone(),
                        releases: weak_releases.clone(),
                        context: context_id,
                        token,
                    });
                    let id = upload.add_event_listener(&event_type, listener);
                    Ok(Some(id.as_u32()))
                },
            )?
            .with_name("__frontier_upload_listen")?;
            global.set("__frontier_upload_listen", func)?;
        }

        {
            let targets = Rc::clone(&targets);
            let func = Function::new(
                ctx.clone(),
                move |target: u32, listener: u32| -> rquickjs::Result<bool> {
                    Ok(lookup_target(&targets, target).is_some_and(|upload| {
                        upload.remove_event_listener(ListenerId::from_raw(listener))
                    }))
                },
            )?
            .with_name("__frontier_upload_unlisten")?;
            global.set("__frontier_upload_unlisten", func)?;
        }

        {
            let targets = Rc::clone(&targets);
            let func = Function::new(
                ctx.clone(),
                move |ctx: Ctx<'_>, target: u32, json: String| -> rquickjs::Result<bool> {
                    let event: ProgressEvent = match serde_json::from_str(&json) {
                        Ok(event) => event,
                        Err(err) => {
                            return Err(rquickjs::Error::new_from_js_message(
                                "object",
                                "ProgressEvent",
                                format!("invalid event payload: {err}"),
                            ))
                        }
                    };
                    if let Some(upload) = lookup_target(&targets, target) {
                        let active = ActiveScript {
                            context: context_id,
                            ctx: &ctx,
                        };
                        upload.dispatch_event(&event, Some(&active));
                    }
                    // Upload events are never cancelable.
                    Ok(true)
                },
            )?
            .with_name("__frontier_upload_dispatch")?;
            global.set("__frontier_upload_dispatch", func)?;
        }

        ctx.eval::<(), _>(UPLOAD_BOOTSTRAP.as_bytes())
    })
}

const UPLOAD_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const frontier = global.frontier ?? (global.frontier = {});
    const listen = global.__frontier_upload_listen;
    const unlisten = global.__frontier_upload_unlisten;
    const dispatch = global.__frontier_upload_dispatch;
    delete global.__frontier_upload_listen;
    delete global.__frontier_upload_unlisten;
    delete global.__frontier_upload_dispatch;
    const TARGET = Symbol('frontier.uploadTarget');
    const HANDLES = new Map();
    const LISTENERS = new Map();
    const RECORDS = new WeakMap();
    const HANDLER_TYPES = ['loadstart', 'progress', 'abort', 'error', 'load', 'timeout', 'loadend'];
    let nextToken = 1;

    const toCount = (value) => {
        const number = Math.floor(Number(value));
        return Number.isFinite(number) && number > 0 ? number : 0;
    };

    function ProgressEvent(type, init) {
        if (!(this instanceof ProgressEvent)) {
            throw new TypeError('Constructor ProgressEvent requires "new"');
        }
        const options = init ?? {};
        this.type = String(type);
        this.lengthComputable = !!options.lengthComputable;
        this.loaded = toCount(options.loaded);
        this.total = toCount(options.total);
        this.target = null;
        this.currentTarget = null;
    }

    function XMLHttpRequestEventTarget() {
        throw new TypeError('Illegal constructor');
    }

    function XMLHttpRequestUpload() {
        throw new TypeError('Illegal constructor');
    }

    Object.setPrototypeOf(XMLHttpRequestUpload.prototype, XMLHttpRequestEventTarget.prototype);
    Object.setPrototypeOf(XMLHttpRequestUpload, XMLHttpRequestEventTarget);

    function targetIdOf(receiver) {
        if (receiver == null || typeof receiver[TARGET] !== 'number') {
            throw new TypeError("'this' is not an XMLHttpRequestUpload");
        }
        return receiver[TARGET];
    }

    function recordFor(handle) {
        let record = RECORDS.get(handle);
        if (!record) {
            record = { listeners: new Map(), handlers: new Map() };
            RECORDS.set(handle, record);
        }
        return record;
    }

    function addListener(handle, type, callback) {
        const targetId = targetIdOf(handle);
        if (callback == null) {
            return null;
        }
        const normalized = String(type);
        const record = recordFor(handle);
        let entries = record.listeners.get(normalized);
        if (!entries) {
            entries = [];
            record.listeners.set(normalized, entries);
        }
        for (const entry of entries) {
            if (entry.callback === callback) {
                return entry;
            }
        }
        const token = nextToken++;
        const listenerId = listen(targetId, normalized, token);
        if (listenerId == null) {
            return null;
        }
        const entry = { token, listenerId, callback, handle, type: normalized };
        entries.push(entry);
        LISTENERS.set(token, entry);
        return entry;
    }

    // Forget the script side of a listener. Safe to call twice.
    function detachEntry(entry) {
        LISTENERS.delete(entry.token);
        const record = RECORDS.get(entry.handle);
        if (!record) {
            return;
        }
        const entries = record.listeners.get(entry.type);
        if (entries) {
            const index = entries.indexOf(entry);
            if (index !== -1) {
                entries.splice(index, 1);
            }
            if (entries.length === 0) {
                record.listeners.delete(entry.type);
            }
        }
        const handler = record.handlers.get(entry.type);
        if (handler && handler.entry === entry) {
            record.handlers.delete(entry.type);
        }
    }

    function removeEntry(entry) {
        detachEntry(entry);
        unlisten(targetIdOf(entry.handle), entry.listenerId);
    }

    function removeListener(handle, type, callback) {
        targetIdOf(handle);
        const record = RECORDS.get(handle);
        if (!record || callback == null) {
            return;
        }
        const entries = record.listeners.get(String(type));
        if (!entries) {
            return;
        }
        const entry = entries.find((candidate) => candidate.callback === callback);
        if (entry) {
            removeEntry(entry);
        }
    }

    const proto = XMLHttpRequestEventTarget.prototype;

    proto.addEventListener = function (type, callback) {
        addListener(this, type, callback);
    };

    proto.removeEventListener = function (type, callback) {
        removeListener(this, type, callback);
    };

    proto.dispatchEvent = function (event) {
        const targetId = targetIdOf(this);
        if (event == null || event.type === undefined) {
            throw new TypeError('dispatchEvent requires an event with a type');
        }
        const detail = {
            type: String(event.type),
            lengthComputable: !!event.lengthComputable,
            loaded: toCount(event.loaded),
            total: toCount(event.total),
        };
        return dispatch(targetId, JSON.stringify(detail));
    };

    for (const type of HANDLER_TYPES) {
        Object.defineProperty(proto, 'on' + type, {
            configurable: true,
            enumerable: true,
            get() {
                targetIdOf(this);
                const record = RECORDS.get(this);
                const handler = record && record.handlers.get(type);
                return handler ? handler.callback : null;
            },
            set(value) {
                targetIdOf(this);
                const record = recordFor(this);
                const previous = record.handlers.get(type);
                if (previous) {
                    record.handlers.delete(type);
                    if (LISTENERS.has(previous.entry.token)) {
                        removeEntry(previous.entry);
                    }
                }
                if (typeof value !== 'function') {
                    return;
                }
                // Wrapped so the handler never collides with an identical addEventListener callback.
                const wrapper = function (event) {
                    return value.call(this, event);
                };
                const entry = addListener(this, type, wrapper);
                if (entry) {
                    record.handlers.set(type, { entry, callback: value });
                }
            },
        });
    }

    frontier.__uploadHandle = function (targetId) {
        let handle = HANDLES.get(targetId);
        if (!handle) {
            handle = Object.create(XMLHttpRequestUpload.prototype);
            Object.defineProperty(handle, TARGET, { value: targetId });
            HANDLES.set(targetId, handle);
        }
        return handle;
    };

    frontier.__invokeUploadListener = function (token, detail) {
        const entry = LISTENERS.get(token);
        if (!entry) {
            return null;
        }
        const event = new ProgressEvent(detail.type, detail);
        event.target = entry.handle;
        event.currentTarget = entry.handle;
        try {
            const callback = entry.callback;
            if (typeof callback === 'function') {
                callback.call(entry.handle, event);
            } else if (callback && typeof callback.handleEvent === 'function') {
                callback.handleEvent(event);
            }
            return null;
        } catch (error) {
            return error instanceof Error ? `${error.name}: ${error.message}` : String(error);
        }
    };

    frontier.__releaseUploadListener = function (token) {
        const entry = LISTENERS.get(token);
        if (entry) {
            detachEntry(entry);
        }
    };

    frontier.__releaseUploadTarget = function (targetId) {
        HANDLES.delete(targetId);
    };

    frontier.__uploadBindingStats = () => ({ handles: HANDLES.size, listeners: LISTENERS.size });

    if (typeof global.ProgressEvent === 'undefined') {
        global.ProgressEvent = ProgressEvent;
    }
    global.XMLHttpRequestEventTarget = XMLHttpRequestEventTarget;
    global.XMLHttpRequestUpload = XMLHttpRequestUpload;
})();
"#;
