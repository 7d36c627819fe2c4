//! Test doubles: a scripted page, a scripted debugger and a fixed card source.

use crate::bridge::{BridgeError, Debugger, Detached};
use crate::card::{CardRecord, CardSource, Expiry};
use crate::config::CardField;
use crate::session::ManualEntry;
use crate::surface::{ElementState, FieldEvent, Surface};
use crate::{Error, Result};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

type Mask = Box<dyn Fn(&str) -> String + Send>;

#[derive(Default)]
struct StubElement {
    state: ElementState,
    /// The framework installed its own `value` on the instance and drops
    /// plain assignment. Only the prototype setter gets through.
    guarded: bool,
    /// What the framework believes the value is, updated on input events.
    framework_value: String,
    /// Reformatting applied when the control loses focus.
    mask: Option<Mask>,
}

#[derive(Default)]
struct PageInner {
    elements: HashMap<String, StubElement>,
    events: HashMap<String, Vec<FieldEvent>>,
    clicks: Vec<String>,
    reveal_on_click: HashMap<String, Vec<String>>,
    changes: Option<broadcast::Sender<()>>,
}

impl PageInner {
    fn changed(&self) {
        if let Some(tx) = &self.changes {
            let _ = tx.send(());
        }
    }
}

/// In-memory page. Clones share the same document.
#[derive(Clone, Default)]
pub struct StubSurface {
    inner: Arc<Mutex<PageInner>>,
}

impl StubSurface {
    /// A page without a mutation feed; waiters poll it.
    pub fn new() -> Self {
        Self::default()
    }

    /// A page that reports every DOM change.
    pub fn with_mutations() -> Self {
        let page = Self::default();
        let (tx, _) = broadcast::channel(64);
        page.lock().changes = Some(tx);
        page
    }

    fn lock(&self) -> MutexGuard<'_, PageInner> {
        self.inner.lock().unwrap()
    }

    pub fn add(&self, selector: &str, state: ElementState) {
        let mut page = self.lock();
        page.elements.insert(
            selector.to_string(),
            StubElement {
                state,
                ..Default::default()
            },
        );
        page.changed();
    }

    /// A visible, enabled, empty control.
    pub fn add_input(&self, selector: &str) {
        self.add(
            selector,
            ElementState {
                rendered: true,
                enabled: true,
                value: String::new(),
            },
        );
    }

    /// A control that exists but has no layout box yet.
    pub fn add_hidden(&self, selector: &str) {
        self.add(
            selector,
            ElementState {
                rendered: false,
                enabled: true,
                value: String::new(),
            },
        );
    }

    pub fn add_guarded(&self, selector: &str, state: ElementState) {
        let mut page = self.lock();
        page.elements.insert(
            selector.to_string(),
            StubElement {
                state,
                guarded: true,
                ..Default::default()
            },
        );
        page.changed();
    }

    pub fn update(&self, selector: &str, f: impl FnOnce(&mut ElementState)) {
        let mut page = self.lock();
        if let Some(el) = page.elements.get_mut(selector) {
            f(&mut el.state);
        }
        page.changed();
    }

    pub fn mask(&self, selector: &str, f: impl Fn(&str) -> String + Send + 'static) {
        if let Some(el) = self.lock().elements.get_mut(selector) {
            el.mask = Some(Box::new(f));
        }
    }

    /// Clicking `button` makes each of `selectors` rendered.
    pub fn reveal_on_click(&self, button: &str, selectors: &[&str]) {
        self.lock().reveal_on_click.insert(
            button.to_string(),
            selectors.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Plain `el.value = v`, as naive page script would do it.
    pub fn assign(&self, selector: &str, value: &str) {
        if let Some(el) = self.lock().elements.get_mut(selector) {
            if !el.guarded {
                el.state.value = value.to_string();
            }
        }
    }

    pub fn value(&self, selector: &str) -> Option<String> {
        self.lock()
            .elements
            .get(selector)
            .map(|el| el.state.value.clone())
    }

    pub fn framework_value(&self, selector: &str) -> Option<String> {
        self.lock()
            .elements
            .get(selector)
            .map(|el| el.framework_value.clone())
    }

    pub fn events(&self, selector: &str) -> Vec<FieldEvent> {
        self.lock()
            .events
            .get(selector)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clicks(&self) -> Vec<String> {
        self.lock().clicks.clone()
    }
}

impl Surface for StubSurface {
    async fn probe(&self, selector: &str) -> Result<Option<ElementState>> {
        Ok(self
            .lock()
            .elements
            .get(selector)
            .map(|el| el.state.clone()))
    }

    async fn set_native_value(&self, selector: &str, value: &str) -> Result<bool> {
        let mut page = self.lock();
        let Some(el) = page.elements.get_mut(selector) else {
            return Ok(false);
        };
        el.state.value = value.to_string();
        page.changed();
        Ok(true)
    }

    async fn dispatch(&self, selector: &str, event: &FieldEvent) -> Result<bool> {
        let mut page = self.lock();
        let Some(el) = page.elements.get_mut(selector) else {
            return Ok(false);
        };
        match event {
            FieldEvent::Input(_) => el.framework_value = el.state.value.clone(),
            FieldEvent::Blur => {
                if let Some(mask) = &el.mask {
                    el.state.value = mask(&el.state.value);
                    el.framework_value = el.state.value.clone();
                }
            }
            FieldEvent::Focus | FieldEvent::Change => {}
        }
        page.events
            .entry(selector.to_string())
            .or_default()
            .push(event.clone());
        page.changed();
        Ok(true)
    }

    async fn read_value(&self, selector: &str) -> Result<Option<String>> {
        Ok(self.value(selector))
    }

    async fn click(&self, selector: &str) -> Result<()> {
        let mut page = self.lock();
        if !page.elements.contains_key(selector) {
            return Err(Error::FieldNotFound(selector.to_string()));
        }
        page.clicks.push(selector.to_string());
        let revealed = page
            .reveal_on_click
            .get(selector)
            .cloned()
            .unwrap_or_default();
        for target in revealed {
            if let Some(el) = page.elements.get_mut(&target) {
                el.state.rendered = true;
            }
        }
        page.changed();
        Ok(())
    }

    fn changes(&self) -> Option<broadcast::Receiver<()>> {
        self.lock().changes.as_ref().map(|tx| tx.subscribe())
    }
}

struct DebuggerInner {
    tree: Value,
    /// frame id -> selectors present in that frame
    fields: HashMap<String, HashSet<String>>,
    /// frame id -> selectors whose value the frame clears after input
    rejecting: HashMap<String, HashSet<String>>,
    contexts: HashMap<i64, String>,
    next_context: i64,
    attached: HashSet<String>,
    refuse_attach: Option<String>,
    frames_tried: Vec<String>,
    filled: Vec<(String, String, String)>,
    calls: Vec<(String, Value)>,
    /// (method, frame id) for commands addressed to a frame
    routed: Vec<(String, String)>,
    /// out-of-process frame id -> the tree its own session reports
    remote: HashMap<String, Value>,
    attach_count: usize,
    detach_count: usize,
    tree_queries: usize,
}

/// Scripted CDP endpoint. Clones share state.
#[derive(Clone)]
pub struct StubDebugger {
    inner: Arc<Mutex<DebuggerInner>>,
    detached: broadcast::Sender<Detached>,
}

impl StubDebugger {
    pub fn new(tree: Value) -> Self {
        let (detached, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(Mutex::new(DebuggerInner {
                tree,
                fields: HashMap::new(),
                rejecting: HashMap::new(),
                contexts: HashMap::new(),
                next_context: 1,
                attached: HashSet::new(),
                refuse_attach: None,
                frames_tried: Vec::new(),
                filled: Vec::new(),
                calls: Vec::new(),
                routed: Vec::new(),
                remote: HashMap::new(),
                attach_count: 0,
                detach_count: 0,
                tree_queries: 0,
            })),
            detached,
        }
    }

    fn lock(&self) -> MutexGuard<'_, DebuggerInner> {
        self.inner.lock().unwrap()
    }

    /// Put a control matching `selector` inside frame `frame_id`.
    pub fn place(&self, frame_id: &str, selector: &str) {
        self.lock()
            .fields
            .entry(frame_id.to_string())
            .or_default()
            .insert(selector.to_string());
    }

    /// Like `place`, but the frame's own script wipes whatever is entered.
    pub fn place_rejecting(&self, frame_id: &str, selector: &str) {
        self.place(frame_id, selector);
        self.lock()
            .rejecting
            .entry(frame_id.to_string())
            .or_default()
            .insert(selector.to_string());
    }

    pub fn set_tree(&self, tree: Value) {
        self.lock().tree = tree;
    }

    pub fn refuse_attach(&self, message: &str) {
        self.lock().refuse_attach = Some(message.to_string());
    }

    /// Simulate another client taking over `target`.
    pub fn force_detach(&self, target: &str, reason: &str) {
        self.lock().attached.remove(target);
        let _ = self.detached.send(Detached {
            target: target.to_string(),
            reason: reason.to_string(),
        });
    }

    /// Frames a fill script ran in, in order.
    pub fn frames_tried(&self) -> Vec<String> {
        self.lock().frames_tried.clone()
    }

    /// `(frame, selector, value)` for every successful fill.
    pub fn filled(&self) -> Vec<(String, String, String)> {
        self.lock().filled.clone()
    }

    pub fn attach_count(&self) -> usize {
        self.lock().attach_count
    }

    pub fn detach_count(&self) -> usize {
        self.lock().detach_count
    }

    pub fn tree_queries(&self) -> usize {
        self.lock().tree_queries
    }

    /// Host `frame_id` out of process. Its subtree is only reported on its
    /// own session.
    pub fn host_remote(&self, frame_id: &str, tree: Value) {
        self.lock().remote.insert(frame_id.to_string(), tree);
    }

    pub fn routed(&self) -> Vec<(String, String)> {
        self.lock().routed.clone()
    }

    pub fn last_params(&self, method: &str) -> Option<Value> {
        self.lock()
            .calls
            .iter()
            .rev()
            .find(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
    }
}

/// First JSON string literal following `marker` in `script`.
fn string_after(script: &str, marker: &str) -> Option<String> {
    let start = script.find(marker)? + marker.len();
    serde_json::Deserializer::from_str(&script[start..])
        .into_iter::<String>()
        .next()?
        .ok()
}

impl DebuggerInner {
    fn evaluate(&mut self, params: &Value) -> Value {
        let expression = params["expression"].as_str().unwrap_or_default();
        let frame = params["contextId"]
            .as_i64()
            .and_then(|id| self.contexts.get(&id).cloned())
            .unwrap_or_default();

        if let Some(message) = expression.strip_prefix("throw ") {
            return json!({
                "result": { "type": "object", "subtype": "error" },
                "exceptionDetails": { "text": "Uncaught", "exception": { "description": message } }
            });
        }

        let Some(selector) = string_after(expression, "document.querySelector(") else {
            // Anything else evaluates to the id of the frame it ran in.
            return json!({ "result": { "type": "string", "value": frame } });
        };
        let value = string_after(expression, "const value = ").unwrap_or_default();
        self.frames_tried.push(frame.clone());

        let present = self
            .fields
            .get(&frame)
            .is_some_and(|fields| fields.contains(&selector));
        if !present {
            return json!({ "result": { "type": "object", "value": { "found": false } } });
        }
        let rejects = self
            .rejecting
            .get(&frame)
            .is_some_and(|fields| fields.contains(&selector));
        let kept = if rejects { String::new() } else { value };
        if !kept.is_empty() {
            self.filled.push((frame, selector, kept.clone()));
        }
        json!({ "result": { "type": "object", "value": { "found": true, "value": kept } } })
    }
}

impl Debugger for StubDebugger {
    async fn attach(&self, target: &str) -> std::result::Result<(), BridgeError> {
        let mut inner = self.lock();
        if let Some(message) = &inner.refuse_attach {
            return Err(BridgeError::AttachFailed(message.clone()));
        }
        inner.attach_count += 1;
        inner.attached.insert(target.to_string());
        Ok(())
    }

    async fn detach(&self, target: &str) -> std::result::Result<(), BridgeError> {
        let mut inner = self.lock();
        if inner.attached.remove(target) {
            inner.detach_count += 1;
        }
        Ok(())
    }

    async fn send(
        &self,
        target: &str,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, BridgeError> {
        let mut inner = self.lock();
        if !inner.attached.contains(target) {
            return Err(BridgeError::NotAttached(target.to_string()));
        }
        inner.calls.push((method.to_string(), params.clone()));
        match method {
            "Page.getFrameTree" => {
                inner.tree_queries += 1;
                Ok(json!({ "frameTree": inner.tree.clone() }))
            }
            "Page.createIsolatedWorld" => {
                let frame = params["frameId"].as_str().unwrap_or_default().to_string();
                let id = inner.next_context;
                inner.next_context += 1;
                inner.contexts.insert(id, frame);
                Ok(json!({ "executionContextId": id }))
            }
            "Runtime.evaluate" => Ok(inner.evaluate(&params)),
            other => Err(BridgeError::Protocol {
                method: other.to_string(),
                message: "method not supported by stub".into(),
            }),
        }
    }

    async fn send_to_frame(
        &self,
        target: &str,
        frame_id: &str,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, BridgeError> {
        let subtree = {
            let mut inner = self.lock();
            inner
                .routed
                .push((method.to_string(), frame_id.to_string()));
            inner.remote.get(frame_id).cloned()
        };
        match subtree {
            Some(tree) if method == "Page.getFrameTree" => Ok(json!({ "frameTree": tree })),
            _ => self.send(target, method, params).await,
        }
    }

    fn remote_frames(&self, _target: &str) -> Vec<String> {
        let mut frames: Vec<String> = self.lock().remote.keys().cloned().collect();
        frames.sort();
        frames
    }

    fn detachments(&self) -> broadcast::Receiver<Detached> {
        self.detached.subscribe()
    }
}

/// Card source returning the same card every time, or failing.
#[derive(Debug, Clone)]
pub struct FixedCards(pub Option<CardRecord>);

impl FixedCards {
    pub fn visa() -> Self {
        Self(Some(CardRecord::new(
            "4242424242424242",
            "visa",
            Expiry::new(12, 2030),
            "123",
        )))
    }

    pub fn failing() -> Self {
        Self(None)
    }
}

impl CardSource for FixedCards {
    fn generate(&self, pattern: &str) -> Result<CardRecord> {
        self.0
            .clone()
            .ok_or_else(|| Error::CardSource(format!("cannot expand pattern '{}'", pattern)))
    }
}

/// Manual entry that records what it was asked to present.
#[derive(Debug, Clone, Default)]
pub struct ManualLog {
    presented: Arc<Mutex<Vec<CardField>>>,
}

impl ManualLog {
    pub fn presented(&self) -> Vec<CardField> {
        self.presented.lock().unwrap().clone()
    }
}

impl ManualEntry for ManualLog {
    fn present(&self, field: CardField, _value: &str) -> Result<()> {
        self.presented.lock().unwrap().push(field);
        Ok(())
    }
}
