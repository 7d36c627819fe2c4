//! Chrome DevTools Protocol over a browser-level websocket, flatten mode.
//!
//! Attaching to a page also auto-attaches to its out-of-process frames.
//! Commands for a cross-site frame go to the child session that owns it.

use super::{BridgeError, Debugger, Detached};
use crate::script;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<Value>>>>;
type Shared = Arc<StdMutex<Registry>>;

/// Page binding the mutation observer reports through.
const MUTATION_BINDING: &str = "__eokaCheckoutMutated";

const SESSION_GONE: &str = "Session with given id not found";

/// Debugger speaking CDP to a browser's `webSocketDebuggerUrl`.
pub struct CdpDebugger {
    sink: Arc<Mutex<SplitSink<WsStream, WsMessage>>>,
    pending: Pending,
    registry: Shared,
    next_id: AtomicU64,
    detached: broadcast::Sender<Detached>,
    reader: JoinHandle<()>,
}

/// Which session answers for which page or frame.
#[derive(Debug, Default)]
struct Registry {
    /// page target id -> session id
    targets: HashMap<String, String>,
    /// out-of-process frame id -> owning child session
    frames: HashMap<String, ChildFrame>,
    /// page target id -> mutation feed
    feeds: HashMap<String, broadcast::Sender<()>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ChildFrame {
    session: String,
    /// Session the frame was auto-attached from.
    parent: String,
}

/// What the reader publishes after applying an event.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Detached(Detached),
    Mutated(String),
}

fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Registry {
    fn target_of(&self, session: &str) -> Option<String> {
        self.targets
            .iter()
            .find(|(_, s)| s.as_str() == session)
            .map(|(t, _)| t.clone())
    }

    /// Drop `target`'s session together with its frames and mutation feed.
    fn forget(&mut self, target: &str) -> Option<String> {
        let session = self.targets.remove(target)?;
        self.feeds.remove(target);
        self.forget_children(&session);
        Some(session)
    }

    fn forget_children(&mut self, session: &str) {
        let children: Vec<String> = self
            .frames
            .iter()
            .filter(|(_, child)| child.parent == session)
            .map(|(frame, _)| frame.clone())
            .collect();
        for frame in children {
            if let Some(child) = self.frames.remove(&frame) {
                self.forget_children(&child.session);
            }
        }
    }

    /// Child session owning `frame_id` when that frame runs out of process
    /// somewhere below `target`.
    fn session_for_frame(&self, target: &str, frame_id: &str) -> Option<String> {
        let page = self.targets.get(target)?;
        let child = self.frames.get(frame_id)?;
        let mut parent = &child.parent;
        for _ in 0..=self.frames.len() {
            if parent == page {
                return Some(child.session.clone());
            }
            parent = &self.frames.values().find(|c| &c.session == parent)?.parent;
        }
        None
    }

    fn drain(&mut self) -> Vec<Detached> {
        self.frames.clear();
        self.feeds.clear();
        self.targets
            .drain()
            .map(|(target, _)| Detached {
                target,
                reason: "connection_closed".into(),
            })
            .collect()
    }
}

/// Apply one protocol event to the registry.
fn handle_event(message: &Value, registry: &mut Registry) -> Option<Event> {
    let method = message.get("method")?.as_str()?;
    let params = &message["params"];
    let session = message.get("sessionId").and_then(Value::as_str);

    match method {
        "Target.attachedToTarget" => {
            let info = &params["targetInfo"];
            if info["type"].as_str() != Some("iframe") {
                return None;
            }
            let frame = info["targetId"].as_str()?;
            let child = params["sessionId"].as_str()?;
            debug!("frame {} -> session {}", frame, child);
            registry.frames.insert(
                frame.to_string(),
                ChildFrame {
                    session: child.to_string(),
                    parent: session?.to_string(),
                },
            );
            None
        }
        "Target.detachedFromTarget" => {
            let gone = params["sessionId"].as_str().unwrap_or_default();
            let frame = registry
                .frames
                .iter()
                .find(|(_, child)| child.session == gone)
                .map(|(frame, _)| frame.clone());
            if let Some(frame) = frame {
                debug!("frame {} lost its session", frame);
                registry.frames.remove(&frame);
                registry.forget_children(gone);
                return None;
            }
            let target = params["targetId"]
                .as_str()
                .filter(|t| registry.targets.contains_key(*t))
                .map(str::to_string)
                .or_else(|| registry.target_of(gone))?;
            registry.forget(&target);
            Some(Event::Detached(Detached {
                target,
                reason: "target_detached".into(),
            }))
        }
        "Inspector.detached" => {
            let target = registry.target_of(session?)?;
            let reason = params["reason"]
                .as_str()
                .unwrap_or("inspector_detached")
                .to_string();
            registry.forget(&target);
            Some(Event::Detached(Detached { target, reason }))
        }
        "Runtime.bindingCalled" if params["name"].as_str() == Some(MUTATION_BINDING) => {
            registry.target_of(session?).map(Event::Mutated)
        }
        _ => None,
    }
}

/// Reply slot for one command. Removed when the caller stops waiting, so
/// commands abandoned on timeout do not pile up.
struct PendingEntry<'a> {
    pending: &'a Pending,
    id: u64,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(&self.id);
    }
}

fn register(pending: &Pending, id: u64) -> (PendingEntry<'_>, oneshot::Receiver<Value>) {
    let (tx, rx) = oneshot::channel();
    lock(pending).insert(id, tx);
    (PendingEntry { pending, id }, rx)
}

impl CdpDebugger {
    /// Connect to a browser-level endpoint such as
    /// `ws://127.0.0.1:9222/devtools/browser/<id>`.
    pub async fn connect(endpoint: &str) -> Result<Self, BridgeError> {
        info!("connecting to CDP endpoint {}", endpoint);
        let (stream, _) = connect_async(endpoint)
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;
        let (sink, source) = stream.split();

        let pending: Pending = Arc::default();
        let registry: Shared = Arc::default();
        let (detached, _) = broadcast::channel(16);
        let reader = tokio::spawn(read_loop(
            source,
            pending.clone(),
            registry.clone(),
            detached.clone(),
        ));

        Ok(Self {
            sink: Arc::new(Mutex::new(sink)),
            pending,
            registry,
            next_id: AtomicU64::new(1),
            detached,
            reader,
        })
    }

    /// Open a new page target at `url` and return its target id.
    pub async fn create_target(&self, url: &str) -> Result<String, BridgeError> {
        let result = self
            .call(None, "Target.createTarget", json!({ "url": url }))
            .await?;
        result
            .get("targetId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::Protocol {
                method: "Target.createTarget".into(),
                message: "no targetId in response".into(),
            })
    }

    /// Subscribe to subtree mutations of `target`'s document.
    ///
    /// Installs a `MutationObserver` reporting through a page binding, now
    /// and after every navigation. Receivers close when the target detaches.
    pub async fn watch_mutations(
        &self,
        target: &str,
    ) -> Result<broadcast::Receiver<()>, BridgeError> {
        self.attach(target).await?;
        let feed = lock(&self.registry)
            .feeds
            .entry(target.to_string())
            .or_insert_with(|| broadcast::channel(64).0)
            .subscribe();

        let observer = script::mutation_observer(MUTATION_BINDING);
        self.send(target, "Runtime.enable", json!({})).await?;
        self.send(target, "Runtime.addBinding", json!({ "name": MUTATION_BINDING }))
            .await?;
        self.send(
            target,
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": observer }),
        )
        .await?;
        self.send(target, "Runtime.evaluate", json!({ "expression": observer }))
            .await?;
        info!("watching mutations on {}", target);
        Ok(feed)
    }

    async fn call(
        &self,
        session_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (_entry, rx) = register(&self.pending, id);

        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            command["sessionId"] = Value::String(session_id.to_string());
        }

        self.sink
            .lock()
            .await
            .send(WsMessage::Text(command.to_string().into()))
            .await
            .map_err(|e| BridgeError::Transport(e.to_string()))?;

        let response = rx
            .await
            .map_err(|_| BridgeError::Transport("connection closed".into()))?;
        if let Some(error) = response.get("error") {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            return Err(BridgeError::Protocol {
                method: method.to_string(),
                message,
            });
        }
        Ok(response.get("result").cloned().unwrap_or_else(|| json!({})))
    }
}

impl Debugger for CdpDebugger {
    async fn attach(&self, target: &str) -> Result<(), BridgeError> {
        if lock(&self.registry).targets.contains_key(target) {
            return Ok(());
        }
        let result = self
            .call(
                None,
                "Target.attachToTarget",
                json!({ "targetId": target, "flatten": true }),
            )
            .await
            .map_err(|e| BridgeError::AttachFailed(e.to_string()))?;
        let session_id = result
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BridgeError::AttachFailed("no sessionId in response".into()))?
            .to_string();
        debug!("target {} -> session {}", target, session_id);
        lock(&self.registry)
            .targets
            .insert(target.to_string(), session_id.clone());

        // Cross-site frames run in their own renderer and are only reachable
        // through sessions attached to them.
        let auto_attach = json!({
            "autoAttach": true,
            "waitForDebuggerOnStart": false,
            "flatten": true,
        });
        if let Err(e) = self
            .call(Some(&session_id), "Target.setAutoAttach", auto_attach)
            .await
        {
            warn!("out-of-process frames of {} unreachable: {}", target, e);
        }
        Ok(())
    }

    async fn detach(&self, target: &str) -> Result<(), BridgeError> {
        let session = lock(&self.registry).forget(target);
        let Some(session_id) = session else {
            return Ok(());
        };
        self.call(
            None,
            "Target.detachFromTarget",
            json!({ "sessionId": session_id }),
        )
        .await
        .map(|_| ())
    }

    async fn send(&self, target: &str, method: &str, params: Value) -> Result<Value, BridgeError> {
        let session = lock(&self.registry).targets.get(target).cloned();
        let session_id = session.ok_or_else(|| BridgeError::NotAttached(target.to_string()))?;
        match self.call(Some(&session_id), method, params).await {
            Err(BridgeError::Protocol { message, .. }) if message.contains(SESSION_GONE) => {
                lock(&self.registry).forget(target);
                Err(BridgeError::NotAttached(target.to_string()))
            }
            other => other,
        }
    }

    async fn send_to_frame(
        &self,
        target: &str,
        frame_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let child = lock(&self.registry).session_for_frame(target, frame_id);
        let Some(session_id) = child else {
            return self.send(target, method, params).await;
        };
        debug!("{} for frame {} via session {}", method, frame_id, session_id);
        match self.call(Some(&session_id), method, params).await {
            Err(BridgeError::Protocol { message, .. }) if message.contains(SESSION_GONE) => {
                lock(&self.registry).frames.remove(frame_id);
                Err(BridgeError::Protocol {
                    method: method.to_string(),
                    message,
                })
            }
            other => other,
        }
    }

    fn remote_frames(&self, target: &str) -> Vec<String> {
        let registry = lock(&self.registry);
        registry
            .frames
            .keys()
            .filter(|frame| registry.session_for_frame(target, frame).is_some())
            .cloned()
            .collect()
    }

    fn detachments(&self) -> broadcast::Receiver<Detached> {
        self.detached.subscribe()
    }
}

impl Drop for CdpDebugger {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut source: SplitStream<WsStream>,
    pending: Pending,
    registry: Shared,
    detached: broadcast::Sender<Detached>,
) {
    while let Some(msg) = source.next().await {
        let text = match msg {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("CDP websocket error: {}", e);
                break;
            }
        };
        let Ok(message) = serde_json::from_str::<Value>(text.as_str()) else {
            continue;
        };

        if let Some(id) = message.get("id").and_then(Value::as_u64) {
            let reply = lock(&pending).remove(&id);
            if let Some(reply) = reply {
                let _ = reply.send(message);
            }
            continue;
        }

        let event = handle_event(&message, &mut lock(&registry));
        match event {
            Some(Event::Detached(gone)) => {
                let _ = detached.send(gone);
            }
            Some(Event::Mutated(target)) => {
                if let Some(feed) = lock(&registry).feeds.get(&target) {
                    let _ = feed.send(());
                }
            }
            None => {}
        }
    }

    info!("CDP connection closed");
    lock(&pending).clear();
    let gone = lock(&registry).drain();
    for detach in gone {
        let _ = detached.send(detach);
    }
}
