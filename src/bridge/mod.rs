//! Cross-frame bridge.
//!
//! Fields inside a cross-origin embedded frame cannot be reached from page
//! script. The bridge attaches a remote debugging session to the hosting
//! page, walks its frame tree and runs the injection script inside an
//! isolated world created for each frame in turn.

mod cdp;
mod host;
mod protocol;

pub use cdp::CdpDebugger;
pub use host::{BridgeHost, BridgeLink};
pub use protocol::{Debugger, Detached, FrameDescriptor, FrameNode};

use crate::script;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, info, warn};

/// Errors from the cross-frame bridge.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    #[error("could not attach to target: {0}")]
    AttachFailed(String),

    #[error("no debugging session attached to '{0}'")]
    NotAttached(String),

    #[error("field '{selector}' not found in any of {frames_tried} frames")]
    FieldNotFoundInAnyFrame { selector: String, frames_tried: usize },

    #[error("{method} failed: {message}")]
    Protocol { method: String, message: String },

    #[error("{method} timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    #[error("script error: {0}")]
    Script(String),

    #[error("transport error: {0}")]
    Transport(String),
}

/// Where a bridge fill landed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameFill {
    pub frame_id: String,
    pub value: String,
}

#[derive(Debug, Default, Deserialize)]
struct FillProbe {
    #[serde(default)]
    found: bool,
    #[serde(default)]
    value: String,
}

/// Debugging-session owner for the targets of one browser.
///
/// Methods take `&mut self`: commands against a target are serialized by
/// whoever owns the bridge, so two isolated contexts are never being set up
/// on the same frame at once.
pub struct Bridge<D: Debugger> {
    debugger: D,
    attached: HashSet<String>,
    detachments: broadcast::Receiver<Detached>,
    world_name: String,
    command_timeout: Duration,
    settle_ms: u64,
}

impl<D: Debugger> Bridge<D> {
    pub fn new(debugger: D, world_name: impl Into<String>, command_timeout: Duration) -> Self {
        let detachments = debugger.detachments();
        Self {
            debugger,
            attached: HashSet::new(),
            detachments,
            world_name: world_name.into(),
            command_timeout,
            settle_ms: 300,
        }
    }

    /// Pause inside the frame between the last event and the read-back.
    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle_ms = settle.as_millis() as u64;
        self
    }

    pub fn debugger(&self) -> &D {
        &self.debugger
    }

    pub fn is_attached(&mut self, target: &str) -> bool {
        self.sync_detachments();
        self.attached.contains(target)
    }

    /// Targets with a live session, as far as the bridge knows.
    pub fn attached_targets(&mut self) -> Vec<String> {
        self.sync_detachments();
        self.attached.iter().cloned().collect()
    }

    /// Attach to `target`. A no-op when already attached.
    pub async fn attach(&mut self, target: &str) -> Result<(), BridgeError> {
        if self.is_attached(target) {
            return Ok(());
        }
        let attach = self.debugger.attach(target);
        match tokio::time::timeout(self.command_timeout, attach).await {
            Ok(Ok(())) => {
                info!("bridge attached to {}", target);
                self.attached.insert(target.to_string());
                Ok(())
            }
            Ok(Err(BridgeError::AttachFailed(msg))) => Err(BridgeError::AttachFailed(msg)),
            Ok(Err(e)) => Err(BridgeError::AttachFailed(e.to_string())),
            Err(_) => Err(BridgeError::AttachFailed(format!(
                "attach timed out after {}ms",
                self.command_timeout.as_millis()
            ))),
        }
    }

    /// Detach from `target`. Bookkeeping is cleared even if the endpoint
    /// reports an error.
    pub async fn detach(&mut self, target: &str) -> Result<(), BridgeError> {
        if !self.is_attached(target) {
            return Ok(());
        }
        self.attached.remove(target);
        info!("bridge detaching from {}", target);
        match tokio::time::timeout(self.command_timeout, self.debugger.detach(target)).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                method: "Target.detachFromTarget".into(),
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }

    /// The page's current frame tree. Queried fresh on every call.
    ///
    /// Frames running in their own process report their subtrees
    /// separately; those are merged in under their owners.
    pub async fn frame_tree(&mut self, target: &str) -> Result<FrameNode, BridgeError> {
        self.attach(target).await?;
        let mut tree = self.query_tree(target, None).await?;

        // A nested frame can only be grafted once its owner is in the tree.
        let mut remote = self.debugger.remote_frames(target);
        loop {
            let before = remote.len();
            let mut waiting = Vec::new();
            for frame_id in remote {
                let subtree = match self.query_tree(target, Some(&frame_id)).await {
                    Ok(subtree) => subtree,
                    Err(e @ (BridgeError::NotAttached(_) | BridgeError::Transport(_))) => {
                        return Err(e)
                    }
                    Err(e) => {
                        debug!("frame {} has no tree: {}", frame_id, e);
                        continue;
                    }
                };
                if !tree.graft(subtree) {
                    waiting.push(frame_id);
                }
            }
            if waiting.is_empty() {
                break;
            }
            if waiting.len() == before {
                debug!("frames {:?} not connected to {}", waiting, target);
                break;
            }
            remote = waiting;
        }
        Ok(tree)
    }

    async fn query_tree(
        &mut self,
        target: &str,
        frame_id: Option<&str>,
    ) -> Result<FrameNode, BridgeError> {
        let result = self
            .command(target, frame_id, "Page.getFrameTree", json!({}))
            .await?;
        serde_json::from_value(result.get("frameTree").cloned().unwrap_or(Value::Null)).map_err(
            |e| BridgeError::Protocol {
                method: "Page.getFrameTree".into(),
                message: e.to_string(),
            },
        )
    }

    /// Evaluate `script` in a fresh isolated world scoped to `frame_id` and
    /// return the result by value.
    pub async fn evaluate_in_frame(
        &mut self,
        target: &str,
        frame_id: &str,
        script: &str,
    ) -> Result<Value, BridgeError> {
        self.attach(target).await?;
        let world = self
            .command(
                target,
                Some(frame_id),
                "Page.createIsolatedWorld",
                json!({
                    "frameId": frame_id,
                    "worldName": self.world_name,
                    "grantUniveralAccess": false,
                }),
            )
            .await?;
        let context_id = world
            .get("executionContextId")
            .and_then(Value::as_i64)
            .ok_or_else(|| BridgeError::Protocol {
                method: "Page.createIsolatedWorld".into(),
                message: "missing executionContextId".into(),
            })?;

        let result = self
            .command(
                target,
                Some(frame_id),
                "Runtime.evaluate",
                json!({
                    "expression": script,
                    "contextId": context_id,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;

        if let Some(exception) = result.get("exceptionDetails") {
            let text = exception
                .pointer("/exception/description")
                .or_else(|| exception.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("unknown exception");
            return Err(BridgeError::Script(text.to_string()));
        }
        Ok(result
            .pointer("/result/value")
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Fill `selector` in the first frame that contains it.
    ///
    /// Frames are tried depth-first from the root. The search stops at the
    /// first frame where the control exists; no later frame is touched.
    pub async fn fill_field(
        &mut self,
        target: &str,
        selector: &str,
        value: &str,
    ) -> Result<FrameFill, BridgeError> {
        let frames = self.frame_tree(target).await?.flatten();
        let fill = script::frame_fill(selector, value, self.settle_ms);
        debug!("bridge fill '{}': {} frames", selector, frames.len());

        for frame in &frames {
            let probe = match self.evaluate_in_frame(target, &frame.id, &fill).await {
                Ok(v) => serde_json::from_value::<FillProbe>(v).unwrap_or_default(),
                Err(e @ (BridgeError::NotAttached(_) | BridgeError::Transport(_))) => {
                    return Err(e)
                }
                Err(e) => {
                    debug!("frame {} ({}) skipped: {}", frame.id, frame.url, e);
                    continue;
                }
            };
            if !probe.found {
                debug!("frame {}: '{}' not present", frame.id, selector);
                continue;
            }
            if probe.value.trim().is_empty() {
                return Err(BridgeError::Script(format!(
                    "'{}' found in frame {} but empty after injection",
                    selector, frame.id
                )));
            }
            info!("bridge filled '{}' in frame {}", selector, frame.id);
            return Ok(FrameFill {
                frame_id: frame.id.clone(),
                value: probe.value,
            });
        }

        Err(BridgeError::FieldNotFoundInAnyFrame {
            selector: selector.to_string(),
            frames_tried: frames.len(),
        })
    }

    /// One protocol command, bounded by the command timeout. Commands for a
    /// frame go to whichever session hosts it.
    async fn command(
        &mut self,
        target: &str,
        frame_id: Option<&str>,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        debug!("cdp {} -> {} (frame {:?})", method, target, frame_id);
        let debugger = &self.debugger;
        let sent = async {
            match frame_id {
                Some(frame_id) => debugger.send_to_frame(target, frame_id, method, params).await,
                None => debugger.send(target, method, params).await,
            }
        };
        match tokio::time::timeout(self.command_timeout, sent).await {
            Ok(Err(BridgeError::NotAttached(t))) => {
                warn!("session for {} is gone", t);
                self.attached.remove(&t);
                Err(BridgeError::NotAttached(t))
            }
            Ok(result) => result,
            Err(_) => Err(BridgeError::Timeout {
                method: method.to_string(),
                timeout_ms: self.command_timeout.as_millis() as u64,
            }),
        }
    }

    fn sync_detachments(&mut self) {
        loop {
            match self.detachments.try_recv() {
                Ok(Detached { target, reason }) => {
                    if self.attached.remove(&target) {
                        warn!("bridge detached from {} externally: {}", target, reason);
                    }
                }
                Err(TryRecvError::Lagged(n)) => {
                    warn!("missed {} detach notifications, forgetting all sessions", n);
                    self.attached.clear();
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
    }
}
