//! The remote-debugging seam and the frame-tree shapes it returns.

use super::BridgeError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// A remote debugging endpoint able to attach to page targets and run
/// protocol commands against them.
#[allow(async_fn_in_trait)]
pub trait Debugger {
    /// Attach a debugging session to `target`.
    async fn attach(&self, target: &str) -> Result<(), BridgeError>;

    /// Detach from `target`. Detaching an unknown target is not an error.
    async fn detach(&self, target: &str) -> Result<(), BridgeError>;

    /// Send one protocol command in the session attached to `target` and
    /// return its `result` object.
    async fn send(&self, target: &str, method: &str, params: Value) -> Result<Value, BridgeError>;

    /// Send a command concerning `frame_id` inside `target`. A frame hosted
    /// in its own process answers on its own session; everything else goes
    /// through the target's session.
    async fn send_to_frame(
        &self,
        target: &str,
        frame_id: &str,
        method: &str,
        params: Value,
    ) -> Result<Value, BridgeError> {
        let _ = frame_id;
        self.send(target, method, params).await
    }

    /// Frames of `target` that run in their own process and only answer on
    /// their own session.
    fn remote_frames(&self, target: &str) -> Vec<String> {
        let _ = target;
        Vec::new()
    }

    /// Detachments the bridge did not ask for (tab closed, another client
    /// took over the target).
    fn detachments(&self) -> broadcast::Receiver<Detached>;
}

/// An externally initiated detach.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detached {
    pub target: String,
    pub reason: String,
}

/// One embedded frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameDescriptor {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    #[serde(default)]
    pub url: String,
}

/// A frame and its nested frames, rooted at the top document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameNode {
    pub frame: FrameDescriptor,
    #[serde(rename = "childFrames", default)]
    pub children: Vec<FrameNode>,
}

impl FrameNode {
    /// Depth-first, root first, children in document order.
    pub fn flatten(&self) -> Vec<FrameDescriptor> {
        let mut frames = Vec::new();
        let mut stack = vec![self];
        while let Some(node) = stack.pop() {
            frames.push(node.frame.clone());
            stack.extend(node.children.iter().rev());
        }
        frames
    }

    fn find_mut(&mut self, frame_id: &str) -> Option<&mut FrameNode> {
        if self.frame.id == frame_id {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|child| child.find_mut(frame_id))
    }

    /// Merge a frame's own tree, as reported by the process hosting it.
    ///
    /// Replaces the children of the matching node, or appends `subtree`
    /// under its parent. `false` when neither is in this tree.
    pub fn graft(&mut self, subtree: FrameNode) -> bool {
        if let Some(node) = self.find_mut(&subtree.frame.id) {
            node.children = subtree.children;
            return true;
        }
        let parent = subtree.frame.parent_id.clone().unwrap_or_default();
        match self.find_mut(&parent) {
            Some(node) => {
                node.children.push(subtree);
                true
            }
            None => false,
        }
    }
}
