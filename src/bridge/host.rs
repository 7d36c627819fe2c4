//! The bridge owner: answers bridge requests one at a time.

use super::{Bridge, Debugger};
use crate::channel::{Inbox, Requester};
use crate::message::{BridgeRequest, BridgeResponse};
use tracing::{debug, info, warn};

/// Sending side of a bridge owner's inbox.
pub type BridgeLink = Requester<BridgeRequest, BridgeResponse>;

/// Serves [`BridgeRequest`]s against one [`Bridge`].
///
/// Requests are handled strictly in arrival order, so fills against the
/// same target never overlap.
pub struct BridgeHost<D: Debugger> {
    bridge: Bridge<D>,
}

impl<D: Debugger> BridgeHost<D> {
    pub fn new(bridge: Bridge<D>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&mut self) -> &mut Bridge<D> {
        &mut self.bridge
    }

    /// Run until every requester is gone, then detach from all targets.
    pub async fn serve(mut self, mut inbox: Inbox<BridgeRequest, BridgeResponse>) {
        while let Some(envelope) = inbox.recv().await {
            let response = self.handle(&envelope.request).await;
            if !envelope.reply(response) {
                debug!("bridge requester gone before reply");
            }
        }

        for target in self.bridge.attached_targets() {
            if let Err(e) = self.bridge.detach(&target).await {
                warn!("detach {} on shutdown failed: {}", target, e);
            }
        }
        info!("bridge host stopped");
    }

    pub async fn handle(&mut self, request: &BridgeRequest) -> BridgeResponse {
        match request {
            BridgeRequest::FillFrameField {
                target,
                selector,
                value,
            } => match self.bridge.fill_field(target, selector, value).await {
                Ok(fill) => BridgeResponse::filled(fill.frame_id, fill.value),
                Err(e) => {
                    warn!("bridge fill '{}' failed: {}", selector, e);
                    BridgeResponse::failed(e)
                }
            },
            BridgeRequest::DetachBridge { target } => match self.bridge.detach(target).await {
                Ok(()) => BridgeResponse::ok(),
                Err(e) => BridgeResponse::failed(e),
            },
            BridgeRequest::Unknown => BridgeResponse::failed("unknown request kind"),
        }
    }
}
