//! Request/response over an mpsc inbox with a oneshot reply slot.
//!
//! Every request carries its own reply sender, so a response can only ever
//! reach the caller that asked. A caller that gives up drops its receiver
//! and a late reply is discarded.

use crate::{Error, Result};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// One request and the slot its answer goes into.
#[derive(Debug)]
pub struct Envelope<Req, Resp> {
    pub request: Req,
    reply: oneshot::Sender<Resp>,
}

impl<Req, Resp> Envelope<Req, Resp> {
    /// Answer the request. Returns `false` when the caller is gone.
    pub fn reply(self, response: Resp) -> bool {
        self.reply.send(response).is_ok()
    }
}

/// Receiving end, held by whoever serves the requests.
pub type Inbox<Req, Resp> = mpsc::Receiver<Envelope<Req, Resp>>;

/// Sending end. Cheap to clone.
#[derive(Debug)]
pub struct Requester<Req, Resp> {
    tx: mpsc::Sender<Envelope<Req, Resp>>,
}

impl<Req, Resp> Clone for Requester<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Resp> Requester<Req, Resp> {
    /// Send `request` and wait up to `timeout` for its response.
    ///
    /// The timeout covers both queueing and handling.
    pub async fn request(&self, request: Req, timeout: Duration) -> Result<Resp> {
        let exchange = async {
            let (reply, rx) = oneshot::channel();
            self.tx
                .send(Envelope { request, reply })
                .await
                .map_err(|_| Error::ChannelClosed)?;
            rx.await.map_err(|_| Error::ChannelClosed)
        };
        tokio::time::timeout(timeout, exchange)
            .await
            .map_err(|_| Error::RequestTimeout(timeout.as_millis() as u64))?
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A bounded request channel.
pub fn channel<Req, Resp>(capacity: usize) -> (Requester<Req, Resp>, Inbox<Req, Resp>) {
    let (tx, rx) = mpsc::channel(capacity);
    (Requester { tx }, rx)
}
