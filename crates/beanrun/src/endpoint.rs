//! # Remote Endpoint
//!
//! Server side of a remote connection: decodes call frames, routes them
//! through the dispatcher's remote path and replies with the same sequence
//! number. A frame that cannot be read still gets a reply, carrying a protocol
//! failure.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use beanwire::Failure;
use beanwire::FailureKind;
use beanwire::Fingerprint;
use beanwire::Frame;
use beanwire::Response;

use crate::dispatch::Dispatcher;
use crate::transport::Transport;

#[derive(Clone)]
pub struct Endpoint {
    dispatcher: Arc<Dispatcher>,
}

impl Endpoint {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Handles one encoded frame and returns the encoded reply.
    pub async fn handle(&self, payload: &[u8]) -> beanwire::Result<Vec<u8>> {
        let seq = match beanwire::frame::decode_seq(payload) {
            Ok(seq) => seq,
            Err(e) => {
                warn!(error = %e, "unreadable frame");
                let failure = Failure::new(FailureKind::Protocol, "invalid frame", Fingerprint::UNKNOWN);
                return Frame::Reply {
                    seq: 0,
                    response: failure.into(),
                }
                .encode();
            }
        };

        let response = match Frame::decode(payload) {
            Ok(Frame::Call { request, .. }) => {
                debug!(seq, container = %request.container_id, component = %request.component, "remote call");
                self.dispatcher.route_remote(request).await
            }
            Ok(Frame::Reply { .. }) => {
                Failure::new(FailureKind::Protocol, "expected a call frame", Fingerprint::UNKNOWN).into()
            }
            Err(e) => {
                warn!(seq, error = %e, "malformed call frame");
                Response::from(Failure::new(FailureKind::Protocol, e.to_string(), Fingerprint::UNKNOWN))
            }
        };

        Frame::Reply { seq, response }.encode()
    }

    /// Serves calls arriving on `transport` until it closes. Each call runs in
    /// its own task, so replies may leave out of order.
    pub fn serve(&self, transport: Arc<dyn Transport>) -> JoinHandle<()> {
        let endpoint = self.clone();
        tokio::spawn(async move {
            loop {
                let msg = match transport.recv().await {
                    Ok(Some(msg)) => msg,
                    Ok(None) => {
                        debug!("endpoint transport closed");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "endpoint transport failed");
                        break;
                    }
                };

                let endpoint = endpoint.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    match endpoint.handle(&msg).await {
                        Ok(reply) => {
                            if let Err(e) = transport.send(&reply).await {
                                warn!(error = %e, "failed to send reply");
                            }
                        }
                        Err(e) => error!(error = %e, "failed to encode reply"),
                    }
                });
            }
        })
    }
}
