//! # Peer with Async Pump
//!
//! Client side of a remote connection. Calls are framed with a sequence
//! number and sent over the transport; a background pump reads replies and
//! hands each one to the caller waiting on that sequence number.
//!
//! When the transport closes or sends something that is not a reply, the pump
//! stops and every pending call fails with the same error.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tracing::debug;
use tracing::warn;

use beanwire::Frame;
use beanwire::Request;
use beanwire::Response;

use crate::transport;
use crate::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    Transport(transport::Error),
    Wire(beanwire::Error),
    Timeout,
    ChannelClosed,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transport(e) => write!(f, "Transport error: {}", e),
            Self::Wire(e) => write!(f, "Wire error: {}", e),
            Self::Timeout => write!(f, "Request timed out"),
            Self::ChannelClosed => write!(f, "Response channel closed"),
        }
    }
}

impl std::error::Error for Error {}

impl From<transport::Error> for Error {
    fn from(e: transport::Error) -> Self {
        Self::Transport(e)
    }
}

impl From<beanwire::Error> for Error {
    fn from(e: beanwire::Error) -> Self {
        Self::Wire(e)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

type Pending = DashMap<u64, oneshot::Sender<Result<Response>>>;

pub struct Peer {
    peer_name: String,
    transport: Arc<dyn Transport>,
    pending: Arc<Pending>,
    closed: Arc<AtomicBool>,
    seq_gen: AtomicU64,
    timeout: Duration,
}

impl Peer {
    /// Creates a peer and spawns its pump. Must be called inside a runtime.
    pub fn new(peer_name: impl Into<String>, transport: Box<dyn Transport>) -> Self {
        let peer_name = peer_name.into();
        let transport: Arc<dyn Transport> = Arc::from(transport);
        let pending: Arc<Pending> = Arc::new(DashMap::new());
        let closed = Arc::new(AtomicBool::new(false));

        let pump_name = peer_name.clone();
        let pump_transport = transport.clone();
        let pump_pending = pending.clone();
        let pump_closed = closed.clone();

        tokio::spawn(async move {
            let error = loop {
                match pump_transport.recv().await {
                    Ok(Some(msg)) => {
                        if let Err(e) = Self::handle_message(&msg, &pump_pending) {
                            warn!(peer = %pump_name, error = %e, "dropping connection after bad reply");
                            break e;
                        }
                    }
                    Ok(None) => {
                        debug!(peer = %pump_name, "stream closed");
                        break Error::Transport(transport::Error::ConnectionLost("stream closed".into()));
                    }
                    Err(e) => {
                        warn!(peer = %pump_name, error = %e, "transport error in pump");
                        break Error::Transport(e);
                    }
                }
            };

            pump_closed.store(true, Ordering::SeqCst);
            Self::notify_all_pending(&pump_pending, error);
        });

        Self {
            peer_name,
            transport,
            pending,
            closed,
            seq_gen: AtomicU64::new(1),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn peer_name(&self) -> &str {
        &self.peer_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn notify_all_pending(pending: &Pending, error: Error) {
        let keys: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, tx)) = pending.remove(&key) {
                let _ = tx.send(Err(error.clone()));
            }
        }
    }

    fn handle_message(msg: &[u8], pending: &Pending) -> Result<()> {
        let Frame::Reply { seq, response } = Frame::decode(msg)? else {
            return Err(Error::Wire(beanwire::Error::ProtocolViolation(
                "pump received a call frame".into(),
            )));
        };

        // Late replies to calls that already timed out are ignored.
        if let Some((_, tx)) = pending.remove(&seq) {
            let _ = tx.send(Ok(response));
        }
        Ok(())
    }

    /// Sends a request and waits for its reply.
    pub async fn call(&self, request: Request) -> Result<Response> {
        let seq = self.seq_gen.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(seq, tx);

        if self.is_closed() {
            self.pending.remove(&seq);
            return Err(Error::Transport(transport::Error::ConnectionLost("peer closed".into())));
        }

        let payload = match (Frame::Call { seq, request }).encode() {
            Ok(payload) => payload,
            Err(e) => {
                self.pending.remove(&seq);
                return Err(e.into());
            }
        };

        if let Err(e) = self.transport.send(&payload).await {
            self.pending.remove(&seq);
            return Err(e.into());
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => {
                self.pending.remove(&seq);
                Err(Error::ChannelClosed)
            }
            Err(_) => {
                self.pending.remove(&seq);
                debug!(peer = %self.peer_name, seq, "call timed out");
                Err(Error::Timeout)
            }
        }
    }
}
