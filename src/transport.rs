//! Outbound TCP transport for inter-node leader traffic.
//!
//! Each peer gets one background task owning a framed TCP connection.
//! Events are fire-and-forget: they are dropped, never queued against
//! backpressure, so the caller can never block on a slow or dead peer.
//! Requests carry correlation ids and are matched to responses arriving
//! on the same connection.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::bytes::Bytes;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, warn};

use crate::rpc::{EventMsg, Frame, RequestMsg, ResponseMsg};
use crate::types::PeerId;

/// Outbound messages queued per peer.
const QUEUE_DEPTH: usize = 64;

const MAX_FRAME: usize = 1024 * 1024;

/// Error type for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(std::io::Error),
    #[error("serialization error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("deserialization error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
    #[error("connection closed by peer")]
    ConnectionClosed,
    #[error("peer queue full or task gone")]
    PeerUnavailable,
    #[error("request timed out")]
    Timeout,
}

type Conn = Framed<TcpStream, LengthDelimitedCodec>;
type ReplySender = oneshot::Sender<Result<ResponseMsg, TransportError>>;

enum Outbound {
    /// Dial the peer if not already connected.
    Connect,
    Event(EventMsg),
    Call {
        request: RequestMsg,
        reply: ReplySender,
    },
}

/// Manages outbound connections to cluster peers.
///
/// Peer ids double as cluster TCP addresses (`host:port`).
pub struct PeerTransport {
    peers: RwLock<HashMap<PeerId, mpsc::Sender<Outbound>>>,
}

impl PeerTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            peers: RwLock::new(HashMap::new()),
        })
    }

    /// Fire-and-forget connection attempt (the startup ping).
    pub(crate) fn connect(&self, peer: &PeerId) {
        let _ = self.sender_for(peer).try_send(Outbound::Connect);
    }

    /// Send a one-way event. Never blocks: if the peer's queue is full or
    /// its task is gone, the event is dropped.
    pub(crate) fn cast(&self, peer: &PeerId, event: EventMsg) {
        if self
            .sender_for(peer)
            .try_send(Outbound::Event(event))
            .is_err()
        {
            debug!(peer = %peer, "Dropping event for unreachable peer");
        }
    }

    /// Send a correlated request and wait for the response.
    pub(crate) async fn call(
        &self,
        peer: &PeerId,
        request: RequestMsg,
        timeout: Duration,
    ) -> Result<ResponseMsg, TransportError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.sender_for(peer)
            .try_send(Outbound::Call {
                request,
                reply: reply_tx,
            })
            .map_err(|_| TransportError::PeerUnavailable)?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::PeerUnavailable),
            Err(_) => Err(TransportError::Timeout),
        }
    }

    /// Drop a peer's connection task.
    pub(crate) fn disconnect(&self, peer: &PeerId) {
        self.peers.write().expect("peer map poisoned").remove(peer);
    }

    fn sender_for(&self, peer: &PeerId) -> mpsc::Sender<Outbound> {
        {
            let peers = self.peers.read().expect("peer map poisoned");
            if let Some(tx) = peers.get(peer) {
                if !tx.is_closed() {
                    return tx.clone();
                }
            }
        }

        let mut peers = self.peers.write().expect("peer map poisoned");
        if let Some(tx) = peers.get(peer) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }

        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        tokio::spawn(peer_task(peer.clone(), rx));
        peers.insert(peer.clone(), tx.clone());
        tx
    }
}

impl std::fmt::Debug for PeerTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTransport").finish()
    }
}

enum Step {
    Outbound(Option<Outbound>),
    Inbound(Option<Result<tokio_util::bytes::BytesMut, std::io::Error>>),
}

async fn peer_task(peer: PeerId, mut rx: mpsc::Receiver<Outbound>) {
    let mut conn: Option<Conn> = None;
    let mut pending: HashMap<u64, ReplySender> = HashMap::new();
    let mut next_id: u64 = 0;

    loop {
        let step = match conn.as_mut() {
            Some(c) => tokio::select! {
                msg = rx.recv() => Step::Outbound(msg),
                frame = c.next() => Step::Inbound(frame),
            },
            None => Step::Outbound(rx.recv().await),
        };

        match step {
            // Transport handle dropped: shut the task down.
            Step::Outbound(None) => break,
            Step::Outbound(Some(Outbound::Connect)) => {
                if conn.is_none() {
                    conn = dial(&peer).await;
                }
            }
            Step::Outbound(Some(Outbound::Event(event))) => {
                if conn.is_none() {
                    conn = dial(&peer).await;
                }
                let Some(c) = conn.as_mut() else {
                    debug!(peer = %peer, "Dropping event, peer unreachable");
                    continue;
                };
                if write_frame(c, &Frame::Event(event)).await.is_err() {
                    drop_connection(&peer, &mut conn, &mut pending);
                }
            }
            Step::Outbound(Some(Outbound::Call { request, reply })) => {
                if conn.is_none() {
                    conn = dial(&peer).await;
                }
                let Some(c) = conn.as_mut() else {
                    let _ = reply.send(Err(TransportError::Connect(std::io::Error::new(
                        std::io::ErrorKind::NotConnected,
                        format!("peer {peer} unreachable"),
                    ))));
                    continue;
                };
                let id = next_id;
                next_id += 1;
                if write_frame(c, &Frame::Request { id, request }).await.is_err() {
                    let _ = reply.send(Err(TransportError::ConnectionClosed));
                    drop_connection(&peer, &mut conn, &mut pending);
                } else {
                    pending.insert(id, reply);
                }
            }
            Step::Inbound(Some(Ok(bytes))) => match rmp_serde::from_slice::<Frame>(&bytes) {
                Ok(Frame::Response { id, response }) => match pending.remove(&id) {
                    Some(reply) => {
                        let _ = reply.send(Ok(response));
                    }
                    // Caller gave up (timeout) before the reply landed.
                    None => debug!(peer = %peer, id, "Discarding late response"),
                },
                Ok(other) => {
                    warn!(peer = %peer, ?other, "Unexpected frame on outbound connection");
                }
                Err(e) => {
                    warn!(peer = %peer, error = %e, "Undecodable frame, dropping connection");
                    drop_connection(&peer, &mut conn, &mut pending);
                }
            },
            Step::Inbound(Some(Err(_))) | Step::Inbound(None) => {
                drop_connection(&peer, &mut conn, &mut pending);
            }
        }
    }
}

async fn dial(peer: &PeerId) -> Option<Conn> {
    debug!(peer = %peer, "Connecting to peer");
    let stream = match TcpStream::connect(peer.as_str()).await {
        Ok(s) => s,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Connect failed");
            return None;
        }
    };
    if let Err(e) = stream.set_nodelay(true) {
        debug!(peer = %peer, error = %e, "Connect failed");
        return None;
    }
    Some(Framed::new(stream, codec()))
}

pub(crate) fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME)
        .new_codec()
}

async fn write_frame(conn: &mut Conn, frame: &Frame) -> Result<(), TransportError> {
    let payload = rmp_serde::to_vec(frame)?;
    conn.send(Bytes::from(payload))
        .await
        .map_err(|_| TransportError::ConnectionClosed)
}

fn drop_connection(peer: &PeerId, conn: &mut Option<Conn>, pending: &mut HashMap<u64, ReplySender>) {
    if conn.take().is_some() {
        debug!(peer = %peer, in_flight = pending.len(), "Connection lost");
    }
    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(TransportError::ConnectionClosed));
    }
}
