//! Inbound TCP server for inter-node leader traffic.
//!
//! Decodes frames off each accepted connection and routes them into the
//! leader task's mailbox: events as-is, requests with a reply channel
//! whose answer is written back on the same connection under the
//! request's correlation id.

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::bytes::Bytes;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

use crate::leader::Command;
use crate::rpc::{EventMsg, Frame, RequestMsg, ResponseMsg};
use crate::transport::codec;

pub(crate) fn start(listen_addr: String, commands: mpsc::Sender<Command>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let listener = match TcpListener::bind(&listen_addr).await {
            Ok(l) => {
                info!(addr = %listen_addr, "Leader TCP server listening");
                l
            }
            Err(e) => {
                error!(error = %e, addr = %listen_addr, "Failed to bind leader TCP server");
                return;
            }
        };

        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    debug!(peer = %peer_addr, "Accepted leader connection");
                    let commands = commands.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(commands, stream).await {
                            debug!(peer = %peer_addr, error = %e, "Leader connection closed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Failed to accept leader connection");
                }
            }
        }
    })
}

async fn handle_connection(
    commands: mpsc::Sender<Command>,
    stream: tokio::net::TcpStream,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream, codec());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        match rmp_serde::from_slice::<Frame>(&frame)? {
            Frame::Event(event) => {
                let command = match event {
                    EventMsg::Heartbeat(info) => Command::Heartbeat(info),
                    EventMsg::SteppingDown(info) => Command::SteppingDown(info),
                };
                if commands.send(command).await.is_err() {
                    // Leader task gone; the process is shutting down.
                    return Ok(());
                }
            }
            Frame::Request { id, request } => {
                let response = match dispatch(&commands, request).await {
                    Some(response) => response,
                    None => return Ok(()),
                };
                let payload = rmp_serde::to_vec(&Frame::Response { id, response })?;
                framed.send(Bytes::from(payload)).await?;
            }
            Frame::Response { id, .. } => {
                warn!(id, "Unexpected response frame on inbound connection");
            }
        }
    }

    Ok(())
}

/// Route a request through the leader task. `None` means the task is gone.
async fn dispatch(commands: &mpsc::Sender<Command>, request: RequestMsg) -> Option<ResponseMsg> {
    match request {
        RequestMsg::Vote(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            commands
                .send(Command::Vote {
                    request,
                    reply: reply_tx,
                })
                .await
                .ok()?;
            reply_rx.await.ok().map(ResponseMsg::Vote)
        }
        RequestMsg::MemberCheck(request) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            commands
                .send(Command::MemberCheck {
                    request,
                    reply: reply_tx,
                })
                .await
                .ok()?;
            reply_rx.await.ok().map(ResponseMsg::MemberCheck)
        }
    }
}
