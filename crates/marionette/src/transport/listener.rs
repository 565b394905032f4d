//! TCP listener with a single-connection policy.

use std::io;
use std::net::SocketAddr;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::{ConnectionId, TransportEvent};
use crate::bridge::codec::{Frame, MessageCodec};
use crate::bridge::protocol::Response;

/// Handle to a running accept loop. Dropping it closes every socket.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
}

impl Listener {
    /// Bound address. Differs from the requested one when port 0 was asked for.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Bind `host:port` and start accepting controllers on the current runtime.
pub async fn bind(
    host: &str,
    port: u16,
) -> io::Result<(Listener, mpsc::UnboundedReceiver<TransportEvent>)> {
    let listener = TcpListener::bind((host, port)).await?;
    let local_addr = listener.local_addr()?;
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();

    tracing::info!(%local_addr, "Agent listening");
    tokio::spawn(accept_loop(listener, events_tx, shutdown.clone()));

    Ok((
        Listener {
            local_addr,
            shutdown,
        },
        events_rx,
    ))
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::UnboundedSender<TransportEvent>,
    shutdown: CancellationToken,
) {
    let mut next_id = 0u64;
    let mut current: Option<(ConnectionId, CancellationToken)> = None;

    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed");
                    continue;
                }
            },
        };

        if let Some((previous, cancel)) = current.take() {
            tracing::info!(connection = %previous, "Superseding previous connection");
            cancel.cancel();
        }

        next_id += 1;
        let connection = ConnectionId::new(next_id);
        let cancel = shutdown.child_token();
        current = Some((connection, cancel.clone()));

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(%connection, error = %e, "Failed to set TCP_NODELAY");
        }

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        if events
            .send(TransportEvent::Connected {
                connection,
                outbound: outbound_tx,
            })
            .is_err()
        {
            tracing::debug!("Agent dropped, stopping accept loop");
            break;
        }

        tracing::info!(%connection, %peer, "Controller connected");
        tokio::spawn(serve_connection(
            connection,
            stream,
            events.clone(),
            outbound_rx,
            cancel,
        ));
    }

    tracing::debug!("Accept loop exiting");
}

async fn serve_connection(
    connection: ConnectionId,
    stream: TcpStream,
    events: mpsc::UnboundedSender<TransportEvent>,
    mut outbound: mpsc::UnboundedReceiver<Response>,
    cancel: CancellationToken,
) {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, MessageCodec::new());
    let mut writer = FramedWrite::new(write, MessageCodec::new());

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                tracing::debug!(%connection, "Connection cancelled");
                break;
            }

            Some(response) = outbound.recv() => {
                if let Err(e) = writer.send(response).await {
                    tracing::warn!(%connection, error = %e, "Failed to write response");
                    break;
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    let event = match frame {
                        Frame::Text(text) => TransportEvent::Message { connection, text },
                        Frame::Invalid(reason) => TransportEvent::Malformed { connection, reason },
                    };
                    if events.send(event).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    tracing::warn!(%connection, error = %e, "Unreadable frame, closing connection");
                    break;
                }
                None => {
                    tracing::info!(%connection, "Controller disconnected");
                    break;
                }
            },
        }
    }

    let _ = events.send(TransportEvent::Closed { connection });
}
