//! Background task that owns the client socket.

use std::collections::HashMap;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::time::{DelayQueue, delay_queue};

use super::ClientError;
use crate::bridge::codec::{Frame, MessageCodec};
use crate::bridge::protocol::{Request, RequestId, Response};

type Reply = oneshot::Sender<Result<Value, ClientError>>;

pub(super) enum Command {
    Send {
        request: Request,
        timeout: Duration,
        reply: Reply,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

struct PendingRequest {
    method: String,
    reply: Reply,
    timer: delay_queue::Key,
    timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    /// `disconnect()` was called or every handle was dropped.
    Requested,
    /// The agent went away or sent an unreadable frame.
    Closed,
}

impl Exit {
    fn error(self) -> ClientError {
        match self {
            Self::Requested => ClientError::Disconnected,
            Self::Closed => ClientError::ConnectionClosed,
        }
    }
}

pub(super) fn spawn(stream: TcpStream) -> mpsc::UnboundedSender<Command> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(run(stream, rx));
    tx
}

/// Ask the task to stop and wait until it has.
pub(super) async fn shutdown(commands: &mpsc::UnboundedSender<Command>) {
    let (done, rx) = oneshot::channel();
    if commands.send(Command::Disconnect { done }).is_ok() {
        let _ = rx.await;
    }
}

async fn run(stream: TcpStream, mut commands: mpsc::UnboundedReceiver<Command>) {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, MessageCodec::new());
    let mut writer = FramedWrite::new(write, MessageCodec::new());
    let mut pending: HashMap<RequestId, PendingRequest> = HashMap::new();
    let mut timers: DelayQueue<RequestId> = DelayQueue::new();

    let (exit, done) = loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Send { request, timeout, reply }) => {
                    if pending.contains_key(&request.id) {
                        let _ = reply.send(Err(ClientError::Protocol(format!(
                            "id {} is already in flight",
                            request.id
                        ))));
                        continue;
                    }
                    if let Err(e) = writer.send(&request).await {
                        tracing::warn!(error = %e, "Failed to write request");
                        let _ = reply.send(Err(ClientError::ConnectionClosed));
                        break (Exit::Closed, None);
                    }
                    tracing::debug!(request_id = %request.id, method = %request.method, "Sent request");
                    let timer = timers.insert(request.id.clone(), timeout);
                    pending.insert(
                        request.id,
                        PendingRequest {
                            method: request.method,
                            reply,
                            timer,
                            timeout,
                        },
                    );
                }
                Some(Command::Disconnect { done }) => break (Exit::Requested, Some(done)),
                None => break (Exit::Requested, None),
            },

            Some(expired) = timers.next() => {
                let id = expired.into_inner();
                if let Some(entry) = pending.remove(&id) {
                    tracing::debug!(request_id = %id, method = %entry.method, "Request timed out");
                    let _ = entry.reply.send(Err(ClientError::Timeout {
                        method: entry.method,
                        timeout: entry.timeout,
                    }));
                }
            }

            frame = reader.next() => match frame {
                Some(Ok(Frame::Text(text))) => deliver(&text, &mut pending, &mut timers),
                Some(Ok(Frame::Invalid(reason))) => {
                    tracing::warn!(%reason, "Discarding non-UTF-8 frame from agent");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Unreadable frame from agent");
                    break (Exit::Closed, None);
                }
                None => {
                    tracing::info!("Agent closed the connection");
                    break (Exit::Closed, None);
                }
            },
        }
    };

    if !pending.is_empty() {
        tracing::debug!(count = pending.len(), ?exit, "Failing outstanding requests");
    }
    for (_, entry) in pending.drain() {
        let _ = entry.reply.send(Err(exit.error()));
    }
    drop(reader);
    drop(writer);

    // Anything queued behind the disconnect is answered, never sent.
    commands.close();
    let mut acks = Vec::from_iter(done);
    while let Ok(command) = commands.try_recv() {
        match command {
            Command::Send { reply, .. } => {
                let _ = reply.send(Err(ClientError::Disconnected));
            }
            Command::Disconnect { done } => acks.push(done),
        }
    }
    for done in acks {
        let _ = done.send(());
    }
    tracing::debug!("Client connection task exiting");
}

/// Resolve the pending entry a response belongs to.
fn deliver(
    text: &str,
    pending: &mut HashMap<RequestId, PendingRequest>,
    timers: &mut DelayQueue<RequestId>,
) {
    let response: Response = match serde_json::from_str(text) {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Discarding unparseable response");
            return;
        }
    };
    let Some(id) = response.id.clone() else {
        tracing::warn!(outcome = ?response.outcome, "Agent reported an error without an id");
        return;
    };
    let Some(entry) = pending.remove(&id) else {
        tracing::warn!(request_id = %id, "Discarding response for unknown or timed-out request");
        return;
    };
    timers.remove(&entry.timer);
    let _ = entry
        .reply
        .send(response.into_result().map_err(ClientError::from));
}
