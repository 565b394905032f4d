//! Controller client.
//!
//! One background task owns the socket and the table of outstanding requests.
//! [`Client`] handles talk to it over a command channel, so any number of
//! requests can be in flight and each resolves on its own id or its own timer.

mod connection;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};

use crate::bridge::protocol::{Request, RpcError};
use crate::capabilities::CapabilitySet;
use connection::Command;

/// Longest per-request timeout honoured. Larger values are clamped to it.
pub const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("handshake failed: {0}")]
    Handshake(String),

    #[error("'{method}' timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("disconnected")]
    Disconnected,

    #[error("connection closed by agent")]
    ConnectionClosed,

    #[error("{message} (code {code})")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    #[error("'{method}' requires capability '{capability}', which the agent did not report")]
    MissingCapability { method: String, capability: String },

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<RpcError> for ClientError {
    fn from(err: RpcError) -> Self {
        Self::Rpc {
            code: err.code,
            message: err.message,
            data: err.data,
        }
    }
}

impl ClientError {
    /// Wire code, for errors the agent answered with.
    pub fn code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Used by [`Client::request`].
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 9080,
            connect_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connected controller. Cheap to clone; clones share one connection.
#[derive(Debug, Clone)]
pub struct Client {
    commands: mpsc::UnboundedSender<Command>,
    next_id: Arc<AtomicI64>,
    capabilities: Arc<CapabilitySet>,
    request_timeout: Duration,
}

impl Client {
    /// Open the transport and perform the `hello` handshake.
    ///
    /// On any failure the socket is released before this returns.
    pub async fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let addr = config.addr();
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(ClientError::Connect { addr, source }),
            Err(_) => {
                return Err(ClientError::ConnectTimeout {
                    addr,
                    timeout: config.connect_timeout,
                });
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        tracing::debug!(%addr, "Connected, starting handshake");

        let commands = connection::spawn(stream);
        let next_id = Arc::new(AtomicI64::new(1));

        let hello = Request::new(next_id.fetch_add(1, Ordering::Relaxed), "hello");
        let capabilities = match Self::roundtrip(&commands, hello, config.handshake_timeout).await {
            Ok(value) => serde_json::from_value::<CapabilitySet>(value)
                .map_err(|e| ClientError::Handshake(format!("malformed capability set: {}", e))),
            Err(e) => Err(ClientError::Handshake(e.to_string())),
        };
        let capabilities = match capabilities {
            Ok(caps) => caps,
            Err(e) => {
                connection::shutdown(&commands).await;
                return Err(e);
            }
        };

        tracing::info!(
            %addr,
            session = %capabilities.session,
            protocol_version = capabilities.protocol_version,
            "Handshake complete"
        );

        Ok(Self {
            commands,
            next_id,
            capabilities: Arc::new(capabilities),
            request_timeout: config.request_timeout,
        })
    }

    /// Capability set reported by the agent at connect time.
    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn is_connected(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Send with the default request timeout.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value, ClientError> {
        self.send(method, params, self.request_timeout).await
    }

    /// Send one request and wait for its response or its timeout.
    ///
    /// `params` must be an object or null. Methods whose capability tag is
    /// missing fail here without touching the transport.
    pub async fn send(&self, method: &str, params: Value, timeout: Duration) -> Result<Value, ClientError> {
        if let Err(tag) = self.capabilities.check(method) {
            return Err(ClientError::MissingCapability {
                method: method.to_string(),
                capability: tag.to_string(),
            });
        }
        let params = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ClientError::Protocol(format!(
                    "params must be an object, got {}",
                    other
                )));
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(id, method).with_params(params);
        Self::roundtrip(&self.commands, request, timeout).await
    }

    async fn roundtrip(
        commands: &mpsc::UnboundedSender<Command>,
        request: Request,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        let timeout = timeout.min(MAX_REQUEST_TIMEOUT);
        let (reply, rx) = oneshot::channel();
        commands
            .send(Command::Send {
                request,
                timeout,
                reply,
            })
            .map_err(|_| ClientError::Disconnected)?;
        rx.await.map_err(|_| ClientError::Disconnected)?
    }

    /// Reject every outstanding request with [`ClientError::Disconnected`] and
    /// close the socket. A no-op when already disconnected.
    pub async fn disconnect(&self) {
        connection::shutdown(&self.commands).await;
    }
}
