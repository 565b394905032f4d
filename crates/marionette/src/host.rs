//! Host abstraction: the application the agent is embedded in.
//!
//! The agent never owns host state. The host's frame loop lends itself as
//! `&mut dyn Host` on every [`Agent::tick`](crate::agent::Agent::tick), so all
//! reads and writes happen on the frame thread without synchronization.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::bridge::protocol::RpcError;
use crate::version::HostInfo;

/// Screen-space position in host pixels.
pub type Point = [f64; 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// Synthetic input delivered to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InputEvent {
    Action {
        name: String,
        pressed: bool,
        strength: f64,
    },
    Key {
        key: String,
        pressed: bool,
    },
    MouseButton {
        button: MouseButton,
        pressed: bool,
        position: Point,
    },
    MouseMotion {
        position: Point,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum HostError {
    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("property '{property}' not found on {path}")]
    PropertyNotFound { path: String, property: String },

    #[error("method '{method}' not found on {path}")]
    MethodNotFound { path: String, method: String },

    #[error("event '{event}' not found on {path}")]
    EventNotFound { path: String, event: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{0}")]
    Evaluation(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Referenced state was destroyed while an operation depended on it.
    #[error("{0} was invalidated")]
    Invalidated(String),
}

impl From<HostError> for RpcError {
    fn from(err: HostError) -> Self {
        match err {
            HostError::NodeNotFound(_)
            | HostError::PropertyNotFound { .. }
            | HostError::MethodNotFound { .. }
            | HostError::EventNotFound { .. } => RpcError::not_found(err),
            HostError::InvalidValue(detail) => RpcError::invalid_params(detail),
            HostError::Evaluation(detail) => RpcError::evaluation_failed(detail),
            HostError::Unsupported(_) => RpcError::unsupported(err),
            HostError::Invalidated(_) => RpcError::target_invalidated(err),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// What a host reports back through a [`Subscription`].
#[derive(Debug, Clone, PartialEq)]
pub enum HostEvent {
    Fired {
        subscription: SubscriptionId,
        args: Vec<Value>,
    },
    SourceDestroyed {
        subscription: SubscriptionId,
    },
}

impl HostEvent {
    pub fn subscription(&self) -> SubscriptionId {
        match self {
            Self::Fired { subscription, .. } | Self::SourceDestroyed { subscription } => *subscription,
        }
    }
}

/// Sending half of the agent's host-event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<HostEvent>,
}

impl EventSink {
    pub(crate) fn new(tx: mpsc::UnboundedSender<HostEvent>) -> Self {
        Self { tx }
    }

    fn push(&self, event: HostEvent) {
        // Agent already gone: nobody is waiting.
        let _ = self.tx.send(event);
    }
}

/// Listener handed to [`Host::subscribe`].
///
/// The host keeps it until [`Host::unsubscribe`] and reports through it; the
/// agent reads the queue on its next tick. Firing more than once is harmless:
/// everything after the first delivery is ignored.
#[derive(Debug, Clone)]
pub struct Subscription {
    id: SubscriptionId,
    sink: EventSink,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, sink: EventSink) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// The event fired with these positional arguments.
    pub fn fire(&self, args: Vec<Value>) {
        self.sink.push(HostEvent::Fired {
            subscription: self.id,
            args,
        });
    }

    /// The event source was destroyed; the subscription will never fire.
    pub fn source_destroyed(&self) {
        self.sink.push(HostEvent::SourceDestroyed {
            subscription: self.id,
        });
    }
}

/// The application surface the agent drives.
///
/// Paths are host-defined node paths (e.g. `/root/Main/Player`). Every method
/// runs on the frame thread and must return promptly.
pub trait Host {
    fn info(&self) -> HostInfo;

    /// Whether a display surface exists (gates `screenshot`).
    fn has_display(&self) -> bool {
        false
    }

    fn frame(&self) -> u64 {
        0
    }

    fn scene_tree(&self, root: Option<&str>, max_depth: Option<usize>) -> Result<Value, HostError>;

    fn node_exists(&self, path: &str) -> bool;

    fn describe_node(&self, path: &str) -> Result<Value, HostError>;

    fn get_property(&self, path: &str, property: &str) -> Result<Value, HostError>;

    fn set_property(&mut self, path: &str, property: &str, value: Value) -> Result<(), HostError>;

    fn call_method(&mut self, path: &str, method: &str, args: &[Value]) -> Result<Value, HostError>;

    /// Evaluate a host-language expression, optionally relative to `target`.
    fn evaluate(&mut self, expression: &str, target: Option<&str>) -> Result<Value, HostError>;

    fn inject_input(&mut self, event: InputEvent) -> Result<(), HostError>;

    /// Attach a listener to `event` on the node at `source`.
    fn subscribe(
        &mut self,
        source: &str,
        event: &str,
        subscription: Subscription,
    ) -> Result<(), HostError>;

    /// Detach a listener. Unknown ids are ignored.
    fn unsubscribe(&mut self, subscription: SubscriptionId);

    /// Capture the current frame as an opaque payload.
    fn capture_frame(&mut self) -> Result<Vec<u8>, HostError> {
        Err(HostError::Unsupported("frame capture".to_string()))
    }
}
