//! marionette: in-process automation agent and controller client for
//! frame-driven applications.
//!
//! The agent is embedded in the host's frame loop and driven by
//! [`Agent::tick`]; the [`Client`] drives it from another process over
//! newline-delimited JSON on TCP.

pub mod agent;
pub mod bridge;
pub mod capabilities;
pub mod client;
pub mod host;
pub mod sentinel;
pub mod transport;
mod version;

#[cfg(test)]
mod test_support;

pub use agent::{Agent, AgentConfig};
pub use bridge::protocol::{Request, RequestId, Response, RpcError};
pub use capabilities::CapabilitySet;
pub use client::{Client, ClientConfig, ClientError};
pub use host::{
    Host, HostError, HostEvent, InputEvent, MouseButton, Point, Subscription, SubscriptionId,
};
pub use sentinel::Sentinel;
pub use transport::Listener;
pub use version::{AGENT_VERSION, HostInfo};
