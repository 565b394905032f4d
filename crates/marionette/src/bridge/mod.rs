//! Wire layer shared by the agent and the controller client.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, RpcError) and request validation
//! - **codec**: Newline-delimited JSON framing for AsyncRead/AsyncWrite

pub mod codec;
pub mod protocol;
