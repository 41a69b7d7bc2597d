//! JSON-RPC 2.0 envelopes and the static half of the MCP surface.

pub mod catalog;
pub mod jsonrpc;

pub use jsonrpc::{JsonRpcError, JsonRpcRequest, JsonRpcResponse, RequestError, RequestId};
