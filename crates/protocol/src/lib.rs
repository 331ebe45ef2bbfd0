//! Wire types for the bridge's JSON-RPC 2.0 surface.
//!
//! The bridge speaks the same dialect on both sides: inbound from the caller and outbound to every
//! registered backend. These types are shared by the server, its integration tests, and any tool
//! that wants to talk to a bridge without pulling in the server crate.

mod envelope;
mod model;

pub use envelope::{
    ErrorCode, ErrorObject, JSONRPC_VERSION, JsonRpcRequest, JsonRpcResponse, RequestId,
    ResponsePayload,
};
pub use model::{
    InitializeResult, ListResourcesResult, ListToolsResult, ResourceDescriptor,
    ResourceReadParams, ServerInfo, ToolCallParams, ToolDescriptor,
};
