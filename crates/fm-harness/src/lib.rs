//! JSON-RPC protocol types, input-schema validation, and the tool
//! registry/dispatcher the transport layer routes every `tools/call`
//! through.

pub mod registry;
pub mod rpc;
pub mod schema;

pub use registry::{FnHandler, ToolContext, ToolError, ToolHandler, ToolRegistry, ToolSpec};
pub use rpc::{
    InitializeResult, RpcError, RpcRequest, RpcResponse, ServerCapabilities, ServerInfo,
    ToolContent, ToolDescriptor, ToolResult, PROTOCOL_VERSION,
};
pub use schema::ValidationError;
