//! The foreman daemon: JSON-RPC over HTTP POST plus an SSE notification
//! channel, the transport-session layer with grace-period recovery, the
//! tool handler implementations, and the bootstrap that wires the whole
//! coordinator together.

pub mod bootstrap;
pub mod context;
pub mod http;
pub mod sessions;
pub mod tools;

pub use context::ServerContext;
pub use sessions::SessionManager;
