//! MCP protocol layer: JSON-RPC types, the outbound client with its three
//! transports, and the inbound proxy server that republishes a backend's
//! capabilities.

pub mod client;
pub mod server;
pub mod sse;
pub mod types;

pub use client::{McpClient, McpClientError, McpResult, StdioSpec, RemoteSpec, TransportSpec};
pub use server::McpProxyServer;
