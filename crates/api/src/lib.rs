//! mcpgate API library
//!
//! This crate contains the gateway server: the MCP connection and proxy
//! fabric, the service manager with its health supervisor, the installation
//! supervisor, the request dispatcher, and the HTTP routes.

pub mod auth;
pub mod config;
pub mod error;
pub mod install;
pub mod mcp;
pub mod options;
pub mod proxy;
pub mod registry;
pub mod routes;
pub mod state;
pub mod stats;
pub mod user_config;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
