//! Market integrations for mcpgate
//!
//! Queries the public npm and PyPI registries for MCP server packages,
//! enriches results with GitHub stars, and mines package READMEs for
//! `mcpServers` config snippets and required environment variables.

pub mod extract;
pub mod github;
pub mod npm;
pub mod pypi;

pub use extract::{
    extract_mcp_config, get_env_vars_from_mcp_config, guess_env_vars_from_readme, McpConfig,
    McpServerConfig,
};
pub use github::{fetch_github_stars, parse_github_repo};
pub use npm::{
    convert_npm_to_search_results, extract_package_name_without_version, get_package_details,
    get_package_readme, search_packages, NpmPackageDetails, NpmSearchResult, SearchPackageResult,
};
pub use pypi::validate_and_get_package_info;

use std::time::Duration;

use thiserror::Error;

/// Timeout for package registry calls.
pub const REGISTRY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("registry returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to parse registry response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("package not found")]
    NotFound,
}

pub type MarketResult<T> = Result<T, MarketError>;
