//! PyPI project probe.

use serde::Deserialize;

use crate::{MarketError, MarketResult, REGISTRY_TIMEOUT};

const PYPI_API: &str = "https://pypi.org/pypi";

#[derive(Debug, Deserialize)]
struct PyPiInfo {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    version: String,
}

#[derive(Debug, Deserialize)]
struct PyPiProject {
    info: PyPiInfo,
}

/// Existence and summary probe against the PyPI project JSON endpoint.
/// Returns `(summary, latest_version)`.
pub async fn validate_and_get_package_info(
    client: &reqwest::Client,
    package_name: &str,
) -> MarketResult<(String, String)> {
    let url = format!("{}/{}/json", PYPI_API, package_name);
    let response = client
        .get(&url)
        .timeout(REGISTRY_TIMEOUT)
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = response.status();
    if status.as_u16() == 404 {
        return Err(MarketError::NotFound);
    }
    let body = response.text().await?;
    if !status.is_success() {
        return Err(MarketError::Status {
            status: status.as_u16(),
            body,
        });
    }

    let project: PyPiProject = serde_json::from_str(&body)?;
    Ok((project.info.summary, project.info.version))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_shape_parses() {
        let body = r#"{"info": {"summary": "An MCP server", "version": "0.9.1"}}"#;
        let project: PyPiProject = serde_json::from_str(body).unwrap();
        assert_eq!(project.info.summary, "An MCP server");
        assert_eq!(project.info.version, "0.9.1");
    }
}
