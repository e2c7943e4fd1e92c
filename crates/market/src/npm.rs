//! npm registry client and search result mapping.

use std::collections::HashMap;

use mcpgate_shared::Kv;
use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::github::{fetch_github_stars, parse_github_repo};
use crate::{MarketError, MarketResult, REGISTRY_TIMEOUT};

/// npm search API.
pub const NPM_SEARCH_API: &str = "https://registry.npmjs.org/-/v1/search";
/// npm package metadata API base.
pub const NPM_PACKAGE_INFO: &str = "https://registry.npmjs.org/";

// =============================================================================
// Registry response shapes
// =============================================================================

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmLinks {
    #[serde(default)]
    pub npm: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub repository: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmPublisher {
    #[serde(default)]
    pub username: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmPackage {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub links: NpmLinks,
    #[serde(default)]
    pub publisher: NpmPublisher,
    #[serde(default)]
    pub maintainers: Vec<NpmPublisher>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmDownloads {
    #[serde(default)]
    pub monthly: i64,
    #[serde(default)]
    pub weekly: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmScore {
    #[serde(default, rename = "final")]
    pub final_score: f64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmSearchObject {
    pub package: NpmPackage,
    #[serde(default)]
    pub downloads: NpmDownloads,
    #[serde(default)]
    pub score: NpmScore,
}

/// Response of the npm search API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmSearchResult {
    #[serde(default)]
    pub objects: Vec<NpmSearchObject>,
    #[serde(default)]
    pub total: i64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmRepository {
    #[serde(default, rename = "type")]
    pub repo_type: String,
    #[serde(default)]
    pub url: String,
}

/// Package metadata from `registry.npmjs.org/<name>`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NpmPackageDetails {
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub homepage: String,
    #[serde(default)]
    pub repository: NpmRepository,
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub license: String,
    #[serde(default, rename = "requiresEnv")]
    pub requires_env: Vec<String>,
    #[serde(default)]
    pub dependencies: HashMap<String, String>,
    #[serde(default, rename = "devDependencies")]
    pub dev_dependencies: HashMap<String, String>,
    #[serde(default)]
    pub readme: String,
    #[serde(default, rename = "readmeFilename")]
    pub readme_filename: String,
    #[serde(default, rename = "dist-tags")]
    pub dist_tags: HashMap<String, String>,
}

impl NpmPackageDetails {
    /// The registry metadata endpoint reports the latest version under
    /// `dist-tags.latest` rather than a top-level `version`.
    pub fn latest_version(&self) -> &str {
        if !self.version.is_empty() {
            return &self.version;
        }
        self.dist_tags.get("latest").map(String::as_str).unwrap_or("")
    }
}

/// Unified search entry shown to the frontend, across npm and PyPI sources.
#[derive(Debug, Clone, Serialize)]
pub struct SearchPackageResult {
    pub name: String,
    pub version: String,
    pub description: String,
    pub package_manager: String,
    pub source_url: String,
    pub homepage: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub repository_url: String,
    pub license: String,
    pub icon_url: String,
    pub github_stars: i64,
    #[serde(skip_serializing_if = "is_zero")]
    pub downloads: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_updated: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub author: String,
    pub score: f64,
    pub is_installed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub installed_service_id: Option<i64>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

// =============================================================================
// Registry calls
// =============================================================================

/// Search npm packages. `page` is 1-based.
pub async fn search_packages(
    client: &reqwest::Client,
    query: &str,
    limit: usize,
    page: usize,
) -> MarketResult<NpmSearchResult> {
    let limit = if limit == 0 { 20 } else { limit };
    let page = page.max(1);
    let from = (page - 1) * limit;

    let response = client
        .get(NPM_SEARCH_API)
        .timeout(REGISTRY_TIMEOUT)
        .query(&[
            ("text", query),
            ("size", &limit.to_string()),
            ("from", &from.to_string()),
        ])
        .header("Accept", "application/json")
        .send()
        .await?;

    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(MarketError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(serde_json::from_str(&body)?)
}

/// Fetch package metadata (including the readme when the registry carries it).
pub async fn get_package_details(
    client: &reqwest::Client,
    package_name: &str,
) -> MarketResult<NpmPackageDetails> {
    let url = format!("{}{}", NPM_PACKAGE_INFO, package_name);
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

    Ok(serde_json::from_str(&body)?)
}

/// README content for a package; the registry returns it inline with the
/// package metadata, so this is a thin wrapper.
pub async fn get_package_readme(
    client: &reqwest::Client,
    package_name: &str,
) -> MarketResult<String> {
    let details = get_package_details(client, package_name).await?;
    Ok(details.readme)
}

/// Strip a version specifier from an npm package reference.
/// `pkg@1.0.0` → `pkg`, `@scope/pkg@latest` → `@scope/pkg`.
pub fn extract_package_name_without_version(reference: &str) -> String {
    if let Some(rest) = reference.strip_prefix('@') {
        // Scoped package: @scope/pkg[@version]
        match rest.split_once('@') {
            Some((name, _version)) => format!("@{}", name),
            None => reference.to_string(),
        }
    } else {
        reference
            .split_once('@')
            .map(|(name, _)| name.to_string())
            .unwrap_or_else(|| reference.to_string())
    }
}

/// Map npm search results into the unified shape, marking installed packages
/// and enriching GitHub-hosted ones with a star count.
pub async fn convert_npm_to_search_results(
    client: &reqwest::Client,
    kv: &Kv,
    github_token: Option<&str>,
    result: &NpmSearchResult,
    installed: &HashMap<String, i64>,
) -> Vec<SearchPackageResult> {
    let mut out = Vec::with_capacity(result.objects.len());

    for object in &result.objects {
        let package = &object.package;
        let author = if !package.publisher.username.is_empty() {
            package.publisher.username.clone()
        } else {
            package
                .maintainers
                .first()
                .map(|m| m.username.clone())
                .unwrap_or_default()
        };

        let repository_url = package.links.repository.clone();
        let mut stars = 0;
        if repository_url.contains("github.com") {
            if let Some((owner, repo)) = parse_github_repo(&repository_url) {
                stars = fetch_github_stars(client, kv, github_token, &owner, &repo).await;
            }
        }

        let installed_service_id = installed.get(&package.name).copied();
        let last_updated = OffsetDateTime::parse(&package.date, &Rfc3339)
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_else(|| package.date.clone());

        out.push(SearchPackageResult {
            name: package.name.clone(),
            version: package.version.clone(),
            description: package.description.clone(),
            package_manager: "npm".to_string(),
            source_url: package.links.npm.clone(),
            homepage: package.links.homepage.clone(),
            repository_url,
            license: String::new(),
            icon_url: String::new(),
            github_stars: stars,
            downloads: object.downloads.weekly,
            last_updated,
            keywords: package.keywords.clone(),
            author,
            score: object.score.final_score,
            is_installed: installed_service_id.is_some(),
            installed_service_id,
        });
    }

    out
}
