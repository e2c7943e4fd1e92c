//! GitHub star counts for repository-linked packages, memoised in the KV
//! cache for ten minutes.

use std::sync::OnceLock;
use std::time::Duration;

use mcpgate_shared::kv::{github_stars_key, Kv};
use regex::Regex;
use serde::Deserialize;

const GITHUB_API: &str = "https://api.github.com/repos";
const GITHUB_TIMEOUT: Duration = Duration::from_secs(5);
const STARS_MEMO_TTL: Duration = Duration::from_secs(10 * 60);

/// Extract `(owner, repo)` from a GitHub repository URL in any of the common
/// forms (`https://github.com/o/r`, `git+https://…/o/r.git`, `git@github.com:o/r`).
pub fn parse_github_repo(repo_url: &str) -> Option<(String, String)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"github\.com[:/]+([\w.-]+)/([\w.-]+?)(?:\.git)?/?$").expect("valid regex")
    });

    let captures = re.captures(repo_url)?;
    let owner = captures.get(1)?.as_str().to_string();
    let repo = captures.get(2)?.as_str().trim_end_matches(".git").to_string();
    Some((owner, repo))
}

#[derive(Debug, Deserialize)]
struct RepoInfo {
    #[serde(default)]
    stargazers_count: i64,
}

/// Fetch the star count for `owner/repo`, consulting the KV memo first.
/// Failures are logged and reported as zero; star enrichment is best-effort.
pub async fn fetch_github_stars(
    client: &reqwest::Client,
    kv: &Kv,
    token: Option<&str>,
    owner: &str,
    repo: &str,
) -> i64 {
    if owner.is_empty() || repo.is_empty() {
        return 0;
    }

    let cache_key = github_stars_key(owner, repo);
    if let Some(cached) = kv.get(&cache_key) {
        return cached.parse().unwrap_or(0);
    }

    let url = format!("{}/{}/{}", GITHUB_API, owner, repo);
    let mut request = client
        .get(&url)
        .timeout(GITHUB_TIMEOUT)
        .header("User-Agent", "mcpgate")
        .header("Accept", "application/vnd.github+json");
    if let Some(token) = token {
        if !token.is_empty() {
            request = request.header("Authorization", format!("token {}", token));
        }
    }

    let stars = match request.send().await {
        Ok(response) if response.status().is_success() => {
            match response.json::<RepoInfo>().await {
                Ok(info) => info.stargazers_count,
                Err(err) => {
                    tracing::debug!(owner, repo, error = %err, "failed to parse GitHub response");
                    return 0;
                }
            }
        }
        Ok(response) => {
            tracing::debug!(owner, repo, status = %response.status(), "GitHub API error");
            return 0;
        }
        Err(err) => {
            tracing::debug!(owner, repo, error = %err, "GitHub API request failed");
            return 0;
        }
    };

    kv.set(&cache_key, &stars.to_string(), Some(STARS_MEMO_TTL));
    stars
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_https_url() {
        assert_eq!(
            parse_github_repo("https://github.com/acme/widget"),
            Some(("acme".into(), "widget".into()))
        );
    }

    #[test]
    fn test_parse_git_plus_url_with_suffix() {
        assert_eq!(
            parse_github_repo("git+https://github.com/acme/widget.git"),
            Some(("acme".into(), "widget".into()))
        );
    }

    #[test]
    fn test_parse_ssh_style() {
        assert_eq!(
            parse_github_repo("git@github.com:acme/widget.git"),
            Some(("acme".into(), "widget".into()))
        );
    }

    #[test]
    fn test_parse_rejects_non_github() {
        assert_eq!(parse_github_repo("https://gitlab.com/acme/widget"), None);
        assert_eq!(parse_github_repo(""), None);
    }

    #[tokio::test]
    async fn test_stars_use_memo_before_network() {
        let kv = Kv::new();
        kv.set(&github_stars_key("acme", "widget"), "77", None);

        // An unroutable client base proves no network call is made on a hit.
        let client = reqwest::Client::new();
        let stars = fetch_github_stars(&client, &kv, None, "acme", "widget").await;
        assert_eq!(stars, 77);
    }
}
