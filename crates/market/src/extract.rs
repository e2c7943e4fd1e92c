//! README mining: `mcpServers` config extraction and env-var discovery.

use std::collections::{BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// One server entry inside an `mcpServers` block.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpServerConfig {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// A parsed `{"mcpServers": {...}}` snippet from a README or package config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct McpConfig {
    #[serde(rename = "mcpServers")]
    pub mcp_servers: HashMap<String, McpServerConfig>,
}

/// Find an MCP config in a README; falls back to `None` when nothing parses.
pub fn extract_mcp_config(readme: &str) -> Option<McpConfig> {
    for block in find_json_blocks(readme, "mcpServers") {
        let candidate = if block.trim_start().starts_with('{') {
            block
        } else {
            format!("{{{}}}", block)
        };
        if let Ok(config) = serde_json::from_str::<McpConfig>(&candidate) {
            if !config.mcp_servers.is_empty() {
                return Some(config);
            }
        }
    }
    None
}

/// Scan for the enclosing balanced-brace JSON block around each occurrence of
/// `"<key>"`. Works line-wise the way READMEs embed fenced config examples.
fn find_json_blocks(text: &str, key: &str) -> Vec<String> {
    let mut results = Vec::new();
    let lines: Vec<&str> = text.lines().collect();
    let quoted = format!("\"{}\"", key);
    let single_quoted = format!("'{}'", key);

    for (i, line) in lines.iter().enumerate() {
        if !line.contains(&quoted) && !line.contains(&single_quoted) {
            continue;
        }

        // Walk back a few lines to include the opening brace.
        let mut start = i;
        for j in (i.saturating_sub(4)..=i).rev() {
            if lines[j].contains('{') {
                start = j;
                break;
            }
        }

        let mut depth = 0i32;
        let mut block = String::new();
        'outer: for (j, line) in lines.iter().enumerate().skip(start).take(50) {
            block.push_str(line);
            block.push('\n');
            for c in line.chars() {
                match c {
                    '{' => depth += 1,
                    '}' => {
                        depth -= 1;
                        if depth <= 0 && j > i {
                            results.push(block.clone());
                            break 'outer;
                        }
                    }
                    _ => {}
                }
            }
            if depth <= 0 && j > i {
                break;
            }
        }
    }

    results
}

/// Extract environment variable names from an MCP config: explicit `env` keys
/// first, then inference from the command line when no `env` block exists.
pub fn get_env_vars_from_mcp_config(config: &McpConfig) -> Vec<String> {
    let mut vars = BTreeSet::new();

    for server in config.mcp_servers.values() {
        for name in server.env.keys() {
            vars.insert(name.clone());
        }

        if !server.env.is_empty() {
            continue;
        }

        // URL-style API keys embedded in the command, e.g. `?tavilyApiKey=…`.
        static API_KEY_RE: OnceLock<Regex> = OnceLock::new();
        let re = API_KEY_RE.get_or_init(|| Regex::new(r"(\w+[Aa]pi[Kk]ey)=").expect("valid regex"));
        for captures in re.captures_iter(&server.command) {
            let snake = camel_to_upper_snake(&captures[1]);
            if is_env_var_name(&snake) {
                vars.insert(snake);
            }
        }

        // Infer from the package the command launches.
        if let Some(package) = launched_package(server) {
            for inferred in infer_env_vars_from_package_name(&package) {
                vars.insert(inferred);
            }
        }
    }

    vars.into_iter().collect()
}

/// Package name launched by an `npx`-style server entry, version stripped.
fn launched_package(server: &McpServerConfig) -> Option<String> {
    let mut package = None;

    if server.command == "npx" && !server.args.is_empty() {
        for (i, arg) in server.args.iter().enumerate() {
            if arg == "-y" && i + 1 < server.args.len() {
                package = Some(server.args[i + 1].clone());
                break;
            }
        }
        if package.is_none() {
            package = server.args.last().cloned();
        }
    } else if server.command.contains("npx") {
        let parts: Vec<&str> = server.command.split_whitespace().collect();
        if let Some(pos) = parts.iter().position(|p| *p == "npx") {
            let mut next = pos + 1;
            if parts.get(next) == Some(&"-y") {
                next += 1;
            }
            if let Some(candidate) = parts.get(next) {
                if !candidate.contains("http") {
                    package = Some(candidate.to_string());
                }
            }
        }
    }

    package.map(|p| p.split('@').next().unwrap_or("").to_string()).filter(|p| !p.is_empty())
}

/// Scan a README for likely environment variables: `process.env.X` references
/// and `ENV_VAR=value` assignment lines near env-flavored text.
pub fn guess_env_vars_from_readme(readme: &str) -> Vec<String> {
    let mut vars = Vec::new();

    for line in readme.lines() {
        for (idx, _) in line.match_indices("process.env.") {
            let tail = &line[idx + "process.env.".len()..];
            let name: String = tail
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if !name.is_empty() && name.len() < 50 && !vars.contains(&name) {
                vars.push(name);
            }
        }

        let env_flavored =
            line.contains("env") || line.contains("ENV") || line.contains("environment");
        if env_flavored && line.contains('=') {
            if let Some((lhs, _)) = line.split_once('=') {
                let name = lhs.trim().to_string();
                if is_env_var_name(&name) && !vars.contains(&name) {
                    vars.push(name);
                }
            }
        }
    }

    vars
}

/// Env var names are upper-snake: at least one capital and over 80% of the
/// characters drawn from `[A-Z0-9_]`.
fn is_env_var_name(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let mut upper = 0usize;
    let mut valid = 0usize;
    for c in s.chars() {
        if c.is_ascii_uppercase() || c == '_' || c.is_ascii_digit() {
            valid += 1;
            if c.is_ascii_uppercase() {
                upper += 1;
            }
        }
    }
    upper > 0 && (valid as f64) / (s.chars().count() as f64) > 0.8
}

/// `tavilyApiKey` → `TAVILY_API_KEY`.
fn camel_to_upper_snake(camel: &str) -> String {
    let mut out = String::with_capacity(camel.len() + 4);
    for (i, c) in camel.chars().enumerate() {
        if c.is_ascii_uppercase() && i > 0 {
            out.push('_');
        }
        out.push(c);
    }
    out.to_uppercase()
}

/// Well-known packages whose env vars cannot be discovered from config blocks.
fn builtin_package_env_table() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        ("tavily-mcp", &["TAVILY_API_KEY"]),
        ("firecrawl-mcp", &["FIRECRAWL_API_KEY"]),
        ("openai-mcp", &["OPENAI_API_KEY"]),
        ("anthropic-mcp", &["ANTHROPIC_API_KEY"]),
        ("slack-mcp", &["SLACK_TOKEN", "SLACK_BOT_TOKEN"]),
        ("github-mcp", &["GITHUB_TOKEN", "GITHUB_ACCESS_TOKEN"]),
        ("gitlab-mcp", &["GITLAB_TOKEN", "GITLAB_ACCESS_TOKEN"]),
        ("notion-mcp", &["NOTION_API_KEY", "NOTION_TOKEN"]),
        ("airtable-mcp", &["AIRTABLE_API_KEY"]),
        ("linear-mcp", &["LINEAR_API_KEY"]),
        ("jira-mcp", &["JIRA_API_TOKEN", "JIRA_EMAIL"]),
        ("stripe-mcp", &["STRIPE_API_KEY"]),
        ("aws-mcp", &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]),
        ("discord-mcp", &["DISCORD_TOKEN"]),
        ("telegram-mcp", &["TELEGRAM_BOT_TOKEN"]),
        ("sendgrid-mcp", &["SENDGRID_API_KEY"]),
        ("twilio-mcp", &["TWILIO_ACCOUNT_SID", "TWILIO_AUTH_TOKEN"]),
        ("supabase-mcp", &["SUPABASE_URL", "SUPABASE_KEY"]),
        ("mongodb-mcp", &["MONGODB_URI", "MONGODB_CONNECTION_STRING"]),
        ("postgresql-mcp", &["POSTGRES_URL", "POSTGRES_CONNECTION_STRING"]),
        ("redis-mcp", &["REDIS_URL", "REDIS_CONNECTION_STRING"]),
        ("elasticsearch-mcp", &["ELASTICSEARCH_URL", "ELASTICSEARCH_API_KEY"]),
        ("cloudflare-mcp", &["CLOUDFLARE_API_TOKEN"]),
        ("vercel-mcp", &["VERCEL_TOKEN"]),
        ("netlify-mcp", &["NETLIFY_ACCESS_TOKEN"]),
        ("heroku-mcp", &["HEROKU_API_KEY"]),
    ]
}

/// Substring fallbacks when the exact package name is not in the table.
fn builtin_substring_env_table() -> &'static [(&'static str, &'static [&'static str])] {
    &[
        ("tavily", &["TAVILY_API_KEY"]),
        ("firecrawl", &["FIRECRAWL_API_KEY"]),
        ("openai", &["OPENAI_API_KEY"]),
        ("anthropic", &["ANTHROPIC_API_KEY"]),
        ("github", &["GITHUB_TOKEN"]),
        ("gitlab", &["GITLAB_TOKEN"]),
        ("notion", &["NOTION_API_KEY"]),
        ("slack", &["SLACK_TOKEN"]),
        ("discord", &["DISCORD_TOKEN"]),
        ("telegram", &["TELEGRAM_BOT_TOKEN"]),
        ("stripe", &["STRIPE_API_KEY"]),
        ("aws", &["AWS_ACCESS_KEY_ID", "AWS_SECRET_ACCESS_KEY"]),
        ("google", &["GOOGLE_API_KEY"]),
    ]
}

/// Canonical env vars for a package name, via the built-in tables.
pub fn infer_env_vars_from_package_name(package_name: &str) -> Vec<String> {
    let mut vars = BTreeSet::new();

    for (name, envs) in builtin_package_env_table() {
        if *name == package_name {
            vars.extend(envs.iter().map(|s| s.to_string()));
        }
    }
    for (fragment, envs) in builtin_substring_env_table() {
        if package_name.contains(fragment) {
            vars.extend(envs.iter().map(|s| s.to_string()));
        }
    }

    vars.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const README_WITH_CONFIG: &str = r#"
# example-mcp

Add this to your client config:

```json
{
  "mcpServers": {
    "example": {
      "command": "npx",
      "args": ["-y", "example-mcp"],
      "env": {
        "EXAMPLE_API_KEY": "your-key-here"
      }
    }
  }
}
```
"#;

    #[test]
    fn test_extract_config_from_fenced_block() {
        let config = extract_mcp_config(README_WITH_CONFIG).expect("config found");
        let server = config.mcp_servers.get("example").expect("server entry");
        assert_eq!(server.command, "npx");
        assert_eq!(server.args, vec!["-y", "example-mcp"]);
        assert!(server.env.contains_key("EXAMPLE_API_KEY"));
    }

    #[test]
    fn test_extract_config_absent() {
        assert!(extract_mcp_config("# plain readme, no config").is_none());
    }

    #[test]
    fn test_env_vars_prefer_explicit_env_block() {
        let config = extract_mcp_config(README_WITH_CONFIG).unwrap();
        assert_eq!(get_env_vars_from_mcp_config(&config), vec!["EXAMPLE_API_KEY"]);
    }

    #[test]
    fn test_env_vars_inferred_from_command_api_key() {
        let mut config = McpConfig::default();
        config.mcp_servers.insert(
            "t".into(),
            McpServerConfig {
                command: "https://mcp.example.com/sse?tavilyApiKey=abc".into(),
                args: vec![],
                env: HashMap::new(),
            },
        );
        let vars = get_env_vars_from_mcp_config(&config);
        assert!(vars.contains(&"TAVILY_API_KEY".to_string()));
    }

    #[test]
    fn test_env_vars_inferred_from_npx_package() {
        let mut config = McpConfig::default();
        config.mcp_servers.insert(
            "g".into(),
            McpServerConfig {
                command: "npx".into(),
                args: vec!["-y".into(), "github-mcp@1.0.0".into()],
                env: HashMap::new(),
            },
        );
        let vars = get_env_vars_from_mcp_config(&config);
        assert!(vars.contains(&"GITHUB_TOKEN".to_string()));
    }

    #[test]
    fn test_guess_from_process_env() {
        let readme = "Set process.env.MY_TOKEN before starting.";
        assert_eq!(guess_env_vars_from_readme(readme), vec!["MY_TOKEN"]);
    }

    #[test]
    fn test_guess_from_assignment_lines() {
        let readme = "export env var:\nAPI_KEY=sk-123 environment setup";
        let vars = guess_env_vars_from_readme(readme);
        assert!(vars.contains(&"API_KEY".to_string()));
    }

    #[test]
    fn test_guess_ignores_lowercase_assignments() {
        let readme = "environment: foo=bar";
        assert!(guess_env_vars_from_readme(readme).is_empty());
    }

    #[test]
    fn test_camel_to_upper_snake() {
        assert_eq!(camel_to_upper_snake("tavilyApiKey"), "TAVILY_API_KEY");
        assert_eq!(camel_to_upper_snake("ApiKey"), "API_KEY");
    }

    #[test]
    fn test_is_env_var_name() {
        assert!(is_env_var_name("MY_TOKEN"));
        assert!(is_env_var_name("API_KEY_2"));
        assert!(!is_env_var_name("my_token"));
        assert!(!is_env_var_name(""));
        assert!(!is_env_var_name("mostly lowercase TEXT"));
    }

    #[test]
    fn test_builtin_table_lookup() {
        assert_eq!(
            infer_env_vars_from_package_name("linear-mcp"),
            vec!["LINEAR_API_KEY"]
        );
        let aws = infer_env_vars_from_package_name("aws-mcp");
        assert!(aws.contains(&"AWS_ACCESS_KEY_ID".to_string()));
        assert!(aws.contains(&"AWS_SECRET_ACCESS_KEY".to_string()));
        assert!(infer_env_vars_from_package_name("totally-unknown").is_empty());
    }
}
