//! External catalog discovery.
//!
//! Queries up to three upstream registries in parallel, each bounded
//! to 8 s, deduplicates by normalized name, prefers installable
//! entries, and ranks by popularity. Discovery is best effort:
//! per-source failures are swallowed.

use std::collections::HashMap;
use std::time::Duration;

use futures::join;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

/// Per-source time budget.
pub const SOURCE_TIMEOUT: Duration = Duration::from_secs(8);
/// Default result cap.
pub const DEFAULT_LIMIT: usize = 10;

/// One ranked discovery result.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CatalogEntry {
    /// Display name from the upstream catalog.
    pub name: String,
    /// Short description.
    pub description: String,
    /// Installable package identifier, when the source carries one.
    pub install: Option<String>,
    /// Popularity score (downloads or upstream rank), higher is better.
    pub popularity: u64,
    /// Which upstream produced the entry.
    pub source: &'static str,
}

/// Query the upstream catalogs and return at most `limit` ranked
/// entries. Network failure anywhere yields fewer (possibly zero)
/// results, never an error.
pub async fn discover(query: &str, limit: Option<usize>) -> Vec<CatalogEntry> {
    let limit = limit.unwrap_or(DEFAULT_LIMIT);
    let client = match reqwest::Client::builder().timeout(SOURCE_TIMEOUT).build() {
        Ok(client) => client,
        Err(_) => return Vec::new(),
    };

    let (npm, pulse, smithery) = join!(
        search_npm(&client, query),
        search_pulse(&client, query),
        search_smithery(&client, query),
    );

    let mut all = npm;
    all.extend(pulse);
    all.extend(smithery);
    rank(all, limit)
}

/// Dedupe by normalized name, prefer installable entries, sort by
/// installability then popularity descending, truncate.
#[must_use]
pub fn rank(entries: Vec<CatalogEntry>, limit: usize) -> Vec<CatalogEntry> {
    let mut best: HashMap<String, CatalogEntry> = HashMap::new();
    for entry in entries {
        let key = normalize_name(&entry.name);
        match best.get(&key) {
            Some(existing) if !prefer(&entry, existing) => {}
            _ => {
                let _ = best.insert(key, entry);
            }
        }
    }

    let mut ranked: Vec<CatalogEntry> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.install
            .is_some()
            .cmp(&a.install.is_some())
            .then(b.popularity.cmp(&a.popularity))
            .then(a.name.cmp(&b.name))
    });
    ranked.truncate(limit);
    ranked
}

fn prefer(candidate: &CatalogEntry, incumbent: &CatalogEntry) -> bool {
    match (candidate.install.is_some(), incumbent.install.is_some()) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.popularity > incumbent.popularity,
    }
}

/// Normalize for dedupe: strip `@scope/`, strip worker-prefix
/// boilerplate, lowercase, drop non-alphanumerics.
#[must_use]
pub fn normalize_name(name: &str) -> String {
    let mut rest = name.trim();
    if rest.starts_with('@') {
        if let Some((_, tail)) = rest.split_once('/') {
            rest = tail;
        }
    }
    let lower = rest.to_lowercase();
    let stripped = ["mcp-server-", "server-", "mcp-"]
        .iter()
        .find_map(|prefix| lower.strip_prefix(prefix))
        .unwrap_or(&lower);
    stripped
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Upstream sources
// ─────────────────────────────────────────────────────────────────────────────

async fn fetch_json(client: &reqwest::Client, url: &str) -> Option<Value> {
    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        debug!(url, status = %resp.status(), "catalog source rejected query");
        return None;
    }
    resp.json().await.ok()
}

async fn search_npm(client: &reqwest::Client, query: &str) -> Vec<CatalogEntry> {
    let url = format!(
        "https://registry.npmjs.org/-/v1/search?text={}&size=25",
        urlencode(&format!("mcp {query}"))
    );
    let Some(body) = fetch_json(client, &url).await else {
        return Vec::new();
    };
    body["objects"]
        .as_array()
        .map(|objects| {
            objects
                .iter()
                .filter_map(|obj| {
                    let package = obj.get("package")?;
                    let name = package["name"].as_str()?.to_owned();
                    Some(CatalogEntry {
                        install: Some(name.clone()),
                        description: package["description"].as_str().unwrap_or("").to_owned(),
                        popularity: obj["downloads"]["monthly"].as_u64().unwrap_or(0),
                        name,
                        source: "npm",
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn search_pulse(client: &reqwest::Client, query: &str) -> Vec<CatalogEntry> {
    let url = format!(
        "https://api.pulsemcp.com/v0beta/servers?query={}&count_per_page=25",
        urlencode(query)
    );
    let Some(body) = fetch_json(client, &url).await else {
        return Vec::new();
    };
    body["servers"]
        .as_array()
        .map(|servers| {
            servers
                .iter()
                .filter_map(|server| {
                    Some(CatalogEntry {
                        name: server["name"].as_str()?.to_owned(),
                        description: server["short_description"].as_str().unwrap_or("").to_owned(),
                        install: server["package_name"].as_str().map(str::to_owned),
                        popularity: server["github_stars"].as_u64().unwrap_or(0),
                        source: "pulsemcp",
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

async fn search_smithery(client: &reqwest::Client, query: &str) -> Vec<CatalogEntry> {
    let url = format!(
        "https://registry.smithery.ai/servers?q={}&pageSize=25",
        urlencode(query)
    );
    let Some(body) = fetch_json(client, &url).await else {
        return Vec::new();
    };
    body["servers"]
        .as_array()
        .map(|servers| {
            servers
                .iter()
                .filter_map(|server| {
                    let qualified = server["qualifiedName"].as_str()?.to_owned();
                    Some(CatalogEntry {
                        name: qualified.clone(),
                        description: server["description"].as_str().unwrap_or("").to_owned(),
                        install: Some(qualified),
                        popularity: server["useCount"].as_u64().unwrap_or(0),
                        source: "smithery",
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn urlencode(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            'A'..='Z' | 'a'..='z' | '0'..='9' | '-' | '_' | '.' | '~' => c.to_string(),
            ' ' => "+".to_owned(),
            other => {
                let mut buf = [0u8; 4];
                other
                    .encode_utf8(&mut buf)
                    .bytes()
                    .map(|b| format!("%{b:02X}"))
                    .collect()
            }
        })
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, install: Option<&str>, popularity: u64) -> CatalogEntry {
        CatalogEntry {
            name: name.into(),
            description: String::new(),
            install: install.map(Into::into),
            popularity,
            source: "npm",
        }
    }

    #[test]
    fn normalize_strips_scope_and_prefixes() {
        assert_eq!(normalize_name("@modelcontextprotocol/server-fetch"), "fetch");
        assert_eq!(normalize_name("mcp-server-fetch"), "fetch");
        assert_eq!(normalize_name("Fetch"), "fetch");
        assert_eq!(normalize_name("mcp-git"), "git");
        assert_eq!(normalize_name("my_server!"), "myserver");
    }

    #[test]
    fn normalized_duplicates_collapse() {
        let ranked = rank(
            vec![
                entry("@scope/server-fetch", Some("@scope/server-fetch"), 10),
                entry("mcp-server-fetch", Some("mcp-server-fetch"), 500),
                entry("Fetch", None, 9999),
            ],
            10,
        );
        assert_eq!(ranked.len(), 1);
        // Installable beats bare popularity; higher-download install wins.
        assert_eq!(ranked[0].name, "mcp-server-fetch");
    }

    #[test]
    fn installable_sorts_before_popular() {
        let ranked = rank(
            vec![
                entry("famous", None, 1_000_000),
                entry("obscure", Some("obscure"), 3),
            ],
            10,
        );
        assert_eq!(ranked[0].name, "obscure");
        assert_eq!(ranked[1].name, "famous");
    }

    #[test]
    fn popularity_orders_within_installable() {
        let ranked = rank(
            vec![
                entry("low", Some("low"), 10),
                entry("high", Some("high"), 1000),
            ],
            10,
        );
        assert_eq!(ranked[0].name, "high");
    }

    #[test]
    fn limit_truncates() {
        let entries = (0..20)
            .map(|i| entry(&format!("pkg{i}"), Some("x"), i))
            .collect();
        assert_eq!(rank(entries, 5).len(), 5);
    }

    #[test]
    fn urlencode_basics() {
        assert_eq!(urlencode("web search"), "web+search");
        assert_eq!(urlencode("a/b"), "a%2Fb");
        assert_eq!(urlencode("plain-name_1.0~x"), "plain-name_1.0~x");
    }

    #[tokio::test]
    async fn rank_is_deterministic_on_ties() {
        let a = rank(
            vec![entry("b", Some("b"), 5), entry("a", Some("a"), 5)],
            10,
        );
        assert_eq!(a[0].name, "a");
    }
}
