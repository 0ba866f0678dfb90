//! robots.txt parsing and the per-host policy cache.
//!
//! Group selection follows the de-facto rules: the most specific matching
//! `User-agent` group wins, falling back to `*`. Within a group the longest
//! matching pattern decides, Allow winning length ties. Patterns support
//! `*` wildcards and the `$` end anchor.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq)]
enum RuleKind {
    Allow,
    Disallow,
}

#[derive(Debug, Clone)]
struct Rule {
    kind: RuleKind,
    pattern: String,
}

#[derive(Debug, Clone)]
pub struct RobotsPolicy {
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

impl RobotsPolicy {
    pub fn allow_all() -> Self {
        Self { rules: Vec::new(), crawl_delay: None }
    }

    pub fn deny_all() -> Self {
        Self {
            rules: vec![Rule { kind: RuleKind::Disallow, pattern: "/".to_string() }],
            crawl_delay: None,
        }
    }

    /// Parse the file, keeping only the best group for `user_agent`.
    pub fn parse(content: &str, user_agent: &str) -> Self {
        let ua = user_agent.to_lowercase();
        // (specificity, rules, crawl_delay) of the best group seen so far:
        // specificity 2 = named match, 1 = "*", 0 = none.
        let mut best: (u8, Vec<Rule>, Option<f64>) = (0, Vec::new(), None);
        let mut current_agents: Vec<String> = Vec::new();
        let mut current_rules: Vec<Rule> = Vec::new();
        let mut current_delay: Option<f64> = None;
        let mut in_group_body = false;

        let mut flush = |agents: &[String], rules: &mut Vec<Rule>, delay: &mut Option<f64>,
                         best: &mut (u8, Vec<Rule>, Option<f64>)| {
            let specificity = if agents.iter().any(|a| a != "*" && ua.contains(a.as_str())) {
                2
            } else if agents.iter().any(|a| a == "*") {
                1
            } else {
                0
            };
            if specificity > best.0 {
                *best = (specificity, std::mem::take(rules), delay.take());
            } else {
                rules.clear();
                *delay = None;
            }
        };

        for raw in content.lines() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else { continue };
            let key = key.trim().to_lowercase();
            let value = value.trim();
            match key.as_str() {
                "user-agent" => {
                    if in_group_body {
                        flush(&current_agents, &mut current_rules, &mut current_delay, &mut best);
                        current_agents.clear();
                        in_group_body = false;
                    }
                    current_agents.push(value.to_lowercase());
                }
                "allow" | "disallow" => {
                    in_group_body = true;
                    if value.is_empty() {
                        // "Disallow:" with no value allows everything.
                        continue;
                    }
                    current_rules.push(Rule {
                        kind: if key == "allow" { RuleKind::Allow } else { RuleKind::Disallow },
                        pattern: value.to_string(),
                    });
                }
                "crawl-delay" => {
                    in_group_body = true;
                    current_delay = value.parse::<f64>().ok().filter(|d| *d >= 0.0);
                }
                _ => {
                    in_group_body = true;
                }
            }
        }
        flush(&current_agents, &mut current_rules, &mut current_delay, &mut best);

        Self { rules: best.1, crawl_delay: best.2 }
    }

    pub fn allows(&self, path: &str) -> bool {
        let path = if path.is_empty() { "/" } else { path };
        let mut verdict = true;
        let mut best_len = 0usize;
        for rule in &self.rules {
            if pattern_matches(&rule.pattern, path) {
                let len = rule.pattern.len();
                let wins = len > best_len
                    || (len == best_len && rule.kind == RuleKind::Allow);
                if wins {
                    best_len = len;
                    verdict = rule.kind == RuleKind::Allow;
                }
            }
        }
        verdict
    }

    pub fn crawl_delay(&self) -> Option<Duration> {
        self.crawl_delay.map(Duration::from_secs_f64)
    }
}

/// Prefix match with `*` wildcards and an optional `$` end anchor.
fn pattern_matches(pattern: &str, path: &str) -> bool {
    let (pattern, anchored) = match pattern.strip_suffix('$') {
        Some(p) => (p, true),
        None => (pattern, false),
    };
    let parts: Vec<&str> = pattern.split('*').collect();
    let mut pos = 0usize;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !path[pos..].starts_with(part) {
                return false;
            }
            pos += part.len();
        } else {
            match path[pos..].find(part) {
                Some(found) => pos += found + part.len(),
                None => return false,
            }
        }
    }
    if anchored {
        // The final literal must reach the end of the path.
        if parts.last().map_or(true, |p| !p.is_empty()) {
            return pos == path.len();
        }
    }
    true
}

#[derive(Debug, Clone)]
pub struct CachedRobots {
    pub policy: Arc<RobotsPolicy>,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
}

impl CachedRobots {
    pub fn fresh(&self, now: DateTime<Utc>) -> bool {
        (now - self.fetched_at).to_std().map(|age| age < self.ttl).unwrap_or(false)
    }
}

/// Per-host robots snapshots. In-process; the TTLs are short enough that
/// workers converging on slightly different snapshots is acceptable.
#[derive(Clone, Default)]
pub struct RobotsCache {
    inner: Arc<RwLock<HashMap<String, CachedRobots>>>,
}

impl RobotsCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, host: &str) -> Option<CachedRobots> {
        let map = self.inner.read().await;
        map.get(host).filter(|c| c.fresh(Utc::now())).cloned()
    }

    pub async fn put(&self, host: &str, policy: RobotsPolicy, ttl: Duration) -> Arc<RobotsPolicy> {
        let policy = Arc::new(policy);
        let mut map = self.inner.write().await;
        map.insert(
            host.to_string(),
            CachedRobots { policy: policy.clone(), fetched_at: Utc::now(), ttl },
        );
        policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const UA: &str = "leadlift-bot/1.0";

    #[test]
    fn disallow_blocks_prefix() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow: /team/\n", UA);
        assert!(!policy.allows("/team/jane"));
        assert!(policy.allows("/about"));
        assert!(policy.allows("/"));
    }

    #[test]
    fn allow_overrides_longer_disallow_on_tie() {
        let policy = RobotsPolicy::parse(
            "User-agent: *\nDisallow: /private/\nAllow: /private/team\n",
            UA,
        );
        assert!(policy.allows("/private/team"));
        assert!(!policy.allows("/private/else"));
    }

    #[test]
    fn named_group_wins_over_star() {
        let policy = RobotsPolicy::parse(
            "User-agent: *\nDisallow: /\n\nUser-agent: leadlift-bot\nDisallow: /secret/\n",
            UA,
        );
        assert!(policy.allows("/team"));
        assert!(!policy.allows("/secret/page"));
    }

    #[test]
    fn crawl_delay_parsed_for_matching_group() {
        let policy = RobotsPolicy::parse("User-agent: *\nCrawl-delay: 7\nDisallow: /x\n", UA);
        assert_eq!(policy.crawl_delay(), Some(Duration::from_secs(7)));
    }

    #[test]
    fn empty_disallow_allows_everything() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow:\n", UA);
        assert!(policy.allows("/anything"));
    }

    #[test]
    fn wildcards_and_anchors() {
        let policy = RobotsPolicy::parse("User-agent: *\nDisallow: /*.pdf$\n", UA);
        assert!(!policy.allows("/files/report.pdf"));
        assert!(policy.allows("/files/report.pdfx"));
        assert!(policy.allows("/files/report.html"));
    }

    #[test]
    fn deny_all_and_allow_all() {
        assert!(!RobotsPolicy::deny_all().allows("/"));
        assert!(RobotsPolicy::allow_all().allows("/anything"));
    }
}
