//! URL / file-type allow/deny-list guard (spec.md §4.1).
//!
//! URL extraction and glob matching use a simple backtracking matcher
//! over domains and extensions, rather than pulling in a dedicated glob
//! crate for a handful of patterns.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;
use std::time::Duration;

static URL_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"https?://[^\s)>\]]+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListMode {
    Allow,
    Deny,
}

pub struct UrlFilterGuardrail {
    name: String,
    on_error: OnError,
    mode: ListMode,
    domains: Vec<String>,
    extensions: Vec<String>,
}

impl UrlFilterGuardrail {
    pub fn new(
        name: impl Into<String>,
        mode: ListMode,
        domains: Vec<String>,
        extensions: Vec<String>,
        on_error: OnError,
    ) -> Self {
        UrlFilterGuardrail {
            name: name.into(),
            on_error,
            mode,
            domains,
            extensions,
        }
    }

    fn host_of(url: &str) -> Option<String> {
        let without_scheme = url.split("://").nth(1)?;
        let host = without_scheme.split(['/', '?', '#']).next()?;
        Some(host.to_lowercase())
    }

    fn matches_domain(&self, host: &str) -> bool {
        self.domains.iter().any(|d| glob_match(&d.to_lowercase(), host))
    }

    fn matches_extension(&self, url: &str) -> bool {
        self.extensions
            .iter()
            .any(|ext| url.to_lowercase().ends_with(&ext.to_lowercase()))
    }
}

/// `*` matches any run of characters; everything else is literal.
fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match (p.first(), t.first()) {
            (None, None) => true,
            (Some(b'*'), _) => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            (Some(pc), Some(tc)) if pc == tc => rec(&p[1..], &t[1..]),
            _ => false,
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

#[async_trait]
impl Guardrail for UrlFilterGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "url_filter"
    }

    fn enabled(&self) -> bool {
        true
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn analyze(&self, content: &str, _conversation: Option<&Conversation>) -> Decision {
        let urls: Vec<&str> = URL_RE.find_iter(content).map(|m| m.as_str()).collect();
        if urls.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }

        let mut flagged = Vec::new();
        for url in &urls {
            let host = Self::host_of(url).unwrap_or_default();
            let listed = self.matches_domain(&host) || self.matches_extension(url);
            let violates = match self.mode {
                ListMode::Deny => listed,
                ListMode::Allow => !listed,
            };
            if violates {
                flagged.push(*url);
            }
        }

        if flagged.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }

        Decision {
            action: Action::Block,
            confidence: 1.0,
            reason: format!("disallowed URL(s): {}", flagged.join(", ")),
            details: json!({ "urls": flagged }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denylist_blocks_listed_domain() {
        let g = UrlFilterGuardrail::new(
            "urls",
            ListMode::Deny,
            vec!["*.evil.example".to_string()],
            vec![],
            OnError::Allow,
        );
        let d = g.analyze("check http://sub.evil.example/path", None).await;
        assert_eq!(d.action, Action::Block);
    }

    #[tokio::test]
    async fn allowlist_blocks_anything_not_listed() {
        let g = UrlFilterGuardrail::new(
            "urls",
            ListMode::Allow,
            vec!["trusted.example".to_string()],
            vec![],
            OnError::Allow,
        );
        let d = g.analyze("see http://random.example/page", None).await;
        assert_eq!(d.action, Action::Block);
    }

    #[tokio::test]
    async fn no_urls_allows() {
        let g = UrlFilterGuardrail::new("urls", ListMode::Deny, vec![], vec![], OnError::Allow);
        let d = g.analyze("no links here", None).await;
        assert_eq!(d.action, Action::Allow);
    }
}
