//! TopicFilter guardrail with `allow`/`deny`/`both` modes (spec.md §4.1, §9).
//!
//! Open Question resolved per spec.md §9: topic extraction is regex-only
//! over the message text (no pluggable extractor capability).

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use serde_json::json;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicMode {
    Allow,
    Deny,
    Both,
}

pub struct TopicFilterGuardrail {
    name: String,
    on_error: OnError,
    mode: TopicMode,
    allowlist: Vec<Regex>,
    denylist: Vec<Regex>,
}

impl TopicFilterGuardrail {
    pub fn new(
        name: impl Into<String>,
        mode: TopicMode,
        allow_topics: &[&str],
        deny_topics: &[&str],
        on_error: OnError,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        let compile = |topics: &[&str]| -> crate::error::Result<Vec<Regex>> {
            topics
                .iter()
                .map(|t| {
                    RegexBuilder::new(&regex::escape(t))
                        .case_insensitive(true)
                        .size_limit(1_000_000)
                        .build()
                        .map_err(|e| crate::error::Error::configuration(name.clone(), "topic", e.to_string()))
                })
                .collect()
        };
        Ok(TopicFilterGuardrail {
            name: name.clone(),
            on_error,
            mode,
            allowlist: compile(allow_topics)?,
            denylist: compile(deny_topics)?,
        })
    }

    /// Same as `new` but topics are treated as regex patterns directly,
    /// rather than literal strings — used when a preset supplies patterns
    /// instead of plain topic words.
    pub fn from_patterns(
        name: impl Into<String>,
        mode: TopicMode,
        allow_patterns: &[&str],
        deny_patterns: &[&str],
        on_error: OnError,
    ) -> crate::error::Result<Self> {
        let name = name.into();
        let compile = |patterns: &[&str]| -> crate::error::Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    RegexBuilder::new(p)
                        .case_insensitive(true)
                        .size_limit(1_000_000)
                        .build()
                        .map_err(|e| crate::error::Error::configuration(name.clone(), "topic", e.to_string()))
                })
                .collect()
        };
        Ok(TopicFilterGuardrail {
            name: name.clone(),
            on_error,
            mode,
            allowlist: compile(allow_patterns)?,
            denylist: compile(deny_patterns)?,
        })
    }
}

#[async_trait]
impl Guardrail for TopicFilterGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "topic_filter"
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
        let denied: Vec<&str> = self
            .denylist
            .iter()
            .filter(|re| re.is_match(content))
            .map(|re| re.as_str())
            .collect();
        let allowed_hit = self.allowlist.iter().any(|re| re.is_match(content));

        let violates = match self.mode {
            TopicMode::Deny => !denied.is_empty(),
            TopicMode::Allow => !self.allowlist.is_empty() && !allowed_hit,
            TopicMode::Both => !denied.is_empty() || (!self.allowlist.is_empty() && !allowed_hit),
        };

        if !violates {
            return Decision::allow(&self.name, self.kind());
        }

        let confidence = if denied.is_empty() { 0.6 } else { 1.0 };
        Decision {
            action: Action::Block,
            confidence,
            reason: if denied.is_empty() {
                "content is outside the allowed topic set".to_string()
            } else {
                format!("content matches denied topic(s): {}", denied.join(", "))
            },
            details: json!({ "denied_matches": denied }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deny_mode_blocks_matched_topic() {
        let g = TopicFilterGuardrail::new("topics", TopicMode::Deny, &[], &["politics"], OnError::Allow).unwrap();
        let d = g.analyze("let's talk about politics today", None).await;
        assert_eq!(d.action, Action::Block);
    }

    #[tokio::test]
    async fn allow_mode_blocks_anything_off_list() {
        let g = TopicFilterGuardrail::new("topics", TopicMode::Allow, &["billing"], &[], OnError::Allow).unwrap();
        let d = g.analyze("tell me about the weather", None).await;
        assert_eq!(d.action, Action::Block);
    }

    #[tokio::test]
    async fn allow_mode_allows_listed_topic() {
        let g = TopicFilterGuardrail::new("topics", TopicMode::Allow, &["billing"], &[], OnError::Allow).unwrap();
        let d = g.analyze("I have a question about billing", None).await;
        assert_eq!(d.action, Action::Allow);
    }
}
