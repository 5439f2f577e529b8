//! Keyword/phrase list matcher (spec.md §4.1).

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Decision, OnError};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub struct KeywordGuardrail {
    name: String,
    enabled: bool,
    on_error: OnError,
    keywords: Vec<String>,
    case_sensitive: bool,
    block: bool,
}

impl KeywordGuardrail {
    pub fn new(
        name: impl Into<String>,
        keywords: Vec<String>,
        case_sensitive: bool,
        block: bool,
        on_error: OnError,
    ) -> Self {
        KeywordGuardrail {
            name: name.into(),
            enabled: true,
            on_error,
            keywords,
            case_sensitive,
            block,
        }
    }

    /// Loads a newline-separated keyword list from disk. One keyword or
    /// phrase per line; blank lines and lines starting with `#` are skipped.
    pub fn from_file(
        name: impl Into<String>,
        path: &str,
        case_sensitive: bool,
        block: bool,
        on_error: OnError,
    ) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            crate::error::Error::configuration(name_preview(path), "keyword_list", e.to_string())
        })?;
        let keywords = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect();
        Ok(KeywordGuardrail::new(name, keywords, case_sensitive, block, on_error))
    }

    fn matches(&self, content: &str) -> Vec<&str> {
        let haystack = if self.case_sensitive {
            content.to_string()
        } else {
            content.to_lowercase()
        };
        self.keywords
            .iter()
            .filter(|kw| {
                let needle = if self.case_sensitive {
                    kw.to_string()
                } else {
                    kw.to_lowercase()
                };
                haystack.contains(&needle)
            })
            .map(|s| s.as_str())
            .collect()
    }
}

fn name_preview(path: &str) -> String {
    format!("keyword_list:{path}")
}

#[async_trait]
impl Guardrail for KeywordGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "keyword"
    }

    fn enabled(&self) -> bool {
        self.enabled
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(10)
    }

    fn on_error(&self) -> OnError {
        self.on_error
    }

    async fn analyze(&self, content: &str, _conversation: Option<&Conversation>) -> Decision {
        let hits = self.matches(content);
        if hits.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }
        Decision {
            action: if self.block {
                crate::decision::Action::Block
            } else {
                crate::decision::Action::Warn
            },
            confidence: 1.0,
            reason: format!("matched keyword(s): {}", hits.join(", ")),
            details: json!({ "matches": hits }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_on_keyword_hit() {
        let g = KeywordGuardrail::new(
            "profanity",
            vec!["badword".to_string()],
            false,
            true,
            OnError::Allow,
        );
        let d = g.analyze("this has a BadWord in it", None).await;
        assert_eq!(d.action, crate::decision::Action::Block);
    }

    #[tokio::test]
    async fn allows_clean_content() {
        let g = KeywordGuardrail::new("profanity", vec!["badword".to_string()], false, true, OnError::Allow);
        let d = g.analyze("perfectly fine text", None).await;
        assert_eq!(d.action, crate::decision::Action::Allow);
    }

    #[tokio::test]
    async fn case_sensitive_mode_requires_exact_case() {
        let g = KeywordGuardrail::new("profanity", vec!["BadWord".to_string()], true, true, OnError::Allow);
        let d = g.analyze("this has a badword in it", None).await;
        assert_eq!(d.action, crate::decision::Action::Allow);
    }
}
