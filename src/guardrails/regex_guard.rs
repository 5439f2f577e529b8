//! Custom regex-pattern matcher for policy-authored patterns (spec.md §4.1).
//!
//! Patterns are validated at construction, never at `analyze` time (§4.7:
//! bad regex is a `ConfigurationError`, raised at build, not check). The
//! `size_limit` cap guards against pathological compiled-program blowup
//! from untrusted patterns.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::json;
use std::time::Duration;

pub struct RegexGuardrail {
    name: String,
    on_error: OnError,
    patterns: Vec<regex::Regex>,
    block: bool,
}

impl RegexGuardrail {
    pub fn new(name: impl Into<String>, patterns: &[&str], block: bool, on_error: OnError) -> crate::error::Result<Self> {
        let name = name.into();
        let compiled = patterns
            .iter()
            .map(|p| {
                RegexBuilder::new(p)
                    .size_limit(1_000_000)
                    .build()
                    .map_err(|e| crate::error::Error::configuration(name.clone(), "regex", e.to_string()))
            })
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok(RegexGuardrail {
            name,
            on_error,
            patterns: compiled,
            block,
        })
    }
}

#[async_trait]
impl Guardrail for RegexGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "regex"
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
        let matched: Vec<&str> = self
            .patterns
            .iter()
            .filter(|re| re.is_match(content))
            .map(|re| re.as_str())
            .collect();
        if matched.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }
        Decision {
            action: if self.block { Action::Block } else { Action::Warn },
            confidence: 1.0,
            reason: format!("matched {} pattern(s)", matched.len()),
            details: json!({ "patterns": matched }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}
