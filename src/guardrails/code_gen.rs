//! Pattern-based code-generation / dangerous-operation detector (spec.md §4.1).
//!
//! A static `RegexSet` over dangerous-operation patterns, extended with
//! fenced-code-block detection.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::{Regex, RegexSet};
use serde_json::json;
use std::time::Duration;

static FENCED_CODE_BLOCK: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[a-zA-Z]*\n[\s\S]*?```").unwrap());

static DANGEROUS_OPS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\brm\s+-rf\b",
        r"(?i)\bos\.system\s*\(",
        r"(?i)\bsubprocess\.(run|call|Popen)\s*\(",
        r"(?i)\beval\s*\(",
        r"(?i)\bexec\s*\(",
        r"(?i)\bDROP\s+TABLE\b",
        r"(?i)\b__import__\s*\(",
    ])
    .unwrap()
});

pub struct CodeGenGuardrail {
    name: String,
    on_error: OnError,
    block: bool,
}

impl CodeGenGuardrail {
    pub fn new(name: impl Into<String>, block: bool, on_error: OnError) -> Self {
        CodeGenGuardrail {
            name: name.into(),
            on_error,
            block,
        }
    }
}

#[async_trait]
impl Guardrail for CodeGenGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "code_gen"
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
        let has_code_block = FENCED_CODE_BLOCK.is_match(content);
        let dangerous: Vec<usize> = DANGEROUS_OPS.matches(content).into_iter().collect();

        if dangerous.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }

        Decision {
            action: if self.block { Action::Block } else { Action::Warn },
            confidence: if has_code_block { 1.0 } else { 0.7 },
            reason: "detected potentially dangerous code operation".to_string(),
            details: json!({ "dangerous_op_count": dangerous.len(), "in_code_block": has_code_block }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn blocks_dangerous_shell_command() {
        let g = CodeGenGuardrail::new("codegen", true, OnError::Allow);
        let d = g.analyze("run `rm -rf /` to clean up", None).await;
        assert_eq!(d.action, Action::Block);
    }

    #[tokio::test]
    async fn allows_benign_code() {
        let g = CodeGenGuardrail::new("codegen", true, OnError::Allow);
        let d = g.analyze("```python\nprint('hello')\n```", None).await;
        assert_eq!(d.action, Action::Allow);
    }
}
