//! Min/max character length guard (spec.md §4.1).

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Decision, OnError};
use async_trait::async_trait;
use serde_json::json;
use std::time::Duration;

pub struct LengthGuardrail {
    name: String,
    on_error: OnError,
    min_chars: Option<usize>,
    max_chars: Option<usize>,
}

impl LengthGuardrail {
    pub fn new(name: impl Into<String>, min_chars: Option<usize>, max_chars: Option<usize>, on_error: OnError) -> Self {
        LengthGuardrail {
            name: name.into(),
            on_error,
            min_chars,
            max_chars,
        }
    }
}

#[async_trait]
impl Guardrail for LengthGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "length"
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
        let len = content.chars().count();
        if let Some(min) = self.min_chars {
            if len < min {
                return Decision {
                    action: crate::decision::Action::Block,
                    confidence: 1.0,
                    reason: format!("content too short: {len} chars, minimum {min}"),
                    details: json!({ "length": len, "min_chars": min }),
                    guardrail_name: self.name.clone(),
                    guardrail_kind: self.kind().to_string(),
                };
            }
        }
        if let Some(max) = self.max_chars {
            if len > max {
                return Decision {
                    action: crate::decision::Action::Block,
                    confidence: 1.0,
                    reason: format!("content too long: {len} chars, maximum {max}"),
                    details: json!({ "length": len, "max_chars": max }),
                    guardrail_name: self.name.clone(),
                    guardrail_kind: self.kind().to_string(),
                };
            }
        }
        Decision::allow(&self.name, self.kind())
    }
}
