//! Pattern-based toxicity detector (spec.md §4.1).
//!
//! Confidence is match density: fraction of configured category groups
//! that fired.

use super::Guardrail;
use crate::conversation::Conversation;
use crate::decision::{Action, Decision, OnError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::RegexSet;
use serde_json::json;
use std::time::Duration;

static INSULT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\byou'?re (an?\s+)?(idiot|moron|stupid|worthless)\b",
        r"(?i)\bshut up\b",
    ])
    .unwrap()
});

static THREAT_PATTERNS: Lazy<RegexSet> = Lazy::new(|| {
    RegexSet::new([
        r"(?i)\bi will (kill|hurt|destroy) you\b",
        r"(?i)\byou('| a)?re dead\b",
    ])
    .unwrap()
});

static HATE_PATTERNS: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new([r"(?i)\ball [a-z]+ (people )?(are|should)\b"]).unwrap());

const GROUPS: &[(&str, &Lazy<RegexSet>)] = &[
    ("insult", &INSULT_PATTERNS),
    ("threat", &THREAT_PATTERNS),
    ("hate", &HATE_PATTERNS),
];

pub struct ToxicityGuardrail {
    name: String,
    on_error: OnError,
    warn_threshold: f32,
    block_threshold: f32,
}

impl ToxicityGuardrail {
    pub fn new(name: impl Into<String>, warn_threshold: f32, block_threshold: f32, on_error: OnError) -> Self {
        ToxicityGuardrail {
            name: name.into(),
            on_error,
            warn_threshold,
            block_threshold,
        }
    }
}

#[async_trait]
impl Guardrail for ToxicityGuardrail {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &str {
        "toxicity"
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
        let hit_groups: Vec<&str> = GROUPS
            .iter()
            .filter(|(_, set)| set.is_match(content))
            .map(|(name, _)| *name)
            .collect();
        let confidence = hit_groups.len() as f32 / GROUPS.len() as f32;

        if hit_groups.is_empty() {
            return Decision::allow(&self.name, self.kind());
        }

        let action = if confidence >= self.block_threshold {
            Action::Block
        } else if confidence >= self.warn_threshold {
            Action::Warn
        } else {
            Action::Allow
        };

        if action == Action::Allow {
            return Decision::allow(&self.name, self.kind());
        }

        Decision {
            action,
            confidence,
            reason: format!("toxicity signals: {}", hit_groups.join(", ")),
            details: json!({ "categories": hit_groups, "confidence": confidence }),
            guardrail_name: self.name.clone(),
            guardrail_kind: self.kind().to_string(),
        }
    }
}
