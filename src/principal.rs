//! The opaque caller identity used for rate limiting and audit attribution.

use serde::{Deserialize, Serialize};

/// An opaque identifier for the requesting actor, plus an optional role tag
/// (e.g. `"admin"`, `"premium"`) that drives rate-limit overrides and
/// exemptions (see `crate::rate_limiter`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub id: String,
    #[serde(default)]
    pub role: Option<String>,
}

impl Principal {
    pub fn new(id: impl Into<String>) -> Self {
        Principal { id: id.into(), role: None }
    }

    pub fn with_role(id: impl Into<String>, role: impl Into<String>) -> Self {
        Principal {
            id: id.into(),
            role: Some(role.into()),
        }
    }

    /// The rate-limiter key for this principal's per-user scope.
    pub fn rate_limit_key(&self) -> String {
        format!("user:{}", self.id)
    }
}
