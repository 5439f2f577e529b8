//! Process configuration, loaded from the environment.
//!
//! `dotenvy` loads a local `.env`, every setting has an explicit default,
//! and env var names live under the crate's own `STINGER_*` namespace.

#[derive(Debug, Clone)]
pub struct Config {
    /// HTTP bind port for `stinger-server`.
    pub port: u16,
    /// Preset used when a `/v1/check` request omits `preset`.
    pub default_preset: String,
    /// Audit destination override. `None` triggers environment auto-detection
    /// (see `crate::audit::Environment`).
    pub audit_path: Option<String>,
    /// Backpressure mode for the audit trail: `fail-safe` (default) or `continue`.
    pub audit_mode: String,
    /// Opaque credential for remote-classifier-backed guardrails (§6).
    pub classifier_api_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            port: 8080,
            default_preset: "basic".to_string(),
            audit_path: None,
            audit_mode: "fail-safe".to_string(),
            classifier_api_key: None,
        }
    }
}

pub fn load() -> Config {
    dotenvy::dotenv().ok();

    Config {
        port: std::env::var("STINGER_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080),
        default_preset: std::env::var("STINGER_PRESET").unwrap_or_else(|_| "basic".to_string()),
        audit_path: std::env::var("STINGER_AUDIT_PATH").ok(),
        audit_mode: std::env::var("STINGER_AUDIT_MODE").unwrap_or_else(|_| "fail-safe".to_string()),
        classifier_api_key: std::env::var("STINGER_CLASSIFIER_API_KEY").ok(),
    }
}

/// Dev-only override: `STINGER_AUDIT_VERBOSE=1` raises the audit writer's
/// internal tracing to `debug` regardless of `RUST_LOG`.
pub fn audit_verbose() -> bool {
    std::env::var("STINGER_AUDIT_VERBOSE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}
