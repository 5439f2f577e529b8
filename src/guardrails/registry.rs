//! Guardrail registry & factory (spec.md §4.2) and `PipelineSpec` (§3).
//!
//! A process-wide, name-keyed constructor table: each guardrail `kind`
//! string maps to a boxed constructor closure.

use super::code_gen::CodeGenGuardrail;
use super::keyword::KeywordGuardrail;
use super::length::LengthGuardrail;
use super::pii::PiiGuardrail;
use super::regex_guard::RegexGuardrail;
use super::remote::{ClassifierTask, RemoteClassifier, RemoteClassifierGuardrail};
use super::toxicity::ToxicityGuardrail;
use super::topic::{TopicFilterGuardrail, TopicMode};
use super::url_filter::{ListMode, UrlFilterGuardrail};
use super::Guardrail;
use crate::decision::OnError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// One entry in a `PipelineSpec` (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardrailSpec {
    pub name: String,
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub config: Value,
    #[serde(default = "default_on_error")]
    pub on_error: OnError,
}

fn default_true() -> bool {
    true
}

fn default_on_error() -> OnError {
    OnError::Block
}

/// Ordered input-side and output-side guardrail lists (spec.md §3).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineSpec {
    pub input: Vec<GuardrailSpec>,
    pub output: Vec<GuardrailSpec>,
}

type Constructor = Arc<dyn Fn(&GuardrailSpec, &RegistryContext) -> crate::error::Result<Arc<dyn Guardrail>> + Send + Sync>;

/// Shared dependencies a constructor may need (e.g. a remote classifier).
#[derive(Clone, Default)]
pub struct RegistryContext {
    pub classifier: Option<Arc<dyn RemoteClassifier>>,
}

/// Process-wide `kind -> constructor` mapping. Registration happens once at
/// startup; duplicate `kind` registration fails (spec.md §4.2).
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            constructors: HashMap::new(),
        }
    }

    pub fn register(
        &mut self,
        kind: impl Into<String>,
        constructor: impl Fn(&GuardrailSpec, &RegistryContext) -> crate::error::Result<Arc<dyn Guardrail>> + Send + Sync + 'static,
    ) -> crate::error::Result<()> {
        let kind = kind.into();
        if self.constructors.contains_key(&kind) {
            return Err(crate::error::Error::configuration(
                kind.clone(),
                "registry",
                "duplicate guardrail kind registration",
            ));
        }
        self.constructors.insert(kind, Arc::new(constructor));
        Ok(())
    }

    pub fn build(&self, spec: &GuardrailSpec, ctx: &RegistryContext) -> crate::error::Result<Arc<dyn Guardrail>> {
        let constructor = self.constructors.get(&spec.kind).ok_or_else(|| {
            crate::error::Error::configuration(spec.name.clone(), spec.kind.clone(), "unknown guardrail kind")
        })?;
        constructor(spec, ctx)
    }

    /// Builds every guardrail in `spec`; fails fast with a named error on
    /// the first construction failure (spec.md §4.2).
    pub fn build_pipeline(
        &self,
        spec: &PipelineSpec,
        ctx: &RegistryContext,
    ) -> crate::error::Result<(Vec<Arc<dyn Guardrail>>, Vec<Arc<dyn Guardrail>>)> {
        let input = spec
            .input
            .iter()
            .filter(|s| s.enabled)
            .map(|s| self.build(s, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        let output = spec
            .output
            .iter()
            .filter(|s| s.enabled)
            .map(|s| self.build(s, ctx))
            .collect::<crate::error::Result<Vec<_>>>()?;
        Ok((input, output))
    }
}

fn cfg_str(cfg: &Value, key: &str, default: &str) -> String {
    cfg.get(key).and_then(Value::as_str).unwrap_or(default).to_string()
}

fn cfg_str_list(cfg: &Value, key: &str) -> Vec<String> {
    cfg.get(key)
        .and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
        .unwrap_or_default()
}

fn cfg_bool(cfg: &Value, key: &str, default: bool) -> bool {
    cfg.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn cfg_f32(cfg: &Value, key: &str, default: f32) -> f32 {
    cfg.get(key).and_then(Value::as_f64).map(|v| v as f32).unwrap_or(default)
}

fn cfg_usize(cfg: &Value, key: &str, default: usize) -> usize {
    cfg.get(key).and_then(Value::as_u64).map(|v| v as usize).unwrap_or(default)
}

/// Reads a fixed-size array of `f32`s from `cfg[key]`, falling back to
/// `default` wholesale if the key is missing or not an array of exactly
/// `N` numbers.
fn cfg_f32_array<const N: usize>(cfg: &Value, key: &str, default: [f32; N]) -> [f32; N] {
    let Some(arr) = cfg.get(key).and_then(Value::as_array) else {
        return default;
    };
    let values: Vec<f32> = arr.iter().filter_map(|v| v.as_f64()).map(|v| v as f32).collect();
    match values.try_into() {
        Ok(values) => values,
        Err(_) => default,
    }
}

/// Builds the default registry with every built-in guardrail kind
/// registered. Called once at process startup.
pub fn default_registry() -> Registry {
    let mut registry = Registry::new();

    registry
        .register("keyword", |spec, _ctx| {
            Ok(Arc::new(KeywordGuardrail::new(
                spec.name.clone(),
                cfg_str_list(&spec.config, "keywords"),
                cfg_bool(&spec.config, "case_sensitive", false),
                cfg_bool(&spec.config, "block", true),
                spec.on_error,
            )))
        })
        .unwrap();

    registry
        .register("regex", |spec, _ctx| {
            let patterns = cfg_str_list(&spec.config, "patterns");
            let pattern_refs: Vec<&str> = patterns.iter().map(String::as_str).collect();
            RegexGuardrail::new(spec.name.clone(), &pattern_refs, cfg_bool(&spec.config, "block", true), spec.on_error)
                .map(|g| Arc::new(g) as Arc<dyn Guardrail>)
        })
        .unwrap();

    registry
        .register("length", |spec, _ctx| {
            let min = spec.config.get("min_chars").and_then(Value::as_u64).map(|v| v as usize);
            let max = spec.config.get("max_chars").and_then(Value::as_u64).map(|v| v as usize);
            Ok(Arc::new(LengthGuardrail::new(spec.name.clone(), min, max, spec.on_error)))
        })
        .unwrap();

    registry
        .register("url_filter", |spec, _ctx| {
            let mode = if cfg_str(&spec.config, "mode", "deny") == "allow" {
                ListMode::Allow
            } else {
                ListMode::Deny
            };
            Ok(Arc::new(UrlFilterGuardrail::new(
                spec.name.clone(),
                mode,
                cfg_str_list(&spec.config, "domains"),
                cfg_str_list(&spec.config, "extensions"),
                spec.on_error,
            )))
        })
        .unwrap();

    registry
        .register("pii", |spec, _ctx| {
            Ok(Arc::new(PiiGuardrail::new(
                spec.name.clone(),
                cfg_str_list(&spec.config, "categories"),
                cfg_bool(&spec.config, "block", true),
                spec.on_error,
            )))
        })
        .unwrap();

    registry
        .register("toxicity", |spec, _ctx| {
            Ok(Arc::new(ToxicityGuardrail::new(
                spec.name.clone(),
                cfg_f32(&spec.config, "warn_threshold", 0.3),
                cfg_f32(&spec.config, "block_threshold", 0.7),
                spec.on_error,
            )))
        })
        .unwrap();

    registry
        .register("code_gen", |spec, _ctx| {
            Ok(Arc::new(CodeGenGuardrail::new(
                spec.name.clone(),
                cfg_bool(&spec.config, "block", true),
                spec.on_error,
            )))
        })
        .unwrap();

    registry
        .register("topic_filter", |spec, _ctx| {
            let mode = match cfg_str(&spec.config, "mode", "deny").as_str() {
                "allow" => TopicMode::Allow,
                "both" => TopicMode::Both,
                _ => TopicMode::Deny,
            };
            let allow = cfg_str_list(&spec.config, "allow_topics");
            let deny = cfg_str_list(&spec.config, "deny_topics");
            let allow_refs: Vec<&str> = allow.iter().map(String::as_str).collect();
            let deny_refs: Vec<&str> = deny.iter().map(String::as_str).collect();
            TopicFilterGuardrail::new(spec.name.clone(), mode, &allow_refs, &deny_refs, spec.on_error)
                .map(|g| Arc::new(g) as Arc<dyn Guardrail>)
        })
        .unwrap();

    registry
        .register("conversation_aware_prompt_injection", |spec, ctx| {
            use super::injection::{ContextStrategy, InjectionDetectorConfig, InjectionGuardrail, Level};

            let strategy = match cfg_str(&spec.config, "strategy", "mixed").as_str() {
                "recent" => ContextStrategy::Recent,
                "suspicious" => ContextStrategy::Suspicious,
                _ => ContextStrategy::Mixed,
            };
            let parse_levels = |key: &str, default: Vec<Level>| -> Vec<Level> {
                let names = cfg_str_list(&spec.config, key);
                if names.is_empty() {
                    return default;
                }
                names
                    .iter()
                    .filter_map(|n| match n.as_str() {
                        "low" => Some(Level::Low),
                        "medium" => Some(Level::Medium),
                        "high" => Some(Level::High),
                        "critical" => Some(Level::Critical),
                        _ => None,
                    })
                    .collect()
            };

            let config = InjectionDetectorConfig {
                strategy,
                max_context_turns: cfg_usize(&spec.config, "max_context_turns", 5),
                context_weight: cfg_f32(&spec.config, "context_weight", 0.3),
                thresholds: cfg_f32_array(&spec.config, "thresholds", [25.0, 50.0, 75.0, 90.0]),
                block_levels: parse_levels("block_levels", vec![Level::High, Level::Critical]),
                warn_levels: parse_levels("warn_levels", vec![Level::Medium]),
                suspicious_indicators: {
                    let list = cfg_str_list(&spec.config, "suspicious_indicators");
                    if list.is_empty() {
                        vec!["ignore", "forget", "pretend", "trust", "you are", "act as"]
                            .into_iter()
                            .map(str::to_string)
                            .collect()
                    } else {
                        list
                    }
                },
                token_budget: cfg_usize(&spec.config, "token_budget", 2000),
                on_error: spec.on_error,
            };

            let mut guardrail = InjectionGuardrail::new(spec.name.clone(), config);
            if cfg_bool(&spec.config, "use_remote", false) {
                if let Some(classifier) = &ctx.classifier {
                    guardrail = guardrail.with_classifier(classifier.clone());
                }
            }
            Ok(Arc::new(guardrail) as Arc<dyn Guardrail>)
        })
        .unwrap();

    registry
        .register("remote_classifier", |spec, ctx| {
            let classifier = ctx.classifier.clone().ok_or_else(|| {
                crate::error::Error::configuration(spec.name.clone(), "remote_classifier", "no classifier configured")
            })?;
            let task = match cfg_str(&spec.config, "task", "moderation").as_str() {
                "injection" => ClassifierTask::Injection,
                "pii" => ClassifierTask::Pii,
                "toxicity" => ClassifierTask::Toxicity,
                "code_gen" => ClassifierTask::CodeGen,
                _ => ClassifierTask::Moderation,
            };
            Ok(Arc::new(RemoteClassifierGuardrail::new(
                spec.name.clone(),
                format!("{}_remote", cfg_str(&spec.config, "task", "moderation")),
                task,
                classifier,
                spec.on_error,
                cfg_f32(&spec.config, "warn_threshold", 0.5),
                cfg_f32(&spec.config, "block_threshold", 0.8),
            )) as Arc<dyn Guardrail>)
        })
        .unwrap();

    registry
}

/// Caches constructed `(input, output)` guardrail lists by preset name, safe
/// under concurrent readers with occasional writers (spec.md §5: "double
/// checked insertion is acceptable").
#[derive(Default)]
pub struct PipelineCache {
    cache: DashMap<String, Arc<(Vec<Arc<dyn Guardrail>>, Vec<Arc<dyn Guardrail>>)>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        PipelineCache::default()
    }

    pub fn get_or_build(
        &self,
        preset_name: &str,
        registry: &Registry,
        spec: &PipelineSpec,
        ctx: &RegistryContext,
    ) -> crate::error::Result<Arc<(Vec<Arc<dyn Guardrail>>, Vec<Arc<dyn Guardrail>>)>> {
        if let Some(hit) = self.cache.get(preset_name) {
            return Ok(hit.clone());
        }
        let built = Arc::new(registry.build_pipeline(spec, ctx)?);
        // Double-checked insertion: if another writer beat us, keep theirs.
        let entry = self.cache.entry(preset_name.to_string()).or_insert_with(|| built.clone());
        Ok(entry.clone())
    }
}
