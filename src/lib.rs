//! Stinger — a policy enforcement and audit layer for conversational AI.
//!
//! The library surface (spec.md §6): build a [`Pipeline`] from a
//! [`guardrails::registry::PipelineSpec`] or a named [`preset`], run
//! `check_input`/`check_output` over content, optionally threading a
//! [`Conversation`] through for multi-turn context and per-conversation
//! rate limiting, and record everything through an [`audit::AuditTrail`].
//!
//! This crate never installs a global `tracing` subscriber — it only emits
//! events. The `stinger-server` binary (`src/bin/stinger_server.rs`) owns
//! subscriber installation, so embedders keep control of their own.

pub mod api;
pub mod audit;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod decision;
pub mod error;
pub mod guardrails;
pub mod pipeline;
pub mod preset;
pub mod principal;
pub mod rate_limiter;

pub use conversation::Conversation;
pub use decision::{Decision, PipelineResult};
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use principal::Principal;
