//! `stinger-server` — the HTTP surface binary (spec.md §6, §9's "HTTP
//! server... out of scope [for the core]; only its contract is part of
//! the core"). Standard bootstrap shape: `tokio::main`, `tracing_subscriber`
//! registry install, `AppState` construction, `axum::Router` with a
//! `tower_http` layer stack, and `cli.rs`'s `clap::Parser` with a `serve`
//! subcommand.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use clap::Parser;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stinger::api::{self, AppState};
use stinger::audit::{AuditTrail, BackpressureMode, Destination, EnableOptions};
use stinger::cli::{Cli, Commands};
use stinger::config;
use stinger::guardrails::registry::{default_registry, RegistryContext};
use stinger::rate_limiter::{RateLimiter, WindowLimits};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load();

    let default_filter = if config::audit_verbose() {
        "stinger=info,stinger::audit=debug,tower_http=info"
    } else {
        "stinger=info,tower_http=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    let (port, preset) = match cli.command {
        Some(Commands::Serve { port, preset }) => (port.unwrap_or(cfg.port), preset.unwrap_or(cfg.default_preset.clone())),
        None => (cfg.port, cfg.default_preset.clone()),
    };

    // Validate the default preset up front — a typo'd `STINGER_PRESET`
    // should fail fast at startup, not on the first request (spec.md §4.7).
    stinger::preset::load_preset(&preset)?;

    let audit = Arc::new(AuditTrail::new());
    let destination = match &cfg.audit_path {
        Some(path) => Destination::Single(path.clone()),
        None => Destination::Auto,
    };
    let mode = match cfg.audit_mode.as_str() {
        "continue" => BackpressureMode::Continue {
            deadline: std::time::Duration::from_millis(50),
        },
        _ => BackpressureMode::FailSafe,
    };
    audit
        .enable(destination, EnableOptions { mode, ..Default::default() })
        .await?;

    let rate_limiter = Arc::new(
        RateLimiter::new(WindowLimits::new().with(std::time::Duration::from_secs(60), 120))
            .with_overrides(vec![stinger::rate_limiter::RoleOverride {
                role_token: "premium".to_string(),
                exempt: false,
                limits: Some(WindowLimits::new().with(std::time::Duration::from_secs(60), 200)),
            }]),
    );

    let registry_ctx = match &cfg.classifier_api_key {
        Some(key) => RegistryContext {
            classifier: Some(Arc::new(stinger::guardrails::remote::HttpClassifier::new(
                "https://classifier.internal/v1/classify",
                Some(key.clone()),
            ))),
        },
        None => RegistryContext::default(),
    };

    let state = Arc::new(AppState::new(
        default_registry(),
        rate_limiter,
        audit.clone(),
        preset,
        registry_ctx,
        cfg.classifier_api_key.is_some(),
    ));

    let app = api::router(state)
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "stinger-server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let result = axum::serve(listener, app).await;

    audit.disable().await;
    result?;
    Ok(())
}
