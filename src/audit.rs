//! Buffered, lossless audit trail (spec.md §4.6).
//!
//! One background writer task drains an mpsc queue into one or more sinks,
//! rather than spawning a fire-and-forget task per event, since spec.md
//! §4.6 requires no sampling and a completeness contract a detached
//! `tokio::spawn` per event cannot give (a spawned task can still be
//! dropped under process exit; a single owned writer task joined on
//! `disable()` can).

use crate::decision::Action;
use crate::guardrails::pii;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

const FLUSH_SIZE: usize = 200;
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);
const QUERY_RING_CAPACITY: usize = 10_000;
const CHANNEL_CAPACITY: usize = 4_096;

/// Tagged union over the event kinds the audit trail records (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum AuditRecord {
    Prompt {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        text: String,
    },
    Response {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        text: String,
    },
    GuardrailDecision {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        guardrail_name: String,
        action: Action,
        reason: String,
        confidence: f32,
    },
    RateLimitExceeded {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        scope: String,
    },
    AuditEnabled {
        timestamp: DateTime<Utc>,
        destination: String,
    },
    SystemError {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        conversation_id: Option<Uuid>,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        request_id: Option<Uuid>,
        message: String,
    },
}

impl AuditRecord {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            AuditRecord::Prompt { timestamp, .. }
            | AuditRecord::Response { timestamp, .. }
            | AuditRecord::GuardrailDecision { timestamp, .. }
            | AuditRecord::RateLimitExceeded { timestamp, .. }
            | AuditRecord::AuditEnabled { timestamp, .. }
            | AuditRecord::SystemError { timestamp, .. } => *timestamp,
        }
    }

    pub fn conversation_id(&self) -> Option<Uuid> {
        match self {
            AuditRecord::Prompt { conversation_id, .. }
            | AuditRecord::Response { conversation_id, .. }
            | AuditRecord::GuardrailDecision { conversation_id, .. }
            | AuditRecord::RateLimitExceeded { conversation_id, .. }
            | AuditRecord::SystemError { conversation_id, .. } => *conversation_id,
            AuditRecord::AuditEnabled { .. } => None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        match self {
            AuditRecord::Prompt { user_id, .. }
            | AuditRecord::Response { user_id, .. }
            | AuditRecord::GuardrailDecision { user_id, .. }
            | AuditRecord::RateLimitExceeded { user_id, .. }
            | AuditRecord::SystemError { user_id, .. } => user_id.as_deref(),
            AuditRecord::AuditEnabled { .. } => None,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            AuditRecord::Prompt { .. } => "prompt",
            AuditRecord::Response { .. } => "response",
            AuditRecord::GuardrailDecision { .. } => "guardrail_decision",
            AuditRecord::RateLimitExceeded { .. } => "rate_limit_exceeded",
            AuditRecord::AuditEnabled { .. } => "audit_enabled",
            AuditRecord::SystemError { .. } => "system_error",
        }
    }

    pub fn decision_action(&self) -> Option<Action> {
        match self {
            AuditRecord::GuardrailDecision { action, .. } => Some(*action),
            _ => None,
        }
    }

    /// Applies the shared PII pattern catalog (`crate::guardrails::pii`) to
    /// the text-bearing fields only — identifiers, timestamps, and
    /// decisions are left untouched (spec.md §4.6, testable property 6).
    /// Idempotent: replacement placeholders never match the patterns that
    /// produced them.
    fn redacted(&self) -> AuditRecord {
        let scrub = |s: &str| -> String {
            let mut out = s.to_string();
            for pattern in pii::BUILTIN_PATTERNS {
                if pattern.regex.is_match(&out) {
                    out = pattern.regex.replace_all(&out, pattern.replacement).to_string();
                }
            }
            out
        };
        match self {
            AuditRecord::Prompt {
                timestamp,
                conversation_id,
                user_id,
                request_id,
                text,
            } => AuditRecord::Prompt {
                timestamp: *timestamp,
                conversation_id: *conversation_id,
                user_id: user_id.clone(),
                request_id: *request_id,
                text: scrub(text),
            },
            AuditRecord::Response {
                timestamp,
                conversation_id,
                user_id,
                request_id,
                text,
            } => AuditRecord::Response {
                timestamp: *timestamp,
                conversation_id: *conversation_id,
                user_id: user_id.clone(),
                request_id: *request_id,
                text: scrub(text),
            },
            AuditRecord::GuardrailDecision {
                timestamp,
                conversation_id,
                user_id,
                request_id,
                guardrail_name,
                action,
                reason,
                confidence,
            } => AuditRecord::GuardrailDecision {
                timestamp: *timestamp,
                conversation_id: *conversation_id,
                user_id: user_id.clone(),
                request_id: *request_id,
                guardrail_name: guardrail_name.clone(),
                action: *action,
                reason: scrub(reason),
                confidence: *confidence,
            },
            other => other.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Development,
    Containerized,
    Production,
}

/// Auto-detects the deployment environment for `enable()`'s smart defaults
/// (spec.md §4.6). `STINGER_ENV` is authoritative when set; otherwise a
/// containerized runtime is inferred from common container/orchestrator
/// signals.
pub fn detect_environment() -> Environment {
    match std::env::var("STINGER_ENV").ok().as_deref() {
        Some("production") => return Environment::Production,
        Some("container") | Some("containerized") => return Environment::Containerized,
        Some("development") => return Environment::Development,
        _ => {}
    }
    if std::path::Path::new("/.dockerenv").exists() || std::env::var("KUBERNETES_SERVICE_HOST").is_ok() {
        Environment::Containerized
    } else {
        Environment::Development
    }
}

/// What `record()` does when the writer's channel is saturated (spec.md
/// §4.6).
#[derive(Debug, Clone, Copy)]
pub enum BackpressureMode {
    /// `record` blocks until the event is accepted — the audit system, not
    /// the caller, absorbs the slowdown.
    FailSafe,
    /// `record` waits up to `deadline`; past it, a `system_error`
    /// completeness-gap marker is emitted instead and `record` returns.
    Continue { deadline: Duration },
}

impl Default for BackpressureMode {
    fn default() -> Self {
        BackpressureMode::FailSafe
    }
}

/// Where enabled events are written. `"stdout"` is a reserved sink name;
/// anything else is treated as a file path.
#[derive(Debug, Clone)]
pub enum Destination {
    Auto,
    Single(String),
    Multi(Vec<String>),
}

impl From<&str> for Destination {
    fn from(s: &str) -> Self {
        Destination::Single(s.to_string())
    }
}

impl From<Vec<&str>> for Destination {
    fn from(v: Vec<&str>) -> Self {
        Destination::Multi(v.into_iter().map(str::to_string).collect())
    }
}

#[derive(Debug, Clone)]
pub struct EnableOptions {
    /// `None` defers to the environment's smart default.
    pub redact_pii: Option<bool>,
    pub mode: BackpressureMode,
    pub buffer_capacity: usize,
}

impl Default for EnableOptions {
    fn default() -> Self {
        EnableOptions {
            redact_pii: None,
            mode: BackpressureMode::FailSafe,
            buffer_capacity: CHANNEL_CAPACITY,
        }
    }
}

#[async_trait::async_trait]
trait Sink: Send + Sync {
    async fn write_line(&self, line: &str) -> std::io::Result<()>;
    async fn flush(&self) -> std::io::Result<()>;
}

struct StdoutSink;

#[async_trait::async_trait]
impl Sink for StdoutSink {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut out = tokio::io::stdout();
        out.write_all(line.as_bytes()).await?;
        out.write_all(b"\n").await
    }

    async fn flush(&self) -> std::io::Result<()> {
        tokio::io::stdout().flush().await
    }
}

/// Appends JSON Lines to a file, creating missing parent directories.
/// Rotation is the sink's concern per spec.md §6: we keep the file handle
/// open across writes (POSIX "open fd keeps writing" semantics tolerate a
/// `mv`/`logrotate`-style rename out from under us) and reopen on an I/O
/// error, which also covers truncate-in-place rotation strategies.
struct FileSink {
    path: PathBuf,
    file: Mutex<BufWriter<tokio::fs::File>>,
}

impl FileSink {
    async fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = Self::open_append(&path).await?;
        Ok(FileSink {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    async fn open_append(path: &PathBuf) -> std::io::Result<tokio::fs::File> {
        tokio::fs::OpenOptions::new().create(true).append(true).open(path).await
    }
}

#[async_trait::async_trait]
impl Sink for FileSink {
    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        if file.write_all(line.as_bytes()).await.is_err() {
            *file = BufWriter::new(Self::open_append(&self.path).await?);
            file.write_all(line.as_bytes()).await?;
        }
        file.write_all(b"\n").await
    }

    async fn flush(&self) -> std::io::Result<()> {
        self.file.lock().await.flush().await
    }
}

/// Filters for `AuditTrail::query` (spec.md §4.6) — an in-process,
/// development/forensic facility, not a high-throughput retrieval service.
#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub conversation_id: Option<Uuid>,
    pub user_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub decision: Option<Action>,
}

impl QueryFilter {
    fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(cid) = self.conversation_id {
            if record.conversation_id() != Some(cid) {
                return false;
            }
        }
        if let Some(uid) = &self.user_id {
            if record.user_id() != Some(uid.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if record.timestamp() < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if record.timestamp() > until {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if record.event_type() != event_type {
                return false;
            }
        }
        if let Some(decision) = self.decision {
            if record.decision_action() != Some(decision) {
                return false;
            }
        }
        true
    }
}

enum WriterMsg {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

struct Inner {
    sender: mpsc::Sender<WriterMsg>,
    writer: Mutex<Option<JoinHandle<()>>>,
    mode: BackpressureMode,
    records: Arc<Mutex<VecDeque<AuditRecord>>>,
}

/// Process-wide audit handle (spec.md §4.6, §9's "shared global audit
/// singleton" mapping). Emitters (the pipeline) hold a borrowed reference;
/// a single writer task owns the sinks and is joined on `disable()` so no
/// accepted event can be lost to process exit.
#[derive(Default)]
pub struct AuditTrail {
    inner: RwLock<Option<Inner>>,
}

impl AuditTrail {
    pub fn new() -> Self {
        AuditTrail::default()
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// `enable(Destination::Auto, ...)` auto-detects the environment and
    /// applies the smart defaults from spec.md §4.6; explicit destinations
    /// bypass detection.
    pub async fn enable(&self, destination: Destination, options: EnableOptions) -> std::io::Result<()> {
        let env = detect_environment();
        let (resolved, redact_default, buffer_capacity) = match &destination {
            Destination::Auto => match env {
                Environment::Development => (Destination::Single("stdout".to_string()), false, options.buffer_capacity),
                Environment::Containerized => (Destination::Single("stdout".to_string()), true, options.buffer_capacity),
                Environment::Production => (
                    Destination::Single("/var/log/stinger/audit.log".to_string()),
                    true,
                    options.buffer_capacity.max(CHANNEL_CAPACITY * 4),
                ),
            },
            other => (other.clone(), false, options.buffer_capacity),
        };
        let redact = options.redact_pii.unwrap_or(redact_default);

        let paths: Vec<String> = match &resolved {
            Destination::Single(s) => vec![s.clone()],
            Destination::Multi(v) => v.clone(),
            Destination::Auto => unreachable!(),
        };

        let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
        for p in &paths {
            if p == "stdout" {
                sinks.push(Arc::new(StdoutSink));
            } else {
                sinks.push(Arc::new(FileSink::open(p).await?));
            }
        }

        let (sender, receiver) = mpsc::channel(buffer_capacity);
        let records = Arc::new(Mutex::new(VecDeque::with_capacity(QUERY_RING_CAPACITY)));
        let writer = tokio::spawn(run_writer(receiver, sinks, redact, records.clone()));

        {
            let mut guard = self.inner.write().await;
            *guard = Some(Inner {
                sender,
                writer: Mutex::new(Some(writer)),
                mode: options.mode,
                records,
            });
        }

        self.record(AuditRecord::AuditEnabled {
            timestamp: Utc::now(),
            destination: paths.join(","),
        })
        .await;
        Ok(())
    }

    /// Flushes and tears down the writer task, guaranteeing every accepted
    /// event has reached every sink before returning (spec.md §4.6,
    /// testable property 5).
    pub async fn disable(&self) {
        let inner = self.inner.write().await.take();
        let Some(inner) = inner else { return };
        let (tx, rx) = oneshot::channel();
        let _ = inner.sender.send(WriterMsg::Flush(tx)).await;
        let _ = rx.await;
        drop(inner.sender);
        if let Some(handle) = inner.writer.lock().await.take() {
            let _ = handle.await;
        }
    }

    /// Records one event under the configured backpressure mode. A no-op
    /// if the trail isn't enabled.
    pub async fn record(&self, event: AuditRecord) {
        let (sender, mode) = {
            let guard = self.inner.read().await;
            match guard.as_ref() {
                Some(inner) => (inner.sender.clone(), inner.mode),
                None => return,
            }
        };
        match mode {
            BackpressureMode::FailSafe => {
                let _ = sender.send(WriterMsg::Record(event)).await;
            }
            BackpressureMode::Continue { deadline } => {
                if tokio::time::timeout(deadline, sender.send(WriterMsg::Record(event)))
                    .await
                    .is_err()
                {
                    let gap = AuditRecord::SystemError {
                        timestamp: Utc::now(),
                        conversation_id: None,
                        user_id: None,
                        request_id: None,
                        message: "audit backpressure: completeness gap, one event dropped".to_string(),
                    };
                    let _ = sender.try_send(WriterMsg::Record(gap));
                }
            }
        }
    }

    /// In-process filtered lookup over the most recent
    /// `QUERY_RING_CAPACITY` events (spec.md §4.6: "not designed as a
    /// high-throughput retrieval service").
    pub async fn query(&self, filter: QueryFilter) -> Vec<AuditRecord> {
        let guard = self.inner.read().await;
        let Some(inner) = guard.as_ref() else { return Vec::new() };
        let records = inner.records.lock().await;
        records.iter().filter(|r| filter.matches(r)).cloned().collect()
    }

    /// Returns every stored event in `[since, until]` matching `filter`, in
    /// chronological order. Modeled as an owned `Vec` rather than a true
    /// stream — the in-process ring buffer this reads from is already
    /// fully materialized — but exposed under the export name spec.md §4.6
    /// uses for this operation.
    pub async fn export(&self, since: DateTime<Utc>, until: DateTime<Utc>, filter: Option<QueryFilter>) -> Vec<AuditRecord> {
        let mut filter = filter.unwrap_or_default();
        filter.since = Some(since);
        filter.until = Some(until);
        self.query(filter).await
    }
}

async fn run_writer(
    mut receiver: mpsc::Receiver<WriterMsg>,
    sinks: Vec<Arc<dyn Sink>>,
    redact: bool,
    records: Arc<Mutex<VecDeque<AuditRecord>>>,
) {
    let mut buffer: Vec<AuditRecord> = Vec::with_capacity(FLUSH_SIZE);
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = receiver.recv() => {
                match msg {
                    Some(WriterMsg::Record(record)) => {
                        buffer.push(record);
                        if buffer.len() >= FLUSH_SIZE {
                            flush(&mut buffer, &sinks, redact, &records).await;
                        }
                    }
                    Some(WriterMsg::Flush(ack)) => {
                        flush(&mut buffer, &sinks, redact, &records).await;
                        for sink in &sinks {
                            let _ = sink.flush().await;
                        }
                        let _ = ack.send(());
                    }
                    None => {
                        flush(&mut buffer, &sinks, redact, &records).await;
                        for sink in &sinks {
                            let _ = sink.flush().await;
                        }
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                if !buffer.is_empty() {
                    flush(&mut buffer, &sinks, redact, &records).await;
                }
            }
        }
    }
}

async fn flush(buffer: &mut Vec<AuditRecord>, sinks: &[Arc<dyn Sink>], redact: bool, records: &Arc<Mutex<VecDeque<AuditRecord>>>) {
    if buffer.is_empty() {
        return;
    }
    let mut ring = records.lock().await;
    for record in buffer.drain(..) {
        let stored = if redact { record.redacted() } else { record };
        if let Ok(line) = serde_json::to_string(&stored) {
            for sink in sinks {
                if let Err(e) = sink.write_line(&line).await {
                    tracing::error!(error = %e, "audit sink write failed");
                }
            }
        }
        if ring.len() >= QUERY_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(stored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disable_is_a_no_op_on_an_already_disabled_trail() {
        let trail = AuditTrail::new();
        trail.disable().await;
        assert!(!trail.is_enabled().await);
    }

    #[tokio::test]
    async fn query_after_disable_returns_empty() {
        let trail = AuditTrail::new();
        trail
            .enable(Destination::Single("stdout".to_string()), EnableOptions::default())
            .await
            .unwrap();
        trail
            .record(AuditRecord::Prompt {
                timestamp: Utc::now(),
                conversation_id: None,
                user_id: Some("u1".to_string()),
                request_id: None,
                text: "hello".to_string(),
            })
            .await;
        trail.disable().await;

        let results = trail.query(QueryFilter::default()).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn file_sink_writes_every_record_before_disable_returns() {
        let dir = std::env::temp_dir().join(format!("stinger-audit-test-{}", Uuid::new_v4()));
        let path = dir.join("audit.log");
        let trail = AuditTrail::new();
        trail
            .enable(Destination::Single(path.to_string_lossy().to_string()), EnableOptions::default())
            .await
            .unwrap();

        for i in 0..50 {
            trail
                .record(AuditRecord::Prompt {
                    timestamp: Utc::now(),
                    conversation_id: None,
                    user_id: Some(format!("user-{i}")),
                    request_id: None,
                    text: format!("message {i}"),
                })
                .await;
        }
        trail.disable().await;

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        // +1 for the audit_enabled record emitted by enable().
        assert_eq!(contents.lines().count(), 51);
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn redaction_scrubs_text_but_preserves_identifiers() {
        let record = AuditRecord::Prompt {
            timestamp: Utc::now(),
            conversation_id: Some(Uuid::new_v4()),
            user_id: Some("user-42".to_string()),
            request_id: None,
            text: "my ssn is 123-45-6789".to_string(),
        };
        let redacted = record.redacted();
        match redacted {
            AuditRecord::Prompt { text, user_id, .. } => {
                assert!(text.contains("REDACTED_SSN"));
                assert_eq!(user_id.as_deref(), Some("user-42"));
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn redaction_is_idempotent() {
        let record = AuditRecord::Prompt {
            timestamp: Utc::now(),
            conversation_id: None,
            user_id: None,
            request_id: None,
            text: "call me at 555-123-4567".to_string(),
        };
        let once = record.redacted();
        let twice = once.redacted();
        match (once, twice) {
            (AuditRecord::Prompt { text: a, .. }, AuditRecord::Prompt { text: b, .. }) => {
                assert_eq!(a, b);
            }
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn query_filters_by_conversation_id() {
        let trail = AuditTrail::new();
        trail
            .enable(Destination::Single("stdout".to_string()), EnableOptions::default())
            .await
            .unwrap();
        let target = Uuid::new_v4();
        trail
            .record(AuditRecord::Prompt {
                timestamp: Utc::now(),
                conversation_id: Some(target),
                user_id: None,
                request_id: None,
                text: "a".to_string(),
            })
            .await;
        trail
            .record(AuditRecord::Prompt {
                timestamp: Utc::now(),
                conversation_id: Some(Uuid::new_v4()),
                user_id: None,
                request_id: None,
                text: "b".to_string(),
            })
            .await;

        // Give the writer task a moment to drain into the ring buffer.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let results = trail
            .query(QueryFilter {
                conversation_id: Some(target),
                ..Default::default()
            })
            .await;
        assert_eq!(results.len(), 1);
        trail.disable().await;
    }
}
