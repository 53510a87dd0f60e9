//! Structured logging.
//!
//! Provides JSON-capable structured logging via `tracing`, with a small
//! set of category-specific helpers for the lifecycle events the engine
//! surfaces: scan progress, broadcast attempts, category-mode fallback,
//! and derivation mismatches.

use serde::Serialize;
use tracing::Level;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Application log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl From<&str> for LogLevel {
    fn from(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Event categories for structured logging.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Scan-engine progress ticks.
    Scan,
    /// Deposit detection / import.
    Deposit,
    /// Shard withdraw construction and broadcast.
    Withdrawal,
    /// Covenant category-mode fallback attempts.
    CategoryMode,
    /// Derivation mismatches between store records and re-derived keys.
    Derivation,
    /// System events (startup, shutdown, config load).
    System,
}

/// Structured log event.
#[derive(Debug, Serialize)]
pub struct LogEvent {
    pub timestamp: String,
    pub level: String,
    pub category: EventCategory,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorDetails>,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
}

impl LogEvent {
    pub fn new(level: LogLevel, category: EventCategory, message: impl Into<String>) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            level: format!("{:?}", level).to_uppercase(),
            category,
            message: message.into(),
            correlation_id: None,
            data: None,
            duration_ms: None,
            error: None,
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_error(mut self, code: impl Into<String>, message: impl Into<String>) -> Self {
        self.error = Some(ErrorDetails {
            code: code.into(),
            message: message.into(),
        });
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self)
            .unwrap_or_else(|_| format!("{{\"error\":\"log serialization failed\",\"message\":\"{}\"}}", self.message))
    }
}

/// Log a scan-engine progress tick (every 25 txids, per the scan window
/// contract).
pub fn log_scan_progress(scanned: u64, matched: u64, tip_height: u32) {
    let event = LogEvent::new(LogLevel::Info, EventCategory::Scan, "scan progress")
        .with_data(serde_json::json!({
            "scanned": scanned,
            "matched": matched,
            "tip_height": tip_height,
        }));
    tracing::info!(target: "stealth_pool::scan", "{}", event.to_json());
}

/// Log a deposit detection or import attempt.
pub fn log_deposit_event(event_type: &str, outpoint: &str, amount_sats: u64, success: bool, error: Option<&str>) {
    let level = if success { LogLevel::Info } else { LogLevel::Warn };
    let mut event = LogEvent::new(level, EventCategory::Deposit, event_type)
        .with_correlation_id(outpoint)
        .with_data(serde_json::json!({
            "outpoint": outpoint,
            "amount_sats": amount_sats,
            "success": success,
        }));
    if let Some(err) = error {
        event = event.with_error("DEPOSIT_ERROR", err);
    }
    if success {
        tracing::info!(target: "stealth_pool::deposit", "{}", event.to_json());
    } else {
        tracing::warn!(target: "stealth_pool::deposit", "{}", event.to_json());
    }
}

/// Log a broadcast attempt and its outcome.
pub fn log_broadcast_event(txid_hint: &str, success: bool, error: Option<&str>) {
    let level = if success { LogLevel::Info } else { LogLevel::Error };
    let mut event = LogEvent::new(level, EventCategory::Withdrawal, "broadcast")
        .with_data(serde_json::json!({
            "txid_hint": txid_hint,
            "success": success,
        }));
    if let Some(err) = error {
        event = event.with_error("BROADCAST_ERROR", err);
    }
    if success {
        tracing::info!(target: "stealth_pool::withdrawal", "{}", event.to_json());
    } else {
        tracing::error!(target: "stealth_pool::withdrawal", "{}", event.to_json());
    }
}

/// Log a category-mode fallback attempt. Surfaced as a diagnostic
/// whenever a non-default mode succeeds, since that usually means the
/// shard's category push layout disagrees with our default assumption.
pub fn log_category_mode_fallback(mode: &str, succeeded: bool) {
    let level = if succeeded { LogLevel::Warn } else { LogLevel::Debug };
    let event = LogEvent::new(level, EventCategory::CategoryMode, "category mode candidate")
        .with_data(serde_json::json!({ "mode": mode, "succeeded": succeeded }));
    match level {
        LogLevel::Warn => tracing::warn!(target: "stealth_pool::category_mode", "{}", event.to_json()),
        _ => tracing::debug!(target: "stealth_pool::category_mode", "{}", event.to_json()),
    }
}

/// Log a derivation mismatch between a stored record and its re-derived
/// key. Always fatal for that one record; the caller decides whether it
/// is fatal for the whole operation.
pub fn log_derivation_mismatch(context: &str, expected: &str, derived: &str) {
    let event = LogEvent::new(LogLevel::Error, EventCategory::Derivation, "derivation mismatch")
        .with_data(serde_json::json!({
            "context": context,
            "expected": expected,
            "derived": derived,
        }));
    tracing::error!(target: "stealth_pool::derivation", "{}", event.to_json());
}

/// Initialize the logging system.
pub fn init_logging(level: LogLevel, json_format: bool) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("bch_stealth_pool={}", format!("{:?}", level).to_lowercase()))
    });

    if json_format {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    } else {
        let subscriber = tracing_subscriber::registry().with(filter).with(
            fmt::layer()
                .pretty()
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_span_events(FmtSpan::CLOSE),
        );
        subscriber
            .try_init()
            .map_err(|e| LoggingError::InitFailed(e.to_string()))?;
    }

    Ok(())
}

/// Initialize logging from [`crate::config::Config`]. JSON on mainnet,
/// pretty-printed otherwise.
pub fn init_from_config(config: &crate::config::Config) -> Result<(), LoggingError> {
    let level = if config.debug { LogLevel::Debug } else { LogLevel::Info };
    let json_format = config.network == crate::config::Network::Mainnet;
    init_logging(level, json_format)
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("failed to initialize logging: {0}")]
    InitFailed(String),
}

/// Generate a correlation id for a scan or send operation.
pub fn generate_correlation_id() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let suffix: u16 = rand::random();
    format!("{:x}-{:04x}", timestamp & 0xFFFF_FFFF, suffix)
}
