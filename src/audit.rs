//! Audit logging for privileged operations
//!
//! Every change to the bypass selection and every full rule (re)application
//! can be recorded as one JSON line in `audit.log` under the state directory.
//! Logging is opt-in through `AppConfig::enable_audit_log`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Types of auditable events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Apply,
    AddApp,
    RemoveApp,
    Cleanup,
}

/// A single audit log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// When the event occurred (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,

    pub event_type: EventType,

    pub success: bool,

    /// Additional structured data about the event
    pub details: serde_json::Value,

    /// Error message if operation failed
    pub error: Option<String>,
}

impl AuditEvent {
    pub fn new(
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) -> Self {
        Self {
            timestamp: chrono::Utc::now(),
            event_type,
            success,
            details,
            error,
        }
    }
}

/// Audit log writer
pub struct AuditLog {
    log_path: PathBuf,
}

impl AuditLog {
    /// Audit log in the state directory
    ///
    /// # Errors
    ///
    /// Returns `Err` if state directory cannot be determined
    pub fn new() -> std::io::Result<Self> {
        let mut log_path = crate::utils::get_state_dir().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "State directory not found")
        })?;
        log_path.push("audit.log");

        Ok(Self { log_path })
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: path.into(),
        }
    }

    /// Appends an event to the audit log as one JSON line
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn log(&self, event: AuditEvent) -> std::io::Result<()> {
        let json = serde_json::to_string(&event)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Reads up to `count` events, most recent first. Unparsable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be read
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<AuditEvent>> {
        let content = tokio::fs::read_to_string(&self.log_path).await?;

        let events: Vec<AuditEvent> = content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect();

        Ok(events)
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}

async fn write(event: AuditEvent) {
    match AuditLog::new() {
        Ok(audit) => {
            if let Err(e) = audit.log(event).await {
                tracing::warn!("Failed to write audit log: {}", e);
            }
        }
        Err(e) => tracing::warn!("Audit log unavailable: {}", e),
    }
}

/// Logs a full rule application for `uids`
pub async fn log_apply(uids: &[u32], success: bool, error: Option<String>) {
    write(AuditEvent::new(
        EventType::Apply,
        success,
        serde_json::json!({
            "uid_count": uids.len(),
            "uids": uids,
        }),
        error,
    ))
    .await;
}

/// Logs adding `app` (resolved to `uid`) to the bypass selection
pub async fn log_add_app(app: &str, uid: u32, success: bool, error: Option<String>) {
    write(AuditEvent::new(
        EventType::AddApp,
        success,
        serde_json::json!({ "app": app, "uid": uid }),
        error,
    ))
    .await;
}

/// Logs removing `app` from the bypass selection
pub async fn log_remove_app(app: &str, uid: Option<u32>, success: bool, error: Option<String>) {
    write(AuditEvent::new(
        EventType::RemoveApp,
        success,
        serde_json::json!({ "app": app, "uid": uid }),
        error,
    ))
    .await;
}

/// Logs a full cleanup of all bypass chains
pub async fn log_cleanup(success: bool, error: Option<String>) {
    write(AuditEvent::new(
        EventType::Cleanup,
        success,
        serde_json::json!({}),
        error,
    ))
    .await;
}
