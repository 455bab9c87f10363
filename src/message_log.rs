//! Per-message structured log capture.
//!
//! One `MessageLog` is created when the engine picks a message up and
//! flushed to the system-log table when it lets go, whatever happened in
//! between. It is threaded through the pipeline as a value; there is no
//! ambient "current message" state.

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Which part of the pipeline an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogArea {
    System,
    Classification,
    Forwarding,
    Autoresponse,
    Database,
    Template,
}

#[derive(Debug, Clone, Serialize)]
struct Entry {
    timestamp: DateTime<Utc>,
    level: LogLevel,
    category: LogArea,
    message: String,
}

/// Autoresponse outcome detail carried into the system log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AutoresponseDetail {
    pub attempted: bool,
    pub successful: bool,
    pub skip_reason: String,
    pub template_folder: String,
    pub subject_line: String,
    pub recipient: String,
    pub error_message: String,
}

#[derive(Debug)]
pub struct MessageLog {
    email_id: String,
    internet_message_id: String,
    subject: String,
    started_at: DateTime<Utc>,
    entries: Vec<Entry>,
    error_count: u32,
    warning_count: u32,
    autoresponse_entries: u32,
    classification_entries: u32,
    forwarding_entries: u32,
    autoresponse: AutoresponseDetail,
}

impl MessageLog {
    pub fn begin(
        email_id: &str,
        internet_message_id: &str,
        subject: &str,
    ) -> Self {
        Self {
            email_id: email_id.to_string(),
            internet_message_id: internet_message_id.to_string(),
            subject: subject.chars().take(500).collect(),
            started_at: Utc::now(),
            entries: Vec::new(),
            error_count: 0,
            warning_count: 0,
            autoresponse_entries: 0,
            classification_entries: 0,
            forwarding_entries: 0,
            autoresponse: AutoresponseDetail::default(),
        }
    }

    pub fn email_id(&self) -> &str { &self.email_id }

    pub fn info(
        &mut self,
        area: LogArea,
        message: impl Into<String>,
    ) {
        self.push(LogLevel::Info, area, message.into());
    }

    pub fn warn(
        &mut self,
        area: LogArea,
        message: impl Into<String>,
    ) {
        self.push(LogLevel::Warning, area, message.into());
    }

    pub fn error(
        &mut self,
        area: LogArea,
        message: impl Into<String>,
    ) {
        self.push(LogLevel::Error, area, message.into());
    }

    pub fn critical(
        &mut self,
        area: LogArea,
        message: impl Into<String>,
    ) {
        self.push(LogLevel::Critical, area, message.into());
    }

    fn push(
        &mut self,
        level: LogLevel,
        area: LogArea,
        message: String,
    ) {
        match level {
            LogLevel::Info => tracing::info!(subject = %self.subject, "{message}"),
            LogLevel::Warning => tracing::warn!(subject = %self.subject, "{message}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(subject = %self.subject, "{message}")
            }
        }
        match level {
            LogLevel::Error | LogLevel::Critical => self.error_count += 1,
            LogLevel::Warning => self.warning_count += 1,
            LogLevel::Info => {}
        }
        match area {
            LogArea::Autoresponse => self.autoresponse_entries += 1,
            LogArea::Classification => self.classification_entries += 1,
            LogArea::Forwarding => self.forwarding_entries += 1,
            _ => {}
        }
        self.entries.push(Entry {
            timestamp: Utc::now(),
            level,
            category: area,
            message,
        });
    }

    pub fn record_autoresponse(
        &mut self,
        detail: AutoresponseDetail,
    ) {
        self.autoresponse = detail;
    }

    /// The flat JSON document stored in the system-log table.
    pub fn into_document(self) -> serde_json::Value {
        let ended_at = Utc::now();
        let duration = (ended_at - self.started_at).num_milliseconds() as f64 / 1000.0;
        let errors: Vec<&Entry> = self
            .entries
            .iter()
            .filter(|e| matches!(e.level, LogLevel::Error | LogLevel::Critical))
            .take(10)
            .collect();
        json!({
            "session_info": {
                "email_id": self.email_id,
                "internet_message_id": self.internet_message_id,
                "email_subject": self.subject,
                "processing_start": self.started_at.to_rfc3339(),
                "processing_end": ended_at.to_rfc3339(),
                "processing_duration_seconds": duration,
            },
            "statistics": {
                "total_log_entries": self.entries.len(),
                "error_count": self.error_count,
                "warning_count": self.warning_count,
                "autoresponse_logs": self.autoresponse_entries,
                "classification_logs": self.classification_entries,
                "forwarding_logs": self.forwarding_entries,
            },
            "autoresponse_summary": self.autoresponse,
            "error_summary": {
                "total_errors": self.error_count,
                "error_details": errors,
            },
            "detailed_logs": self.entries,
        })
    }
}
