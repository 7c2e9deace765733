use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use log::error;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    FixMessage,
    OrderEvent,
    FillEvent,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub ts: chrono::DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: AuditEventType,
    pub session_id: String,
    pub payload: Value,
}

/// Append-only, daily-rotated JSONL event store. Every write is
/// synchronous and flushed before returning; a write failure is CRITICAL
/// and must halt trading.
pub struct AuditLog {
    dir: PathBuf,
    session_id: String,
    current_date: NaiveDate,
    file: File,
}

impl AuditLog {
    pub fn open(dir: impl AsRef<Path>, session_id: impl Into<String>) -> EngineResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| EngineError::AuditWriteFailure(e.to_string()))?;
        let today = Utc::now().date_naive();
        let file = open_day_file(&dir, today)?;
        Ok(Self {
            dir,
            session_id: session_id.into(),
            current_date: today,
            file,
        })
    }

    fn path_for(dir: &Path, date: NaiveDate) -> PathBuf {
        dir.join(format!("truex-audit-{}.jsonl", date.format("%Y-%m-%d")))
    }

    fn ensure_current_file(&mut self) -> EngineResult<()> {
        let today = Utc::now().date_naive();
        if today != self.current_date {
            self.file = open_day_file(&self.dir, today)?;
            self.current_date = today;
        }
        Ok(())
    }

    /// Writes one entry and flushes before returning. On failure, returns
    /// `EngineError::AuditWriteFailure` — the caller MUST treat this as
    /// fatal and halt trading, not retry silently.
    pub fn append(&mut self, event_type: AuditEventType, payload: Value) -> EngineResult<()> {
        self.ensure_current_file()?;
        let entry = AuditEntry {
            ts: Utc::now(),
            event_type,
            session_id: self.session_id.clone(),
            payload,
        };
        let line = serde_json::to_string(&entry)
            .map_err(|e| EngineError::AuditWriteFailure(e.to_string()))?;
        writeln!(self.file, "{}", line).map_err(|e| EngineError::AuditWriteFailure(e.to_string()))?;
        self.file
            .sync_data()
            .map_err(|e| EngineError::AuditWriteFailure(e.to_string()))?;
        Ok(())
    }

    /// Scans the day file for `session_id` (falling back to the most
    /// recent existing file when today's has no entries for the session),
    /// returning every recorded order/fill/fix-message/error event.
    pub fn recover_session(&self, session_id: &str, date: Option<NaiveDate>) -> EngineResult<Vec<AuditEntry>> {
        let target_date = date.unwrap_or(self.current_date);
        let path = Self::path_for(&self.dir, target_date);
        let candidates = if path.exists() {
            vec![path]
        } else {
            latest_existing_files(&self.dir)?
        };

        let mut out = Vec::new();
        for candidate in candidates {
            let content = fs::read_to_string(&candidate).map_err(|e| EngineError::Storage(e.to_string()))?;
            for line in content.lines() {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<AuditEntry>(line) {
                    Ok(entry) if entry.session_id == session_id => out.push(entry),
                    Ok(_) => {}
                    Err(e) => error!("corrupt audit line skipped: {}", e),
                }
            }
        }
        Ok(out)
    }
}

fn open_day_file(dir: &Path, date: NaiveDate) -> EngineResult<File> {
    let path = AuditLog::path_for(dir, date);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|e| EngineError::AuditWriteFailure(e.to_string()))
}

fn latest_existing_files(dir: &Path) -> EngineResult<Vec<PathBuf>> {
    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| EngineError::Storage(e.to_string()))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|ext| ext == "jsonl").unwrap_or(false))
        .collect();
    entries.sort();
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_append_and_recover_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::open(dir.path(), "session-1").unwrap();
        log.append(AuditEventType::OrderEvent, json!({"client_order_id": "MM-1"}))
            .unwrap();
        let entries = log.recover_session("session-1", None).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].event_type, AuditEventType::OrderEvent);
    }

    #[test]
    fn test_recover_filters_by_session_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = AuditLog::open(dir.path(), "session-1").unwrap();
        log.append(AuditEventType::OrderEvent, json!({})).unwrap();
        let mut other = AuditLog::open(dir.path(), "session-2").unwrap();
        other.append(AuditEventType::OrderEvent, json!({})).unwrap();
        let entries = log.recover_session("session-1", None).unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_append_creates_dated_file() {
        let dir = tempfile::tempdir().unwrap();
        let _log = AuditLog::open(dir.path(), "session-1").unwrap();
        let today = Utc::now().date_naive();
        let expected = dir.path().join(format!("truex-audit-{}.jsonl", today.format("%Y-%m-%d")));
        assert!(expected.exists());
    }
}
