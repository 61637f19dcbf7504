//! Append-only JSON-lines file sink
//!
//! Each stamped record is written as one line. Parent directories are
//! created on first write.

use super::{RecordSink, SinkInfo};
use crate::error::{AuditError, Result};
use crate::types::AuditRecord;
use async_trait::async_trait;
use std::collections::HashSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// JSON-lines file sink
pub struct FileSink {
    path: PathBuf,
    write_lock: Mutex<()>,
    records: AtomicU64,
    bytes: AtomicU64,
}

impl FileSink {
    /// Create a sink appending to `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
            records: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
        }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record persisted at `path`, in write order
    ///
    /// A record redelivered after a timed-out write may appear twice; only
    /// its first occurrence is returned.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let content = std::fs::read_to_string(path).map_err(|e| AuditError::Sink {
            sink: "file".to_string(),
            reason: format!("Failed to read {}: {}", path.display(), e),
        })?;

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for (line_no, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let record: AuditRecord = serde_json::from_str(line).map_err(|e| AuditError::Sink {
                sink: "file".to_string(),
                reason: format!("Corrupt line {} in {}: {}", line_no + 1, path.display(), e),
            })?;
            if seen.insert(record.id.clone()) {
                records.push(record);
            }
        }
        Ok(records)
    }

    fn append(&self, line: &[u8]) -> Result<()> {
        let _guard = self.write_lock.lock().map_err(|e| AuditError::Sink {
            sink: "file".to_string(),
            reason: format!("Failed to acquire write lock: {}", e),
        })?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AuditError::Sink {
                sink: "file".to_string(),
                reason: format!("Failed to create directory {}: {}", parent.display(), e),
            })?;
        }

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| AuditError::Sink {
                sink: "file".to_string(),
                reason: format!("Failed to open {}: {}", self.path.display(), e),
            })?;

        file.write_all(line)
            .and_then(|_| file.sync_data())
            .map_err(|e| AuditError::Sink {
                sink: "file".to_string(),
                reason: format!("Failed to write {}: {}", self.path.display(), e),
            })
    }
}

#[async_trait]
impl RecordSink for FileSink {
    async fn write(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.append(&line)?;

        self.records.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(line.len() as u64, Ordering::Relaxed);
        tracing::debug!(record_id = %record.id, path = %self.path.display(), "Record appended");
        Ok(())
    }

    async fn info(&self) -> Result<SinkInfo> {
        Ok(SinkInfo {
            sink: "file".to_string(),
            records: self.records.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        })
    }

    fn name(&self) -> &str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditCategory, Severity};

    fn record(action: &str) -> AuditRecord {
        AuditRecord::new(AuditCategory::DataExport, Severity::Warning, "analyst", action)
    }

    #[tokio::test]
    async fn test_append_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("audit.jsonl");
        let sink = FileSink::new(&path);

        let a = record("export.csv");
        let b = record("export.pdf");
        sink.write(&a).await.unwrap();
        sink.write(&b).await.unwrap();

        let records = FileSink::read_all(&path).unwrap();
        assert_eq!(records, vec![a, b]);

        let info = sink.info().await.unwrap();
        assert_eq!(info.records, 2);
        assert_eq!(info.bytes, std::fs::metadata(&path).unwrap().len());
    }

    #[tokio::test]
    async fn test_read_all_skips_redelivered_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = FileSink::new(&path);

        let a = record("export.csv");
        sink.write(&a).await.unwrap();
        sink.write(&a).await.unwrap();

        assert_eq!(FileSink::read_all(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FileSink::read_all(dir.path().join("none.jsonl")).unwrap().is_empty());
    }

    #[test]
    fn test_read_corrupt_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{not json}\n").unwrap();

        let err = FileSink::read_all(&path).unwrap_err();
        assert!(err.to_string().contains("Corrupt line 1"));
    }
}
