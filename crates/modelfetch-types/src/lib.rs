//! Shared types for modelfetch
//!
//! This crate contains the data structures shared between the core
//! engine and its consumers (CLI or embedding applications).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

// ============================================================================
// Transfer Types
// ============================================================================

/// One transfer attempt: where the artifact comes from and where it lands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub source_url: String,
    pub destination: PathBuf,
}

impl TransferRequest {
    pub fn new(source_url: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source_url: source_url.into(),
            destination: destination.into(),
        }
    }

    /// Final file name of the destination, used to derive cache file names.
    pub fn file_name(&self) -> Option<&str> {
        self.destination.file_name().and_then(|name| name.to_str())
    }
}

/// Status of the engine's single transfer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Idle,
    Downloading,
    Paused,
    Cancelled,
    Finished,
    Failed,
}

/// In-memory view of the active transfer. The engine is the sole mutator;
/// `bytes_expected` is the raw server-reported total, `-1` when unknown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferState {
    pub status: TransferStatus,
    pub bytes_written: u64,
    pub bytes_expected: i64,
}

impl Default for TransferState {
    fn default() -> Self {
        Self {
            status: TransferStatus::Idle,
            bytes_written: 0,
            bytes_expected: -1,
        }
    }
}

impl TransferState {
    /// Expected total in bytes, `None` when the server did not report one.
    pub fn expected(&self) -> Option<u64> {
        (self.bytes_expected > 0).then_some(self.bytes_expected as u64)
    }

    pub fn progress(&self) -> f64 {
        match self.expected() {
            Some(total) => (self.bytes_written as f64 / total as f64) * 100.0,
            None => 0.0,
        }
    }
}

// ============================================================================
// Resume Cache Types
// ============================================================================

/// Resume bookkeeping persisted across process restarts.
///
/// At most one record exists at a time, stored under a fixed slot. It is
/// written when a pause produced resume data and removed on cancel,
/// completion, or when the blob it references has gone missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeCacheRecord {
    pub download_link: String,
    pub cache_file_name: String,
    pub bytes_written: i64,
    pub bytes_expected: i64,
}

impl ResumeCacheRecord {
    /// Percentage completed at pause time, `None` when the total is unknown.
    pub fn progress(&self) -> Option<f64> {
        (self.bytes_expected > 0)
            .then(|| (self.bytes_written.max(0) as f64 / self.bytes_expected as f64) * 100.0)
    }
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to its consumer.
///
/// Failures are not an event value; they terminate the event sequence
/// as an error item.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum DownloadEvent {
    Progress {
        bytes_written: u64,
        bytes_expected: Option<u64>,
    },
    Finished {
        path: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_json() {
        let records = [
            ResumeCacheRecord {
                download_link: "https://host/model.bin".to_string(),
                cache_file_name: "model.bin.resume".to_string(),
                bytes_written: 1000,
                bytes_expected: 10000,
            },
            ResumeCacheRecord {
                download_link: "http://host/weights.gguf".to_string(),
                cache_file_name: "weights.gguf.resume".to_string(),
                bytes_written: 0,
                bytes_expected: -1,
            },
            ResumeCacheRecord {
                download_link: "https://host/a%20b.bin".to_string(),
                cache_file_name: "a b.bin.resume".to_string(),
                bytes_written: i64::MAX,
                bytes_expected: i64::MAX,
            },
        ];

        for record in records {
            let encoded = serde_json::to_vec(&record).unwrap();
            let decoded: ResumeCacheRecord = serde_json::from_slice(&encoded).unwrap();
            assert_eq!(decoded, record);
        }
    }

    #[test]
    fn record_uses_camel_case_keys() {
        let record = ResumeCacheRecord {
            download_link: "https://host/model.bin".to_string(),
            cache_file_name: "model.bin.resume".to_string(),
            bytes_written: 5,
            bytes_expected: 10,
        };

        let json: serde_json::Value = serde_json::to_value(&record).unwrap();
        assert!(json.get("downloadLink").is_some());
        assert!(json.get("cacheFileName").is_some());
        assert!(json.get("bytesWritten").is_some());
        assert!(json.get("bytesExpected").is_some());
    }

    #[test]
    fn record_progress_handles_unknown_total() {
        let mut record = ResumeCacheRecord {
            download_link: "https://host/model.bin".to_string(),
            cache_file_name: "model.bin.resume".to_string(),
            bytes_written: 500,
            bytes_expected: -1,
        };
        assert_eq!(record.progress(), None);

        record.bytes_expected = 1000;
        assert_eq!(record.progress(), Some(50.0));
    }

    #[test]
    fn state_normalizes_non_positive_expected() {
        let mut state = TransferState::default();
        assert_eq!(state.expected(), None);

        state.bytes_expected = 0;
        assert_eq!(state.expected(), None);

        state.bytes_expected = 2048;
        assert_eq!(state.expected(), Some(2048));
    }
}
