//! Health and process status reporting.

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use std::time::Instant;

/// Liveness and readiness of the dataplane.
///
/// `ready` turns true once the first apply pass has completed without
/// errors and stays true from then on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub live: bool,
    pub ready: bool,
}

/// Periodic status message sent on the outbound channel.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessStatus {
    pub iso_timestamp: String,
    pub uptime_secs: f64,
}

impl ProcessStatus {
    pub fn now(started: Instant) -> Self {
        Self {
            iso_timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            uptime_secs: started.elapsed().as_secs_f64(),
        }
    }
}

/// Messages sent from the dataplane to whoever drives it.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataplaneStatus {
    ProcessStatus(ProcessStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_status_timestamp() {
        let status = ProcessStatus::now(Instant::now());
        assert!(status.iso_timestamp.ends_with('Z'));
        assert!(chrono::DateTime::parse_from_rfc3339(&status.iso_timestamp).is_ok());
        assert!(status.uptime_secs >= 0.0);
    }

    #[test]
    fn test_status_json() {
        let msg = DataplaneStatus::ProcessStatus(ProcessStatus {
            iso_timestamp: "2026-01-01T00:00:00Z".to_string(),
            uptime_secs: 1.5,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert_eq!(
            json,
            r#"{"type":"process_status","iso_timestamp":"2026-01-01T00:00:00Z","uptime_secs":1.5}"#
        );
    }
}
