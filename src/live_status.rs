use crate::types::GpsFix;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn current_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Idle,
    Initialising,
    Active,
}

/// The small JSON heartbeat external dashboards poll. Written atomically
/// every 2 s, deleted on normal shutdown; readers treat a missing file as
/// INACTIVE and an mtime older than 10 s as STALE.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LiveStatus {
    pub session_id: String,
    pub status: SessionStatus,
    pub elapsed_s: f64,
    pub last_update: f64,
    pub gps_fixes: u64,
    pub accel_samples: u64,
    pub gyro_samples: u64,
    pub current_velocity: f64,
    pub current_heading: f64,
    pub total_distance: f64,
    pub latest_gps: Option<GpsFix>,
    pub incidents_count: u64,
    pub memory_mb: f64,
    pub filter_kind: String,
    pub gps_first_fix_latency: Option<f64>,
    pub specific_power_w_per_kg: f64,
    pub power_coefficient: f64,
}

impl LiveStatus {
    pub fn new(session_id: &str) -> Self {
        LiveStatus {
            session_id: session_id.to_string(),
            status: SessionStatus::Idle,
            elapsed_s: 0.0,
            last_update: current_timestamp(),
            gps_fixes: 0,
            accel_samples: 0,
            gyro_samples: 0,
            current_velocity: 0.0,
            current_heading: 0.0,
            total_distance: 0.0,
            latest_gps: None,
            incidents_count: 0,
            memory_mb: 0.0,
            filter_kind: "ekf".to_string(),
            gps_first_fix_latency: None,
            specific_power_w_per_kg: 0.0,
            power_coefficient: 0.0,
        }
    }

    /// Atomic overwrite: serialize to a sibling temp file, then rename over
    /// the live path so readers never observe a torn write.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn delete(path: &Path) {
        let _ = std::fs::remove_file(path);
    }
}

/// Reader-side classification of the status file.
#[derive(Clone, Debug, PartialEq)]
pub enum StatusReading {
    Inactive,
    Stale(LiveStatus),
    Live(LiveStatus),
}

pub fn read_status(path: &Path) -> StatusReading {
    let Ok(metadata) = std::fs::metadata(path) else {
        return StatusReading::Inactive;
    };
    let Ok(content) = std::fs::read_to_string(path) else {
        return StatusReading::Inactive;
    };
    let Ok(status) = serde_json::from_str::<LiveStatus>(&content) else {
        return StatusReading::Inactive;
    };
    let age = metadata
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .unwrap_or(Duration::MAX);
    if age > Duration::from_secs(10) {
        StatusReading::Stale(status)
    } else {
        StatusReading::Live(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_then_read_is_live() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_status.json");

        let mut status = LiveStatus::new("session-1");
        status.status = SessionStatus::Active;
        status.gps_fixes = 42;
        status.save(&path).unwrap();

        match read_status(&path) {
            StatusReading::Live(read) => {
                assert_eq!(read.session_id, "session-1");
                assert_eq!(read.gps_fixes, 42);
                assert_eq!(read.status, SessionStatus::Active);
            }
            other => panic!("expected live, got {other:?}"),
        }

        // No temp file left behind after the rename.
        assert!(!dir.path().join("live_status.json.tmp").exists());
    }

    #[test]
    fn missing_file_is_inactive() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            read_status(&dir.path().join("live_status.json")),
            StatusReading::Inactive
        );
    }

    #[test]
    fn old_mtime_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_status.json");
        LiveStatus::new("s").save(&path).unwrap();

        let old = SystemTime::now() - Duration::from_secs(30);
        let file = std::fs::File::options().append(true).open(&path).unwrap();
        file.set_modified(old).unwrap();
        drop(file);

        assert!(matches!(read_status(&path), StatusReading::Stale(_)));
    }

    #[test]
    fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("live_status.json");
        LiveStatus::new("s").save(&path).unwrap();
        LiveStatus::delete(&path);
        LiveStatus::delete(&path);
        assert_eq!(read_status(&path), StatusReading::Inactive);
    }
}
