use crate::error::PersistError;
use crate::incident::IncidentRecord;
use crate::metrics::FinalMetrics;
use crate::types::{
    AccelSample, BoundedRing, CovarianceSnapshot, GpsFix, GyroSample, Sample, TrajectoryPoint,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, Write};
use std::path::{Path, PathBuf};

/// Caps on the raw-sample accumulators between saves. A save every 15 s at
/// 50 Hz needs ~750 slots per IMU stream; the headroom covers a stalled
/// persistence thread without unbounded growth.
const ACCUM_IMU_CAP: usize = 4096;
const ACCUM_GPS_CAP: usize = 256;
const ACCUM_INCIDENT_CAP: usize = 128;

/// On-disk session schema.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFile {
    pub start_time: f64,
    pub duration_seconds: f64,
    pub gps_fixes: u64,
    pub gps_samples: Vec<GpsFix>,
    pub accel_samples: Vec<AccelSample>,
    pub gyro_samples: Vec<GyroSample>,
    pub incidents: Vec<IncidentRecord>,
    pub ekf_trajectory: Vec<TrajectoryPoint>,
    pub comp_trajectory: Vec<TrajectoryPoint>,
    pub covariance_snapshots: Vec<CovarianceSnapshot>,
    pub final_metrics: FinalMetrics,
    pub peak_memory_mb: f64,
}

/// In-memory session state between saves. Raw sample buffers and the
/// incident list are cleared after each successful save; the trajectory and
/// covariance rings are already bounded and persist across saves.
pub struct SessionAccumulator {
    pub start_time: f64,
    accel: BoundedRing<AccelSample>,
    gyro: BoundedRing<GyroSample>,
    gps: BoundedRing<GpsFix>,
    incidents: Vec<IncidentRecord>,
    ekf_trajectory: BoundedRing<TrajectoryPoint>,
    comp_trajectory: BoundedRing<TrajectoryPoint>,
    covariance: BoundedRing<CovarianceSnapshot>,
    gps_fixes: u64,
    saves: u64,
}

impl SessionAccumulator {
    pub fn new(start_time: f64, trajectory_ring: usize, covariance_ring: usize) -> Self {
        SessionAccumulator {
            start_time,
            accel: BoundedRing::new(ACCUM_IMU_CAP),
            gyro: BoundedRing::new(ACCUM_IMU_CAP),
            gps: BoundedRing::new(ACCUM_GPS_CAP),
            incidents: Vec::new(),
            ekf_trajectory: BoundedRing::new(trajectory_ring),
            comp_trajectory: BoundedRing::new(trajectory_ring),
            covariance: BoundedRing::new(covariance_ring),
            gps_fixes: 0,
            saves: 0,
        }
    }

    pub fn record_sample(&mut self, sample: &Sample) {
        match sample {
            Sample::Accel(a) => self.accel.push(a.clone()),
            Sample::Gyro(g) => self.gyro.push(g.clone()),
            Sample::Gps(fix) => {
                self.gps.push(fix.clone());
                self.gps_fixes += 1;
            }
        }
    }

    pub fn record_incident(&mut self, record: IncidentRecord) {
        if self.incidents.len() < ACCUM_INCIDENT_CAP {
            self.incidents.push(record);
        }
    }

    pub fn record_ekf_point(&mut self, point: TrajectoryPoint) {
        self.ekf_trajectory.push(point);
    }

    pub fn record_comp_point(&mut self, point: TrajectoryPoint) {
        self.comp_trajectory.push(point);
    }

    pub fn record_covariance(&mut self, snapshot: CovarianceSnapshot) {
        self.covariance.push(snapshot);
    }

    pub fn incident_count(&self) -> usize {
        self.incidents.len()
    }

    pub fn saves(&self) -> u64 {
        self.saves
    }

    pub fn build_file(
        &self,
        duration_seconds: f64,
        final_metrics: FinalMetrics,
        peak_memory_mb: f64,
    ) -> SessionFile {
        SessionFile {
            start_time: self.start_time,
            duration_seconds,
            gps_fixes: self.gps_fixes,
            gps_samples: self.gps.to_vec(),
            accel_samples: self.accel.to_vec(),
            gyro_samples: self.gyro.to_vec(),
            incidents: self.incidents.clone(),
            ekf_trajectory: self.ekf_trajectory.to_vec(),
            comp_trajectory: self.comp_trajectory.to_vec(),
            covariance_snapshots: self.covariance.to_vec(),
            final_metrics,
            peak_memory_mb,
        }
    }

    /// Clear-after-save: raw sample buffers and the incident list drain once
    /// the bytes are durable on disk. Trajectory rings stay.
    pub fn clear_after_save(&mut self) {
        self.accel.clear();
        self.gyro.clear();
        self.gps.clear();
        self.incidents.clear();
        self.saves += 1;
    }
}

/// Serialize to a sibling temp file, fsync, then rename over the session
/// path. Readers never observe a torn session file.
pub fn save_session(path: &Path, session: &SessionFile, gzip: bool) -> Result<PathBuf, PersistError> {
    let json = serde_json::to_string_pretty(session)?;
    let tmp = path.with_extension("tmp");

    {
        let file = File::create(&tmp)?;
        if gzip {
            let mut encoder = GzEncoder::new(file, Compression::default());
            encoder.write_all(json.as_bytes())?;
            let file = encoder.finish()?;
            file.sync_all()?;
        } else {
            let mut file = file;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
    }

    std::fs::rename(&tmp, path)?;
    Ok(path.to_path_buf())
}

/// Load a session written by `save_session`; gzip is detected by extension.
pub fn load_session(path: &Path) -> Result<SessionFile, PersistError> {
    let file = File::open(path)?;
    if path.extension().map(|e| e == "gz").unwrap_or(false) {
        let reader = BufReader::new(GzDecoder::new(file));
        Ok(serde_json::from_reader(reader)?)
    } else {
        let reader = BufReader::new(file);
        Ok(serde_json::from_reader(reader)?)
    }
}

/// File name for the rolling autosave target.
pub fn session_file_name(gzip: bool) -> &'static str {
    if gzip {
        "current_session.json.gz"
    } else {
        "current_session.json"
    }
}

/// Promote the rolling autosave into a timestamped final session file.
pub fn finalize_session(
    output_dir: &Path,
    current: &Path,
    stamp: &str,
    gzip: bool,
) -> Result<PathBuf, PersistError> {
    let suffix = if gzip { "json.gz" } else { "json" };
    let final_path = output_dir.join(format!("session_{stamp}.{suffix}"));
    std::fs::copy(current, &final_path)?;
    info!("[SAVE] final session at {}", final_path.display());
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incident::{ContextWindow, IncidentKind};

    fn sample_session() -> SessionFile {
        SessionFile {
            start_time: 1000.0,
            duration_seconds: 120.0,
            gps_fixes: 2,
            gps_samples: vec![GpsFix {
                timestamp: 1001.0,
                latitude: 32.2,
                longitude: -110.9,
                altitude: Some(740.0),
                accuracy: 4.0,
                speed: 9.5,
                bearing: Some(88.0),
            }],
            accel_samples: vec![AccelSample {
                timestamp: 1001.02,
                x: 0.1,
                y: -0.2,
                z: 9.79,
            }],
            gyro_samples: vec![GyroSample {
                timestamp: 1001.02,
                x: 0.001,
                y: 0.0,
                z: -0.002,
            }],
            incidents: vec![IncidentRecord {
                timestamp: 1050.0,
                kind: IncidentKind::Swerve,
                magnitude: 1.2,
                threshold: 1.047,
                gps_speed: Some(10.0),
                latitude: Some(32.2),
                longitude: Some(-110.9),
                window: ContextWindow::default(),
            }],
            ekf_trajectory: vec![TrajectoryPoint {
                timestamp: 1002.0,
                x: 1.0,
                y: 2.0,
                velocity: 9.4,
                heading_deg: 88.0,
                uncertainty_m: 2.5,
            }],
            comp_trajectory: vec![],
            covariance_snapshots: vec![CovarianceSnapshot {
                timestamp: 1002.0,
                trace: 12.5,
                diag: [0.1, 0.1, 0.1, 0.1, 0.01, 0.01, 0.01, 1.0],
            }],
            final_metrics: FinalMetrics {
                duration_seconds: 120.0,
                bias_magnitude: 0.0037,
                ..FinalMetrics::default()
            },
            peak_memory_mb: 48.2,
        }
    }

    #[test]
    fn session_round_trips_plain_and_gzipped() {
        let dir = tempfile::tempdir().unwrap();
        let session = sample_session();

        let plain = dir.path().join("current_session.json");
        save_session(&plain, &session, false).unwrap();
        assert_eq!(load_session(&plain).unwrap(), session);

        let gz = dir.path().join("current_session.json.gz");
        save_session(&gz, &session, true).unwrap();
        assert_eq!(load_session(&gz).unwrap(), session);

        // No temp files survive the rename.
        let leftovers: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map(|x| x == "tmp").unwrap_or(false))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn clear_after_save_drains_raw_buffers_only() {
        let mut acc = SessionAccumulator::new(0.0, 1000, 2000);
        acc.record_sample(&Sample::Accel(AccelSample {
            timestamp: 1.0,
            x: 0.0,
            y: 0.0,
            z: 9.8,
        }));
        acc.record_sample(&Sample::Gps(GpsFix {
            timestamp: 1.0,
            latitude: 32.2,
            longitude: -110.9,
            altitude: None,
            accuracy: 5.0,
            speed: 0.0,
            bearing: None,
        }));
        acc.record_incident(sample_session().incidents[0].clone());
        acc.record_ekf_point(sample_session().ekf_trajectory[0].clone());
        acc.record_covariance(sample_session().covariance_snapshots[0].clone());

        let before = acc.build_file(10.0, FinalMetrics::default(), 40.0);
        assert_eq!(before.accel_samples.len(), 1);
        assert_eq!(before.incidents.len(), 1);

        acc.clear_after_save();
        let after = acc.build_file(20.0, FinalMetrics::default(), 40.0);
        assert!(after.accel_samples.is_empty());
        assert!(after.gps_samples.is_empty());
        assert!(after.incidents.is_empty());
        // Bounded rings survive the save.
        assert_eq!(after.ekf_trajectory.len(), 1);
        assert_eq!(after.covariance_snapshots.len(), 1);
        // Totals keep counting across saves.
        assert_eq!(after.gps_fixes, 1);
        assert_eq!(acc.saves(), 1);
    }

    #[test]
    fn trajectory_rings_stay_bounded() {
        let mut acc = SessionAccumulator::new(0.0, 10, 20);
        for i in 0..100 {
            acc.record_ekf_point(TrajectoryPoint {
                timestamp: i as f64,
                x: 0.0,
                y: 0.0,
                velocity: 0.0,
                heading_deg: 0.0,
                uncertainty_m: 0.0,
            });
            acc.record_covariance(CovarianceSnapshot {
                timestamp: i as f64,
                trace: 0.0,
                diag: [0.0; 8],
            });
        }
        let file = acc.build_file(100.0, FinalMetrics::default(), 0.0);
        assert_eq!(file.ekf_trajectory.len(), 10);
        assert_eq!(file.covariance_snapshots.len(), 20);
        // The newest points are the ones retained.
        assert_eq!(file.ekf_trajectory.last().unwrap().timestamp, 99.0);
    }

    #[test]
    fn saved_raw_samples_replay_deterministically() {
        use crate::config::EngineConfig;
        use crate::fusion::FusionPipeline;
        use crate::types::{latlon_to_enu, EARTH_RADIUS_M};

        let (lat0, lon0): (f64, f64) = (32.2, -110.9);
        let config = EngineConfig::default();
        let mut pipeline = FusionPipeline::new(config.clone());
        let mut acc = SessionAccumulator::new(0.0, 1000, 2000);

        // 4 s parked (calibration window), then 30 s eastbound at 15 m/s.
        let mut samples: Vec<Sample> = Vec::new();
        let mut t = 0.0;
        for _ in 0..200 {
            t += 0.02;
            samples.push(Sample::Accel(AccelSample {
                timestamp: t,
                x: 0.0,
                y: 0.0,
                z: 9.81,
            }));
            samples.push(Sample::Gyro(GyroSample {
                timestamp: t,
                x: 0.001,
                y: 0.0,
                z: -0.001,
            }));
        }
        for second in 0..30 {
            for _ in 0..50 {
                t += 0.02;
                samples.push(Sample::Accel(AccelSample {
                    timestamp: t,
                    x: 0.0,
                    y: 0.0,
                    z: 9.81,
                }));
                samples.push(Sample::Gyro(GyroSample {
                    timestamp: t,
                    x: 0.001,
                    y: 0.0,
                    z: -0.001,
                }));
            }
            let east = 15.0 * (second + 1) as f64;
            let lon = lon0
                + (east / (EARTH_RADIUS_M * lat0.to_radians().cos())).to_degrees();
            // Sanity on the projection helper itself.
            let (back_east, _) = latlon_to_enu(lat0, lon, lat0, lon0);
            assert!((back_east - east).abs() < 0.01);
            samples.push(Sample::Gps(GpsFix {
                timestamp: t,
                latitude: lat0,
                longitude: lon,
                altitude: None,
                accuracy: 5.0,
                speed: 15.0,
                bearing: Some(90.0),
            }));
        }

        for sample in &samples {
            acc.record_sample(sample);
            pipeline.handle(sample);
        }
        let recorded_distance = pipeline.metrics.export().ekf_distance_m;
        assert!(recorded_distance > 400.0);

        // Persist, reload, and re-drive a fresh pipeline from the raw data.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("current_session.json.gz");
        let file = acc.build_file(t, FinalMetrics::default(), 0.0);
        save_session(&path, &file, true).unwrap();
        let loaded = load_session(&path).unwrap();

        let mut replayed: Vec<Sample> = Vec::new();
        replayed.extend(loaded.accel_samples.iter().cloned().map(Sample::Accel));
        replayed.extend(loaded.gyro_samples.iter().cloned().map(Sample::Gyro));
        replayed.extend(loaded.gps_samples.iter().cloned().map(Sample::Gps));
        replayed.sort_by(|a, b| {
            a.timestamp()
                .partial_cmp(&b.timestamp())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        assert_eq!(replayed.len(), samples.len());

        let mut fresh = FusionPipeline::new(config);
        for sample in &replayed {
            fresh.handle(sample);
        }
        let replayed_distance = fresh.metrics.export().ekf_distance_m;
        assert!(
            (replayed_distance - recorded_distance).abs() < 1e-6,
            "{recorded_distance} vs {replayed_distance}"
        );
    }

    #[test]
    fn finalize_copies_current_session() {
        let dir = tempfile::tempdir().unwrap();
        let current = dir.path().join(session_file_name(false));
        save_session(&current, &sample_session(), false).unwrap();
        let final_path = finalize_session(dir.path(), &current, "20260801_120000", false).unwrap();
        assert!(final_path.exists());
        assert_eq!(load_session(&final_path).unwrap(), sample_session());
    }
}
