use crate::config::EngineConfig;
use crate::types::{AccelSample, BoundedRing, GpsFix, GyroSample, STANDARD_GRAVITY};
use log::info;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentKind {
    HardBrake,
    Swerve,
    Impact,
}

impl IncidentKind {
    pub fn name(&self) -> &'static str {
        match self {
            IncidentKind::HardBrake => "hard_brake",
            IncidentKind::Swerve => "swerve",
            IncidentKind::Impact => "impact",
        }
    }
}

/// Raw-data slice around a trigger: 30 s before and 30 s after.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextWindow {
    pub accel: Vec<AccelSample>,
    pub gyro: Vec<GyroSample>,
    pub gps: Vec<GpsFix>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub timestamp: f64,
    pub kind: IncidentKind,
    /// g for accelerometer-class incidents, rad/s for swerve.
    pub magnitude: f64,
    pub threshold: f64,
    pub gps_speed: Option<f64>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub window: ContextWindow,
}

impl IncidentRecord {
    /// `incident_<tsec>_<frac>_<kind>.json`
    pub fn file_name(&self) -> String {
        let secs = self.timestamp.trunc() as i64;
        let frac = ((self.timestamp.fract() * 1000.0).round() as i64).clamp(0, 999);
        format!("incident_{}_{:03}_{}.json", secs, frac, self.kind.name())
    }
}

/// Write one incident to its own JSON file under the incidents directory.
pub fn write_incident_file(dir: &Path, record: &IncidentRecord) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(record.file_name());
    let json = serde_json::to_string_pretty(record)?;
    std::fs::write(&path, json)?;
    Ok(path)
}

struct PendingIncident {
    record: IncidentRecord,
    post_deadline: f64,
}

/// Detects hard braking, swerving, and impacts from the filtered stream,
/// keeping native-rate ring buffers so each emitted record carries its full
/// pre/post context.
pub struct IncidentDetector {
    brake_threshold_mps2: f64,
    swerve_threshold_rads: f64,
    swerve_min_speed: f64,
    impact_threshold_mps2: f64,
    cooldown_secs: f64,
    window_secs: f64,

    accel_ring: BoundedRing<AccelSample>,
    gyro_ring: BoundedRing<GyroSample>,
    gps_ring: BoundedRing<GpsFix>,

    last_trigger: [f64; 3],
    pending: Vec<PendingIncident>,
    emitted: u64,
}

impl IncidentDetector {
    pub fn new(config: &EngineConfig) -> Self {
        // Rings sized for a full pre-window at native rates (50 Hz IMU,
        // 1 Hz GPS) with headroom for jitter.
        let imu_capacity = (config.incident_window_secs * 55.0) as usize;
        let gps_capacity = (config.incident_window_secs * 1.5) as usize + 5;
        IncidentDetector {
            brake_threshold_mps2: config.brake_threshold_g * STANDARD_GRAVITY,
            swerve_threshold_rads: config.swerve_threshold_rads,
            swerve_min_speed: config.swerve_min_speed,
            impact_threshold_mps2: config.impact_threshold_g * STANDARD_GRAVITY,
            cooldown_secs: config.incident_cooldown_secs,
            window_secs: config.incident_window_secs,
            accel_ring: BoundedRing::new(imu_capacity),
            gyro_ring: BoundedRing::new(imu_capacity),
            gps_ring: BoundedRing::new(gps_capacity),
            last_trigger: [f64::NEG_INFINITY; 3],
            pending: Vec::new(),
            emitted: 0,
        }
    }

    pub fn emitted_count(&self) -> u64 {
        self.emitted
    }

    pub fn feed_accel(&mut self, sample: &AccelSample) {
        for p in &mut self.pending {
            if sample.timestamp <= p.post_deadline {
                p.record.window.accel.push(sample.clone());
            }
        }
        self.accel_ring.push(sample.clone());
    }

    pub fn feed_gyro(&mut self, sample: &GyroSample) {
        for p in &mut self.pending {
            if sample.timestamp <= p.post_deadline {
                p.record.window.gyro.push(sample.clone());
            }
        }
        self.gyro_ring.push(sample.clone());
    }

    pub fn feed_gps(&mut self, fix: &GpsFix) {
        for p in &mut self.pending {
            if fix.timestamp <= p.post_deadline {
                p.record.window.gps.push(fix.clone());
            }
        }
        self.gps_ring.push(fix.clone());
    }

    /// Evaluate one filtered tick. `linear_accel_mps2` is gravity-corrected;
    /// `raw_accel_mps2` is the unfiltered magnitude (impacts dwarf gravity);
    /// `yaw_rate` is bias-corrected gyro z.
    pub fn observe(
        &mut self,
        timestamp: f64,
        linear_accel_mps2: f64,
        raw_accel_mps2: f64,
        yaw_rate: f64,
        gps_speed: Option<f64>,
        position: Option<(f64, f64)>,
    ) {
        // Highest severity first; one trigger per tick.
        if raw_accel_mps2 > self.impact_threshold_mps2 {
            self.trigger(
                IncidentKind::Impact,
                timestamp,
                raw_accel_mps2 / STANDARD_GRAVITY,
                self.impact_threshold_mps2 / STANDARD_GRAVITY,
                gps_speed,
                position,
            );
            return;
        }

        if linear_accel_mps2 > self.brake_threshold_mps2 {
            self.trigger(
                IncidentKind::HardBrake,
                timestamp,
                linear_accel_mps2 / STANDARD_GRAVITY,
                self.brake_threshold_mps2 / STANDARD_GRAVITY,
                gps_speed,
                position,
            );
            return;
        }

        // Swerve is gated on GPS speed so phone-in-hand rotation while
        // parked never fires.
        if yaw_rate.abs() > self.swerve_threshold_rads {
            if let Some(speed) = gps_speed {
                if speed > self.swerve_min_speed {
                    self.trigger(
                        IncidentKind::Swerve,
                        timestamp,
                        yaw_rate.abs(),
                        self.swerve_threshold_rads,
                        gps_speed,
                        position,
                    );
                }
            }
        }
    }

    fn trigger(
        &mut self,
        kind: IncidentKind,
        timestamp: f64,
        magnitude: f64,
        threshold: f64,
        gps_speed: Option<f64>,
        position: Option<(f64, f64)>,
    ) {
        let slot = kind as usize;
        if timestamp - self.last_trigger[slot] < self.cooldown_secs {
            // Same manoeuvre, still ramping: record its peak, not the first
            // threshold crossing.
            for p in &mut self.pending {
                if p.record.kind == kind && magnitude > p.record.magnitude {
                    p.record.magnitude = magnitude;
                }
            }
            return;
        }
        self.last_trigger[slot] = timestamp;

        let pre_start = timestamp - self.window_secs;
        let window = ContextWindow {
            accel: self
                .accel_ring
                .iter()
                .filter(|s| s.timestamp >= pre_start)
                .cloned()
                .collect(),
            gyro: self
                .gyro_ring
                .iter()
                .filter(|s| s.timestamp >= pre_start)
                .cloned()
                .collect(),
            gps: self
                .gps_ring
                .iter()
                .filter(|s| s.timestamp >= pre_start)
                .cloned()
                .collect(),
        };

        info!(
            "[INCIDENT] {} at {timestamp:.3}: magnitude {magnitude:.2} (threshold {threshold:.2})",
            kind.name()
        );
        self.pending.push(PendingIncident {
            record: IncidentRecord {
                timestamp,
                kind,
                magnitude,
                threshold,
                gps_speed,
                latitude: position.map(|p| p.0),
                longitude: position.map(|p| p.1),
                window,
            },
            post_deadline: timestamp + self.window_secs,
        });
    }

    /// Emit every pending incident whose post-window has elapsed. Called at
    /// sample cadence and once more on session stop with `flush = true`.
    pub fn collect_matured(&mut self, now: f64, flush: bool) -> Vec<IncidentRecord> {
        let mut matured = Vec::new();
        let mut remaining = Vec::new();
        for pending in self.pending.drain(..) {
            if flush || now >= pending.post_deadline {
                matured.push(pending.record);
            } else {
                remaining.push(pending);
            }
        }
        self.pending = remaining;
        self.emitted += matured.len() as u64;
        matured
    }
}
