use crate::config::EngineConfig;
use crate::types::SensorKind;
use std::time::{Duration, Instant};

/// Silence model for one sensor: a daemon is unhealthy when its published
/// `last_sample_instant` has not advanced within the threshold. Before the
/// first sample, silence is measured from monitor creation so a backend that
/// never produces still trips the threshold.
#[derive(Clone, Debug)]
pub struct SensorHealth {
    pub kind: SensorKind,
    pub silence_threshold: Duration,
    baseline: Instant,
}

impl SensorHealth {
    pub fn new(kind: SensorKind, silence_threshold_secs: u64) -> Self {
        SensorHealth {
            kind,
            silence_threshold: Duration::from_secs(silence_threshold_secs),
            baseline: Instant::now(),
        }
    }

    pub fn for_kind(kind: SensorKind, config: &EngineConfig) -> Self {
        let secs = match kind {
            SensorKind::Accel => config.accel_silence_secs,
            SensorKind::Gyro => config.gyro_silence_secs,
            SensorKind::Gps => config.gps_silence_secs,
        };
        Self::new(kind, secs)
    }

    pub fn silence(&self, last_sample: Option<Instant>) -> Duration {
        let reference = last_sample.unwrap_or(self.baseline);
        Instant::now().saturating_duration_since(reference)
    }

    pub fn is_silent(&self, last_sample: Option<Instant>) -> bool {
        self.silence(last_sample) > self.silence_threshold
    }

    pub fn report(&self, last_sample: Option<Instant>, alive: bool) -> SensorReport {
        let silence = self.silence(last_sample);
        SensorReport {
            kind: self.kind,
            healthy: alive && !self.is_silent(last_sample),
            alive,
            silence,
        }
    }
}

#[derive(Clone, Debug)]
pub struct SensorReport {
    pub kind: SensorKind,
    pub healthy: bool,
    pub alive: bool,
    pub silence: Duration,
}

/// Snapshot of every monitored sensor at one health tick.
#[derive(Clone, Debug, Default)]
pub struct HealthReport {
    pub sensors: Vec<SensorReport>,
}

impl HealthReport {
    pub fn get(&self, kind: SensorKind) -> Option<&SensorReport> {
        self.sensors.iter().find(|r| r.kind == kind)
    }

    pub fn is_healthy(&self, kind: SensorKind) -> bool {
        self.get(kind).map(|r| r.healthy).unwrap_or(false)
    }

    pub fn unhealthy(&self) -> impl Iterator<Item = &SensorReport> {
        self.sensors.iter().filter(|r| !r.healthy)
    }

    pub fn format_status(&self) -> String {
        let parts: Vec<String> = self
            .sensors
            .iter()
            .map(|r| {
                if r.healthy {
                    format!("{} ok", r.kind.name())
                } else if !r.alive {
                    format!("{} dead", r.kind.name())
                } else {
                    format!("{} silent {:.1}s", r.kind.name(), r.silence.as_secs_f64())
                }
            })
            .collect();
        format!("Health: {}", parts.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_sample_is_healthy() {
        let health = SensorHealth::new(SensorKind::Accel, 5);
        assert!(!health.is_silent(Some(Instant::now())));
    }

    #[test]
    fn stale_sample_is_silent() {
        let health = SensorHealth::new(SensorKind::Accel, 1);
        let stale = Instant::now() - Duration::from_secs(3);
        assert!(health.is_silent(Some(stale)));
        assert!(health.silence(Some(stale)) >= Duration::from_secs(3));
    }

    #[test]
    fn no_sample_measures_from_monitor_start() {
        let health = SensorHealth::new(SensorKind::Gps, 30);
        // Just created: not silent yet even with no samples ever.
        assert!(!health.is_silent(None));
    }

    #[test]
    fn dead_process_is_unhealthy_even_with_recent_samples() {
        let health = SensorHealth::new(SensorKind::Accel, 5);
        let report = health.report(Some(Instant::now()), false);
        assert!(!report.healthy);
        assert!(!report.alive);
    }

    #[test]
    fn thresholds_follow_config_per_kind() {
        let config = EngineConfig::default();
        let gps = SensorHealth::for_kind(SensorKind::Gps, &config);
        let accel = SensorHealth::for_kind(SensorKind::Accel, &config);
        assert_eq!(gps.silence_threshold, Duration::from_secs(30));
        assert_eq!(accel.silence_threshold, Duration::from_secs(5));
    }

    #[test]
    fn status_line_names_silent_sensors() {
        let accel = SensorHealth::new(SensorKind::Accel, 5);
        let gps = SensorHealth::new(SensorKind::Gps, 30);
        let report = HealthReport {
            sensors: vec![
                accel.report(Some(Instant::now()), true),
                gps.report(Some(Instant::now() - Duration::from_secs(60)), true),
            ],
        };
        let line = report.format_status();
        assert!(line.contains("accel ok"));
        assert!(line.contains("gps silent"));
    }
}
