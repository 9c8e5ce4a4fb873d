use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Mean Earth radius used for local-frame projections [meters].
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Standard gravity for g-force conversions [m/s²].
pub const STANDARD_GRAVITY: f64 = 9.80665;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AccelSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl AccelSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GyroSample {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl GyroSample {
    pub fn magnitude(&self) -> f64 {
        (self.x * self.x + self.y * self.y + self.z * self.z).sqrt()
    }
}

/// A single GPS fix. Altitude and bearing are optional on the wire; the
/// pipeline tolerates their absence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GpsFix {
    pub timestamp: f64,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub altitude: Option<f64>,
    pub accuracy: f64,
    pub speed: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing: Option<f64>,
}

/// Tagged sensor sample. Shape validation happens once, at subprocess parse
/// time; downstream code matches on the variant and never re-introspects.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Sample {
    Accel(AccelSample),
    Gyro(GyroSample),
    Gps(GpsFix),
}

impl Sample {
    pub fn timestamp(&self) -> f64 {
        match self {
            Sample::Accel(s) => s.timestamp,
            Sample::Gyro(s) => s.timestamp,
            Sample::Gps(s) => s.timestamp,
        }
    }

    pub fn kind(&self) -> SensorKind {
        match self {
            Sample::Accel(_) => SensorKind::Accel,
            Sample::Gyro(_) => SensorKind::Gyro,
            Sample::Gps(_) => SensorKind::Gps,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Accel,
    Gyro,
    Gps,
}

impl SensorKind {
    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Accel => "accel",
            SensorKind::Gyro => "gyro",
            SensorKind::Gps => "gps",
        }
    }
}

impl std::fmt::Display for SensorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One fused trajectory estimate per cadence tick.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub velocity: f64,
    pub heading_deg: f64,
    pub uncertainty_m: f64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CovarianceSnapshot {
    pub timestamp: f64,
    pub trace: f64,
    pub diag: [f64; 8],
}

/// Fixed-capacity ring. Pushing beyond capacity evicts the oldest entry, so
/// memory stays bounded for arbitrary session lengths.
#[derive(Clone, Debug)]
pub struct BoundedRing<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> BoundedRing<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn latest(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Clone> BoundedRing<T> {
    pub fn to_vec(&self) -> Vec<T> {
        self.items.iter().cloned().collect()
    }
}

/// Project (lat, lon) into the local East-North tangent plane anchored at the
/// origin fix. Equirectangular approximation, fine for drive-length sessions.
pub fn latlon_to_enu(lat: f64, lon: f64, origin_lat: f64, origin_lon: f64) -> (f64, f64) {
    let d_lat = (lat - origin_lat).to_radians();
    let d_lon = (lon - origin_lon).to_radians();
    let east = EARTH_RADIUS_M * d_lon * origin_lat.to_radians().cos();
    let north = EARTH_RADIUS_M * d_lat;
    (east, north)
}

pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_evicts_oldest() {
        let mut ring = BoundedRing::new(3);
        for i in 0..5 {
            ring.push(i);
        }
        assert_eq!(ring.len(), 3);
        let items: Vec<_> = ring.iter().copied().collect();
        assert_eq!(items, vec![2, 3, 4]);
        assert_eq!(ring.latest(), Some(&4));
    }

    #[test]
    fn sample_tagging_survives_serde() {
        let sample = Sample::Gps(GpsFix {
            timestamp: 100.0,
            latitude: 32.2,
            longitude: -110.9,
            altitude: None,
            accuracy: 5.0,
            speed: 12.0,
            bearing: Some(90.0),
        });
        let json = serde_json::to_string(&sample).unwrap();
        let back: Sample = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), SensorKind::Gps);
        assert_eq!(back.timestamp(), 100.0);
    }

    #[test]
    fn gps_fix_tolerates_missing_bearing() {
        let json = r#"{"timestamp":1.0,"latitude":32.0,"longitude":-110.0,"accuracy":4.0,"speed":0.0}"#;
        let fix: GpsFix = serde_json::from_str(json).unwrap();
        assert!(fix.bearing.is_none());
        assert!(fix.altitude.is_none());
    }

    #[test]
    fn haversine_matches_enu_for_short_baselines() {
        let (lat1, lon1) = (32.2000, -110.9000);
        let (lat2, lon2) = (32.2010, -110.9000);
        let hav = haversine_distance(lat1, lon1, lat2, lon2);
        let (e, n) = latlon_to_enu(lat2, lon2, lat1, lon1);
        let enu = (e * e + n * n).sqrt();
        assert!((hav - enu).abs() < 0.5, "hav={hav} enu={enu}");
    }
}
