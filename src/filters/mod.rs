pub mod complementary;
pub mod ekf;

use crate::types::Sample;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterKind {
    Ekf,
    Complementary,
}

impl FilterKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilterKind::Ekf => "ekf",
            FilterKind::Complementary => "complementary",
        }
    }
}

/// Cross-filter context the pipeline derives from the raw stream; filters
/// must not re-derive it themselves.
#[derive(Clone, Copy, Debug, Default)]
pub struct AdvanceContext {
    /// Device judged stationary (accel magnitude near gravity, gyro quiet).
    pub stationary: bool,
    /// Latest GPS ground speed, when any fix has arrived.
    pub gps_speed: Option<f64>,
}

/// Planar output common to every filter variant, sampled at status cadence.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct FilterOutput {
    pub timestamp: f64,
    pub x: f64,
    pub y: f64,
    pub velocity: f64,
    pub heading_deg: f64,
    pub uncertainty_m: f64,
    pub distance: f64,
}

/// Common contract for filter variants: consume the shared sample stream,
/// expose a planar state. The orchestrator records trajectories for every
/// registered filter through this seam.
pub trait MotionFilter {
    fn kind(&self) -> FilterKind;
    fn advance(&mut self, sample: &Sample, ctx: &AdvanceContext);
    fn output(&self) -> FilterOutput;
}
