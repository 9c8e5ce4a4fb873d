//! Driving-load estimate from fused speed and linear acceleration.
//!
//! Everything is normalised per kilogram of vehicle mass so the output is
//! meaningful without knowing the actual car; external dashboards scale it.

/// Road-load model. Defaults describe a mid-size sedan.
#[derive(Clone, Copy, Debug)]
pub struct LoadModel {
    pub mass_kg: f64,
    pub drag_coefficient: f64,
    pub frontal_area_m2: f64,
    pub rolling_resistance: f64,
}

impl Default for LoadModel {
    fn default() -> Self {
        Self {
            mass_kg: 1600.0,
            drag_coefficient: 0.30,
            frontal_area_m2: 2.2,
            rolling_resistance: 0.015,
        }
    }
}

const AIR_DENSITY: f64 = 1.225; // kg/m³ at sea level
const GRAVITY: f64 = 9.81; // m/s²

/// Below this the accelerometer term is all noise.
const MIN_SPEED_MS: f64 = 5.0;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct SpecificPower {
    /// Tractive power per unit mass [W/kg]; zero while coasting or braking.
    pub specific_power_w_per_kg: f64,
    /// Share of the tractive power spent against aerodynamic drag, 0..1.
    pub power_coefficient: f64,
}

/// Tractive power per kilogram needed to sustain `linear_accel` at `speed`.
pub fn specific_power(speed_ms: f64, linear_accel_ms2: f64, model: &LoadModel) -> SpecificPower {
    if speed_ms < MIN_SPEED_MS {
        return SpecificPower::default();
    }

    // Per-kg forces: kinematic, rolling, aerodynamic.
    let f_kinetic = linear_accel_ms2;
    let f_roll = GRAVITY * model.rolling_resistance;
    let f_aero = 0.5 * AIR_DENSITY * model.drag_coefficient * model.frontal_area_m2 * speed_ms
        * speed_ms
        / model.mass_kg;

    let total = f_kinetic + f_roll + f_aero;
    let power = (total * speed_ms).max(0.0);
    let coefficient = if total > 1e-9 {
        (f_aero / total).clamp(0.0, 1.0)
    } else {
        0.0
    };

    SpecificPower {
        specific_power_w_per_kg: power,
        power_coefficient: coefficient,
    }
}
