//! Displacement to thrust conversion for the torsion balance

use crate::error::{Error, Result};

/// Geometry and stiffness of the balance. Validated once, never mutated.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct CalibrationModel {
    /// Torsional stiffness k in N·m/rad
    stiffness: f64,
    /// Pivot to thruster distance in m
    thrust_arm: f64,
    /// Pivot to displacement sensor distance in m
    sensor_arm: f64,
}

fn positive(name: &str, value: f64) -> Result<f64> {
    if value.is_finite() && value > 0.0 {
        Ok(value)
    } else {
        Err(Error::InvalidCalibration(format!(
            "{name} must be positive, got {value}"
        )))
    }
}

impl CalibrationModel {
    pub fn new(stiffness: f64, thrust_arm: f64, sensor_arm: f64) -> Result<Self> {
        Ok(Self {
            stiffness: positive("torsional stiffness", stiffness)?,
            thrust_arm: positive("thrust arm length", thrust_arm)?,
            sensor_arm: positive("sensor arm length", sensor_arm)?,
        })
    }

    pub fn stiffness(&self) -> f64 {
        self.stiffness
    }

    pub fn thrust_arm(&self) -> f64 {
        self.thrust_arm
    }

    pub fn sensor_arm(&self) -> f64 {
        self.sensor_arm
    }

    /// Deflection angle in rad. Small-angle approximation (tan θ ≈ θ), only
    /// meaningful while the beam stays within a few degrees.
    pub fn angle(&self, displacement_um: f64) -> f64 {
        (displacement_um / 1e6) / self.sensor_arm
    }

    /// Thrust in mN for a displacement in µm
    pub fn to_thrust(&self, displacement_um: f64) -> f64 {
        let torque = self.stiffness * self.angle(displacement_um);
        torque / self.thrust_arm * 1000.0
    }

    pub fn to_thrust_series(&self, displacement_um: &[f64]) -> Vec<f64> {
        displacement_um.iter().map(|&d| self.to_thrust(d)).collect()
    }
}
