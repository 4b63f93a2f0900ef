//! Constant-velocity Kalman filter for identity motion.
//!
//! # State Vector
//! ```text
//! [cx, cy, vx, vy]
//!  ^center ^velocity (per frame)
//! ```
//!
//! Only the center is measured. Covariance is propagated in full
//! (4x4), with the measurement model `H = [I2 0]`.

use percept_models::Velocity;
use serde::{Deserialize, Serialize};

use crate::config::IdentityConfig;

type Matrix4 = [[f64; 4]; 4];

/// Initial variance on position (normalized units squared).
const INITIAL_POS_VARIANCE: f64 = 1e-2;
/// Initial variance on velocity; high because nothing is known yet.
const INITIAL_VEL_VARIANCE: f64 = 1e-1;

/// Kalman filter state, stored inline on each identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionFilter {
    state: [f64; 4],
    covariance: Matrix4,
    process_noise_pos: f64,
    process_noise_vel: f64,
    measurement_noise: f64,
}

impl MotionFilter {
    /// Start a filter at the given center with zero velocity.
    pub fn new(cx: f64, cy: f64, config: &IdentityConfig) -> Self {
        let mut covariance = [[0.0; 4]; 4];
        covariance[0][0] = INITIAL_POS_VARIANCE;
        covariance[1][1] = INITIAL_POS_VARIANCE;
        covariance[2][2] = INITIAL_VEL_VARIANCE;
        covariance[3][3] = INITIAL_VEL_VARIANCE;

        Self {
            state: [cx, cy, 0.0, 0.0],
            covariance,
            process_noise_pos: config.process_noise_pos,
            process_noise_vel: config.process_noise_vel,
            measurement_noise: config.measurement_noise,
        }
    }

    /// Advance one frame: `x' = F x`, `P' = F P Fᵀ + Q`.
    pub fn predict(&mut self) {
        let f = transition();

        self.state = [
            self.state[0] + self.state[2],
            self.state[1] + self.state[3],
            self.state[2],
            self.state[3],
        ];

        let mut p = mat_mul(&mat_mul(&f, &self.covariance), &transpose(&f));
        p[0][0] += self.process_noise_pos;
        p[1][1] += self.process_noise_pos;
        p[2][2] += self.process_noise_vel;
        p[3][3] += self.process_noise_vel;
        self.covariance = p;
    }

    /// Fold in a measured center.
    ///
    /// Non-finite measurements are ignored so a bad box never poisons the
    /// filter.
    pub fn update(&mut self, cx: f64, cy: f64) {
        if !cx.is_finite() || !cy.is_finite() {
            return;
        }

        let p = &self.covariance;

        // S = H P Hᵀ + R (2x2)
        let s00 = p[0][0] + self.measurement_noise;
        let s01 = p[0][1];
        let s10 = p[1][0];
        let s11 = p[1][1] + self.measurement_noise;
        let det = s00 * s11 - s01 * s10;
        if det.abs() < f64::EPSILON || !det.is_finite() {
            return;
        }
        let inv = [[s11 / det, -s01 / det], [-s10 / det, s00 / det]];

        // K = P Hᵀ S⁻¹ (4x2); P Hᵀ is the first two columns of P
        let mut gain = [[0.0; 2]; 4];
        for (i, row) in gain.iter_mut().enumerate() {
            row[0] = p[i][0] * inv[0][0] + p[i][1] * inv[1][0];
            row[1] = p[i][0] * inv[0][1] + p[i][1] * inv[1][1];
        }

        let innovation = [cx - self.state[0], cy - self.state[1]];
        for (i, row) in gain.iter().enumerate() {
            self.state[i] += row[0] * innovation[0] + row[1] * innovation[1];
        }

        // P = (I - K H) P
        let mut i_kh = identity();
        for (i, row) in gain.iter().enumerate() {
            i_kh[i][0] -= row[0];
            i_kh[i][1] -= row[1];
        }
        self.covariance = mat_mul(&i_kh, &self.covariance);
    }

    /// Predict then update with a new measurement.
    pub fn step(&mut self, cx: f64, cy: f64) {
        self.predict();
        self.update(cx, cy);
    }

    /// Current center estimate.
    pub fn position(&self) -> (f64, f64) {
        (self.state[0], self.state[1])
    }

    /// Current per-frame velocity estimate.
    pub fn velocity(&self) -> Velocity {
        Velocity::new(self.state[2], self.state[3])
    }

    /// Center expected on the next frame.
    pub fn predicted_position(&self) -> (f64, f64) {
        (self.state[0] + self.state[2], self.state[1] + self.state[3])
    }

    /// Position variance (trace of the position block).
    pub fn position_uncertainty(&self) -> f64 {
        self.covariance[0][0] + self.covariance[1][1]
    }
}

fn transition() -> Matrix4 {
    let mut f = identity();
    f[0][2] = 1.0;
    f[1][3] = 1.0;
    f
}

fn identity() -> Matrix4 {
    let mut m = [[0.0; 4]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        row[i] = 1.0;
    }
    m
}

fn transpose(m: &Matrix4) -> Matrix4 {
    let mut t = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            t[j][i] = m[i][j];
        }
    }
    t
}

fn mat_mul(a: &Matrix4, b: &Matrix4) -> Matrix4 {
    let mut out = [[0.0; 4]; 4];
    for i in 0..4 {
        for j in 0..4 {
            out[i][j] = (0..4).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter_at(cx: f64, cy: f64) -> MotionFilter {
        MotionFilter::new(cx, cy, &IdentityConfig::default())
    }

    #[test]
    fn test_stationary_object_stays_put() {
        let mut filter = filter_at(0.5, 0.5);
        for _ in 0..10 {
            filter.step(0.5, 0.5);
        }

        let (x, y) = filter.position();
        assert!((x - 0.5).abs() < 1e-6);
        assert!((y - 0.5).abs() < 1e-6);
        assert!(filter.velocity().magnitude() < 1e-6);
    }

    #[test]
    fn test_learns_constant_velocity() {
        let mut filter = filter_at(0.1, 0.5);
        for i in 1..=30 {
            filter.step(0.1 + 0.01 * i as f64, 0.5);
        }

        let v = filter.velocity();
        assert!((v.dx - 0.01).abs() < 2e-3, "vx = {}", v.dx);
        assert!(v.dy.abs() < 1e-3);

        let (px, _) = filter.predicted_position();
        assert!((px - 0.41).abs() < 5e-3, "px = {}", px);
    }

    #[test]
    fn test_update_reduces_uncertainty() {
        let mut filter = filter_at(0.5, 0.5);
        filter.predict();
        let before = filter.position_uncertainty();
        filter.update(0.5, 0.5);
        assert!(filter.position_uncertainty() < before);
    }

    #[test]
    fn test_non_finite_measurement_is_ignored() {
        let mut filter = filter_at(0.3, 0.3);
        filter.step(f64::NAN, 0.3);
        let (x, y) = filter.position();
        assert!(x.is_finite() && y.is_finite());
    }
}
