// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Prior models of the MAP cost: QGGMRF and the proximal map.

use ndarray::Array3;
use thiserror::Error;

/// Parameters of the QGGMRF potential.
///
/// The potential behaves like `|d|^q` for differences below roughly
/// `T * sigma_x` and like `|d|^p` above, which preserves edges while
/// smoothing low-contrast noise.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct QggmrfParams {
    /// High-contrast shape exponent, `1 <= p < q`.
    pub p: f32,
    /// Low-contrast shape exponent, normally 2.
    pub q: f32,
    /// Transition threshold between the regimes, in units of `sigma_x`.
    pub t: f32,
    /// Prior scale; larger means weaker regularization.
    pub sigma_x: f32,
    /// Relative weight of face-sharing neighbors.
    pub b_face: f32,
    /// Relative weight of edge-sharing neighbors.
    pub b_edge: f32,
    /// Relative weight of vertex-sharing neighbors.
    pub b_vertex: f32,
}

impl Default for QggmrfParams {
    fn default() -> Self {
        QggmrfParams {
            p: 1.2,
            q: 2.0,
            t: 1.0,
            sigma_x: 1.0,
            b_face: 1.0,
            b_edge: std::f32::consts::FRAC_1_SQRT_2,
            b_vertex: 1.0 / 3.0f32.sqrt(),
        }
    }
}

/// Rejected prior parameter combinations.
#[derive(Debug, Error)]
pub enum PriorError {
    #[error("QGGMRF exponents must satisfy 1 <= p < q <= 2, got p = {p}, q = {q}")]
    BadExponents { p: f32, q: f32 },
    #[error("QGGMRF scale {name} must be positive, got {value}")]
    NonPositiveScale { name: &'static str, value: f32 },
    #[error("proximal map scale sigma_p must be positive, got {0}")]
    NonPositiveProxScale(f32),
}

impl QggmrfParams {
    pub fn validate(&self) -> Result<(), PriorError> {
        if !(1.0 <= self.p && self.p < self.q && self.q <= 2.0) {
            return Err(PriorError::BadExponents {
                p: self.p,
                q: self.q,
            });
        }
        let scales = [
            ("T", self.t),
            ("sigma_x", self.sigma_x),
            ("b_face", self.b_face),
            ("b_edge", self.b_edge),
            ("b_vertex", self.b_vertex),
        ];
        for &(name, value) in scales.iter() {
            if !(value > 0.0) {
                return Err(PriorError::NonPositiveScale { name, value });
            }
        }
        Ok(())
    }

    /// Per-class neighbor weights, normalized so the 26 weights sum to one.
    pub fn neighbor_weights(&self) -> (f32, f32, f32) {
        let total = 6.0 * self.b_face + 12.0 * self.b_edge + 8.0 * self.b_vertex;
        (
            self.b_face / total,
            self.b_edge / total,
            self.b_vertex / total,
        )
    }

    /// Potential value `rho(delta)`.
    pub fn potential(&self, delta: f32) -> f32 {
        let d = delta.abs();
        if d == 0.0 {
            return 0.0;
        }
        let r = (d / (self.t * self.sigma_x)).powf(self.q - self.p);
        (d / self.sigma_x).powf(self.p) / self.p * (r / (1.0 + r))
    }

    /// Surrogate coefficient `rho'(delta) / (2 delta)`.
    ///
    /// Finite everywhere for `q = 2`; below `|delta| = 1e-5` the analytic
    /// limit is used to avoid the 0/0.
    pub fn surrogate_coeff(&self, delta: f32) -> f32 {
        let (p, q, t, sigma) = (self.p, self.q, self.t, self.sigma_x);
        let d = delta.abs();
        if d < 1e-5 {
            return q / (2.0 * p * sigma.powf(p) * (t * sigma).powf(q - p));
        }
        let r = (d / (t * sigma)).powf(q - p);
        d.powf(p - 2.0) / (2.0 * sigma.powf(p))
            * (r / (1.0 + r))
            * (1.0 + (q - p) / (p * (1.0 + r)))
    }
}

/// The prior term of the MAP cost.
#[derive(Debug)]
pub enum PriorModel<'a> {
    /// Markov random field over the 26-neighborhood.
    Qggmrf(QggmrfParams),
    /// Quadratic pull toward a fixed target volume, as used by proximal
    /// splitting drivers that alternate reconstruction with denoising.
    ProxMap {
        /// Proximal regularization scale.
        sigma_p: f32,
        /// Target volume, image-shaped.
        target: &'a Array3<f32>,
    },
}

impl<'a> PriorModel<'a> {
    pub fn validate(&self) -> Result<(), PriorError> {
        match self {
            PriorModel::Qggmrf(params) => params.validate(),
            PriorModel::ProxMap { sigma_p, .. } => {
                if !(*sigma_p > 0.0) {
                    return Err(PriorError::NonPositiveProxScale(*sigma_p));
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::QggmrfParams;

    #[test]
    fn potential_is_even_and_zero_at_origin() {
        let params = QggmrfParams::default();
        assert_eq!(params.potential(0.0), 0.0);
        assert!((params.potential(0.7) - params.potential(-0.7)).abs() < 1e-7);
    }

    #[test]
    fn surrogate_coeff_matches_derivative_ratio() {
        // Central difference of the potential against rho'(d) = 2 d a(d).
        let params = QggmrfParams::default();
        for &d in &[0.01f32, 0.3, 1.0, 4.0] {
            let h = 1e-3 * d;
            let drho = (params.potential(d + h) - params.potential(d - h)) / (2.0 * h);
            let from_coeff = 2.0 * d * params.surrogate_coeff(d);
            assert!(
                (drho - from_coeff).abs() <= 2e-3 * drho.abs().max(1.0),
                "mismatch at d = {}: {} vs {}",
                d,
                drho,
                from_coeff
            );
        }
    }

    #[test]
    fn surrogate_coeff_is_continuous_at_the_origin() {
        let params = QggmrfParams::default();
        let limit = params.surrogate_coeff(0.0);
        let near = params.surrogate_coeff(2e-5);
        assert!((limit - near).abs() < 1e-2 * limit);
    }
}
