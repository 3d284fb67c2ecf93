// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scanner and image geometry parameters for cone-beam projection.

use thiserror::Error;

/// Sinogram (scanner) geometry.
///
/// All distances share the length unit of the image pitches. The scanner
/// u axis runs from the source toward the detector, v is the in-plane
/// detector axis and w the axial detector axis. The source sits at
/// `(u_s, 0, 0)` and the detector plane at `u = u_d0`.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SinoParams {
    /// Number of view angles.
    pub n_beta: usize,
    /// Number of detector channels along v.
    pub n_dv: usize,
    /// Number of detector rows along w.
    pub n_dw: usize,
    /// u coordinate of the X-ray source.
    pub u_s: f32,
    /// u coordinate of the detector plane.
    pub u_d0: f32,
    /// v coordinate of the edge of the first detector channel.
    pub v_d0: f32,
    /// w coordinate of the edge of the first detector row.
    pub w_d0: f32,
    /// Detector channel pitch along v.
    pub delta_dv: f32,
    /// Detector row pitch along w.
    pub delta_dw: f32,
    /// Rotation center offset along u.
    pub u_r: f32,
    /// Rotation center offset along v.
    pub v_r: f32,
}

/// Image (voxel grid) geometry.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ImageParams {
    /// Number of voxels along x.
    pub n_x: usize,
    /// Number of voxels along y.
    pub n_y: usize,
    /// Number of voxels along z (the rotation axis).
    pub n_z: usize,
    /// x coordinate of the edge of the first voxel.
    pub x_0: f32,
    /// y coordinate of the edge of the first voxel.
    pub y_0: f32,
    /// z coordinate of the edge of the first voxel.
    pub z_0: f32,
    /// In-plane voxel pitch (square voxels in x and y).
    pub delta_xy: f32,
    /// Axial voxel pitch.
    pub delta_z: f32,
}

impl ImageParams {
    /// Total number of voxels.
    pub fn num_voxels(&self) -> usize {
        self.n_x * self.n_y * self.n_z
    }
}

impl SinoParams {
    /// Total number of detector cells over all views.
    pub fn num_cells(&self) -> usize {
        self.n_beta * self.n_dv * self.n_dw
    }
}

/// Reasons a set of geometry parameters is rejected.
#[derive(Debug, Error)]
pub enum GeomError {
    #[error("dimension {name} must be positive")]
    NonPositiveDim { name: &'static str },
    #[error("pitch {name} must be positive, got {value}")]
    NonPositivePitch { name: &'static str, value: f32 },
    #[error("{got} view angles given but the sinogram declares {expected} views")]
    ViewCountMismatch { expected: usize, got: usize },
    #[error("voxel at scanner coordinate u = {u_v} is not in front of the source at u = {u_s}")]
    SourceBehindVoxel { u_v: f32, u_s: f32 },
    #[error("detector plane u = {u_d0} sits behind the source at u = {u_s}")]
    DetectorBehindSource { u_d0: f32, u_s: f32 },
    #[error("scanner u range degenerated to N_u = {n_u}")]
    EmptyURange { n_u: i64 },
}

/// Check that the geometry describes a usable scanner and image grid.
///
/// Degeneracies that only show up once voxels are projected (a voxel on
/// the wrong side of the source) are caught later, during precompute.
pub fn validate(
    sino: &SinoParams,
    img: &ImageParams,
    angles: &[f32],
) -> Result<(), GeomError> {
    let dims: [(&'static str, usize); 6] = [
        ("N_beta", sino.n_beta),
        ("N_dv", sino.n_dv),
        ("N_dw", sino.n_dw),
        ("N_x", img.n_x),
        ("N_y", img.n_y),
        ("N_z", img.n_z),
    ];
    for &(name, value) in dims.iter() {
        if value == 0 {
            return Err(GeomError::NonPositiveDim { name });
        }
    }
    let pitches: [(&'static str, f32); 4] = [
        ("Delta_dv", sino.delta_dv),
        ("Delta_dw", sino.delta_dw),
        ("Delta_xy", img.delta_xy),
        ("Delta_z", img.delta_z),
    ];
    for &(name, value) in pitches.iter() {
        if !(value > 0.0) {
            return Err(GeomError::NonPositivePitch { name, value });
        }
    }
    if angles.len() != sino.n_beta {
        return Err(GeomError::ViewCountMismatch {
            expected: sino.n_beta,
            got: angles.len(),
        });
    }
    if sino.u_d0 <= sino.u_s {
        return Err(GeomError::DetectorBehindSource {
            u_d0: sino.u_d0,
            u_s: sino.u_s,
        });
    }
    Ok(())
}
