// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Separable cone-beam system matrix: storage and precomputation.
//!
//! The matrix factors as `A = B · C`: `B` carries the in-plane footprint
//! of a voxel column onto the detector channels of one view, `C` carries
//! the axial footprint onto the detector rows. `C` is indexed not by
//! `(j_x, j_y)` but by a 1-D resampling of the scanner u axis, so a whole
//! z column of voxels shares one row of `B` and each of its voxels picks
//! its `C` row through the precomputed `j_u` index.

use std::f32::consts::{FRAC_PI_2, FRAC_PI_4};

use log::debug;

use crate::geom::{self, GeomError, ImageParams, SinoParams};

/// Runtime switches of the matrix build.
///
/// Historically compile-time macros; carried at runtime so one binary can
/// produce and consume both compressed and verbatim matrices. The on-disk
/// format does not record these switches, so a reader must be handed the
/// same configuration the writer used.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MatrixConfig {
    /// Quantize `B` cells to 8 bits under a global scaler.
    pub b_compressed: bool,
    /// Quantize `C` cells to 8 bits under a global scaler.
    pub c_compressed: bool,
    /// Oversampling ratio of the u grid relative to the voxel pitch.
    pub oversample: f32,
}

impl Default for MatrixConfig {
    fn default() -> Self {
        MatrixConfig {
            b_compressed: false,
            c_compressed: false,
            oversample: 1.0,
        }
    }
}

/// One flat table of footprint coefficients.
///
/// Quantized cells hold `round(coeff / scaler)`; the scaler is reapplied
/// on every read so callers only ever see real coefficients.
#[derive(Debug, Clone, PartialEq)]
pub enum CoeffTable {
    Quantized(Vec<u8>),
    Float(Vec<f32>),
}

impl CoeffTable {
    fn zeros(len: usize, compressed: bool) -> Self {
        if compressed {
            CoeffTable::Quantized(vec![0; len])
        } else {
            CoeffTable::Float(vec![0.0; len])
        }
    }

    pub fn len(&self) -> usize {
        match self {
            CoeffTable::Quantized(cells) => cells.len(),
            CoeffTable::Float(cells) => cells.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Coefficient at `idx`, with the quantization scaler reapplied.
    #[inline]
    pub fn get(&self, idx: usize, scaler: f32) -> f32 {
        match self {
            CoeffTable::Quantized(cells) => cells[idx] as f32 * scaler,
            CoeffTable::Float(cells) => cells[idx],
        }
    }

    #[inline]
    fn set(&mut self, idx: usize, coeff: f32, scaler: f32) {
        match self {
            CoeffTable::Quantized(cells) => {
                cells[idx] = (coeff / scaler + 0.5).clamp(0.0, 255.0) as u8
            }
            CoeffTable::Float(cells) => cells[idx] = coeff,
        }
    }
}

/// The separable system matrix and its index arrays.
///
/// Every table is a single flat allocation addressed with explicit
/// strides: ragged footprints padded to the rectangular bound
/// `i_vstride_max` (resp. `i_wstride_max`). Cells past a real stride are
/// never read.
#[derive(Debug, Clone, PartialEq)]
pub struct SysMatrix {
    pub config: MatrixConfig,
    /// Image/sinogram shape the tables were built for. Not serialized;
    /// re-supplied from the geometry when a matrix is read back.
    pub n_x: usize,
    pub n_y: usize,
    pub n_z: usize,
    pub n_beta: usize,
    /// Largest v footprint over all voxel columns and views.
    pub i_vstride_max: i64,
    /// Largest w footprint over the resampled u grid.
    pub i_wstride_max: i64,
    /// Number of samples of the u resampling grid.
    pub n_u: i64,
    pub b_ij_max: f32,
    pub c_ij_max: f32,
    pub b_ij_scaler: f32,
    pub c_ij_scaler: f32,
    /// Pitch of the u resampling grid.
    pub delta_u: f32,
    /// Lower edge of the image extent in scanner u coordinates.
    pub u_0: f32,
    /// Upper edge, re-aligned to `u_0 + N_u * Delta_u`.
    pub u_1: f32,
    /// In-plane coefficients, shape `(N_x, N_y, N_beta * i_vstride_max)`.
    pub b: CoeffTable,
    /// First detector channel of each v footprint, shape `(N_x, N_y, N_beta)`.
    pub i_vstart: Vec<i32>,
    /// Length of each v footprint, same shape.
    pub i_vstride: Vec<i32>,
    /// Row of `C` used by each `(j_x, j_y, i_beta)` triple, same shape.
    pub j_u: Vec<i32>,
    /// Axial coefficients, shape `(N_u, N_z * i_wstride_max)`.
    pub c: CoeffTable,
    /// First detector row of each w footprint, shape `(N_u, N_z)`.
    pub i_wstart: Vec<i32>,
    /// Length of each w footprint, same shape.
    pub i_wstride: Vec<i32>,
}

impl SysMatrix {
    /// Flat index of the `(j_x, j_y, i_beta)` triple into the v-side
    /// index arrays. The matching `B` cells start at
    /// `vrow * i_vstride_max`.
    #[inline]
    pub fn vrow(&self, j_x: usize, j_y: usize, i_beta: usize) -> usize {
        (j_x * self.n_y + j_y) * self.n_beta + i_beta
    }

    /// Flat index of the `(j_u, j_z)` pair into the w-side index arrays.
    /// The matching `C` cells start at `wrow * i_wstride_max`.
    #[inline]
    pub fn wrow(&self, j_u: usize, j_z: usize) -> usize {
        j_u * self.n_z + j_z
    }

    /// Allocate zeroed tables for the given bounds.
    pub(crate) fn allocate(
        sino: &SinoParams,
        img: &ImageParams,
        config: MatrixConfig,
        bounds: MatrixBounds,
    ) -> SysMatrix {
        let v_rows = img.n_x * img.n_y * sino.n_beta;
        let w_rows = bounds.n_u as usize * img.n_z;
        SysMatrix {
            n_x: img.n_x,
            n_y: img.n_y,
            n_z: img.n_z,
            n_beta: sino.n_beta,
            i_vstride_max: bounds.i_vstride_max,
            i_wstride_max: bounds.i_wstride_max,
            n_u: bounds.n_u,
            b_ij_max: bounds.b_ij_max,
            c_ij_max: bounds.c_ij_max,
            b_ij_scaler: bounds.b_ij_scaler,
            c_ij_scaler: bounds.c_ij_scaler,
            delta_u: bounds.delta_u,
            u_0: bounds.u_0,
            u_1: bounds.u_1,
            b: CoeffTable::zeros(
                v_rows * bounds.i_vstride_max as usize,
                config.b_compressed,
            ),
            i_vstart: vec![0; v_rows],
            i_vstride: vec![0; v_rows],
            j_u: vec![0; v_rows],
            c: CoeffTable::zeros(
                w_rows * bounds.i_wstride_max as usize,
                config.c_compressed,
            ),
            i_wstart: vec![0; w_rows],
            i_wstride: vec![0; w_rows],
            config,
        }
    }
}

/// Scalars produced by the bounds pass, consumed by allocation.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatrixBounds {
    pub i_vstride_max: i64,
    pub i_wstride_max: i64,
    pub n_u: i64,
    pub delta_u: f32,
    pub u_0: f32,
    pub u_1: f32,
    pub b_ij_max: f32,
    pub c_ij_max: f32,
    pub b_ij_scaler: f32,
    pub c_ij_scaler: f32,
}

/// In-plane projection of one voxel column at one view angle.
struct VoxelView {
    /// Voxel center in scanner coordinates.
    u_v: f32,
    v_v: f32,
    /// Magnification from the voxel plane to the detector plane.
    m: f32,
    /// Footprint angle, folded into [-pi/4, pi/4].
    alpha_xy: f32,
    /// Footprint width on the detector along v.
    w_pv: f32,
}

/// Rotate a voxel center into scanner coordinates and project it.
fn project_voxel_view(
    sino: &SinoParams,
    img: &ImageParams,
    x_v: f32,
    y_v: f32,
    beta: f32,
) -> VoxelView {
    let (sine, cosine) = beta.sin_cos();
    // The object turns under a fixed source-detector pair, so the voxel
    // is the thing that rotates.
    let u_v = cosine * x_v - sine * y_v + sino.u_r;
    let v_v = sine * x_v + cosine * y_v + sino.v_r;
    // Magnification: source-detector distance over source-voxel distance.
    let m = (sino.u_d0 - sino.u_s) / (u_v - sino.u_s);
    // Angle between the voxel and the source-detector axis.
    let theta = v_v.atan2(u_v - sino.u_s);
    // cos is even, so folding the footprint angle into [-pi/4, pi/4]
    // loses nothing.
    let alpha_xy = (beta - theta + FRAC_PI_4) % FRAC_PI_2 - FRAC_PI_4;
    let w_pv = m * img.delta_xy * alpha_xy.cos() / theta.cos();
    VoxelView {
        u_v,
        v_v,
        m,
        alpha_xy,
        w_pv,
    }
}

/// Overlap length `max(a - max(|b|, d), 0)` between a projected footprint
/// of width `w_p` and a detector cell of the given pitch, `dist` away
/// from the footprint center.
#[inline]
fn overlap_length(w_p: f32, pitch: f32, dist: f32) -> f32 {
    let half_sum = (w_p + pitch) / 2.0;
    let half_diff = ((w_p - pitch) / 2.0).abs();
    (half_sum - half_diff.max(dist)).max(0.0)
}

/// Detector channel window `[start, start + stride)` of a v footprint.
/// Rounded half away from zero, then clamped to the detector.
fn v_window(sino: &SinoParams, vv: &VoxelView) -> (i64, i64) {
    let first_center = sino.v_d0 + sino.delta_dv / 2.0;
    let center = vv.m * vv.v_v;
    let start = ((center - vv.w_pv / 2.0 - first_center) / sino.delta_dv).round() as i64;
    let start = start.max(0);
    let stop = ((center + vv.w_pv / 2.0 - first_center) / sino.delta_dv).round() as i64;
    let stop = stop.min(sino.n_dv as i64 - 1);
    (start, (stop - start + 1).max(0))
}

/// Detector row window of a w footprint. The `+ 0.5` truncating cast is
/// the rounding used here; valid because the in-range expression is
/// non-negative.
fn w_window(sino: &SinoParams, m: f32, w_pw: f32, w_v: f32) -> (i64, i64) {
    let first_center = sino.w_d0 + sino.delta_dw / 2.0;
    let center = m * w_v;
    let start = ((center - first_center - w_pw / 2.0) / sino.delta_dw + 0.5) as i64;
    let start = start.max(0);
    let stop = ((center - first_center + w_pw / 2.0) / sino.delta_dw + 0.5) as i64;
    let stop = stop.min(sino.n_dw as i64 - 1);
    (start, (stop - start + 1).max(0))
}

/// Center of voxel `j` on a grid with the given edge and pitch.
#[inline]
fn grid_center(j: usize, pitch: f32, edge: f32) -> f32 {
    j as f32 * pitch + edge + pitch / 2.0
}

/// Bounds pass: find `i_vstride_max`, the u extent of the image, the u
/// resampling grid, `i_wstride_max`, and the quantization scalers.
pub(crate) fn compute_matrix_bounds(
    sino: &SinoParams,
    img: &ImageParams,
    angles: &[f32],
    config: &MatrixConfig,
) -> Result<MatrixBounds, GeomError> {
    let mut i_vstride_max: i64 = 0;
    let mut u_0 = f32::INFINITY;
    let mut u_1 = f32::NEG_INFINITY;
    let mut b_ij_max: f32 = 0.0;

    for j_x in 0..img.n_x {
        let x_v = grid_center(j_x, img.delta_xy, img.x_0);
        for j_y in 0..img.n_y {
            let y_v = grid_center(j_y, img.delta_xy, img.y_0);
            for &beta in angles {
                let vv = project_voxel_view(sino, img, x_v, y_v, beta);
                if vv.u_v <= sino.u_s {
                    return Err(GeomError::SourceBehindVoxel {
                        u_v: vv.u_v,
                        u_s: sino.u_s,
                    });
                }
                let (_, stride) = v_window(sino, &vv);
                i_vstride_max = i_vstride_max.max(stride);
                // Track the u extent of the rotated image; both edges use
                // the same half-pitch shift so the grid built below stays
                // consistent with the j_u lookup.
                u_0 = u_0.min(vv.u_v - img.delta_xy / 2.0);
                u_1 = u_1.max(vv.u_v - img.delta_xy / 2.0);
                if config.b_compressed {
                    let l_v = overlap_length(vv.w_pv, sino.delta_dv, 0.0);
                    let peak = img.delta_xy * l_v / (vv.alpha_xy.cos() * sino.delta_dv);
                    b_ij_max = b_ij_max.max(peak);
                }
            }
        }
    }

    let delta_u = img.delta_xy / config.oversample;
    let n_u = ((u_1 - u_0) / delta_u).ceil() as i64 + 1;
    if n_u < 1 {
        return Err(GeomError::EmptyURange { n_u });
    }
    // Re-align the upper edge so the grid ends exactly on a sample.
    let u_1 = u_0 + n_u as f32 * delta_u;

    let mut i_wstride_max: i64 = 0;
    let mut c_ij_max: f32 = 0.0;
    for j_u in 0..n_u as usize {
        // Grid centers keep the half voxel-pitch shift (not half Delta_u)
        // so that the j_u index computed during the B fill lands here.
        let u_v = j_u as f32 * delta_u + u_0 + img.delta_xy / 2.0;
        if u_v <= sino.u_s {
            return Err(GeomError::SourceBehindVoxel {
                u_v,
                u_s: sino.u_s,
            });
        }
        let m = (sino.u_d0 - sino.u_s) / (u_v - sino.u_s);
        let w_pw = m * img.delta_z;
        for j_z in 0..img.n_z {
            let w_v = grid_center(j_z, img.delta_z, img.z_0);
            let (_, stride) = w_window(sino, m, w_pw, w_v);
            i_wstride_max = i_wstride_max.max(stride);
            if config.c_compressed {
                let l_w = overlap_length(w_pw, sino.delta_dw, 0.0);
                let du = u_v - sino.u_s;
                let secant = (1.0 + (w_v * w_v) / (du * du)).sqrt();
                c_ij_max = c_ij_max.max(secant * l_w / sino.delta_dw);
            }
        }
    }

    let b_ij_scaler = if config.b_compressed {
        b_ij_max / 255.0
    } else {
        1.0
    };
    let c_ij_scaler = if config.c_compressed {
        c_ij_max / 255.0
    } else {
        1.0
    };

    debug!(
        "matrix bounds: i_vstride_max {} i_wstride_max {} N_u {} u [{}, {}]",
        i_vstride_max, i_wstride_max, n_u, u_0, u_1
    );

    Ok(MatrixBounds {
        i_vstride_max,
        i_wstride_max,
        n_u,
        delta_u,
        u_0,
        u_1,
        b_ij_max,
        c_ij_max,
        b_ij_scaler,
        c_ij_scaler,
    })
}

/// Fill `B`, the v-side index arrays, and the `j_u` resampling index.
fn fill_b(a: &mut SysMatrix, sino: &SinoParams, img: &ImageParams, angles: &[f32]) {
    let first_center = sino.v_d0 + sino.delta_dv / 2.0;
    let u_grid_center = a.u_0 + img.delta_xy / 2.0;
    let vstride_max = a.i_vstride_max as usize;

    for j_x in 0..img.n_x {
        let x_v = grid_center(j_x, img.delta_xy, img.x_0);
        for j_y in 0..img.n_y {
            let y_v = grid_center(j_y, img.delta_xy, img.y_0);
            for (i_beta, &beta) in angles.iter().enumerate() {
                let vv = project_voxel_view(sino, img, x_v, y_v, beta);
                let (start, stride) = v_window(sino, &vv);
                let row = a.vrow(j_x, j_y, i_beta);
                // An off-detector footprint has stride 0; clamping its
                // start keeps the stored index inside the detector.
                a.i_vstart[row] = start.min(sino.n_dv as i64 - 1) as i32;
                a.i_vstride[row] = stride as i32;
                a.j_u[row] = ((vv.u_v - u_grid_center) / a.delta_u).round() as i32;

                let cos_alpha = vv.alpha_xy.cos();
                let center = vv.m * vv.v_v;
                for k in 0..stride as usize {
                    let v_d = first_center + (start + k as i64) as f32 * sino.delta_dv;
                    let delta_v = (v_d - center).abs();
                    let l_v = overlap_length(vv.w_pv, sino.delta_dv, delta_v);
                    let b_ij = img.delta_xy * l_v / (cos_alpha * sino.delta_dv);
                    let scaler = a.b_ij_scaler;
                    a.b.set(row * vstride_max + k, b_ij, scaler);
                }
            }
        }
    }
}

/// Fill `C` and the w-side index arrays over the `(j_u, j_z)` grid.
fn fill_c(a: &mut SysMatrix, sino: &SinoParams, img: &ImageParams) {
    let first_center = sino.w_d0 + sino.delta_dw / 2.0;
    let wstride_max = a.i_wstride_max as usize;

    for j_u in 0..a.n_u as usize {
        let u_v = j_u as f32 * a.delta_u + a.u_0 + img.delta_xy / 2.0;
        let m = (sino.u_d0 - sino.u_s) / (u_v - sino.u_s);
        let w_pw = m * img.delta_z;
        let du = u_v - sino.u_s;
        for j_z in 0..img.n_z {
            let w_v = grid_center(j_z, img.delta_z, img.z_0);
            let (start, stride) = w_window(sino, m, w_pw, w_v);
            let row = a.wrow(j_u, j_z);
            a.i_wstart[row] = start.min(sino.n_dw as i64 - 1) as i32;
            a.i_wstride[row] = stride as i32;

            // The axial obliqueness factor 1/cos(alpha_z).
            let secant = (1.0 + (w_v * w_v) / (du * du)).sqrt();
            let center = m * w_v;
            for k in 0..stride as usize {
                let w_d = first_center + (start + k as i64) as f32 * sino.delta_dw;
                let delta_w = (w_d - center).abs();
                let l_w = overlap_length(w_pw, sino.delta_dw, delta_w);
                let c_ij = secant * l_w / sino.delta_dw;
                let scaler = a.c_ij_scaler;
                a.c.set(row * wstride_max + k, c_ij, scaler);
            }
        }
    }
}

/// Build the full system matrix from the geometry: bounds pass, allocate,
/// then the `B` and `C` fills.
pub fn compute_sys_matrix(
    sino: &SinoParams,
    img: &ImageParams,
    angles: &[f32],
    config: &MatrixConfig,
) -> Result<SysMatrix, GeomError> {
    geom::validate(sino, img, angles)?;
    let bounds = compute_matrix_bounds(sino, img, angles, config)?;
    let mut a = SysMatrix::allocate(sino, img, config.clone(), bounds);
    fill_b(&mut a, sino, img, angles);
    fill_c(&mut a, sino, img);
    debug!(
        "system matrix built: B {} cells, C {} cells",
        a.b.len(),
        a.c.len()
    );
    Ok(a)
}

#[cfg(test)]
mod tests {
    use super::overlap_length;

    #[test]
    fn overlap_is_full_pitch_at_center_of_wide_footprint() {
        // Footprint much wider than the cell: the cell is fully covered.
        assert_eq!(overlap_length(4.0, 1.0, 0.0), 1.0);
    }

    #[test]
    fn overlap_vanishes_far_from_footprint() {
        assert_eq!(overlap_length(1.0, 1.0, 3.0), 0.0);
    }

    #[test]
    fn overlap_tapers_linearly_on_the_shoulder() {
        // Equal widths: triangle profile with peak 1 at distance 0.
        let near = overlap_length(1.0, 1.0, 0.25);
        let far = overlap_length(1.0, 1.0, 0.75);
        assert!((near - 0.75).abs() < 1e-6);
        assert!((far - 0.25).abs() < 1e-6);
    }
}
