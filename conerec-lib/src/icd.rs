// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Per-voxel coordinate descent: surrogate coefficients and updates.
//!
//! One ICD step minimizes a local quadratic surrogate of the MAP cost in
//! a single voxel. The data term contributes
//! `theta1 = -sum(w * A_ij * e)` and `theta2 = sum(w * A_ij^2)` over the
//! voxel's sparse footprint; the prior adds its own pair; the voxel moves
//! by `-theta1 / theta2`, clipped to the value box.

use ndarray::Array3;

use crate::prior::{PriorModel, QggmrfParams};
use crate::project::{weighted_norm_sqr, Sinogram};
use crate::sysmatrix::SysMatrix;

/// Surrogate coefficients of the data term for one voxel.
pub fn forward_theta(
    a: &SysMatrix,
    sino: &Sinogram,
    e: &Array3<f32>,
    j_x: usize,
    j_y: usize,
    j_z: usize,
) -> (f32, f32) {
    let vstride_max = a.i_vstride_max as usize;
    let wstride_max = a.i_wstride_max as usize;
    let mut theta1 = 0.0f32;
    let mut theta2 = 0.0f32;
    for i_beta in 0..a.n_beta {
        let row = a.vrow(j_x, j_y, i_beta);
        let vstart = a.i_vstart[row] as usize;
        let vstride = a.i_vstride[row] as usize;
        let wrow = a.wrow(a.j_u[row] as usize, j_z);
        let wstart = a.i_wstart[wrow] as usize;
        let wstride = a.i_wstride[wrow] as usize;
        for k_v in 0..vstride {
            let b = a.b.get(row * vstride_max + k_v, a.b_ij_scaler);
            if b == 0.0 {
                continue;
            }
            let i_v = vstart + k_v;
            for k_w in 0..wstride {
                let c = a.c.get(wrow * wstride_max + k_w, a.c_ij_scaler);
                let a_ij = b * c;
                let i_w = wstart + k_w;
                let w = sino.weights[[i_beta, i_v, i_w]];
                theta1 -= w * a_ij * e[[i_beta, i_v, i_w]];
                theta2 += w * a_ij * a_ij;
            }
        }
    }
    (theta1, theta2)
}

/// Surrogate coefficients of the QGGMRF prior for one voxel, from the
/// current neighborhood values. Out-of-volume neighbors are skipped.
pub fn prior_theta_qggmrf(
    params: &QggmrfParams,
    image: &Array3<f32>,
    j_x: usize,
    j_y: usize,
    j_z: usize,
) -> (f32, f32) {
    let (n_x, n_y, n_z) = image.dim();
    let x_j = image[[j_x, j_y, j_z]];
    let (w_face, w_edge, w_vertex) = params.neighbor_weights();
    let mut theta1 = 0.0f32;
    let mut theta2 = 0.0f32;
    for dx in -1i64..=1 {
        for dy in -1i64..=1 {
            for dz in -1i64..=1 {
                let order = dx.abs() + dy.abs() + dz.abs();
                if order == 0 {
                    continue;
                }
                let (k_x, k_y, k_z) = (
                    j_x as i64 + dx,
                    j_y as i64 + dy,
                    j_z as i64 + dz,
                );
                if k_x < 0
                    || k_y < 0
                    || k_z < 0
                    || k_x >= n_x as i64
                    || k_y >= n_y as i64
                    || k_z >= n_z as i64
                {
                    continue;
                }
                let b_jk = match order {
                    1 => w_face,
                    2 => w_edge,
                    _ => w_vertex,
                };
                let delta = x_j - image[[k_x as usize, k_y as usize, k_z as usize]];
                let coeff = b_jk * params.surrogate_coeff(delta);
                theta1 += 2.0 * coeff * delta;
                theta2 += 2.0 * coeff;
            }
        }
    }
    (theta1, theta2)
}

/// Surrogate coefficients of the chosen prior for one voxel.
pub fn prior_theta(
    prior: &PriorModel,
    image: &Array3<f32>,
    j_x: usize,
    j_y: usize,
    j_z: usize,
) -> (f32, f32) {
    match prior {
        PriorModel::Qggmrf(params) => prior_theta_qggmrf(params, image, j_x, j_y, j_z),
        PriorModel::ProxMap { sigma_p, target } => {
            let inv_var = 1.0 / (sigma_p * sigma_p);
            let delta = image[[j_x, j_y, j_z]] - target[[j_x, j_y, j_z]];
            (delta * inv_var, inv_var)
        }
    }
}

/// Clipped surrogate minimizer for one voxel.
///
/// With a prior, `theta2 > 0`; if both coefficients vanish (a voxel with
/// no footprint and no prior pull) the update is zero.
#[inline]
pub fn voxel_delta(theta1: f32, theta2: f32, x_j: f32, clip: (f32, f32)) -> f32 {
    if theta2 <= 0.0 {
        return 0.0;
    }
    (-theta1 / theta2).max(clip.0 - x_j).min(clip.1 - x_j)
}

/// Walk the voxel's footprint subtracting `A_ij * delta` from the error
/// sinogram, keeping `e = y - A x` true after the voxel moved.
pub fn update_error_sinogram(
    a: &SysMatrix,
    e: &mut Array3<f32>,
    j_x: usize,
    j_y: usize,
    j_z: usize,
    delta: f32,
) {
    let vstride_max = a.i_vstride_max as usize;
    let wstride_max = a.i_wstride_max as usize;
    for i_beta in 0..a.n_beta {
        let row = a.vrow(j_x, j_y, i_beta);
        let vstart = a.i_vstart[row] as usize;
        let vstride = a.i_vstride[row] as usize;
        let wrow = a.wrow(a.j_u[row] as usize, j_z);
        let wstart = a.i_wstart[wrow] as usize;
        let wstride = a.i_wstride[wrow] as usize;
        for k_v in 0..vstride {
            let b = a.b.get(row * vstride_max + k_v, a.b_ij_scaler);
            if b == 0.0 {
                continue;
            }
            let i_v = vstart + k_v;
            for k_w in 0..wstride {
                let c = a.c.get(wrow * wstride_max + k_w, a.c_ij_scaler);
                e[[i_beta, i_v, wstart + k_w]] -= b * c * delta;
            }
        }
    }
}

/// Full MAP cost `0.5 sum(w e^2) + prior(x)`.
pub fn map_cost(
    sino: &Sinogram,
    e: &Array3<f32>,
    image: &Array3<f32>,
    prior: &PriorModel,
) -> f32 {
    0.5 * weighted_norm_sqr(&sino.weights, e) + prior_cost(image, prior)
}

/// Prior part of the MAP cost.
///
/// The QGGMRF sum runs over the half neighborhood so each voxel pair is
/// counted once.
pub fn prior_cost(image: &Array3<f32>, prior: &PriorModel) -> f32 {
    match prior {
        PriorModel::Qggmrf(params) => {
            let (n_x, n_y, n_z) = image.dim();
            let (w_face, w_edge, w_vertex) = params.neighbor_weights();
            let mut cost = 0.0f32;
            for j_x in 0..n_x {
                for j_y in 0..n_y {
                    for j_z in 0..n_z {
                        let x_j = image[[j_x, j_y, j_z]];
                        for &(dx, dy, dz) in HALF_NEIGHBORHOOD.iter() {
                            let (k_x, k_y, k_z) = (
                                j_x as i64 + dx,
                                j_y as i64 + dy,
                                j_z as i64 + dz,
                            );
                            if k_x < 0
                                || k_y < 0
                                || k_z < 0
                                || k_x >= n_x as i64
                                || k_y >= n_y as i64
                                || k_z >= n_z as i64
                            {
                                continue;
                            }
                            let b_jk = match dx.abs() + dy.abs() + dz.abs() {
                                1 => w_face,
                                2 => w_edge,
                                _ => w_vertex,
                            };
                            let x_k = image[[k_x as usize, k_y as usize, k_z as usize]];
                            cost += b_jk * params.potential(x_j - x_k);
                        }
                    }
                }
            }
            cost
        }
        PriorModel::ProxMap { sigma_p, target } => {
            let inv_two_var = 0.5 / (sigma_p * sigma_p);
            image
                .iter()
                .zip(target.iter())
                .map(|(&x, &t)| inv_two_var * (x - t) * (x - t))
                .sum()
        }
    }
}

/// The 13 offsets covering each unordered neighbor pair exactly once.
const HALF_NEIGHBORHOOD: [(i64, i64, i64); 13] = [
    (1, 0, 0),
    (0, 1, 0),
    (0, 0, 1),
    (1, 1, 0),
    (1, -1, 0),
    (1, 0, 1),
    (1, 0, -1),
    (0, 1, 1),
    (0, 1, -1),
    (1, 1, 1),
    (1, 1, -1),
    (1, -1, 1),
    (1, -1, -1),
];
