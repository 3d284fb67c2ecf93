// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Forward projection through the separable matrix and residual norms.

use ndarray::Array3;

use crate::geom::SinoParams;
use crate::sysmatrix::SysMatrix;

/// Measured sinogram plus the statistical weights of the data term.
#[derive(Debug, Clone)]
pub struct Sinogram {
    /// Measurements, indexed `[i_beta, i_v, i_w]`.
    pub data: Array3<f32>,
    /// Weights, same shape. All ones for an unweighted least-squares fit.
    pub weights: Array3<f32>,
}

impl Sinogram {
    /// Wrap measurements with unit weights.
    pub fn unweighted(data: Array3<f32>) -> Sinogram {
        let weights = Array3::ones(data.dim());
        Sinogram { data, weights }
    }
}

/// Project `image` through the matrix into a new sinogram-shaped array.
///
/// For every voxel, the contribution to detector cell `(i_beta, i_v, i_w)`
/// is `B[j_x, j_y, i_beta, i_v] * C[j_u, j_z, i_w]` with `j_u` looked up
/// from the voxel column.
pub fn forward_project(
    a: &SysMatrix,
    sino: &SinoParams,
    image: &Array3<f32>,
) -> Array3<f32> {
    let mut proj = Array3::zeros((sino.n_beta, sino.n_dv, sino.n_dw));
    let vstride_max = a.i_vstride_max as usize;
    let wstride_max = a.i_wstride_max as usize;

    for j_x in 0..a.n_x {
        for j_y in 0..a.n_y {
            for i_beta in 0..a.n_beta {
                let row = a.vrow(j_x, j_y, i_beta);
                let vstart = a.i_vstart[row] as usize;
                let vstride = a.i_vstride[row] as usize;
                let j_u = a.j_u[row] as usize;
                for j_z in 0..a.n_z {
                    let x = image[[j_x, j_y, j_z]];
                    if x == 0.0 {
                        continue;
                    }
                    let wrow = a.wrow(j_u, j_z);
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
                            proj[[i_beta, i_v, wstart + k_w]] += b * c * x;
                        }
                    }
                }
            }
        }
    }
    proj
}

/// Error sinogram `e = y - A x`.
pub fn error_sinogram(
    a: &SysMatrix,
    sino: &SinoParams,
    data: &Array3<f32>,
    image: &Array3<f32>,
) -> Array3<f32> {
    let proj = forward_project(a, sino, image);
    data - &proj
}

/// `sum(w * x^2)` over a sinogram-shaped array, accumulated in f32.
pub fn weighted_norm_sqr(weights: &Array3<f32>, x: &Array3<f32>) -> f32 {
    weights
        .iter()
        .zip(x.iter())
        .map(|(&w, &v)| w * v * v)
        .sum()
}
