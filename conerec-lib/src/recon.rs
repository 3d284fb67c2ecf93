// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! ICD reconstruction driver: voxel ordering, zipline groups, NHICD.
//!
//! The outer loop sweeps the image in a freshly shuffled `(j_x, j_y)`
//! order every iteration. Each pair is processed as a sequence of partial
//! ziplines (axial voxel runs); the voxels of one zipline project through
//! the same detector channels but disjoint detector rows, so their
//! surrogate coefficients are computed in parallel from a snapshot of the
//! error sinogram, and the image and error sinogram are then committed
//! voxel by voxel.

use std::time::Instant;

use log::{info, warn};
use ndarray::Array3;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use thiserror::Error;

use crate::geom::SinoParams;
use crate::icd;
use crate::prior::{PriorError, PriorModel};
use crate::project::{error_sinogram, weighted_norm_sqr, Sinogram};
use crate::sysmatrix::SysMatrix;

/// Knobs of the ICD loop.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ReconParams {
    /// Hard cap on outer iterations.
    pub max_iterations: usize,
    /// Stop once the relative update magnitude falls below this.
    pub stop_threshold: f32,
    /// Length of the axial voxel runs updated as one parallel group.
    pub voxels_per_zipline: usize,
    /// Worker threads inside a zipline group. 1 disables the pool.
    pub num_threads: usize,
    /// Seed of the voxel-order shuffle.
    pub seed: u64,
    /// Box constraint on voxel values.
    pub clip: (f32, f32),
    /// Non-homogeneous update policy; `None` keeps plain full sweeps.
    pub nhicd: Option<NhicdParams>,
}

impl Default for ReconParams {
    fn default() -> Self {
        ReconParams {
            max_iterations: 50,
            stop_threshold: 1e-3,
            voxels_per_zipline: 32,
            num_threads: 1,
            seed: 0,
            clip: (0.0, f32::INFINITY),
            nhicd: None,
        }
    }
}

/// Non-homogeneous ICD: once the residual is small, spend sweeps only on
/// the ziplines whose voxels still move.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NhicdParams {
    /// Partial updates activate below this relative weighted residual.
    pub activation_threshold: f32,
    /// Hot-voxel cut as a multiple of the mean absolute last change.
    pub last_change_threshold: f32,
}

/// Observables of one outer iteration.
#[derive(Debug, Clone)]
pub struct IterationStats {
    pub iteration: usize,
    /// MAP cost at the end of the sweep.
    pub cost: f32,
    /// Relative magnitude of this sweep's updates.
    pub rel_update: f32,
    /// `sum(w e^2)` after the sweep.
    pub weighted_norm_sqr_e: f32,
    /// Fraction of the volume visited in this sweep.
    pub ratio_updated: f32,
    /// Cumulative visited fraction (equivalent iterations).
    pub total_equits: f32,
    pub voxels_per_second: f32,
    pub wall_time: std::time::Duration,
}

/// What the loop did, with the per-iteration trace.
#[derive(Debug, Clone)]
pub struct ReconReport {
    /// True when the stop threshold was reached before the iteration cap.
    pub converged: bool,
    pub stats: Vec<IterationStats>,
}

#[derive(Debug, Error)]
pub enum ReconError {
    #[error(transparent)]
    Prior(#[from] PriorError),
    #[error("image shape {got:?} does not match the system matrix shape {expected:?}")]
    ImageShape {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
    #[error("sinogram shape {got:?} does not match the scanner shape {expected:?}")]
    SinoShape {
        expected: (usize, usize, usize),
        got: (usize, usize, usize),
    },
    #[error("reconstruction parameter {name} is invalid: {why}")]
    Param { name: &'static str, why: String },
    #[error("error sinogram went non-finite at iteration {iteration}")]
    NonFinite { iteration: usize },
}

/// Axial bounds `[z0, z1)` of one partial zipline.
pub fn zipline_bounds(
    index_zipline: usize,
    voxels_per_zipline: usize,
    n_z: usize,
) -> (usize, usize) {
    let z0 = index_zipline * voxels_per_zipline;
    (z0, (z0 + voxels_per_zipline).min(n_z))
}

/// Partial updates activate once the relative weighted residual is small.
pub fn nhicd_active(params: &NhicdParams, relative_weighted_error: f32) -> bool {
    relative_weighted_error < params.activation_threshold
}

/// Absolute hot-voxel cut for the current sweep, scaled from the mean
/// absolute last change over the volume.
pub fn hot_threshold(params: &NhicdParams, last_change: &Array3<f32>) -> f32 {
    let mean_abs =
        last_change.iter().map(|d| d.abs()).sum::<f32>() / last_change.len() as f32;
    params.last_change_threshold * mean_abs
}

/// A voxel is hot when its last change beat the cut.
pub fn voxel_is_hot(last_change: &Array3<f32>, j: (usize, usize, usize), cut: f32) -> bool {
    last_change[[j.0, j.1, j.2]].abs() > cut
}

/// A partial zipline is hot when any of its voxels is.
pub fn zipline_is_hot(
    last_change: &Array3<f32>,
    j_x: usize,
    j_y: usize,
    z_bounds: (usize, usize),
    cut: f32,
) -> bool {
    (z_bounds.0..z_bounds.1).any(|j_z| voxel_is_hot(last_change, (j_x, j_y, j_z), cut))
}

/// One voxel of a zipline group while its update is in flight.
struct GroupVoxel {
    j_z: usize,
    x: f32,
    theta1: f32,
    theta2: f32,
}

fn ceil_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

/// The detector-row windows along a zipline are ordered by construction;
/// this is the static property behind lock-free group updates.
#[cfg(debug_assertions)]
fn assert_zipline_ordered(a: &SysMatrix, j_x: usize, j_y: usize, z0: usize, z1: usize) {
    for i_beta in 0..a.n_beta {
        let j_u = a.j_u[a.vrow(j_x, j_y, i_beta)] as usize;
        for j_z in z0 + 1..z1 {
            debug_assert!(
                a.i_wstart[a.wrow(j_u, j_z)] >= a.i_wstart[a.wrow(j_u, j_z - 1)],
                "detector-row windows out of order along zipline ({}, {}) at j_z = {}",
                j_x,
                j_y,
                j_z
            );
        }
    }
}

/// Run ICD until the relative update falls under the stop threshold or
/// the iteration cap is hit. The image is updated in place; the error
/// sinogram is owned by the loop. `observe` is called once per iteration
/// with the fresh statistics.
pub fn reconstruct(
    image: &mut Array3<f32>,
    sino: &Sinogram,
    a: &SysMatrix,
    sino_params: &SinoParams,
    params: &ReconParams,
    prior: &PriorModel,
    mut observe: impl FnMut(&IterationStats),
) -> Result<ReconReport, ReconError> {
    check_inputs(image, sino, a, sino_params, params, prior)?;

    let (n_x, n_y, n_z) = image.dim();
    let num_voxels = n_x * n_y * n_z;
    let n_ziplines = ceil_div(n_z, params.voxels_per_zipline);

    let mut e = error_sinogram(a, sino_params, &sino.data, image);
    let weighted_data_norm = weighted_norm_sqr(&sino.weights, &sino.data).max(f32::MIN_POSITIVE);

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut pairs: Vec<(usize, usize)> = (0..n_x)
        .flat_map(|j_x| (0..n_y).map(move |j_y| (j_x, j_y)))
        .collect();

    let mut last_change = Array3::<f32>::zeros((n_x, n_y, n_z));
    let mut pool = if params.num_threads > 1 {
        Some(scoped_threadpool::Pool::new(params.num_threads as u32))
    } else {
        None
    };

    let mut stats = Vec::with_capacity(params.max_iterations);
    let mut total_equits = 0.0f32;
    let mut converged = false;

    for iteration in 0..params.max_iterations {
        let tic = Instant::now();
        pairs.shuffle(&mut rng);

        // Decide this sweep's NHICD focus from the state left by the
        // previous one.
        let rel_forward_error =
            (weighted_norm_sqr(&sino.weights, &e) / weighted_data_norm).sqrt();
        let hot_map = match &params.nhicd {
            Some(nhicd) if nhicd_active(nhicd, rel_forward_error) => {
                let cut = hot_threshold(nhicd, &last_change);
                let map: Vec<bool> = pairs_zipline_indices(n_x, n_y, n_ziplines)
                    .map(|(j_x, j_y, iz)| {
                        let bounds = zipline_bounds(iz, params.voxels_per_zipline, n_z);
                        zipline_is_hot(&last_change, j_x, j_y, bounds, cut)
                    })
                    .collect();
                // An empty hot set would stall; fall back to a full sweep.
                if map.iter().any(|&hot| hot) {
                    Some(map)
                } else {
                    None
                }
            }
            _ => None,
        };

        let mut updated = 0usize;
        let mut delta_sqr = 0.0f32;

        for &(j_x, j_y) in pairs.iter() {
            for index_zipline in 0..n_ziplines {
                if let Some(map) = &hot_map {
                    if !map[(j_x * n_y + j_y) * n_ziplines + index_zipline] {
                        // Cool ziplines are skipped but decay so they
                        // eventually re-enter the sweep.
                        let (z0, z1) =
                            zipline_bounds(index_zipline, params.voxels_per_zipline, n_z);
                        for j_z in z0..z1 {
                            last_change[[j_x, j_y, j_z]] *= LAST_CHANGE_DECAY;
                        }
                        continue;
                    }
                }
                let (z0, z1) = zipline_bounds(index_zipline, params.voxels_per_zipline, n_z);
                #[cfg(debug_assertions)]
                assert_zipline_ordered(a, j_x, j_y, z0, z1);

                let mut group: Vec<GroupVoxel> = (z0..z1)
                    .map(|j_z| GroupVoxel {
                        j_z,
                        x: image[[j_x, j_y, j_z]],
                        theta1: 0.0,
                        theta2: 0.0,
                    })
                    .collect();

                // Phase 1: data-term coefficients from a snapshot of e.
                run_group(pool.as_mut(), &mut group, params.num_threads, |voxel| {
                    let (t1, t2) = icd::forward_theta(a, sino, &e, j_x, j_y, voxel.j_z);
                    voxel.theta1 = t1;
                    voxel.theta2 = t2;
                });
                // Phase 2: prior coefficients from the image snapshot.
                {
                    let image_snapshot: &Array3<f32> = image;
                    run_group(pool.as_mut(), &mut group, params.num_threads, |voxel| {
                        let (t1, t2) =
                            icd::prior_theta(prior, image_snapshot, j_x, j_y, voxel.j_z);
                        voxel.theta1 += t1;
                        voxel.theta2 += t2;
                    });
                }

                // Commit: deltas, image, error sinogram, stats, in z order.
                // The w supports of the group are disjoint so the commits
                // never touch the same sinogram cell twice.
                for voxel in group.iter() {
                    let delta =
                        icd::voxel_delta(voxel.theta1, voxel.theta2, voxel.x, params.clip);
                    if delta != 0.0 {
                        image[[j_x, j_y, voxel.j_z]] = voxel.x + delta;
                        icd::update_error_sinogram(a, &mut e, j_x, j_y, voxel.j_z, delta);
                    }
                    last_change[[j_x, j_y, voxel.j_z]] = delta;
                    delta_sqr += delta * delta;
                }
                updated += group.len();
            }
        }

        let weighted_norm_sqr_e = weighted_norm_sqr(&sino.weights, &e);
        if !weighted_norm_sqr_e.is_finite() {
            warn!("error sinogram went non-finite at iteration {}", iteration);
            return Err(ReconError::NonFinite { iteration });
        }

        let image_norm = image.iter().map(|&x| x * x).sum::<f32>().sqrt();
        let rel_update = delta_sqr.sqrt() / image_norm.max(f32::MIN_POSITIVE);
        let wall_time = tic.elapsed();
        total_equits += updated as f32 / num_voxels as f32;
        let iter_stats = IterationStats {
            iteration,
            cost: icd::map_cost(sino, &e, image, prior),
            rel_update,
            weighted_norm_sqr_e,
            ratio_updated: updated as f32 / num_voxels as f32,
            total_equits,
            voxels_per_second: updated as f32 / wall_time.as_secs_f32().max(1e-9),
            wall_time,
        };
        info!(
            "iteration {:3}: cost {:.6e} relUpdate {:.3e} wsqr(e) {:.3e} \
             updated {:.1}% equits {:.2} ({:.0} vox/s)",
            iter_stats.iteration,
            iter_stats.cost,
            iter_stats.rel_update,
            iter_stats.weighted_norm_sqr_e,
            100.0 * iter_stats.ratio_updated,
            iter_stats.total_equits,
            iter_stats.voxels_per_second,
        );
        observe(&iter_stats);
        stats.push(iter_stats);

        if rel_update < params.stop_threshold {
            converged = true;
            break;
        }
    }

    if !converged {
        warn!(
            "stopped after {} iterations with relUpdate above {:.3e}",
            params.max_iterations, params.stop_threshold
        );
    }
    Ok(ReconReport { converged, stats })
}

/// Decay applied to the last-change record of skipped ziplines.
const LAST_CHANGE_DECAY: f32 = 0.5;

/// Iterate `(j_x, j_y, index_zipline)` in hot-map order.
fn pairs_zipline_indices(
    n_x: usize,
    n_y: usize,
    n_ziplines: usize,
) -> impl Iterator<Item = (usize, usize, usize)> {
    (0..n_x).flat_map(move |j_x| {
        (0..n_y).flat_map(move |j_y| (0..n_ziplines).map(move |iz| (j_x, j_y, iz)))
    })
}

/// Apply `body` to every voxel of the group, fanned out over the pool
/// when one is available. Fork-join: returns once every voxel is done.
fn run_group<F>(
    pool: Option<&mut scoped_threadpool::Pool>,
    group: &mut [GroupVoxel],
    num_threads: usize,
    body: F,
) where
    F: Fn(&mut GroupVoxel) + Send + Sync,
{
    match pool {
        Some(pool) if group.len() > 1 => {
            let chunk_size = ceil_div(group.len(), num_threads);
            pool.scoped(|scope| {
                for chunk in group.chunks_mut(chunk_size) {
                    let body = &body;
                    scope.execute(move || {
                        for voxel in chunk {
                            body(voxel);
                        }
                    });
                }
            });
        }
        _ => {
            for voxel in group.iter_mut() {
                body(voxel);
            }
        }
    }
}

fn check_inputs(
    image: &Array3<f32>,
    sino: &Sinogram,
    a: &SysMatrix,
    sino_params: &SinoParams,
    params: &ReconParams,
    prior: &PriorModel,
) -> Result<(), ReconError> {
    let expected_image = (a.n_x, a.n_y, a.n_z);
    if image.dim() != expected_image {
        return Err(ReconError::ImageShape {
            expected: expected_image,
            got: image.dim(),
        });
    }
    let expected_sino = (sino_params.n_beta, sino_params.n_dv, sino_params.n_dw);
    if sino.data.dim() != expected_sino || sino.weights.dim() != expected_sino {
        return Err(ReconError::SinoShape {
            expected: expected_sino,
            got: sino.data.dim(),
        });
    }
    if a.n_beta != sino_params.n_beta {
        return Err(ReconError::SinoShape {
            expected: (a.n_beta, sino_params.n_dv, sino_params.n_dw),
            got: sino.data.dim(),
        });
    }
    if params.voxels_per_zipline == 0 {
        return Err(ReconError::Param {
            name: "voxels_per_zipline",
            why: "must be at least 1".into(),
        });
    }
    if params.num_threads == 0 {
        return Err(ReconError::Param {
            name: "num_threads",
            why: "must be at least 1".into(),
        });
    }
    if !(params.stop_threshold >= 0.0) {
        return Err(ReconError::Param {
            name: "stop_threshold",
            why: format!("must be non-negative, got {}", params.stop_threshold),
        });
    }
    if !(params.clip.0 <= params.clip.1) {
        return Err(ReconError::Param {
            name: "clip",
            why: format!("empty value box [{}, {}]", params.clip.0, params.clip.1),
        });
    }
    if let Some(nhicd) = &params.nhicd {
        if !(nhicd.activation_threshold > 0.0) || !(nhicd.last_change_threshold > 0.0) {
            return Err(ReconError::Param {
                name: "nhicd",
                why: "thresholds must be positive".into(),
            });
        }
    }
    prior.validate()?;
    if let PriorModel::ProxMap { target, .. } = prior {
        if target.dim() != expected_image {
            return Err(ReconError::ImageShape {
                expected: expected_image,
                got: target.dim(),
            });
        }
    }
    Ok(())
}
