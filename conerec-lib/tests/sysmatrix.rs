// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Structural properties of the precomputed system matrix.

mod common;

use conerec::geom::GeomError;
use conerec::project::forward_project;
use conerec::sysmatrix::{compute_sys_matrix, MatrixConfig, SysMatrix};
use ndarray::Array3;

fn max_coeff(table_len: usize, get: impl Fn(usize) -> f32) -> f32 {
    (0..table_len).fold(0.0f32, |acc, idx| acc.max(get(idx)))
}

#[test]
fn footprint_windows_stay_on_the_detector() {
    let (sino, img, _, a) = common::cardinal_matrix();
    for row in 0..img.n_x * img.n_y * sino.n_beta {
        let start = a.i_vstart[row];
        let stride = a.i_vstride[row];
        assert!(start >= 0 && start < sino.n_dv as i32);
        assert!(stride >= 0);
        assert!(start + stride <= sino.n_dv as i32);
        assert!((stride as i64) <= a.i_vstride_max);
        let j_u = a.j_u[row];
        assert!(j_u >= 0 && (j_u as i64) < a.n_u);
    }
    for row in 0..a.n_u as usize * img.n_z {
        let start = a.i_wstart[row];
        let stride = a.i_wstride[row];
        assert!(start >= 0 && start < sino.n_dw as i32);
        assert!(stride >= 0);
        assert!(start + stride <= sino.n_dw as i32);
        assert!((stride as i64) <= a.i_wstride_max);
    }
}

#[test]
fn u_grid_is_exactly_aligned() {
    let (_, _, _, a) = common::cardinal_matrix();
    assert_eq!(a.u_1, a.u_0 + a.n_u as f32 * a.delta_u);
    assert!(a.n_u >= 1);
    assert!(a.delta_u > 0.0);
}

#[test]
fn coefficients_are_non_negative() {
    let (_, _, _, a) = common::cardinal_matrix();
    for idx in 0..a.b.len() {
        assert!(a.b.get(idx, a.b_ij_scaler) >= 0.0);
    }
    for idx in 0..a.c.len() {
        assert!(a.c.get(idx, a.c_ij_scaler) >= 0.0);
    }
}

#[test]
fn quantized_tables_reach_their_tracked_maximum() {
    let (sino, img, angles) = common::cardinal_geometry();
    let config = MatrixConfig {
        b_compressed: true,
        c_compressed: true,
        oversample: 1.0,
    };
    let a = compute_sys_matrix(&sino, &img, &angles, &config).unwrap();
    assert!(a.b_ij_max > 0.0);
    assert!(a.c_ij_max > 0.0);
    assert!(a.b_ij_scaler > 0.0);
    assert!(a.c_ij_scaler > 0.0);

    let b_peak = max_coeff(a.b.len(), |idx| a.b.get(idx, a.b_ij_scaler));
    let c_peak = max_coeff(a.c.len(), |idx| a.c.get(idx, a.c_ij_scaler));
    // The tracked maximum is taken at zero offset from the footprint
    // center, so the largest stored cell sits within one quantization
    // step of it.
    assert!((b_peak - a.b_ij_max).abs() <= 1.5 * a.b_ij_scaler + 1e-6);
    assert!((c_peak - a.c_ij_max).abs() <= 1.5 * a.c_ij_scaler + 1e-6);
    assert!(b_peak <= a.b_ij_max + a.b_ij_scaler);
    assert!(c_peak <= a.c_ij_max + a.c_ij_scaler);
}

#[test]
fn precompute_is_deterministic() {
    let (sino, img, angles) = common::cardinal_geometry();
    let config = MatrixConfig::default();
    let first = compute_sys_matrix(&sino, &img, &angles, &config).unwrap();
    let second = compute_sys_matrix(&sino, &img, &angles, &config).unwrap();
    assert_eq!(first, second);
}

#[test]
fn impulse_projects_inside_its_predicted_windows() {
    let (sino, img, _, a) = common::cardinal_matrix();
    let (j_x, j_y, j_z) = (4usize, 4usize, 4usize);
    let mut image = Array3::<f32>::zeros((img.n_x, img.n_y, img.n_z));
    image[[j_x, j_y, j_z]] = 1.0;
    let proj = forward_project(&a, &sino, &image);

    for i_beta in 0..sino.n_beta {
        let row = a.vrow(j_x, j_y, i_beta);
        let (vstart, vstride) = (a.i_vstart[row] as usize, a.i_vstride[row] as usize);
        let wrow = a.wrow(a.j_u[row] as usize, j_z);
        let (wstart, wstride) = (a.i_wstart[wrow] as usize, a.i_wstride[wrow] as usize);
        assert!(vstride > 0 && wstride > 0, "impulse fell off the detector");

        let mut mass = 0.0f32;
        for i_v in 0..sino.n_dv {
            for i_w in 0..sino.n_dw {
                let value = proj[[i_beta, i_v, i_w]];
                let inside = i_v >= vstart
                    && i_v < vstart + vstride
                    && i_w >= wstart
                    && i_w < wstart + wstride;
                if !inside {
                    assert_eq!(
                        value, 0.0,
                        "nonzero cell ({}, {}, {}) outside the footprint window",
                        i_beta, i_v, i_w
                    );
                }
                mass += value;
            }
        }
        assert!(mass > 0.0, "empty footprint at view {}", i_beta);
    }
}

#[test]
fn source_inside_the_volume_is_rejected() {
    let (mut sino, img, angles) = common::cardinal_geometry();
    // Drag the source into the voxel grid.
    sino.u_s = 0.0;
    sino.u_d0 = 100.0;
    let err = compute_sys_matrix(&sino, &img, &angles, &MatrixConfig::default()).unwrap_err();
    match err {
        GeomError::SourceBehindVoxel { .. } => {}
        other => panic!("expected SourceBehindVoxel, got {:?}", other),
    }
}

#[test]
fn zero_dimension_is_rejected() {
    let (sino, mut img, angles) = common::cardinal_geometry();
    img.n_z = 0;
    let err = compute_sys_matrix(&sino, &img, &angles, &MatrixConfig::default()).unwrap_err();
    match err {
        GeomError::NonPositiveDim { .. } => {}
        other => panic!("expected NonPositiveDim, got {:?}", other),
    }
}

#[test]
fn oversampled_u_grid_is_denser() {
    let (sino, img, angles) = common::cardinal_geometry();
    let coarse = compute_sys_matrix(&sino, &img, &angles, &MatrixConfig::default()).unwrap();
    let fine = compute_sys_matrix(
        &sino,
        &img,
        &angles,
        &MatrixConfig {
            oversample: 2.0,
            ..MatrixConfig::default()
        },
    )
    .unwrap();
    assert_eq!(fine.delta_u, coarse.delta_u / 2.0);
    assert!(fine.n_u > coarse.n_u);
}

#[allow(dead_code)]
fn assert_send_sync<T: Send + Sync>() {}

#[test]
fn matrix_is_shareable_across_workers() {
    assert_send_sync::<SysMatrix>();
}
