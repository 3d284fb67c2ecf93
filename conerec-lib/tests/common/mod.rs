// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Shared scanner setups for the integration tests.

use conerec::geom::{ImageParams, SinoParams};
use conerec::sysmatrix::{compute_sys_matrix, MatrixConfig, SysMatrix};

/// Small isotropic scanner: an 8x8x8 unit-pitch volume centered on the
/// rotation axis, a far source so the rays are nearly parallel
/// (magnification about 1), a 16x16 detector that covers the volume with
/// margin, and the four cardinal view angles.
pub fn cardinal_geometry() -> (SinoParams, ImageParams, Vec<f32>) {
    let sino = SinoParams {
        n_beta: 4,
        n_dv: 16,
        n_dw: 16,
        u_s: -1.0e4,
        u_d0: 0.0,
        v_d0: -8.0,
        w_d0: -8.0,
        delta_dv: 1.0,
        delta_dw: 1.0,
        u_r: 0.0,
        v_r: 0.0,
    };
    let img = ImageParams {
        n_x: 8,
        n_y: 8,
        n_z: 8,
        x_0: -4.0,
        y_0: -4.0,
        z_0: -4.0,
        delta_xy: 1.0,
        delta_z: 1.0,
    };
    let half_pi = std::f32::consts::FRAC_PI_2;
    let angles = vec![0.0, half_pi, 2.0 * half_pi, 3.0 * half_pi];
    (sino, img, angles)
}

/// Uncompressed matrix for the cardinal scanner.
pub fn cardinal_matrix() -> (SinoParams, ImageParams, Vec<f32>, SysMatrix) {
    let (sino, img, angles) = cardinal_geometry();
    let a = compute_sys_matrix(&sino, &img, &angles, &MatrixConfig::default())
        .expect("valid test geometry");
    (sino, img, angles, a)
}
