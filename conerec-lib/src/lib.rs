// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! # Cone-beam MBIR reconstruction
//!
//! Model-based iterative reconstruction of 3-D volumes from cone-beam
//! sinograms. Two kernels do the heavy lifting: a separable sparse
//! system matrix (precomputed once, optionally 8-bit quantized, and
//! persisted to disk) and an iterative coordinate descent solver that
//! sweeps voxels in shuffled order, keeps an error sinogram in lock-step,
//! and updates axial voxel runs ("ziplines") as parallel groups.

pub mod codec;
pub mod geom;
pub mod icd;
pub mod prior;
pub mod project;
pub mod recon;
pub mod sysmatrix;
