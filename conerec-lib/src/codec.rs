// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Binary persistence of the system matrix.
//!
//! The layout is little-endian and position-defined: three 64-bit bounds,
//! seven 32-bit scalars, then the seven table payloads in a fixed order.
//! The image and sinogram shapes are deliberately not part of the file;
//! the reader derives every payload length from the geometry it is handed
//! plus the header bounds. Compression switches are not recorded either,
//! so reader and writer must share the same [`MatrixConfig`].

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, info};
use thiserror::Error;

use crate::geom::{ImageParams, SinoParams};
use crate::sysmatrix::{CoeffTable, MatrixConfig, SysMatrix};

/// Errors of the system-matrix codec. All fatal at this boundary.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("can't open system matrix file {path:?}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed writing system matrix to {path:?}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed reading system matrix from {path:?} (truncated file?)")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(
        "system matrix file {path:?} has trailing bytes; \
         the geometry or compression config does not match the writer"
    )]
    TrailingBytes { path: PathBuf },
    #[error("system matrix header of {path:?} is inconsistent: {what}")]
    BadHeader { path: PathBuf, what: String },
}

fn write_table<W: Write>(w: &mut W, table: &CoeffTable) -> io::Result<()> {
    match table {
        CoeffTable::Quantized(cells) => w.write_all(cells),
        CoeffTable::Float(cells) => {
            for &cell in cells {
                w.write_f32::<LittleEndian>(cell)?;
            }
            Ok(())
        }
    }
}

fn read_table<R: io::Read>(
    r: &mut R,
    len: usize,
    compressed: bool,
) -> io::Result<CoeffTable> {
    if compressed {
        let mut cells = vec![0u8; len];
        r.read_exact(&mut cells)?;
        Ok(CoeffTable::Quantized(cells))
    } else {
        let mut cells = vec![0.0f32; len];
        r.read_f32_into::<LittleEndian>(&mut cells)?;
        Ok(CoeffTable::Float(cells))
    }
}

fn write_indices<W: Write>(w: &mut W, indices: &[i32]) -> io::Result<()> {
    for &cell in indices {
        w.write_i32::<LittleEndian>(cell)?;
    }
    Ok(())
}

fn read_indices<R: io::Read>(r: &mut R, len: usize) -> io::Result<Vec<i32>> {
    let mut cells = vec![0i32; len];
    r.read_i32_into::<LittleEndian>(&mut cells)?;
    Ok(cells)
}

/// Write the matrix to disk in the fixed binary layout.
pub fn write_sys_matrix(path: &Path, a: &SysMatrix) -> Result<(), CodecError> {
    let file = File::create(path).map_err(|source| CodecError::Open {
        path: path.to_owned(),
        source,
    })?;
    let mut w = BufWriter::new(file);
    let failed = |source| CodecError::Write {
        path: path.to_owned(),
        source,
    };

    (|| -> io::Result<()> {
        w.write_i64::<LittleEndian>(a.i_vstride_max)?;
        w.write_i64::<LittleEndian>(a.i_wstride_max)?;
        w.write_i64::<LittleEndian>(a.n_u)?;
        w.write_f32::<LittleEndian>(a.b_ij_max)?;
        w.write_f32::<LittleEndian>(a.c_ij_max)?;
        w.write_f32::<LittleEndian>(a.b_ij_scaler)?;
        w.write_f32::<LittleEndian>(a.c_ij_scaler)?;
        w.write_f32::<LittleEndian>(a.delta_u)?;
        w.write_f32::<LittleEndian>(a.u_0)?;
        w.write_f32::<LittleEndian>(a.u_1)?;

        write_table(&mut w, &a.b)?;
        write_indices(&mut w, &a.i_vstart)?;
        write_indices(&mut w, &a.i_vstride)?;
        write_indices(&mut w, &a.j_u)?;
        write_table(&mut w, &a.c)?;
        write_indices(&mut w, &a.i_wstart)?;
        write_indices(&mut w, &a.i_wstride)?;
        w.flush()
    })()
    .map_err(failed)?;

    info!("wrote system matrix to {:?}", path);
    Ok(())
}

/// Read a matrix back. The caller supplies the geometry the matrix was
/// built for and the compression configuration the writer used; a
/// mismatch surfaces as a truncation or trailing-bytes error.
pub fn read_sys_matrix(
    path: &Path,
    sino: &SinoParams,
    img: &ImageParams,
    config: &MatrixConfig,
) -> Result<SysMatrix, CodecError> {
    let file = File::open(path).map_err(|source| CodecError::Open {
        path: path.to_owned(),
        source,
    })?;
    let mut r = BufReader::new(file);
    let failed = |source| CodecError::Read {
        path: path.to_owned(),
        source,
    };

    let i_vstride_max = r.read_i64::<LittleEndian>().map_err(failed)?;
    let i_wstride_max = r.read_i64::<LittleEndian>().map_err(failed)?;
    let n_u = r.read_i64::<LittleEndian>().map_err(failed)?;
    let b_ij_max = r.read_f32::<LittleEndian>().map_err(failed)?;
    let c_ij_max = r.read_f32::<LittleEndian>().map_err(failed)?;
    let b_ij_scaler = r.read_f32::<LittleEndian>().map_err(failed)?;
    let c_ij_scaler = r.read_f32::<LittleEndian>().map_err(failed)?;
    let delta_u = r.read_f32::<LittleEndian>().map_err(failed)?;
    let u_0 = r.read_f32::<LittleEndian>().map_err(failed)?;
    let u_1 = r.read_f32::<LittleEndian>().map_err(failed)?;

    let bad_header = |what: String| CodecError::BadHeader {
        path: path.to_owned(),
        what,
    };
    if i_vstride_max < 0 || i_vstride_max > sino.n_dv as i64 {
        return Err(bad_header(format!(
            "i_vstride_max = {} outside [0, N_dv = {}]",
            i_vstride_max, sino.n_dv
        )));
    }
    if i_wstride_max < 0 || i_wstride_max > sino.n_dw as i64 {
        return Err(bad_header(format!(
            "i_wstride_max = {} outside [0, N_dw = {}]",
            i_wstride_max, sino.n_dw
        )));
    }
    if n_u < 1 {
        return Err(bad_header(format!("N_u = {} < 1", n_u)));
    }

    let failed = |source| CodecError::Read {
        path: path.to_owned(),
        source,
    };
    let v_rows = img.n_x * img.n_y * sino.n_beta;
    let w_rows = n_u as usize * img.n_z;

    let b = read_table(
        &mut r,
        v_rows * i_vstride_max as usize,
        config.b_compressed,
    )
    .map_err(failed)?;
    let i_vstart = read_indices(&mut r, v_rows).map_err(failed)?;
    let i_vstride = read_indices(&mut r, v_rows).map_err(failed)?;
    let j_u = read_indices(&mut r, v_rows).map_err(failed)?;
    let c = read_table(
        &mut r,
        w_rows * i_wstride_max as usize,
        config.c_compressed,
    )
    .map_err(failed)?;
    let i_wstart = read_indices(&mut r, w_rows).map_err(failed)?;
    let i_wstride = read_indices(&mut r, w_rows).map_err(failed)?;

    // Any byte past the last payload means the file was written with a
    // different shape or configuration than the one supplied here.
    let extra = io::copy(&mut r, &mut io::sink()).map_err(failed)?;
    if extra > 0 {
        return Err(CodecError::TrailingBytes {
            path: path.to_owned(),
        });
    }

    debug!(
        "read system matrix from {:?}: B {} cells, C {} cells",
        path,
        b.len(),
        c.len()
    );

    Ok(SysMatrix {
        config: config.clone(),
        n_x: img.n_x,
        n_y: img.n_y,
        n_z: img.n_z,
        n_beta: sino.n_beta,
        i_vstride_max,
        i_wstride_max,
        n_u,
        b_ij_max,
        c_ij_max,
        b_ij_scaler,
        c_ij_scaler,
        delta_u,
        u_0,
        u_1,
        b,
        i_vstart,
        i_vstride,
        j_u,
        c,
        i_wstart,
        i_wstride,
    })
}
