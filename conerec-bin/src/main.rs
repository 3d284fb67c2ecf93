// SPDX-License-Identifier: MPL-2.0

use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use ndarray::Array3;

use conerec::codec::{read_sys_matrix, write_sys_matrix};
use conerec::geom::{self, GeomError, ImageParams, SinoParams};
use conerec::prior::{PriorError, PriorModel, QggmrfParams};
use conerec::project::Sinogram;
use conerec::recon::{reconstruct, ReconError, ReconParams};
use conerec::sysmatrix::{compute_sys_matrix, MatrixConfig, SysMatrix};

// Default values for some of the program arguments.
const DEFAULT_OVERSAMPLE: &str = "1.0";

/// Entry point of the program.
fn main() {
    // CLI arguments shared by every subcommand that touches the matrix.
    let matrix_args = vec![
        clap::Arg::with_name("geometry")
            .long("geometry")
            .value_name("path")
            .required(true)
            .help("TOML file with the scanner and image geometry"),
        clap::Arg::with_name("sysmatrix")
            .long("sysmatrix")
            .value_name("path")
            .required(true)
            .help("Path of the precomputed system matrix"),
        clap::Arg::with_name("compress-b")
            .long("compress-b")
            .help("Quantize the in-plane footprint table to 8 bits"),
        clap::Arg::with_name("compress-c")
            .long("compress-c")
            .help("Quantize the axial footprint table to 8 bits"),
        clap::Arg::with_name("oversample")
            .long("oversample")
            .value_name("x")
            .default_value(DEFAULT_OVERSAMPLE)
            .help("Oversampling ratio of the scanner-u grid"),
    ];
    let recon_args = vec![
        clap::Arg::with_name("sinogram")
            .long("sinogram")
            .value_name("path")
            .required(true)
            .help("Measured sinogram, raw little-endian f32, w fastest"),
        clap::Arg::with_name("weights")
            .long("weights")
            .value_name("path")
            .help("Data-term weights, same layout as the sinogram (default all ones)"),
        clap::Arg::with_name("image")
            .long("image")
            .value_name("path")
            .required(true)
            .help("Output volume, raw little-endian f32, z fastest"),
        clap::Arg::with_name("recon-params")
            .long("recon-params")
            .value_name("path")
            .help("TOML file with solver and prior parameters"),
        clap::Arg::with_name("seed")
            .long("seed")
            .value_name("N")
            .help("Override the voxel-order shuffle seed"),
        clap::Arg::with_name("max-iterations")
            .long("max-iterations")
            .value_name("N")
            .help("Override the iteration cap"),
        clap::Arg::with_name("stop-threshold")
            .long("stop-threshold")
            .value_name("x")
            .help("Override the relative-update stop threshold"),
    ];

    let matches = clap::App::new("conerec")
        .version(std::env!("CARGO_PKG_VERSION"))
        .about("Cone-beam MBIR: precompute the system matrix, then reconstruct")
        .setting(clap::AppSettings::SubcommandRequiredElseHelp)
        .arg(
            clap::Arg::with_name("verbose")
                .short("v")
                .multiple(true)
                .global(true)
                .help("Multiple levels of verbosity (up to -vvv)"),
        )
        .subcommand(
            clap::SubCommand::with_name("precompute")
                .about("Build the separable system matrix and write it to disk")
                .args(&matrix_args),
        )
        .subcommand(
            clap::SubCommand::with_name("reconstruct")
                .about("Run ICD against a measured sinogram")
                .args(&matrix_args)
                .args(&recon_args),
        )
        .subcommand(
            clap::SubCommand::with_name("roundtrip")
                .about("Precompute, persist, re-read and verify the matrix")
                .args(&matrix_args),
        )
        .get_matches();

    // Set log verbosity.
    let verbosity = 1 + matches.occurrences_of("verbose");
    if let Err(err) = stderrlog::new()
        .quiet(false)
        .verbosity(verbosity as usize)
        .show_level(false)
        .color(stderrlog::ColorChoice::Never)
        .init()
    {
        eprintln!("Failed to initialize logging: {}", err);
        std::process::exit(1);
    }

    let result = match matches.subcommand() {
        ("precompute", Some(sub)) => run_precompute(sub),
        ("reconstruct", Some(sub)) => run_reconstruct(sub),
        ("roundtrip", Some(sub)) => run_roundtrip(sub),
        _ => unreachable!("subcommand is required"),
    };
    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            log::error!("{:#}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

/// Command-line values that parse but fail validation.
#[derive(Debug, thiserror::Error)]
#[error("argument --{name} is invalid: {why}")]
struct ArgError {
    name: &'static str,
    why: String,
}

/// Map an error chain to the documented exit codes: 1 for I/O,
/// 2 for parameter problems, 3 for numerical failure.
fn exit_code(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if cause.downcast_ref::<GeomError>().is_some()
            || cause.downcast_ref::<PriorError>().is_some()
            || cause.downcast_ref::<ArgError>().is_some()
            || cause.downcast_ref::<toml::de::Error>().is_some()
            || cause.downcast_ref::<std::num::ParseIntError>().is_some()
            || cause.downcast_ref::<std::num::ParseFloatError>().is_some()
        {
            return 2;
        }
        if let Some(recon_err) = cause.downcast_ref::<ReconError>() {
            return match recon_err {
                ReconError::NonFinite { .. } => 3,
                _ => 2,
            };
        }
    }
    1
}

/// On-disk geometry description.
#[derive(Debug, serde::Deserialize)]
struct GeometryFile {
    sino: SinoParams,
    image: ImageParams,
    /// View angles in radians, one per view.
    view_angles: Vec<f32>,
}

/// On-disk solver and prior parameters. Everything has a default so a
/// missing file or section falls back to the stock solver.
#[derive(Debug, Default, serde::Deserialize)]
struct ReconFile {
    #[serde(default)]
    recon: ReconParams,
    #[serde(default)]
    prior: QggmrfParams,
}

fn load_geometry(path: &Path) -> anyhow::Result<GeometryFile> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("Failed to read geometry file {}", path.display()))?;
    let geometry: GeometryFile = toml::from_str(&text)
        .with_context(|| format!("Failed to parse geometry file {}", path.display()))?;
    geom::validate(&geometry.sino, &geometry.image, &geometry.view_angles)
        .context("Invalid geometry")?;
    Ok(geometry)
}

fn load_recon_file(path: Option<&str>) -> anyhow::Result<ReconFile> {
    match path {
        None => Ok(ReconFile::default()),
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("Failed to read recon params {}", path))?;
            toml::from_str(&text)
                .with_context(|| format!("Failed to parse recon params {}", path))
        }
    }
}

fn matrix_config(sub: &clap::ArgMatches) -> anyhow::Result<MatrixConfig> {
    let oversample: f32 = sub
        .value_of("oversample")
        .unwrap()
        .parse()
        .context("Failed to parse --oversample")?;
    if !(oversample > 0.0) {
        return Err(ArgError {
            name: "oversample",
            why: format!("must be positive, got {}", oversample),
        }
        .into());
    }
    Ok(MatrixConfig {
        b_compressed: sub.is_present("compress-b"),
        c_compressed: sub.is_present("compress-c"),
        oversample,
    })
}

/// Load a raw little-endian f32 volume of the exact given shape.
fn read_volume(path: &Path, shape: (usize, usize, usize)) -> anyhow::Result<Array3<f32>> {
    let file = fs::File::open(path)
        .with_context(|| format!("Failed to open volume {}", path.display()))?;
    let mut r = BufReader::new(file);
    let mut cells = vec![0.0f32; shape.0 * shape.1 * shape.2];
    r.read_f32_into::<LittleEndian>(&mut cells)
        .with_context(|| format!("Volume {} is shorter than expected", path.display()))?;
    let extra = std::io::copy(&mut r, &mut std::io::sink())?;
    anyhow::ensure!(
        extra == 0,
        "Volume {} is larger than the declared {}x{}x{} cells",
        path.display(),
        shape.0,
        shape.1,
        shape.2
    );
    Array3::from_shape_vec(shape, cells)
        .with_context(|| format!("Volume {} does not fit its shape", path.display()))
}

fn write_volume(path: &Path, volume: &Array3<f32>) -> anyhow::Result<()> {
    let file = fs::File::create(path)
        .with_context(|| format!("Failed to create volume {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for &cell in volume.iter() {
        w.write_f32::<LittleEndian>(cell)
            .with_context(|| format!("Failed to write volume {}", path.display()))?;
    }
    w.flush()
        .with_context(|| format!("Failed to flush volume {}", path.display()))
}

fn run_precompute(sub: &clap::ArgMatches) -> anyhow::Result<i32> {
    let geometry = load_geometry(Path::new(sub.value_of("geometry").unwrap()))?;
    let config = matrix_config(sub)?;
    let now = std::time::Instant::now();
    let a = compute_sys_matrix(
        &geometry.sino,
        &geometry.image,
        &geometry.view_angles,
        &config,
    )
    .context("Failed to precompute the system matrix")?;
    log::info!(
        "Precomputed the system matrix in {:.1} s",
        now.elapsed().as_secs_f32()
    );
    write_sys_matrix(Path::new(sub.value_of("sysmatrix").unwrap()), &a)
        .context("Failed to persist the system matrix")?;
    Ok(0)
}

/// Reuse a persisted matrix when one is present, otherwise build and
/// persist it for the next run.
fn load_or_compute_matrix(
    sub: &clap::ArgMatches,
    geometry: &GeometryFile,
    config: &MatrixConfig,
) -> anyhow::Result<SysMatrix> {
    let path = PathBuf::from(sub.value_of("sysmatrix").unwrap());
    if path.exists() {
        log::info!("Reading system matrix from {}", path.display());
        let a = read_sys_matrix(&path, &geometry.sino, &geometry.image, config)
            .context("Failed to read the system matrix")?;
        Ok(a)
    } else {
        log::info!("No matrix at {}, precomputing", path.display());
        let a = compute_sys_matrix(
            &geometry.sino,
            &geometry.image,
            &geometry.view_angles,
            config,
        )
        .context("Failed to precompute the system matrix")?;
        write_sys_matrix(&path, &a).context("Failed to persist the system matrix")?;
        Ok(a)
    }
}

fn run_reconstruct(sub: &clap::ArgMatches) -> anyhow::Result<i32> {
    let geometry = load_geometry(Path::new(sub.value_of("geometry").unwrap()))?;
    let config = matrix_config(sub)?;
    let recon_file = load_recon_file(sub.value_of("recon-params"))?;

    let mut params = recon_file.recon;
    if let Some(seed) = sub.value_of("seed") {
        params.seed = seed.parse().context("Failed to parse --seed")?;
    }
    if let Some(n) = sub.value_of("max-iterations") {
        params.max_iterations = n.parse().context("Failed to parse --max-iterations")?;
    }
    if let Some(x) = sub.value_of("stop-threshold") {
        params.stop_threshold = x.parse().context("Failed to parse --stop-threshold")?;
    }

    let a = load_or_compute_matrix(sub, &geometry, &config)?;

    let sino_shape = (
        geometry.sino.n_beta,
        geometry.sino.n_dv,
        geometry.sino.n_dw,
    );
    let data = read_volume(Path::new(sub.value_of("sinogram").unwrap()), sino_shape)?;
    let sino = match sub.value_of("weights") {
        Some(path) => Sinogram {
            weights: read_volume(Path::new(path), sino_shape)?,
            data,
        },
        None => Sinogram::unweighted(data),
    };

    let mut image = Array3::zeros((
        geometry.image.n_x,
        geometry.image.n_y,
        geometry.image.n_z,
    ));
    let prior = PriorModel::Qggmrf(recon_file.prior);

    let pb = if log::log_enabled!(log::Level::Info) {
        indicatif::ProgressBar::new(params.max_iterations as u64)
    } else {
        indicatif::ProgressBar::hidden()
    };
    let report = reconstruct(
        &mut image,
        &sino,
        &a,
        &geometry.sino,
        &params,
        &prior,
        |stats| {
            pb.set_message(&format!("cost {:.4e}", stats.cost));
            pb.inc(1);
        },
    )
    .context("Reconstruction failed")?;
    pb.finish();

    write_volume(Path::new(sub.value_of("image").unwrap()), &image)?;

    if report.converged {
        Ok(0)
    } else {
        log::warn!("Reconstruction did not reach the stop threshold");
        Ok(3)
    }
}

fn run_roundtrip(sub: &clap::ArgMatches) -> anyhow::Result<i32> {
    let geometry = load_geometry(Path::new(sub.value_of("geometry").unwrap()))?;
    let config = matrix_config(sub)?;
    let path = PathBuf::from(sub.value_of("sysmatrix").unwrap());

    let a = compute_sys_matrix(
        &geometry.sino,
        &geometry.image,
        &geometry.view_angles,
        &config,
    )
    .context("Failed to precompute the system matrix")?;
    write_sys_matrix(&path, &a).context("Failed to persist the system matrix")?;
    let b = read_sys_matrix(&path, &geometry.sino, &geometry.image, &config)
        .context("Failed to re-read the system matrix")?;

    anyhow::ensure!(
        a == b,
        "Matrix read back from {} differs from the one written",
        path.display()
    );
    log::info!("Round-trip through {} is bit-exact", path.display());
    println!("ok");
    Ok(0)
}
