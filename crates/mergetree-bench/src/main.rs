//! mergetree-bench: CLI tool for denoising parameter experimentation and
//! diagnostics.
//!
//! Runs the merge-tree denoising pipeline on a given image file with
//! configurable parameters, printing detailed per-stage diagnostics. Useful
//! for:
//!
//! - Comparing global and per-component bilateral sigmas
//! - Tuning the cut level, step size, and step budget
//! - Measuring per-stage durations to identify bottlenecks
//! - Checking how far diffusion gets before the stopping rule fires
//!
//! # Usage
//!
//! ```text
//! cargo run --release --bin mergetree-bench -- [OPTIONS] <IMAGE_PATH>
//! ```
//!
//! Library logs go to stderr; set `RUST_LOG` (e.g. `RUST_LOG=mergetree=debug`)
//! to see per-step diffusion scores.

#![allow(clippy::print_stdout, clippy::print_stderr)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::{Parser, ValueEnum};
use mergetree::diagnostics::{Clock, DenoiseDiagnostics};
use mergetree::{
    CutLevel, DenoiseConfig, Denoised, DiffusionConfig, ScalarImage, SigmaMode, StopRule,
};
use tracing_subscriber::EnvFilter;

/// Merge-tree denoising experimentation and diagnostics.
///
/// Builds the merge tree of a grayscale image, optionally cuts it, runs
/// tree-aware diffusion, and prints per-stage timing and count
/// diagnostics.
#[derive(Parser)]
#[command(name = "mergetree-bench", version)]
struct Cli {
    /// Path to the input image (any format the `image` crate decodes).
    image_path: PathBuf,

    /// Maximum number of diffusion steps.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_STEPS)]
    steps: usize,

    /// Diffusion step size.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_ALPHA)]
    alpha: f64,

    /// Global spatial sigma in pixels.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_SPATIAL_SIGMA)]
    spatial_sigma: f64,

    /// Global intensity sigma in normalized units.
    #[arg(long, default_value_t = DiffusionConfig::DEFAULT_INTENSITY_SIGMA)]
    intensity_sigma: f64,

    /// Derive sigmas per component instead of using the global values.
    #[arg(long, conflicts_with_all = ["spatial_sigma", "intensity_sigma"])]
    per_component: bool,

    /// Cut at this level (raw image units) instead of the max-jump level.
    #[arg(long, conflicts_with = "no_cut")]
    cut_level: Option<f64>,

    /// Diffuse over the full tree without cutting.
    #[arg(long)]
    no_cut: bool,

    /// Unsupervised stopping rule.
    #[arg(long, value_enum, default_value_t = Stop::EntropyRate)]
    stop: Stop,

    /// Clean reference image; supervises diffusion when given.
    #[arg(long)]
    ground_truth: Option<PathBuf>,

    /// Write the denoised image as PNG.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Number of runs for averaging.
    #[arg(long, default_value_t = 1, value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..))]
    runs: usize,

    /// Output diagnostics as JSON instead of human-readable report.
    #[arg(long)]
    json: bool,

    /// Full denoise config as a JSON string.
    ///
    /// When provided, all other parameter flags are ignored.
    /// The JSON must be a valid `DenoiseConfig` serialization.
    #[arg(long)]
    config_json: Option<String>,
}

/// Stopping rule selection.
#[derive(Clone, Copy, ValueEnum)]
enum Stop {
    /// Stop when the entropy rate turns upward.
    EntropyRate,
    /// Always run the full step budget.
    Never,
}

/// Build a [`DenoiseConfig`] from CLI arguments.
///
/// If `--config-json` is provided, the JSON is parsed directly and all
/// individual parameter flags are ignored.  Otherwise, a config is
/// assembled from the individual flags.
fn config_from_cli(cli: &Cli) -> Result<DenoiseConfig, String> {
    if let Some(ref json) = cli.config_json {
        return serde_json::from_str(json).map_err(|e| format!("Error parsing --config-json: {e}"));
    }

    Ok(DenoiseConfig {
        cut: match (cli.no_cut, cli.cut_level) {
            (true, _) => CutLevel::None,
            (false, Some(level)) => CutLevel::Level(level),
            (false, None) => CutLevel::MaxJump,
        },
        diffusion: DiffusionConfig {
            steps: cli.steps,
            alpha: cli.alpha,
            sigma: if cli.per_component {
                SigmaMode::PerComponent
            } else {
                SigmaMode::Global {
                    spatial: cli.spatial_sigma,
                    intensity: cli.intensity_sigma,
                }
            },
            stop: match cli.stop {
                Stop::EntropyRate => StopRule::EntropyRate,
                Stop::Never => StopRule::Never,
            },
        },
        ..DenoiseConfig::default()
    })
}

/// Decode an image file to its luma channel.
fn load_luma(path: &Path) -> Result<ScalarImage, String> {
    let gray = image::open(path)
        .map_err(|e| format!("Error reading {}: {e}", path.display()))?
        .to_luma8();
    ScalarImage::from_luma(&gray).map_err(|e| format!("Error loading {}: {e}", path.display()))
}

/// Save the denoised image, clamped at zero, as an 8-bit PNG.
fn write_png(path: &Path, denoised: &Denoised) -> Result<(), String> {
    denoised
        .tree
        .to_image(true)
        .to_luma8()
        .save_with_format(path, image::ImageFormat::Png)
        .map_err(|e| format!("Error writing {}: {e}", path.display()))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    if let Err(e) = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .try_init()
    {
        eprintln!("Logger initialization failed: {e}");
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    let config = match config_from_cli(&cli) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let image = match load_luma(&cli.image_path) {
        Ok(image) => image,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    let ground_truth = match cli.ground_truth.as_deref().map(load_luma).transpose() {
        Ok(gt) => gt,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::FAILURE;
        }
    };

    eprintln!(
        "Image: {} ({}x{})",
        cli.image_path.display(),
        image.rows(),
        image.cols(),
    );
    if let Some(ref path) = cli.ground_truth {
        eprintln!("Ground truth: {}", path.display());
    }
    eprintln!("Config: {config:#?}");
    eprintln!("Runs: {}", cli.runs);
    eprintln!();

    let mut all_diagnostics = Vec::with_capacity(cli.runs);

    for run in 0..cli.runs {
        if cli.runs > 1 {
            eprintln!("--- Run {}/{} ---", run + 1, cli.runs);
        }

        match mergetree::diagnostics::denoise_with_diagnostics(
            &image,
            &config,
            ground_truth.as_ref(),
            &StdClock,
        ) {
            Ok((denoised, diagnostics)) => {
                if cli.json {
                    match serde_json::to_string_pretty(&diagnostics) {
                        Ok(json) => println!("{json}"),
                        Err(e) => {
                            eprintln!("Error serializing diagnostics: {e}");
                            return ExitCode::FAILURE;
                        }
                    }
                } else {
                    println!("{}", diagnostics.report());
                    if let Some(ref gt) = ground_truth {
                        let raw = mergetree::metrics::mse(denoised.image.data(), gt.data());
                        println!("MSE vs ground truth (raw units): {raw:.4}");
                    }
                }

                // Write the image on the first run only.
                if run == 0
                    && let Some(ref output) = cli.output
                {
                    match write_png(output, &denoised) {
                        Ok(()) => {
                            eprintln!("Denoised image written to {}", output.display());
                        }
                        Err(msg) => {
                            eprintln!("{msg}");
                            return ExitCode::FAILURE;
                        }
                    }
                }

                all_diagnostics.push(diagnostics);
            }
            Err(e) => {
                eprintln!("Pipeline error: {e}");
                return ExitCode::FAILURE;
            }
        }

        if cli.runs > 1 {
            eprintln!();
        }
    }

    // Print summary when multiple runs.
    if cli.runs > 1 {
        print_multi_run_summary(&all_diagnostics);
    }

    ExitCode::SUCCESS
}

/// [`Clock`] implementation backed by [`std::time::Instant`].
struct StdClock;

impl Clock for StdClock {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn elapsed(&self, since: &Instant) -> Duration {
        since.elapsed()
    }
}

/// Function pointer type for extracting a stage duration from diagnostics.
type StageExtractor = fn(&DenoiseDiagnostics) -> Option<Duration>;

/// Print aggregated statistics across multiple runs.
#[allow(clippy::cast_precision_loss)]
fn print_multi_run_summary(all_diagnostics: &[DenoiseDiagnostics]) {
    println!();
    println!(
        "Summary ({} runs)\n{}",
        all_diagnostics.len(),
        "=".repeat(60),
    );

    if all_diagnostics.is_empty() {
        println!("Warning: no diagnostics to summarize");
        return;
    }

    let durations: Vec<f64> = all_diagnostics
        .iter()
        .map(|d| d.total_duration.as_secs_f64() * 1000.0)
        .collect();

    let min = durations.iter().copied().reduce(f64::min).unwrap_or(0.0);
    let max = durations.iter().copied().reduce(f64::max).unwrap_or(0.0);
    let mean = durations.iter().sum::<f64>() / durations.len() as f64;

    println!("Total duration: min={min:.3}ms  mean={mean:.3}ms  max={max:.3}ms");

    println!();
    println!("{:<24} {:>12}", "Stage", "Mean (ms)");
    println!("{}", "-".repeat(40));

    let stage_extractors: &[(&str, StageExtractor)] = &[
        ("Build", |d| Some(d.build.duration)),
        ("Cut", |d| d.cut.as_ref().map(|s| s.duration)),
        ("Diffusion", |d| Some(d.diffusion.duration)),
    ];

    for (name, extractor) in stage_extractors {
        let stage_durations: Vec<f64> = all_diagnostics
            .iter()
            .filter_map(extractor)
            .map(|dur| dur.as_secs_f64() * 1000.0)
            .collect();

        if stage_durations.is_empty() {
            continue;
        }

        let stage_mean = stage_durations.iter().sum::<f64>() / stage_durations.len() as f64;
        println!("{name:<24} {stage_mean:>10.3}ms");
    }
}
