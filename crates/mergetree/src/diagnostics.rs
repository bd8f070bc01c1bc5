//! Pipeline diagnostics: timing, counts, and other metrics for each stage.
//!
//! These diagnostics are permanent instrumentation intended for parameter
//! experimentation. [`denoise_with_diagnostics`] runs the staged pipeline
//! and records one [`StageDiagnostics`] per stage.
//!
//! Time is read through the [`Clock`] trait so callers can pick their own
//! time source. [`WebClock`] uses the `web-time` crate, which maps to
//! `performance.now()` on WASM and `std::time::Instant` on native.
//!
//! Durations are serialized as fractional seconds (`f64`) for JSON
//! compatibility, since `std::time::Duration` does not implement serde
//! traits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::diffusion::{SigmaMode, StopReason};
use crate::pipeline::Pipeline;
use crate::types::{DenoiseConfig, Denoised, ScalarImage, TreeError};

/// Serde support for `std::time::Duration` as fractional seconds.
mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// A monotonic time source.
pub trait Clock {
    /// Opaque timestamp type.
    type Instant;

    /// Current timestamp.
    fn now(&self) -> Self::Instant;

    /// Time elapsed since `since`.
    fn elapsed(&self, since: &Self::Instant) -> Duration;
}

/// [`Clock`] backed by [`web_time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WebClock;

impl Clock for WebClock {
    type Instant = web_time::Instant;

    fn now(&self) -> web_time::Instant {
        web_time::Instant::now()
    }

    fn elapsed(&self, since: &web_time::Instant) -> Duration {
        since.elapsed()
    }
}

/// Diagnostics collected from a single pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiseDiagnostics {
    /// Stage 1: merge tree construction.
    pub build: StageDiagnostics,
    /// Stage 2: tree cut (only when `config.cut` is not `None`).
    pub cut: Option<StageDiagnostics>,
    /// Stage 3: diffusion.
    pub diffusion: StageDiagnostics,
    /// Total wall-clock duration of the entire pipeline (seconds).
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    /// Summary counts across all stages.
    pub summary: DenoiseSummary,
}

/// Diagnostics for a single pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    /// Wall-clock duration of this stage (seconds).
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    /// Stage-specific metrics.
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    /// Merge tree construction.
    Build {
        /// Image rows.
        rows: usize,
        /// Image columns.
        cols: usize,
        /// Number of components.
        components: usize,
        /// Lifetime of the longest-lived component (normalized).
        max_lifetime: f64,
    },
    /// Tree cut.
    Cut {
        /// Threshold in raw image units.
        level: f64,
        /// Threshold in normalized units.
        normalized_level: f64,
        /// Components before the cut.
        components_before: usize,
        /// Components after the cut.
        components_after: usize,
    },
    /// Diffusion.
    Diffusion {
        /// Step budget.
        max_steps: usize,
        /// Committed steps.
        steps: usize,
        /// Step size.
        alpha: f64,
        /// Sigma mode description.
        sigma: String,
        /// Final score.
        score: f64,
        /// Why diffusion stopped.
        stop: StopReason,
    },
}

/// High-level summary for the entire pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiseSummary {
    /// Image rows.
    pub rows: usize,
    /// Image columns.
    pub cols: usize,
    /// Total pixel count.
    pub pixel_count: usize,
    /// Components in the active view fed to diffusion.
    pub components: usize,
    /// Committed diffusion steps.
    pub steps: usize,
    /// Final diffusion score.
    pub score: f64,
}

/// Run the staged pipeline, timing every stage with `clock`.
///
/// # Errors
///
/// Returns the first [`TreeError`] raised by any stage.
pub fn denoise_with_diagnostics<C: Clock>(
    image: &ScalarImage,
    config: &DenoiseConfig,
    ground_truth: Option<&ScalarImage>,
    clock: &C,
) -> Result<(Denoised, DenoiseDiagnostics), TreeError> {
    let total_start = clock.now();

    let mut pending = Pipeline::new(image.clone(), config.clone());
    if let Some(gt) = ground_truth {
        pending = pending.with_ground_truth(gt.clone());
    }

    let start = clock.now();
    let built = pending.build()?;
    let tree = built.tree();
    let components_before = tree.components().len();
    let build = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Build {
            rows: tree.info().rows,
            cols: tree.info().cols,
            components: components_before,
            max_lifetime: tree
                .lifetimes()
                .iter()
                .map(|&(_, l)| l)
                .fold(0.0, f64::max),
        },
    };

    let start = clock.now();
    let pruned = built.cut()?;
    let cut_duration = clock.elapsed(&start);
    let components = pruned.tree().components().len();
    let cut = match (pruned.level(), pruned.tree().cut_view()) {
        (Some(level), Some(view)) => Some(StageDiagnostics {
            duration: cut_duration,
            metrics: StageMetrics::Cut {
                level,
                normalized_level: view.level,
                components_before,
                components_after: components,
            },
        }),
        _ => None,
    };

    let start = clock.now();
    let result = pruned.diffuse()?.into_result();
    let diffusion = StageDiagnostics {
        duration: clock.elapsed(&start),
        metrics: StageMetrics::Diffusion {
            max_steps: config.diffusion.steps,
            steps: result.steps,
            alpha: config.diffusion.alpha,
            sigma: describe_sigma(config.diffusion.sigma),
            score: result.score,
            stop: result.stop,
        },
    };

    let diagnostics = DenoiseDiagnostics {
        build,
        cut,
        diffusion,
        total_duration: clock.elapsed(&total_start),
        summary: DenoiseSummary {
            rows: image.rows(),
            cols: image.cols(),
            pixel_count: image.len(),
            components,
            steps: result.steps,
            score: result.score,
        },
    };
    Ok((result, diagnostics))
}

fn describe_sigma(sigma: SigmaMode) -> String {
    match sigma {
        SigmaMode::Global { spatial, intensity } => {
            format!("global(spatial={spatial}, intensity={intensity})")
        }
        SigmaMode::PerComponent => String::from("per-component"),
    }
}

impl DenoiseDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Denoise Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.rows, self.summary.cols, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<24} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages = vec![("Build", &self.build)];
        if let Some(ref cut) = self.cut {
            stages.push(("Cut", cut));
        }
        stages.push(("Diffusion", &self.diffusion));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<24} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        lines.push(String::new());
        lines.push(format!(
            "Components: {}  |  Steps: {}  |  Score: {:.6}",
            self.summary.components, self.summary.steps, self.summary.score,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

/// Format stage metrics into a compact detail string.
fn format_metrics(metrics: &StageMetrics) -> String {
    match metrics {
        StageMetrics::Build {
            rows,
            cols,
            components,
            max_lifetime,
        } => format!("{rows}x{cols} components={components} max_lifetime={max_lifetime:.4}"),
        StageMetrics::Cut {
            level,
            normalized_level,
            components_before,
            components_after,
        } => format!(
            "level={level:.4} (normalized {normalized_level:.4}) components={components_before}->{components_after}"
        ),
        StageMetrics::Diffusion {
            max_steps,
            steps,
            alpha,
            sigma,
            score,
            stop,
        } => format!("alpha={alpha} {sigma} steps={steps}/{max_steps} score={score:.6} ({stop})"),
    }
}
