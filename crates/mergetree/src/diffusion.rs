//! Anisotropic diffusion over the merge tree's neighbor graph.
//!
//! Each pixel exchanges value with its tree parent and its 8 grid
//! neighbors. Every exchange is weighted by a bilateral kernel (spatial
//! distance times intensity difference), and the weighted differences are
//! summed without normalization:
//!
//! ```text
//! v' = v + alpha * sum_n  exp(-d_n^2 / (2 s^2 + eps)) * exp(-D_n^2 / (2 i^2 + eps)) * D_n
//! ```
//!
//! where `D_n = v_n - v`. A step reads the previous values only, so nodes
//! update in parallel.
//!
//! Diffusion stops on one of three rules:
//!
//! - **Supervised**: with a ground truth, stop at the first step whose MSE
//!   does not improve.
//! - **Entropy rate**: without one, track the spatial entropy against
//!   `ln(step + 1)` and stop when its estimated rate of change rises.
//! - **Never**: run every step.
//!
//! The stopping step is never committed.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::metrics::mse;
use crate::oracle::NEIGHBOR_OFFSETS;
use crate::tree::MergeTree;
use crate::types::{EPSILON, ScalarImage, TreeError};

/// How bilateral sigmas are chosen.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SigmaMode {
    /// One spatial and one intensity sigma for every pixel.
    Global {
        /// Spatial sigma in pixels.
        spatial: f64,
        /// Intensity sigma in normalized units.
        intensity: f64,
    },
    /// Each pixel uses its component's maximum distance to the apex as the
    /// spatial sigma and the component's lifetime as the intensity sigma.
    PerComponent,
}

impl Default for SigmaMode {
    fn default() -> Self {
        Self::Global {
            spatial: DiffusionConfig::DEFAULT_SPATIAL_SIGMA,
            intensity: DiffusionConfig::DEFAULT_INTENSITY_SIGMA,
        }
    }
}

/// Stopping rule when no ground truth is supplied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StopRule {
    /// Stop when the log-time rate of change of spatial entropy increases.
    #[default]
    EntropyRate,
    /// Run all configured steps.
    Never,
}

/// Diffusion parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DiffusionConfig {
    /// Maximum number of steps.
    pub steps: usize,
    /// Step size applied to the weighted difference sum.
    pub alpha: f64,
    /// Bilateral sigma selection.
    pub sigma: SigmaMode,
    /// Unsupervised stopping rule; ignored when a ground truth is given.
    pub stop: StopRule,
}

impl DiffusionConfig {
    /// Default step budget.
    pub const DEFAULT_STEPS: usize = 50;
    /// Default step size.
    pub const DEFAULT_ALPHA: f64 = 0.1;
    /// Default global spatial sigma.
    pub const DEFAULT_SPATIAL_SIGMA: f64 = 1.0;
    /// Default global intensity sigma.
    pub const DEFAULT_INTENSITY_SIGMA: f64 = 0.1;

    /// Check that every numeric parameter is finite.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] naming the offending field.
    pub fn validate(&self) -> Result<(), TreeError> {
        if !self.alpha.is_finite() {
            return Err(TreeError::InvalidConfig(format!(
                "alpha must be finite, got {}",
                self.alpha
            )));
        }
        if let SigmaMode::Global { spatial, intensity } = self.sigma {
            if !spatial.is_finite() {
                return Err(TreeError::InvalidConfig(format!(
                    "spatial sigma must be finite, got {spatial}"
                )));
            }
            if !intensity.is_finite() {
                return Err(TreeError::InvalidConfig(format!(
                    "intensity sigma must be finite, got {intensity}"
                )));
            }
        }
        Ok(())
    }
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            steps: Self::DEFAULT_STEPS,
            alpha: Self::DEFAULT_ALPHA,
            sigma: SigmaMode::default(),
            stop: StopRule::default(),
        }
    }
}

/// Cooperative cancellation flag, checked between diffusion steps.
///
/// Clones share the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    /// A fresh, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// `true` once [`cancel`](Self::cancel) has been called on any clone.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Why diffusion ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The stopping rule fired.
    Converged,
    /// The step budget ran out.
    Exhausted,
    /// The cancellation token was set.
    Cancelled,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Converged => write!(f, "converged"),
            Self::Exhausted => write!(f, "exhausted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Result of [`diffuse`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffusionOutcome {
    /// Copy of the input tree carrying the diffused values.
    pub tree: MergeTree,
    /// Number of committed steps. On exhaustion this equals the step
    /// budget, one more than the index of the last step taken; when the
    /// stopping rule fires it equals the index of the rejected step.
    pub steps: usize,
    /// Best MSE when supervised, otherwise negated spatial entropy.
    pub score: f64,
    /// Why the loop ended.
    pub stop: StopReason,
}

/// Diffuse a copy of `tree`.
///
/// `ground_truth`, if given, is in raw image units and must match the
/// tree's shape.
///
/// # Errors
///
/// - [`TreeError::InvalidConfig`] if `config` fails validation.
/// - [`TreeError::InvalidInput`] if `ground_truth` has the wrong shape.
pub fn diffuse(
    tree: &MergeTree,
    config: &DiffusionConfig,
    ground_truth: Option<&ScalarImage>,
) -> Result<DiffusionOutcome, TreeError> {
    diffuse_cancellable(tree, config, ground_truth, &CancellationToken::new())
}

/// [`diffuse`] with a cancellation token polled before every step.
///
/// # Errors
///
/// Same as [`diffuse`].
pub fn diffuse_cancellable(
    tree: &MergeTree,
    config: &DiffusionConfig,
    ground_truth: Option<&ScalarImage>,
    cancel: &CancellationToken,
) -> Result<DiffusionOutcome, TreeError> {
    config.validate()?;
    let mut monitor = Monitor::new(tree, config.stop, ground_truth)?;
    let kernel = Kernel::new(tree, config.sigma);

    let mut values = tree.values().to_vec();
    let mut committed = 0;
    let mut stop = StopReason::Exhausted;

    for step in 0..config.steps {
        if cancel.is_cancelled() {
            stop = StopReason::Cancelled;
            break;
        }
        let next = kernel.step(&values, config.alpha);
        if monitor.observe(step, &next) {
            stop = StopReason::Converged;
            break;
        }
        values = next;
        committed += 1;
    }

    let score = monitor.score(stop, &values);
    tracing::info!(steps = committed, score, %stop, "diffusion finished");

    let mut out = tree.clone();
    out.set_values(values)?;
    Ok(DiffusionOutcome {
        tree: out,
        steps: committed,
        score,
        stop,
    })
}

/// Spatial entropy `-sum p ln(p + eps)` with `p = v / sum(v)`; zero when
/// the values sum to zero.
#[must_use]
#[allow(clippy::float_cmp)]
pub fn spatial_entropy(values: &[f64]) -> f64 {
    let total: f64 = values.iter().sum();
    if total == 0.0 {
        return 0.0;
    }
    -values
        .iter()
        .map(|&v| {
            let p = v / total;
            p * (p + EPSILON).ln()
        })
        .sum::<f64>()
}

/// Rate of change of entropy `h` against log-time `t`.
///
/// Uses the three-point non-uniform difference (centered on the middle
/// sample) once the oldest log-time is positive, a two-point backward
/// difference once the middle one is, and `+inf` before that.
#[must_use]
pub fn entropy_rate(h: &[f64; 3], t: &[f64; 3]) -> f64 {
    if t[0] > 0.0 {
        let dx1 = t[1] - t[0];
        let dx2 = t[2] - t[1];
        let a = -dx2 / (dx1 * (dx1 + dx2));
        let b = (dx2 - dx1) / (dx1 * dx2);
        let c = dx1 / (dx2 * (dx1 + dx2));
        c.mul_add(h[2], a.mul_add(h[0], b * h[1]))
    } else if t[1] > 0.0 {
        (h[2] - h[1]) / (t[2] - t[1])
    } else {
        f64::INFINITY
    }
}

/// Sliding three-point window over entropy, log-time, and rate.
#[derive(Debug, Clone)]
struct EntropyWindow {
    h: [f64; 3],
    t: [f64; 3],
    rate: [f64; 3],
}

impl EntropyWindow {
    const fn new() -> Self {
        Self {
            h: [0.0; 3],
            t: [0.0; 3],
            rate: [f64::INFINITY; 3],
        }
    }

    /// Push step `step`'s entropy; `true` when the rate strictly rose to a
    /// finite value.
    #[allow(clippy::cast_precision_loss)]
    fn push(&mut self, step: usize, entropy: f64) -> bool {
        shift_in(&mut self.h, entropy);
        shift_in(&mut self.t, ((step + 1) as f64).ln());
        shift_in(&mut self.rate, entropy_rate(&self.h, &self.t));
        self.rate[1] < self.rate[2] && self.rate[2].is_finite()
    }
}

fn shift_in(window: &mut [f64; 3], value: f64) {
    window.rotate_left(1);
    window[2] = value;
}

/// Per-run stopping state.
enum Monitor {
    Supervised { target: Vec<f64>, best: f64 },
    Entropy(EntropyWindow),
    Never,
}

impl Monitor {
    fn new(
        tree: &MergeTree,
        rule: StopRule,
        ground_truth: Option<&ScalarImage>,
    ) -> Result<Self, TreeError> {
        if let Some(gt) = ground_truth {
            let info = tree.info();
            if gt.rows() != info.rows || gt.cols() != info.cols {
                return Err(TreeError::InvalidInput(format!(
                    "ground truth is {}x{}, tree is {}x{}",
                    gt.rows(),
                    gt.cols(),
                    info.rows,
                    info.cols
                )));
            }
            let target = gt.data().iter().map(|&v| info.normalize(v)).collect();
            return Ok(Self::Supervised {
                target,
                best: f64::INFINITY,
            });
        }
        Ok(match rule {
            StopRule::EntropyRate => Self::Entropy(EntropyWindow::new()),
            StopRule::Never => Self::Never,
        })
    }

    /// Record a candidate step; `true` means stop without committing it.
    fn observe(&mut self, step: usize, candidate: &[f64]) -> bool {
        match self {
            Self::Supervised { target, best } => {
                let error = mse(candidate, target);
                tracing::debug!(step, mse = error, "diffusion step");
                if error < *best {
                    *best = error;
                    false
                } else {
                    true
                }
            }
            Self::Entropy(window) => {
                let entropy = spatial_entropy(candidate);
                let stop = window.push(step, entropy);
                tracing::debug!(step, entropy, rate = window.rate[2], "diffusion step");
                stop
            }
            Self::Never => {
                tracing::debug!(step, "diffusion step");
                false
            }
        }
    }

    fn score(&self, stop: StopReason, committed: &[f64]) -> f64 {
        match self {
            Self::Supervised { target, .. } => mse(committed, target),
            Self::Entropy(window) if stop == StopReason::Converged => -window.h[0],
            Self::Entropy(_) | Self::Never => -spatial_entropy(committed),
        }
    }
}

/// Bilateral sigmas, shared or per pixel.
enum Sigmas {
    Shared(f64),
    PerNode(Vec<f64>),
}

impl Sigmas {
    fn at(&self, node: usize) -> f64 {
        match self {
            Self::Shared(s) => *s,
            Self::PerNode(s) => s[node],
        }
    }
}

/// Immutable neighborhood and sigma tables for one diffusion run.
struct Kernel {
    rows: usize,
    cols: usize,
    parents: Vec<Option<usize>>,
    spatial: Sigmas,
    intensity: Sigmas,
}

impl Kernel {
    fn new(tree: &MergeTree, mode: SigmaMode) -> Self {
        let info = tree.info();
        let (spatial, intensity) = match mode {
            SigmaMode::Global { spatial, intensity } => {
                (Sigmas::Shared(spatial), Sigmas::Shared(intensity))
            }
            SigmaMode::PerComponent => {
                let distances = tree.max_distances();
                let labels = tree.labels();
                let spatial = labels
                    .iter()
                    .map(|l| distances.get(l).copied().unwrap_or(0.0))
                    .collect();
                let intensity = labels
                    .iter()
                    .map(|&l| tree.lifetime(l).unwrap_or(0.0))
                    .collect();
                (Sigmas::PerNode(spatial), Sigmas::PerNode(intensity))
            }
        };
        Self {
            rows: info.rows,
            cols: info.cols,
            parents: tree.forest().parents().to_vec(),
            spatial,
            intensity,
        }
    }

    fn step(&self, values: &[f64], alpha: f64) -> Vec<f64> {
        (0..values.len())
            .into_par_iter()
            .map(|node| values[node] + alpha * self.flux(values, node))
            .collect()
    }

    /// Weighted sum of value differences into `node`.
    #[allow(clippy::cast_precision_loss)]
    fn flux(&self, values: &[f64], node: usize) -> f64 {
        let (row, col) = (node / self.cols, node % self.cols);
        let v = values[node];
        let spatial_den = 2.0 * self.spatial.at(node).powi(2) + EPSILON;
        let intensity_den = 2.0 * self.intensity.at(node).powi(2) + EPSILON;

        let grid = NEIGHBOR_OFFSETS.iter().filter_map(|&(dr, dc)| {
            let r = row.checked_add_signed(dr).filter(|&r| r < self.rows)?;
            let c = col.checked_add_signed(dc).filter(|&c| c < self.cols)?;
            Some(r * self.cols + c)
        });

        self.parents[node]
            .into_iter()
            .chain(grid)
            .map(|n| {
                let (nr, nc) = (n / self.cols, n % self.cols);
                let dr = nr.abs_diff(row) as f64;
                let dc = nc.abs_diff(col) as f64;
                let dist_sq = dr.mul_add(dr, dc * dc);
                let diff = values[n] - v;
                let weight = (-dist_sq / spatial_den).exp() * (-(diff * diff) / intensity_den).exp();
                weight * diff
            })
            .sum()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp, clippy::cast_precision_loss)]
mod tests {
    use super::*;
    use crate::oracle::{PixelGraph, PixelGraphOracle};

    fn gradient_4x4() -> ScalarImage {
        ScalarImage::from_fn(4, 4, |r, c| (r + c) as f64).unwrap()
    }

    fn noisy_gradient() -> (ScalarImage, ScalarImage) {
        let clean = gradient_4x4();
        // Deterministic +/-0.5 checkerboard noise.
        let noisy = ScalarImage::from_fn(4, 4, |r, c| {
            let sign = if (r + c) % 2 == 0 { 0.5 } else { -0.5 };
            (r + c) as f64 + sign
        })
        .unwrap();
        (noisy, clean)
    }

    fn never(steps: usize) -> DiffusionConfig {
        DiffusionConfig {
            steps,
            stop: StopRule::Never,
            ..DiffusionConfig::default()
        }
    }

    #[test]
    fn default_config() {
        let config = DiffusionConfig::default();
        assert_eq!(config.steps, 50);
        assert_eq!(config.alpha, 0.1);
        assert_eq!(
            config.sigma,
            SigmaMode::Global {
                spatial: 1.0,
                intensity: 0.1
            }
        );
        assert_eq!(config.stop, StopRule::EntropyRate);
    }

    #[test]
    fn zero_alpha_is_identity() {
        let tree = MergeTree::from_image(&gradient_4x4()).unwrap();
        let config = DiffusionConfig {
            alpha: 0.0,
            ..never(25)
        };
        let out = diffuse(&tree, &config, None).unwrap();
        assert_eq!(out.tree.values(), tree.values());
        assert_eq!(out.steps, 25);
        assert_eq!(out.stop, StopReason::Exhausted);
    }

    #[test]
    fn input_tree_is_untouched() {
        let tree = MergeTree::from_image(&gradient_4x4()).unwrap();
        let before = tree.clone();
        let out = diffuse(&tree, &never(5), None).unwrap();
        assert_eq!(tree, before);
        assert_ne!(out.tree.values(), tree.values());
    }

    #[test]
    fn single_step_matches_formula() {
        // 1x2 image: [0, 1]. Pixel 1 is the root, pixel 0 hangs off it.
        let img = ScalarImage::new(1, 2, vec![0.0, 1.0]).unwrap();
        let tree = MergeTree::from_image(&img).unwrap();
        assert_eq!(tree.parent(0), Some(1));

        let config = DiffusionConfig {
            steps: 1,
            alpha: 0.5,
            sigma: SigmaMode::Global {
                spatial: 1.0,
                intensity: 1.0,
            },
            stop: StopRule::Never,
        };
        let out = diffuse(&tree, &config, None).unwrap();

        let w = (-1.0 / (2.0 + EPSILON)).exp() * (-1.0 / (2.0 + EPSILON)).exp();
        // Pixel 0 sees pixel 1 twice: once as parent, once as grid neighbor.
        let expected0 = 0.5 * 2.0 * w;
        let expected1 = 1.0 - 0.5 * w;
        assert!((out.tree.values()[0] - expected0).abs() < 1e-12);
        assert!((out.tree.values()[1] - expected1).abs() < 1e-12);
    }

    #[test]
    fn supervised_mse_never_increases() {
        let (noisy, clean) = noisy_gradient();
        let tree = MergeTree::from_image(&noisy).unwrap();
        let target: Vec<f64> = clean
            .data()
            .iter()
            .map(|&v| tree.info().normalize(v))
            .collect();

        let config = DiffusionConfig {
            steps: 200,
            alpha: 0.05,
            sigma: SigmaMode::Global {
                spatial: 1.0,
                intensity: 1.0,
            },
            stop: StopRule::Never,
        };
        let out = diffuse(&tree, &config, Some(&clean)).unwrap();
        assert!(out.steps >= 1);
        assert_eq!(mse(out.tree.values(), &target), out.score);

        let errors: Vec<f64> = (1..=out.steps.min(10))
            .map(|steps| {
                let partial = diffuse(&tree, &DiffusionConfig { steps, ..config }, Some(&clean))
                    .unwrap();
                partial.score
            })
            .collect();
        assert!(errors.windows(2).all(|w| w[1] <= w[0]), "{errors:?}");

        // The rejected step is exactly the next step from the result.
        if out.stop == StopReason::Converged {
            let again = diffuse(&out.tree, &DiffusionConfig { steps: 1, ..config }, Some(&clean))
                .unwrap();
            assert!(again.score >= out.score);
        }
    }

    #[test]
    fn supervised_rejects_shape_mismatch() {
        let tree = MergeTree::from_image(&gradient_4x4()).unwrap();
        let gt = ScalarImage::new(2, 8, vec![0.0; 16]).unwrap();
        assert!(matches!(
            diffuse(&tree, &DiffusionConfig::default(), Some(&gt)),
            Err(TreeError::InvalidInput(_))
        ));
    }

    #[test]
    fn rejects_non_finite_parameters() {
        let tree = MergeTree::from_image(&gradient_4x4()).unwrap();
        let config = DiffusionConfig {
            alpha: f64::NAN,
            ..DiffusionConfig::default()
        };
        assert!(matches!(
            diffuse(&tree, &config, None),
            Err(TreeError::InvalidConfig(_))
        ));
        let config = DiffusionConfig {
            sigma: SigmaMode::Global {
                spatial: f64::INFINITY,
                intensity: 0.1,
            },
            ..DiffusionConfig::default()
        };
        assert!(matches!(
            diffuse(&tree, &config, None),
            Err(TreeError::InvalidConfig(_))
        ));
    }

    #[test]
    fn cancelled_before_first_step() {
        let tree = MergeTree::from_image(&gradient_4x4()).unwrap();
        let token = CancellationToken::new();
        token.clone().cancel();
        let out = diffuse_cancellable(&tree, &never(10), None, &token).unwrap();
        assert_eq!(out.steps, 0);
        assert_eq!(out.stop, StopReason::Cancelled);
        assert_eq!(out.tree.values(), tree.values());
        assert!((out.score + spatial_entropy(tree.values())).abs() < 1e-12);
    }

    struct FixedOracle(Vec<usize>);

    impl PixelGraphOracle for FixedOracle {
        fn image_to_graph(&self, _image: &ScalarImage) -> PixelGraph {
            PixelGraph {
                parents: self.0.clone(),
                weights: vec![0.0; self.0.len()],
            }
        }
    }

    /// 3x4 image, every pixel parented to pixel 5 (value 1). The interior
    /// pixels 5 and 6 form component 5 with lifetime 0.5 and extent 1; the
    /// border pixels (value 0) are singleton components.
    fn two_pixel_component() -> MergeTree {
        let mut data = vec![0.0; 12];
        data[5] = 1.0;
        data[6] = 0.5;
        let img = ScalarImage::new(3, 4, data).unwrap();
        MergeTree::from_image_with(&img, &FixedOracle(vec![5; 12])).unwrap()
    }

    /// One-step flux into pixel 6 for the given squared sigmas: pixel 5 is
    /// both its parent and a grid neighbor, the rest are 0.5 below it.
    fn flux_into_6(spatial_sq: f64, intensity_sq: f64) -> f64 {
        let w = |dist_sq: f64, diff: f64| {
            (-dist_sq / (2.0 * spatial_sq + EPSILON)).exp()
                * (-(diff * diff) / (2.0 * intensity_sq + EPSILON)).exp()
                * diff
        };
        2.0 * w(1.0, 0.5) + 3.0 * w(1.0, -0.5) + 4.0 * w(2.0, -0.5)
    }

    #[test]
    fn per_component_sigmas_follow_active_view() {
        let mut tree = two_pixel_component();
        assert_eq!(tree.labels()[6], 5);
        assert_eq!(tree.max_distances()[&5], 1.0);
        assert_eq!(tree.lifetime(5), Some(0.5));

        let config = DiffusionConfig {
            alpha: 0.1,
            sigma: SigmaMode::PerComponent,
            ..never(1)
        };
        let out = diffuse(&tree, &config, None).unwrap();
        let expected = 0.1f64.mul_add(flux_into_6(1.0, 0.25), 0.5);
        assert!((out.tree.values()[6] - expected).abs() < 1e-12);
        // Singleton components have zero sigmas, so their weights vanish.
        assert_eq!(out.tree.values()[0], 0.0);

        // After the cut every pixel joins component 5: lifetime 1, extent
        // sqrt(5) from (1, 1) to the far column.
        tree.cut(Some(0.25)).unwrap();
        assert_eq!(tree.components(), &[5]);
        assert!((tree.max_distances()[&5] - 5f64.sqrt()).abs() < 1e-12);
        assert_eq!(tree.lifetime(5), Some(1.0));
        assert_eq!(tree.parent(6), Some(5));

        let out = diffuse(&tree, &config, None).unwrap();
        let expected = 0.1f64.mul_add(flux_into_6(5.0, 1.0), 0.5);
        assert!((out.tree.values()[6] - expected).abs() < 1e-12);
        assert!(out.tree.values()[0] > 0.0);
    }

    #[test]
    fn entropy_of_uniform_values() {
        let h = spatial_entropy(&[1.0; 4]);
        assert!((h - 4f64.ln()).abs() < 1e-9);
        assert_eq!(spatial_entropy(&[0.0; 4]), 0.0);
    }

    #[test]
    fn entropy_rate_warms_up() {
        assert_eq!(entropy_rate(&[0.0, 0.0, 1.0], &[0.0, 0.0, 0.0]), f64::INFINITY);
        let two_point = entropy_rate(&[0.0, 1.0, 2.0], &[0.0, 1.0, 3.0]);
        assert!((two_point - 0.5).abs() < 1e-12);
    }

    #[test]
    fn entropy_rate_is_exact_for_quadratics() {
        // h = t^2 has derivative 2t; the three-point formula is exact at
        // the middle sample.
        let t = [1.0, 2.0, 4.0];
        let h = t.map(|x: f64| x * x);
        assert!((entropy_rate(&h, &t) - 4.0).abs() < 1e-12);
    }

    #[test]
    fn entropy_window_stops_on_rising_rate() {
        let mut window = EntropyWindow::new();
        // Entropy drops, then flattens out, so the rate climbs back up.
        assert!(!window.push(0, 1.0));
        assert!(!window.push(1, 0.9));
        assert!(!window.push(2, 0.7));
        // A flat point makes the rate jump back up.
        assert!(window.push(3, 0.7));
        assert!((-window.h[0] + 0.9).abs() < 1e-12);
    }

    #[test]
    fn entropy_stop_leaves_stopping_step_uncommitted() {
        // A lone spike spreads out, so entropy rises with an accelerating
        // log-time rate and the rule fires as soon as the window is full.
        let spike = ScalarImage::from_fn(5, 5, |r, c| if (r, c) == (2, 2) { 1.0 } else { 0.0 })
            .unwrap();
        let tree = MergeTree::from_image(&spike).unwrap();
        let config = DiffusionConfig {
            steps: 50,
            alpha: 0.01,
            sigma: SigmaMode::Global {
                spatial: 1.0,
                intensity: 1.0,
            },
            stop: StopRule::EntropyRate,
        };
        let out = diffuse(&tree, &config, None).unwrap();
        assert_eq!(out.stop, StopReason::Converged);
        assert!(out.steps >= 2);

        let fixed = |steps| {
            diffuse(&tree, &DiffusionConfig { steps, stop: StopRule::Never, ..config }, None)
                .unwrap()
        };
        assert_eq!(fixed(out.steps).tree.values(), out.tree.values());

        // The reported score is the entropy at the start of the window.
        let window_start = fixed(out.steps - 1);
        assert!((out.score + spatial_entropy(window_start.tree.values())).abs() < 1e-12);
    }

    #[test]
    fn entropy_rule_converges_or_exhausts() {
        let (noisy, _) = noisy_gradient();
        let tree = MergeTree::from_image(&noisy).unwrap();
        let out = diffuse(&tree, &DiffusionConfig::default(), None).unwrap();
        match out.stop {
            StopReason::Converged => assert!(out.steps < 50),
            StopReason::Exhausted => assert_eq!(out.steps, 50),
            StopReason::Cancelled => unreachable!(),
        }
        assert!(out.score.is_finite());
    }
}
