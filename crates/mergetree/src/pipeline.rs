//! Incremental pipeline: advance stage-by-stage, inspecting each
//! intermediate result before continuing.
//!
//! Unlike [`crate::denoise`] which runs everything in one call,
//! [`Pipeline`] lets the caller drive execution one step at a time:
//!
//! ```rust
//! # use mergetree::{DenoiseConfig, Pipeline, ScalarImage, TreeError};
//! # fn run(image: ScalarImage) -> Result<(), TreeError> {
//! let built = Pipeline::new(image, DenoiseConfig::default()).build()?;
//! println!("{} components", built.tree().components().len());
//!
//! let denoised = built.cut()?.diffuse()?.into_result();
//! # Ok(())
//! # }
//! ```
//!
//! Each stage method consumes `self` and returns the next pipeline state
//! (or `Result` for fallible stages). The caller can inspect the current
//! stage's output via accessor methods at any point.

use crate::diffusion::{self, CancellationToken, DiffusionOutcome};
use crate::tree::MergeTree;
use crate::types::{CutLevel, DenoiseConfig, Denoised, ScalarImage, TreeError};

// ───────────────────────── Stage 0: Pending ──────────────────────────

/// Pipeline state before any processing has occurred.
///
/// Call [`build`](Self::build) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing, call .build() to continue"]
pub struct Pending {
    config: DenoiseConfig,
    image: ScalarImage,
    ground_truth: Option<ScalarImage>,
    cancel: CancellationToken,
}

impl Pending {
    /// The source image.
    #[must_use]
    pub const fn image(&self) -> &ScalarImage {
        &self.image
    }

    /// Supervise diffusion against `ground_truth` (raw units, same shape).
    pub fn with_ground_truth(mut self, ground_truth: ScalarImage) -> Self {
        self.ground_truth = Some(ground_truth);
        self
    }

    /// Poll `cancel` between diffusion steps.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build the merge tree and advance to the [`Built`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if the image cannot be
    /// normalized or the oracle output is malformed.
    pub fn build(self) -> Result<Built, TreeError> {
        let tree = MergeTree::from_image_with(&self.image, &self.config.oracle)?;
        Ok(Built {
            config: self.config,
            ground_truth: self.ground_truth,
            cancel: self.cancel,
            tree,
        })
    }
}

// ───────────────────────── Stage 1: Built ────────────────────────────

/// Pipeline state after the merge tree has been built.
///
/// Call [`cut`](Self::cut) to advance to the next stage.
#[must_use = "pipeline stages are consumed by advancing, call .cut() to continue"]
pub struct Built {
    config: DenoiseConfig,
    ground_truth: Option<ScalarImage>,
    cancel: CancellationToken,
    tree: MergeTree,
}

impl Built {
    /// The freshly built tree.
    #[must_use]
    pub const fn tree(&self) -> &MergeTree {
        &self.tree
    }

    /// Apply `config.cut` and advance to the [`Pruned`] stage.
    ///
    /// With [`CutLevel::None`] the tree passes through unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::DegenerateForest`] or
    /// [`TreeError::EmptyPartition`] as [`MergeTree::cut`] does.
    pub fn cut(mut self) -> Result<Pruned, TreeError> {
        let level = match self.config.cut {
            CutLevel::None => None,
            CutLevel::MaxJump => Some(self.tree.cut(None)?),
            CutLevel::Level(raw) => Some(self.tree.cut(Some(raw))?),
        };
        Ok(Pruned {
            config: self.config,
            ground_truth: self.ground_truth,
            cancel: self.cancel,
            tree: self.tree,
            level,
        })
    }
}

// ───────────────────────── Stage 2: Pruned ───────────────────────────

/// Pipeline state after the optional cut.
///
/// Call [`diffuse`](Self::diffuse) to advance to the final stage.
#[must_use = "pipeline stages are consumed by advancing, call .diffuse() to continue"]
pub struct Pruned {
    config: DenoiseConfig,
    ground_truth: Option<ScalarImage>,
    cancel: CancellationToken,
    tree: MergeTree,
    level: Option<f64>,
}

impl Pruned {
    /// The tree diffusion will run on.
    #[must_use]
    pub const fn tree(&self) -> &MergeTree {
        &self.tree
    }

    /// Cut threshold in raw units, or `None` when no cut was applied.
    #[must_use]
    pub const fn level(&self) -> Option<f64> {
        self.level
    }

    /// Run diffusion and advance to the [`Diffused`] stage.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidConfig`] or [`TreeError::InvalidInput`]
    /// as [`diffusion::diffuse`] does.
    pub fn diffuse(self) -> Result<Diffused, TreeError> {
        let outcome = diffusion::diffuse_cancellable(
            &self.tree,
            &self.config.diffusion,
            self.ground_truth.as_ref(),
            &self.cancel,
        )?;
        Ok(Diffused {
            level: self.level,
            outcome,
        })
    }
}

// ───────────────────────── Stage 3: Diffused ─────────────────────────

/// Pipeline state after diffusion, the final stage.
///
/// Call [`into_result`](Self::into_result) to extract the [`Denoised`]
/// result.
#[must_use = "call .into_result() to extract the Denoised result"]
pub struct Diffused {
    level: Option<f64>,
    outcome: DiffusionOutcome,
}

impl Diffused {
    /// The diffusion outcome.
    #[must_use]
    pub const fn outcome(&self) -> &DiffusionOutcome {
        &self.outcome
    }

    /// Consume the pipeline and return the [`Denoised`] result.
    #[must_use]
    pub fn into_result(self) -> Denoised {
        let DiffusionOutcome {
            tree,
            steps,
            score,
            stop,
        } = self.outcome;
        Denoised {
            image: tree.to_image(false),
            tree,
            level: self.level,
            steps,
            score,
            stop,
        }
    }
}

// ──────────────────────── Stage enum ─────────────────────────────────

/// Total number of stages in the pipeline.
pub const STAGE_COUNT: usize = 4;

/// Any pipeline state, for callers that loop instead of chaining.
///
/// ```rust
/// # use mergetree::{DenoiseConfig, Pipeline, ScalarImage, TreeError};
/// # use mergetree::pipeline::Stage;
/// # fn run(image: ScalarImage) -> Result<(), TreeError> {
/// let mut stage: Stage = Pipeline::new(image, DenoiseConfig::default()).into();
/// while !stage.is_complete() {
///     println!("{}", stage.name());
///     stage = stage.advance()?;
/// }
/// let result = stage.complete()?;
/// # Ok(())
/// # }
/// ```
#[must_use]
pub enum Stage {
    /// See [`Pending`].
    Pending(Pending),
    /// See [`Built`].
    Built(Built),
    /// See [`Pruned`].
    Pruned(Pruned),
    /// See [`Diffused`].
    Diffused(Diffused),
}

impl Stage {
    /// Human-readable name of the current stage.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending(_) => "source",
            Self::Built(_) => "build",
            Self::Pruned(_) => "cut",
            Self::Diffused(_) => "diffuse",
        }
    }

    /// Zero-based index of the current stage.
    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Pending(_) => 0,
            Self::Built(_) => 1,
            Self::Pruned(_) => 2,
            Self::Diffused(_) => 3,
        }
    }

    /// The tree as of this stage, if one has been built.
    #[must_use]
    pub const fn tree(&self) -> Option<&MergeTree> {
        match self {
            Self::Pending(_) => None,
            Self::Built(s) => Some(s.tree()),
            Self::Pruned(s) => Some(s.tree()),
            Self::Diffused(s) => Some(&s.outcome.tree),
        }
    }

    /// Whether the pipeline is at the final stage.
    #[must_use]
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Diffused(_))
    }

    /// Advance one stage. The final stage is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError`] if the stage transition fails.
    pub fn advance(self) -> Result<Self, TreeError> {
        Ok(match self {
            Self::Pending(s) => s.build()?.into(),
            Self::Built(s) => s.cut()?.into(),
            Self::Pruned(s) => s.diffuse()?.into(),
            done @ Self::Diffused(_) => done,
        })
    }

    /// Run all remaining stages to completion.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError`] if any remaining stage fails.
    pub fn complete(self) -> Result<Denoised, TreeError> {
        Ok(match self {
            Self::Pending(s) => s.build()?.cut()?.diffuse()?.into_result(),
            Self::Built(s) => s.cut()?.diffuse()?.into_result(),
            Self::Pruned(s) => s.diffuse()?.into_result(),
            Self::Diffused(s) => s.into_result(),
        })
    }
}

impl From<Pending> for Stage {
    fn from(s: Pending) -> Self {
        Self::Pending(s)
    }
}

impl From<Built> for Stage {
    fn from(s: Built) -> Self {
        Self::Built(s)
    }
}

impl From<Pruned> for Stage {
    fn from(s: Pruned) -> Self {
        Self::Pruned(s)
    }
}

impl From<Diffused> for Stage {
    fn from(s: Diffused) -> Self {
        Self::Diffused(s)
    }
}

// ───────────────────── Pipeline entry point ──────────────────────────

/// Incremental denoising pipeline.
///
/// Created via [`Pipeline::new`], which stores the image and config
/// without doing any processing. Each stage method consumes the current
/// state and returns the next, making it a compile-time error to skip
/// stages or call them out of order.
pub struct Pipeline;

impl Pipeline {
    /// Create a new pipeline from a source image and config.
    #[allow(clippy::new_ret_no_self)]
    pub fn new(image: ScalarImage, config: DenoiseConfig) -> Pending {
        Pending {
            config,
            image,
            ground_truth: None,
            cancel: CancellationToken::new(),
        }
    }
}
