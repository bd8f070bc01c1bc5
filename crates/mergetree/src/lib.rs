//! mergetree: Topological image denoising over merge trees (sans-IO).
//!
//! Builds a merge tree from a 2D scalar image through:
//! steepest-ascent forest -> consistency labels -> component birth/death
//! values, then optionally prunes short-lived components (tree cut) and
//! smooths the image with a bilateral diffusion that follows the tree.
//!
//! This crate has **no I/O dependencies** -- it operates on in-memory
//! grids and returns structured data. Decoding image files and writing
//! results lives in `mergetree-bench`.

pub mod cut;
pub mod diagnostics;
pub mod diffusion;
pub mod forest;
pub mod label;
pub mod metrics;
pub mod oracle;
pub mod pipeline;
pub mod segmentation;
pub mod tree;
pub mod types;

pub use cut::{CutState, CutView};
pub use diffusion::{
    CancellationToken, DiffusionConfig, DiffusionOutcome, SigmaMode, StopReason, StopRule,
};
pub use forest::Forest;
pub use oracle::{OracleKind, PixelGraph, PixelGraphOracle};
pub use pipeline::Pipeline;
pub use tree::{MergeTree, NodeView};
pub use types::{
    CutLevel, DenoiseConfig, Denoised, EPSILON, GrayImage, ImageInfo, ScalarImage, TreeError,
};

/// Run the full denoising pipeline.
///
/// # Pipeline steps
///
/// 1. Build the merge tree with `config.oracle`
/// 2. Cut it according to `config.cut` (skipped for [`CutLevel::None`])
/// 3. Diffuse, supervised by `ground_truth` when given, otherwise stopped
///    by `config.diffusion.stop`
/// 4. Denormalize the diffused values back into an image
///
/// # Errors
///
/// Returns [`TreeError::InvalidInput`] if the image has no value range or
/// `ground_truth` has a different shape.
/// Returns [`TreeError::DegenerateForest`] if max-jump cutting is requested
/// on fewer than two components.
/// Returns [`TreeError::EmptyPartition`] if an explicit cut level is above
/// every component lifetime.
/// Returns [`TreeError::InvalidConfig`] if diffusion parameters are not
/// finite.
pub fn denoise(
    image: &ScalarImage,
    config: &DenoiseConfig,
    ground_truth: Option<&ScalarImage>,
) -> Result<Denoised, TreeError> {
    let mut pending = Pipeline::new(image.clone(), config.clone());
    if let Some(gt) = ground_truth {
        pending = pending.with_ground_truth(gt.clone());
    }
    Ok(pending.build()?.cut()?.diffuse()?.into_result())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::cast_precision_loss)]
mod tests {
    use super::*;

    fn plateau_with_bump() -> ScalarImage {
        ScalarImage::from_fn(5, 5, |r, c| {
            if (r, c) == (2, 2) {
                4.0
            } else {
                ((r + c) % 3) as f64
            }
        })
        .unwrap()
    }

    #[test]
    fn denoise_constant_image() {
        let image = ScalarImage::new(3, 3, vec![1.0; 9]).unwrap();
        let result = denoise(&image, &DenoiseConfig::default(), None);
        assert!(matches!(result, Err(TreeError::InvalidInput(_))));
    }

    #[test]
    fn denoise_without_cut_keeps_shape() {
        let config = DenoiseConfig {
            cut: CutLevel::None,
            ..DenoiseConfig::default()
        };
        let image = plateau_with_bump();
        let result = denoise(&image, &config, None).unwrap();
        assert_eq!(result.image.rows(), 5);
        assert_eq!(result.image.cols(), 5);
        assert_eq!(result.level, None);
        assert!(result.steps <= DiffusionConfig::DEFAULT_STEPS);
        assert!(result.image.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn denoise_rejects_mismatched_ground_truth() {
        let gt = ScalarImage::new(2, 2, vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let config = DenoiseConfig {
            cut: CutLevel::None,
            ..DenoiseConfig::default()
        };
        let result = denoise(&plateau_with_bump(), &config, Some(&gt));
        assert!(matches!(result, Err(TreeError::InvalidInput(_))));
    }

    #[test]
    fn denoise_reports_invalid_config() {
        let mut config = DenoiseConfig {
            cut: CutLevel::None,
            ..DenoiseConfig::default()
        };
        config.diffusion.alpha = f64::NAN;
        let result = denoise(&plateau_with_bump(), &config, None);
        assert!(matches!(result, Err(TreeError::InvalidConfig(_))));
    }
}
