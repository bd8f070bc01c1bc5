//! End-to-end runs of the denoising pipeline on synthetic images.

#![allow(clippy::unwrap_used, clippy::cast_precision_loss)]

use mergetree::diagnostics::{WebClock, denoise_with_diagnostics};
use mergetree::metrics::mse;
use mergetree::segmentation::relabel_connected;
use mergetree::{
    CutLevel, DenoiseConfig, DiffusionConfig, GrayImage, ScalarImage, StopReason, StopRule,
    TreeError, denoise,
};

const SIZE: usize = 16;

/// Two Gaussian bumps of different heights.
fn clean() -> ScalarImage {
    ScalarImage::from_fn(SIZE, SIZE, |r, c| {
        let bump = |cr: f64, cc: f64, h: f64| {
            let d2 = (r as f64 - cr).powi(2) + (c as f64 - cc).powi(2);
            h * (-d2 / 8.0).exp()
        };
        bump(4.0, 4.0, 1.0) + bump(11.0, 10.0, 0.6)
    })
    .unwrap()
}

/// `clean()` plus deterministic hash noise in `[-0.1, 0.1)`.
fn noisy() -> ScalarImage {
    let clean = clean();
    ScalarImage::from_fn(SIZE, SIZE, |r, c| {
        let i = (r * SIZE + c) as u64;
        let n = (i.wrapping_mul(2_654_435_761) % 1000) as f64 / 1000.0 - 0.5;
        clean.get(r, c).unwrap() + 0.2 * n
    })
    .unwrap()
}

fn config(steps: usize, cut: CutLevel) -> DenoiseConfig {
    DenoiseConfig {
        cut,
        diffusion: DiffusionConfig {
            steps,
            ..DiffusionConfig::default()
        },
        ..DenoiseConfig::default()
    }
}

#[test]
fn supervised_run_never_ends_worse_than_first_step() {
    let (image, gt) = (noisy(), clean());
    let first = denoise(&image, &config(1, CutLevel::MaxJump), Some(&gt)).unwrap();
    let full = denoise(&image, &config(30, CutLevel::MaxJump), Some(&gt)).unwrap();

    assert_eq!(first.steps, 1);
    assert!(full.steps >= 1);
    assert!(full.score <= first.score);

    let info = full.tree.info();
    let target: Vec<f64> = gt.data().iter().map(|&v| info.normalize(v)).collect();
    assert!((mse(full.tree.values(), &target) - full.score).abs() < 1e-12);
}

#[test]
fn max_jump_cut_yields_single_rooted_forest() {
    let result = denoise(&noisy(), &config(5, CutLevel::MaxJump), None).unwrap();
    let tree = &result.tree;
    assert!(tree.is_cut());
    assert!(result.level.is_some());
    assert!(tree.components().len() <= tree.base_components().len());
    assert_eq!(tree.forest().roots(), vec![tree.root()]);
}

#[test]
fn entropy_rule_stops_within_budget() {
    let result = denoise(&noisy(), &config(40, CutLevel::None), None).unwrap();
    assert!(result.steps <= 40);
    assert!(matches!(
        result.stop,
        StopReason::Converged | StopReason::Exhausted
    ));
    assert!(result.score.is_finite());
}

#[test]
fn luma_round_trip_keeps_dimensions() {
    let gray = GrayImage::from_fn(12, 9, |x, y| image_pixel(x * 20 + y * 7));
    let image = ScalarImage::from_luma(&gray).unwrap();
    assert_eq!((image.rows(), image.cols()), (9, 12));

    let mut config = config(4, CutLevel::None);
    config.diffusion.stop = StopRule::Never;
    let result = denoise(&image, &config, None).unwrap();
    let out = result.tree.to_image(true).to_luma8();
    assert_eq!(out.dimensions(), gray.dimensions());
}

fn image_pixel(v: u32) -> image::Luma<u8> {
    image::Luma([u8::try_from(v % 256).unwrap()])
}

#[test]
fn segmentation_splits_into_connected_regions() {
    let result = denoise(&clean(), &config(1, CutLevel::MaxJump), None).unwrap();
    let segm = result.tree.segmentation(0.0);
    assert_eq!(segm.len(), SIZE * SIZE);
    let regions = relabel_connected(&segm, SIZE, SIZE);
    let distinct = regions
        .iter()
        .filter(|&&l| l != 0)
        .collect::<std::collections::BTreeSet<_>>();
    assert!(!distinct.is_empty());
    assert!(regions.iter().all(|&l| l <= SIZE * SIZE));
}

#[test]
fn diagnostics_match_plain_run() {
    let config = config(6, CutLevel::MaxJump);
    let plain = denoise(&noisy(), &config, None).unwrap();
    let (traced, diag) = denoise_with_diagnostics(&noisy(), &config, None, &WebClock).unwrap();
    assert_eq!(plain.steps, traced.steps);
    assert_eq!(plain.image, traced.image);
    assert_eq!(diag.summary.pixel_count, SIZE * SIZE);
    assert!(diag.cut.is_some());
}

#[test]
fn explicit_level_above_every_lifetime_fails() {
    let result = denoise(&noisy(), &config(3, CutLevel::Level(100.0)), None);
    assert!(matches!(result, Err(TreeError::EmptyPartition { .. })));
}
