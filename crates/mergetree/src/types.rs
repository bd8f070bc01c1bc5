//! Shared types for the merge-tree pipeline.

use serde::{Deserialize, Serialize};

use crate::diffusion::{DiffusionConfig, StopReason};
use crate::oracle::OracleKind;
use crate::tree::MergeTree;

/// Re-export `GrayImage` so downstream crates can hand 8-bit rasters to
/// the pipeline without depending on `image` directly.
pub use image::GrayImage;

/// Guard added to denominators that may vanish (zero lifetime, zero
/// spatial extent, all-zero images).
pub const EPSILON: f64 = 1e-12;

/// A row-major 2D grid of `f64` samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalarImage {
    rows: usize,
    cols: usize,
    data: Vec<f64>,
}

impl ScalarImage {
    /// Create an image from row-major samples.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if either dimension is zero or
    /// `data.len() != rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self, TreeError> {
        if rows == 0 || cols == 0 {
            return Err(TreeError::InvalidInput(format!(
                "image must be non-empty, got {rows}x{cols}"
            )));
        }
        if data.len() != rows * cols {
            return Err(TreeError::InvalidInput(format!(
                "expected {} samples for a {rows}x{cols} image, got {}",
                rows * cols,
                data.len()
            )));
        }
        Ok(Self { rows, cols, data })
    }

    /// Build without validation; callers guarantee `data.len() == rows * cols > 0`.
    pub(crate) const fn from_raw(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        Self { rows, cols, data }
    }

    /// Create an image from a slice of rows.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if there are no rows, the rows
    /// are empty, or the rows have different lengths.
    pub fn from_rows(rows: &[Vec<f64>]) -> Result<Self, TreeError> {
        let cols = rows.first().map_or(0, Vec::len);
        if let Some(n) = rows.iter().position(|row| row.len() != cols) {
            return Err(TreeError::InvalidInput(format!(
                "row 0 has {cols} columns, but row {n} has {}",
                rows[n].len()
            )));
        }
        Self::new(rows.len(), cols, rows.concat())
    }

    /// Create an image by evaluating `f(row, col)` for every pixel.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if either dimension is zero.
    pub fn from_fn(
        rows: usize,
        cols: usize,
        mut f: impl FnMut(usize, usize) -> f64,
    ) -> Result<Self, TreeError> {
        let data = (0..rows * cols).map(|i| f(i / cols, i % cols)).collect();
        Self::new(rows, cols, data)
    }

    /// Convert an 8-bit grayscale raster (width = columns, height = rows).
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if the raster is empty.
    pub fn from_luma(gray: &GrayImage) -> Result<Self, TreeError> {
        let data = gray.pixels().map(|p| f64::from(p.0[0])).collect();
        Self::new(gray.height() as usize, gray.width() as usize, data)
    }

    /// Render to an 8-bit grayscale raster, clamping samples to `[0, 255]`.
    #[must_use]
    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    pub fn to_luma8(&self) -> GrayImage {
        GrayImage::from_fn(self.cols as u32, self.rows as u32, |x, y| {
            let v = self.data[y as usize * self.cols + x as usize];
            image::Luma([v.clamp(0.0, 255.0).round() as u8])
        })
    }

    /// Number of rows.
    #[must_use]
    pub const fn rows(&self) -> usize {
        self.rows
    }

    /// Number of columns.
    #[must_use]
    pub const fn cols(&self) -> usize {
        self.cols
    }

    /// Total pixel count.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false` for a constructed image; present for API symmetry.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Row-major samples.
    #[must_use]
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Consume the image and return the row-major samples.
    #[must_use]
    pub fn into_data(self) -> Vec<f64> {
        self.data
    }

    /// Sample at `(row, col)`, or `None` when out of bounds.
    #[must_use]
    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        (row < self.rows && col < self.cols).then(|| self.data[row * self.cols + col])
    }

    /// Minimum and maximum sample. Any NaN sample yields `(NaN, NaN)`.
    #[must_use]
    pub fn min_max(&self) -> (f64, f64) {
        if self.data.iter().any(|v| v.is_nan()) {
            return (f64::NAN, f64::NAN);
        }
        self.data
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| {
                (lo.min(v), hi.max(v))
            })
    }
}

/// Shape and value range of the image a tree was built from.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    /// Number of rows.
    pub rows: usize,
    /// Number of columns.
    pub cols: usize,
    /// Raw minimum sample.
    pub min: f64,
    /// Raw maximum sample.
    pub max: f64,
}

impl ImageInfo {
    /// Capture the shape and range of `image`.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if the range is not finite or
    /// `max <= min` (constant images cannot be normalized).
    pub fn of(image: &ScalarImage) -> Result<Self, TreeError> {
        let (min, max) = image.min_max();
        if !min.is_finite() || !max.is_finite() {
            return Err(TreeError::InvalidInput(String::from(
                "image contains non-finite samples",
            )));
        }
        if max <= min {
            return Err(TreeError::InvalidInput(format!(
                "image has a degenerate value range [{min}, {max}]"
            )));
        }
        Ok(Self {
            rows: image.rows(),
            cols: image.cols(),
            min,
            max,
        })
    }

    /// `max - min`.
    #[must_use]
    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Map a raw value into `[0, 1]`.
    #[must_use]
    pub fn normalize(&self, value: f64) -> f64 {
        (value - self.min) / self.range()
    }

    /// Inverse of [`normalize`](Self::normalize).
    #[must_use]
    pub fn denormalize(&self, value: f64) -> f64 {
        value.mul_add(self.range(), self.min)
    }

    /// Pixel count.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.rows * self.cols
    }

    /// `true` for a zero-sized grid.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `(row, col)` of a row-major index.
    #[must_use]
    pub const fn coords(&self, index: usize) -> (usize, usize) {
        (index / self.cols, index % self.cols)
    }
}

/// Where to cut the merge tree before diffusion.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum CutLevel {
    /// Diffuse over the full, unpruned tree.
    None,
    /// Pick the threshold with the max-jump heuristic on lifetimes.
    #[default]
    MaxJump,
    /// Cut at an explicit level expressed in raw image units.
    Level(f64),
}

/// Configuration for the denoising pipeline.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DenoiseConfig {
    /// Which pixel graph oracle builds the steepest-ascent forest.
    pub oracle: OracleKind,

    /// Pruning applied before diffusion.
    pub cut: CutLevel,

    /// Diffusion parameters and stopping rule.
    pub diffusion: DiffusionConfig,
}

/// Result of running the full denoising pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Denoised {
    /// Reconstructed image in raw units (not clipped).
    pub image: ScalarImage,

    /// The diffused tree, carrying its cut view if one was applied.
    pub tree: MergeTree,

    /// Cut threshold in raw units, or `None` when the tree was not cut.
    pub level: Option<f64>,

    /// Committed diffusion steps.
    pub steps: usize,

    /// Final diffusion score (MSE when supervised, negated entropy otherwise).
    pub score: f64,

    /// Why diffusion stopped.
    pub stop: StopReason,
}

/// Errors raised while building, cutting, or diffusing a merge tree.
#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize, Deserialize)]
pub enum TreeError {
    /// The image (or a companion array) is malformed.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The cut threshold leaves no pixel above it.
    #[error("cut level {level} leaves no component above the threshold")]
    EmptyPartition {
        /// Normalized threshold that was requested.
        level: f64,
    },

    /// The max-jump heuristic needs at least two components.
    #[error("max-jump threshold is undefined for {components} component(s)")]
    DegenerateForest {
        /// Number of components in the tree.
        components: usize,
    },

    /// Diffusion parameters are unusable.
    #[error("invalid diffusion configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_empty() {
        assert!(matches!(
            ScalarImage::new(0, 3, vec![]),
            Err(TreeError::InvalidInput(_))
        ));
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(matches!(
            ScalarImage::new(2, 2, vec![1.0; 3]),
            Err(TreeError::InvalidInput(_))
        ));
    }

    #[test]
    fn from_rows_rejects_ragged() {
        let rows = vec![vec![1.0, 2.0], vec![3.0]];
        assert!(matches!(
            ScalarImage::from_rows(&rows),
            Err(TreeError::InvalidInput(_))
        ));
    }

    #[test]
    fn from_rows_is_row_major() {
        let img = ScalarImage::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0, 5.0, 6.0]]).unwrap();
        assert_eq!(img.rows(), 2);
        assert_eq!(img.cols(), 3);
        assert_eq!(img.get(1, 0), Some(4.0));
        assert_eq!(img.get(2, 0), None);
    }

    #[test]
    fn luma_conversion_keeps_orientation() {
        let gray = GrayImage::from_fn(3, 2, |x, y| image::Luma([u8::try_from(x + 10 * y).unwrap()]));
        let img = ScalarImage::from_luma(&gray).unwrap();
        assert_eq!(img.rows(), 2);
        assert_eq!(img.cols(), 3);
        assert_eq!(img.get(1, 2), Some(12.0));
        assert_eq!(img.to_luma8(), gray);
    }

    #[test]
    fn to_luma8_clamps() {
        let img = ScalarImage::new(1, 2, vec![-5.0, 300.0]).unwrap();
        let gray = img.to_luma8();
        assert_eq!(gray.get_pixel(0, 0).0[0], 0);
        assert_eq!(gray.get_pixel(1, 0).0[0], 255);
    }

    #[test]
    fn info_rejects_constant_image() {
        let img = ScalarImage::new(2, 2, vec![3.0; 4]).unwrap();
        assert!(matches!(ImageInfo::of(&img), Err(TreeError::InvalidInput(_))));
    }

    #[test]
    fn info_rejects_nan() {
        let img = ScalarImage::new(1, 3, vec![0.0, f64::NAN, 1.0]).unwrap();
        assert!(matches!(ImageInfo::of(&img), Err(TreeError::InvalidInput(_))));
    }

    #[test]
    fn normalize_round_trip() {
        let img = ScalarImage::new(1, 3, vec![-2.0, 0.5, 6.0]).unwrap();
        let info = ImageInfo::of(&img).unwrap();
        for &v in img.data() {
            let n = info.normalize(v);
            assert!((0.0..=1.0).contains(&n));
            assert!((info.denormalize(n) - v).abs() < 1e-12);
        }
    }

    #[test]
    fn error_serde_round_trip() {
        let err = TreeError::DegenerateForest { components: 1 };
        let json = serde_json::to_string(&err).unwrap();
        let back: TreeError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn config_default_cuts_with_max_jump() {
        let config = DenoiseConfig::default();
        assert_eq!(config.cut, CutLevel::MaxJump);
    }
}
