//! The merge tree: a pixel forest annotated with component labels and
//! birth/death values.
//!
//! A [`MergeTree`] owns its base structure (built once from an image) and
//! an optional cut view. Accessors without a `base_` prefix read whichever
//! view is active.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::cut::{self, CutState, CutView};
use crate::forest::Forest;
use crate::label::consistency_labels;
use crate::oracle::{OracleKind, PixelGraphOracle};
use crate::types::{ImageInfo, ScalarImage, TreeError};

/// Per-label extrema over the pixels carrying that label.
pub(crate) struct LabelExtrema {
    pub components: Vec<usize>,
    pub births: BTreeMap<usize, f64>,
    pub deaths: BTreeMap<usize, f64>,
}

impl LabelExtrema {
    pub(crate) fn of(values: &[f64], labels: &[usize]) -> Self {
        let mut births = BTreeMap::new();
        let mut deaths = BTreeMap::new();
        for (&value, &label) in values.iter().zip(labels) {
            births
                .entry(label)
                .and_modify(|b: &mut f64| *b = b.max(value))
                .or_insert(value);
            deaths
                .entry(label)
                .and_modify(|d: &mut f64| *d = d.min(value))
                .or_insert(value);
        }
        let components = births.keys().copied().collect();
        Self {
            components,
            births,
            deaths,
        }
    }
}

/// Read-only view of a single node in the active structure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeView {
    /// Normalized value.
    pub value: f64,
    /// Component label (the component's apex pixel).
    pub label: usize,
    /// Birth of the node's component.
    pub birth: f64,
    /// Death of the node's component.
    pub death: f64,
    /// Parent pixel, `None` at the root.
    pub parent: Option<usize>,
    /// Child pixels.
    pub children: Vec<usize>,
}

/// Hierarchical merge tree over the pixels of a 2D image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeTree {
    info: ImageInfo,
    values: Vec<f64>,
    labels: Vec<usize>,
    forest: Forest,
    components: Vec<usize>,
    births: BTreeMap<usize, f64>,
    deaths: BTreeMap<usize, f64>,
    root: usize,
    cut: CutState,
}

impl MergeTree {
    /// Build a merge tree with the default pixel graph oracle.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if the image has a degenerate or
    /// non-finite value range.
    pub fn from_image(image: &ScalarImage) -> Result<Self, TreeError> {
        Self::from_image_with(image, &OracleKind::default())
    }

    /// Build a merge tree using `oracle` to extract the pixel forest.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if the image has a degenerate or
    /// non-finite value range, or the oracle returns a parent array of the
    /// wrong length or with out-of-range indices.
    pub fn from_image_with<O: PixelGraphOracle + ?Sized>(
        image: &ScalarImage,
        oracle: &O,
    ) -> Result<Self, TreeError> {
        let info = ImageInfo::of(image)?;
        let values: Vec<f64> = image.data().iter().map(|&v| info.normalize(v)).collect();
        let normalized = ScalarImage::from_raw(info.rows, info.cols, values);

        let graph = oracle.image_to_graph(&normalized);
        let n = info.len();
        if graph.parents.len() != n {
            return Err(TreeError::InvalidInput(format!(
                "oracle returned {} parents for {n} pixels",
                graph.parents.len()
            )));
        }
        if let Some(bad) = graph.parents.iter().find(|&&p| p >= n) {
            return Err(TreeError::InvalidInput(format!(
                "oracle returned parent index {bad} for {n} pixels"
            )));
        }

        let root = single_root(&graph.parents)?;
        let values = normalized.into_data();
        if values.iter().any(|&v| v > values[root]) {
            return Err(TreeError::InvalidInput(format!(
                "oracle root {root} is not a global maximum"
            )));
        }

        let labels = consistency_labels(&graph.parents, info.rows, info.cols);
        let forest = Forest::from_parent_array(&graph.parents);
        let LabelExtrema {
            components,
            births,
            deaths,
        } = LabelExtrema::of(&values, &labels);

        Ok(Self {
            info,
            values,
            labels,
            forest,
            components,
            births,
            deaths,
            root,
            cut: CutState::Uncut,
        })
    }

    /// Shape and raw value range of the source image.
    #[must_use]
    pub const fn info(&self) -> &ImageInfo {
        &self.info
    }

    /// Number of pixels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Always `false` for a built tree.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The oracle's single parentless pixel, a global maximum.
    #[must_use]
    pub const fn root(&self) -> usize {
        self.root
    }

    /// Normalized pixel values, row-major.
    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Replace the normalized pixel values.
    ///
    /// # Errors
    ///
    /// Returns [`TreeError::InvalidInput`] if `values` has the wrong length.
    pub fn set_values(&mut self, values: Vec<f64>) -> Result<(), TreeError> {
        if values.len() != self.values.len() {
            return Err(TreeError::InvalidInput(format!(
                "expected {} values, got {}",
                self.values.len(),
                values.len()
            )));
        }
        self.values = values;
        Ok(())
    }

    /// Denormalized image of the current values, optionally clamped at zero.
    #[must_use]
    pub fn to_image(&self, clip: bool) -> ScalarImage {
        let data = self
            .values
            .iter()
            .map(|&v| {
                let raw = self.info.denormalize(v);
                if clip { raw.max(0.0) } else { raw }
            })
            .collect();
        ScalarImage::from_raw(self.info.rows, self.info.cols, data)
    }

    // --- cut state ---------------------------------------------------------

    /// `true` once [`cut`](Self::cut) has succeeded.
    #[must_use]
    pub const fn is_cut(&self) -> bool {
        matches!(self.cut, CutState::Cut(_))
    }

    /// The active cut view, if any.
    #[must_use]
    pub const fn cut_view(&self) -> Option<&CutView> {
        match &self.cut {
            CutState::Cut(view) => Some(view),
            CutState::Uncut => None,
        }
    }

    /// The explicit cut tag.
    #[must_use]
    pub const fn cut_state(&self) -> &CutState {
        &self.cut
    }

    /// Prune the tree at `level` (raw image units), or at the max-jump
    /// threshold when `level` is `None`, and make the result the active view.
    ///
    /// The cut is always recomputed from the base structure, so cutting
    /// twice is the same as cutting once at the second level. Returns the
    /// threshold actually used, in raw image units.
    ///
    /// # Errors
    ///
    /// - [`TreeError::DegenerateForest`] if `level` is `None` and the tree
    ///   has fewer than two components.
    /// - [`TreeError::EmptyPartition`] if no pixel survives the threshold.
    ///
    /// On error the previous view is left untouched.
    pub fn cut(&mut self, level: Option<f64>) -> Result<f64, TreeError> {
        let (view, raw_level) = cut::cut(self, level)?;
        self.cut = CutState::Cut(view);
        Ok(raw_level)
    }

    /// Drop the cut view and return to the base structure.
    pub fn clear_cut(&mut self) {
        self.cut = CutState::Uncut;
    }

    // --- active view -------------------------------------------------------

    /// Component label per pixel.
    #[must_use]
    pub fn labels(&self) -> &[usize] {
        self.cut_view().map_or(&self.labels, |v| &v.labels)
    }

    /// Parent/children relation.
    #[must_use]
    pub fn forest(&self) -> &Forest {
        self.cut_view().map_or(&self.forest, |v| &v.forest)
    }

    /// Sorted distinct labels.
    #[must_use]
    pub fn components(&self) -> &[usize] {
        self.cut_view().map_or(&self.components, |v| &v.components)
    }

    /// Parent of `node`.
    #[must_use]
    pub fn parent(&self, node: usize) -> Option<usize> {
        self.forest().parent(node)
    }

    /// Maximum normalized value of component `label`.
    #[must_use]
    pub fn birth(&self, label: usize) -> Option<f64> {
        self.cut_view()
            .map_or(&self.births, |v| &v.births)
            .get(&label)
            .copied()
    }

    /// Minimum normalized value of component `label`.
    #[must_use]
    pub fn death(&self, label: usize) -> Option<f64> {
        self.cut_view()
            .map_or(&self.deaths, |v| &v.deaths)
            .get(&label)
            .copied()
    }

    /// `birth - death` of component `label`.
    #[must_use]
    pub fn lifetime(&self, label: usize) -> Option<f64> {
        Some(self.birth(label)? - self.death(label)?)
    }

    /// `(label, lifetime)` for every component, ordered by label.
    #[must_use]
    pub fn lifetimes(&self) -> Vec<(usize, f64)> {
        self.components()
            .iter()
            .filter_map(|&label| Some((label, self.lifetime(label)?)))
            .collect()
    }

    /// `(label, lifetime)` ordered by ascending lifetime; equal lifetimes
    /// keep label order.
    #[must_use]
    pub fn lifetimes_ascending(&self) -> Vec<(usize, f64)> {
        let mut lifetimes = self.lifetimes();
        lifetimes.sort_by(|a, b| a.1.total_cmp(&b.1));
        lifetimes
    }

    /// Largest Euclidean grid distance from any pixel of each component to
    /// the component's apex.
    #[must_use]
    pub fn max_distances(&self) -> BTreeMap<usize, f64> {
        max_distances(&self.info, self.labels())
    }

    /// Everything known about pixel `index`, or `None` when out of range.
    #[must_use]
    pub fn node(&self, index: usize) -> Option<NodeView> {
        let value = *self.values.get(index)?;
        let label = self.labels()[index];
        Some(NodeView {
            value,
            label,
            birth: self.birth(label)?,
            death: self.death(label)?,
            parent: self.parent(index),
            children: self.forest().children(index).to_vec(),
        })
    }

    /// Row-major segmentation: `label + 1` per pixel, or `0` where the
    /// value lies below `bg_value` (raw image units).
    #[must_use]
    pub fn segmentation(&self, bg_value: f64) -> Vec<usize> {
        let background = self.info.normalize(bg_value);
        self.values
            .iter()
            .zip(self.labels())
            .map(|(&v, &label)| if v < background { 0 } else { label + 1 })
            .collect()
    }

    // --- base structure ----------------------------------------------------

    /// Labels of the un-cut tree.
    #[must_use]
    pub fn base_labels(&self) -> &[usize] {
        &self.labels
    }

    /// Forest of the un-cut tree.
    #[must_use]
    pub const fn base_forest(&self) -> &Forest {
        &self.forest
    }

    /// Components of the un-cut tree.
    #[must_use]
    pub fn base_components(&self) -> &[usize] {
        &self.components
    }

    /// Birth of `label` in the un-cut tree.
    #[must_use]
    pub fn base_birth(&self, label: usize) -> Option<f64> {
        self.births.get(&label).copied()
    }

    /// Death of `label` in the un-cut tree.
    #[must_use]
    pub fn base_death(&self, label: usize) -> Option<f64> {
        self.deaths.get(&label).copied()
    }

    /// Lifetime of `label` in the un-cut tree.
    #[must_use]
    pub fn base_lifetime(&self, label: usize) -> Option<f64> {
        Some(self.base_birth(label)? - self.base_death(label)?)
    }

    /// `(label, lifetime)` of the un-cut tree, ordered by label.
    #[must_use]
    pub fn base_lifetimes(&self) -> Vec<(usize, f64)> {
        self.components
            .iter()
            .filter_map(|&label| Some((label, self.base_lifetime(label)?)))
            .collect()
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unseen,
    OnPath,
    Rooted,
}

/// The only self-parented pixel of an in-range parent array, provided every
/// chain reaches it.
fn single_root(parents: &[usize]) -> Result<usize, TreeError> {
    let mut roots = (0..parents.len()).filter(|&i| parents[i] == i);
    let root = match (roots.next(), roots.next()) {
        (Some(root), None) => root,
        (None, _) => {
            return Err(TreeError::InvalidInput(String::from(
                "oracle returned no parentless pixel",
            )));
        }
        (Some(a), Some(b)) => {
            return Err(TreeError::InvalidInput(format!(
                "oracle returned several parentless pixels ({a}, {b}, ...)"
            )));
        }
    };

    let mut marks = vec![Mark::Unseen; parents.len()];
    marks[root] = Mark::Rooted;
    let mut path = Vec::new();
    for start in 0..parents.len() {
        let mut node = start;
        while marks[node] != Mark::Rooted {
            if marks[node] == Mark::OnPath {
                return Err(TreeError::InvalidInput(format!(
                    "oracle parent array has a cycle through pixel {node}"
                )));
            }
            marks[node] = Mark::OnPath;
            path.push(node);
            node = parents[node];
        }
        for visited in path.drain(..) {
            marks[visited] = Mark::Rooted;
        }
    }
    Ok(root)
}

#[allow(clippy::cast_precision_loss)]
pub(crate) fn max_distances(info: &ImageInfo, labels: &[usize]) -> BTreeMap<usize, f64> {
    let mut out: BTreeMap<usize, f64> = BTreeMap::new();
    for (index, &label) in labels.iter().enumerate() {
        let (r, c) = info.coords(index);
        let (lr, lc) = info.coords(label);
        let dr = r.abs_diff(lr) as f64;
        let dc = c.abs_diff(lc) as f64;
        let d = dr.hypot(dc);
        out.entry(label)
            .and_modify(|m| *m = m.max(d))
            .or_insert(d);
    }
    out
}
