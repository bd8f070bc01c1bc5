//! Tree cutting: prune short-lived components and reattach their pixels.
//!
//! Pixels whose component lifetime reaches the threshold keep their place
//! in the tree. Every other pixel is attached to the component apex reached
//! by walking up from its nearest surviving neighbor in `(col, row, value)`
//! space. A repair pass then shortcuts parent pointers through pruned
//! pixels so each one targets a surviving component apex, and any pixel
//! still left without a parent is hung off a longer-lived component.
//!
//! The result is a [`CutView`]: the base structure is never modified.

use std::collections::BTreeMap;

use rayon::prelude::*;
use rstar::RTree;
use rstar::primitives::GeomWithData;
use serde::{Deserialize, Serialize};

use crate::forest::Forest;
use crate::tree::{LabelExtrema, MergeTree};
use crate::types::TreeError;

/// Whether a tree currently exposes a cut view.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum CutState {
    /// Only the base structure exists.
    #[default]
    Uncut,
    /// A cut has been computed and is the active view.
    Cut(CutView),
}

/// The pruned structure produced by [`cut`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CutView {
    /// Parent/children relation after pruning; a single tree rooted at the
    /// merge tree's root.
    pub forest: Forest,
    /// Component label per pixel after pruning.
    pub labels: Vec<usize>,
    /// Sorted distinct cut labels.
    pub components: Vec<usize>,
    /// Maximum normalized value per cut label.
    pub births: BTreeMap<usize, f64>,
    /// Minimum normalized value per cut label.
    pub deaths: BTreeMap<usize, f64>,
    /// Normalized threshold that produced this view.
    pub level: f64,
}

type IndexedPoint = GeomWithData<[f64; 3], usize>;

/// Max-jump threshold over a set of component lifetimes.
///
/// Sorts the lifetimes, finds the first largest gap between consecutive
/// values at position `i`, and returns the midpoint of the two sorted
/// lifetimes just below it (`(sorted[i-2] + sorted[i-1]) / 2`). Negative
/// positions wrap around from the end of the sorted list.
///
/// # Errors
///
/// Returns [`TreeError::DegenerateForest`] for fewer than two lifetimes.
pub fn max_jump_threshold(lifetimes: &[f64]) -> Result<f64, TreeError> {
    let n = lifetimes.len();
    if n < 2 {
        return Err(TreeError::DegenerateForest { components: n });
    }
    let mut sorted = lifetimes.to_vec();
    sorted.sort_by(f64::total_cmp);

    let mut i_max = 0;
    let mut best = f64::NEG_INFINITY;
    for (i, pair) in sorted.windows(2).enumerate() {
        let jump = pair[1] - pair[0];
        if jump > best {
            best = jump;
            i_max = i;
        }
    }

    let lo = sorted[(i_max + n - 2) % n];
    let hi = sorted[(i_max + n - 1) % n];
    Ok(f64::midpoint(lo, hi))
}

/// Cut `tree` at `level` (raw image units), or at the max-jump threshold of
/// its base lifetimes when `level` is `None`.
///
/// Returns the view and the threshold in raw image units.
///
/// # Errors
///
/// - [`TreeError::DegenerateForest`] if `level` is `None` and the base tree
///   has fewer than two components.
/// - [`TreeError::EmptyPartition`] if no pixel has a component lifetime at
///   or above the threshold.
pub fn cut(tree: &MergeTree, level: Option<f64>) -> Result<(CutView, f64), TreeError> {
    let info = tree.info();
    let threshold = match level {
        Some(raw) => info.normalize(raw),
        None => {
            let lifetimes: Vec<f64> = tree.base_lifetimes().into_iter().map(|(_, l)| l).collect();
            max_jump_threshold(&lifetimes)?
        }
    };

    let n = tree.len();
    let root = tree.root();
    let values = tree.values();
    let base = tree.base_forest();
    let base_labels = tree.base_labels();

    let above: Vec<bool> = base_labels
        .iter()
        .map(|&label| tree.base_lifetime(label).is_some_and(|l| l >= threshold))
        .collect();

    #[allow(clippy::cast_precision_loss)]
    let point = |index: usize| -> [f64; 3] {
        let (row, col) = info.coords(index);
        [col as f64, row as f64, values[index]]
    };

    let points: Vec<IndexedPoint> = (0..n)
        .filter(|&i| above[i])
        .map(|i| IndexedPoint::new(point(i), i))
        .collect();
    if points.is_empty() {
        return Err(TreeError::EmptyPartition { level: threshold });
    }
    let surviving = points.len();
    let index = RTree::bulk_load(points);

    // Induced subgraph over surviving pixels.
    let mut forest = Forest::new(n);
    for child in (0..n).filter(|&i| above[i]) {
        if let Some(parent) = base.parent(child).filter(|&p| above[p]) {
            forest.set_parent(child, Some(parent));
        }
    }

    let below: Vec<usize> = (0..n).filter(|&i| !above[i]).collect();
    let nearest: Vec<usize> = below
        .par_iter()
        .map(|&i| {
            index
                .nearest_neighbor(&point(i))
                .map_or(root, |hit| hit.data)
        })
        .collect();

    let mut labels = base_labels.to_vec();
    for (&node, &hit) in below.iter().zip(&nearest) {
        let apex = walk_to_apex(tree, hit);
        labels[node] = apex;
        if node == root {
            continue;
        }
        attach(&mut forest, node, apex, root);
    }

    let LabelExtrema {
        components,
        births,
        deaths,
    } = LabelExtrema::of(values, &labels);

    shortcut_to_components(&mut forest, &components);
    reattach_orphans(&mut forest, &labels, &births, &deaths, root);

    tracing::info!(
        level = threshold,
        surviving,
        components_before = tree.base_components().len(),
        components_after = components.len(),
        "merge tree cut"
    );

    let view = CutView {
        forest,
        labels,
        components,
        births,
        deaths,
        level: threshold,
    };
    Ok((view, info.denormalize(threshold)))
}

/// From `start`, climb the base forest to the first pixel that is a
/// component apex. A zero-lifetime apex defers to its own parent.
fn walk_to_apex(tree: &MergeTree, start: usize) -> usize {
    let base = tree.base_forest();
    let mut node = start;
    while tree.base_birth(node).is_none() {
        match base.parent(node) {
            Some(parent) => node = parent,
            None => break,
        }
    }
    if tree.base_lifetime(node).is_some_and(|l| l <= 0.0)
        && let Some(parent) = base.parent(node)
    {
        node = parent;
    }
    node
}

/// Point `node` at `target`, falling back to `root` when that would close
/// a cycle.
fn attach(forest: &mut Forest, node: usize, target: usize, root: usize) {
    let parent = if forest.would_cycle(node, target) {
        root
    } else {
        target
    };
    forest.set_parent(node, Some(parent));
}

/// Replace each parent with its nearest ancestor-or-self that is a
/// component apex (or the top of its chain). Resolutions are computed on a
/// snapshot before any pointer moves.
fn shortcut_to_components(forest: &mut Forest, components: &[usize]) {
    let n = forest.len();
    let mut is_component = vec![false; n];
    for &c in components {
        is_component[c] = true;
    }

    let snapshot = forest.parents().to_vec();
    let mut resolved: Vec<Option<usize>> = vec![None; n];
    let mut path = Vec::new();
    let mut resolve = |start: usize| -> usize {
        let mut node = start;
        let target = loop {
            if let Some(done) = resolved[node] {
                break done;
            }
            if is_component[node] {
                break node;
            }
            match snapshot[node] {
                Some(parent) => {
                    path.push(node);
                    node = parent;
                }
                None => break node,
            }
        };
        for visited in path.drain(..) {
            resolved[visited] = Some(target);
        }
        resolved[node] = Some(target);
        target
    };

    let moves: Vec<(usize, usize)> = snapshot
        .iter()
        .enumerate()
        .filter_map(|(child, parent)| parent.map(|p| (child, p)))
        .filter_map(|(child, parent)| {
            let target = resolve(parent);
            (target != parent).then_some((child, target))
        })
        .collect();
    for (child, target) in moves {
        forest.set_parent(child, Some(target));
    }
}

/// Attach every non-root pixel without a parent to the apex of the
/// shortest-lived component that outlives the pixel's own component, or to
/// the longest-lived component when none does.
fn reattach_orphans(
    forest: &mut Forest,
    labels: &[usize],
    births: &BTreeMap<usize, f64>,
    deaths: &BTreeMap<usize, f64>,
    root: usize,
) {
    let orphans: Vec<usize> = (0..forest.len())
        .filter(|&i| i != root && forest.parent(i).is_none())
        .collect();
    if orphans.is_empty() {
        return;
    }
    tracing::warn!(
        orphans = orphans.len(),
        "cut left pixels without a parent, reattaching"
    );

    let lifetime = |label: usize| -> f64 {
        births.get(&label).copied().unwrap_or(0.0) - deaths.get(&label).copied().unwrap_or(0.0)
    };
    let mut ascending: Vec<(usize, f64)> = births.keys().map(|&l| (l, lifetime(l))).collect();
    ascending.sort_by(|a, b| a.1.total_cmp(&b.1));

    for orphan in orphans {
        let own = lifetime(labels[orphan]);
        let target = ascending
            .iter()
            .find(|&&(_, l)| l > own)
            .or_else(|| ascending.last())
            .map_or(root, |&(label, _)| label);
        attach(forest, orphan, target, root);
    }
}
