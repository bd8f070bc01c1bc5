//! Pixel graph oracle: turn an image into a steepest-ascent forest.
//!
//! This module defines the [`PixelGraphOracle`] trait for pluggable graph
//! extraction and the [`OracleKind`] enum for selecting an implementation
//! at runtime. The merge tree builder only relies on the trait contract:
//! one parent index per pixel (row-major), where a parent equal to the
//! pixel's own index means "no parent".
//!
//! # Steepest ascent with saddle merging
//!
//! The shipped oracle works in two passes. First every pixel points at the
//! highest pixel of its 3x3 window, and pointer jumping collapses those
//! chains so each pixel points straight at the local maximum of its basin.
//! Then adjacent pixels lying in different basins are treated as saddle
//! candidates, processed from the highest lower-side value downward; each
//! one that still separates two basins hangs the lower basin's maximum off
//! the saddle pixel on the higher side. The global maximum is left as the
//! single parentless pixel.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::types::ScalarImage;

/// Row/column offsets of the 8-connected neighborhood.
pub(crate) const NEIGHBOR_OFFSETS: [(isize, isize); 8] = [
    (-1, 0),
    (1, 0),
    (0, -1),
    (0, 1),
    (-1, -1),
    (-1, 1),
    (1, -1),
    (1, 1),
];

/// Output of a [`PixelGraphOracle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PixelGraph {
    /// Row-major parent index per pixel; `parents[i] == i` marks a root.
    pub parents: Vec<usize>,
    /// Row-major edge weight per pixel (value gap to the parent's root).
    pub weights: Vec<f64>,
}

/// Selects which pixel graph oracle to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OracleKind {
    /// 3x3 steepest ascent followed by descending saddle merging.
    #[default]
    SteepestAscent,
}

/// Trait for pixel graph extraction strategies.
///
/// Input: a normalized image. Output: a steepest-ascent forest with one
/// parent per pixel.
pub trait PixelGraphOracle {
    /// Build the parent and weight arrays for `image`.
    fn image_to_graph(&self, image: &ScalarImage) -> PixelGraph;
}

impl PixelGraphOracle for OracleKind {
    fn image_to_graph(&self, image: &ScalarImage) -> PixelGraph {
        match *self {
            Self::SteepestAscent => steepest_ascent(image),
        }
    }
}

/// A pair of adjacent pixels in different basins.
#[derive(Debug, Clone, Copy)]
struct Saddle {
    u_val: f64,
    c_val: f64,
    c_point: usize,
    u_point: usize,
}

#[allow(clippy::float_cmp)]
fn steepest_ascent(image: &ScalarImage) -> PixelGraph {
    let values = image.data();
    let (rows, cols) = (image.rows(), image.cols());
    let n = values.len();

    let mut parents = window_argmax(image);
    let mut weights = vec![0.0; n];

    // Collapse ascent chains in place, in index order.
    loop {
        let mut changed = false;
        for i in 0..n {
            let grand = parents[parents[i]];
            if parents[i] != grand {
                parents[i] = grand;
                weights[i] = values[parents[grand]] - values[i];
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let mut saddles = Vec::new();
    for c_point in 0..n {
        let (i, j) = (c_point / cols, c_point % cols);
        let c_val = values[c_point];
        for h in i.saturating_sub(1)..=(i + 1).min(rows - 1) {
            for k in j.saturating_sub(1)..=(j + 1).min(cols - 1) {
                let t_point = h * cols + k;
                let t_val = values[t_point];
                let higher = c_val > t_val || (c_val == t_val && c_point > t_point);
                if c_point != t_point && parents[c_point] != parents[t_point] && higher {
                    saddles.push(Saddle {
                        u_val: t_val,
                        c_val,
                        c_point,
                        u_point: t_point,
                    });
                }
            }
        }
    }

    saddles.sort_by(|a, b| {
        b.u_val
            .partial_cmp(&a.u_val)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.c_val.partial_cmp(&a.c_val).unwrap_or(Ordering::Equal))
    });

    for saddle in &saddles {
        let c_obj = find_root(&parents, saddle.c_point);
        let u_obj = find_root(&parents, saddle.u_point);
        if c_obj == u_obj {
            continue;
        }
        let c_wins = match values[c_obj].partial_cmp(&values[u_obj]) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) => false,
            _ => c_obj > u_obj,
        };
        if c_wins {
            parents[u_obj] = saddle.c_point;
            weights[u_obj] = values[c_obj] - values[u_obj];
        } else {
            parents[c_obj] = saddle.u_point;
            weights[c_obj] = values[u_obj] - values[c_obj];
        }
    }

    PixelGraph { parents, weights }
}

/// Index of the first strictly-greatest cell of each pixel's 3x3 window,
/// scanning the window row-major. Cells outside the image never win.
fn window_argmax(image: &ScalarImage) -> Vec<usize> {
    let values = image.data();
    let (rows, cols) = (image.rows(), image.cols());

    (0..values.len())
        .map(|c_point| {
            let (i, j) = (c_point / cols, c_point % cols);
            let mut best = c_point;
            let mut best_val = f64::MIN;
            for di in 0..3 {
                for dj in 0..3 {
                    let (Some(ni), Some(nj)) = ((i + di).checked_sub(1), (j + dj).checked_sub(1))
                    else {
                        continue;
                    };
                    if ni >= rows || nj >= cols {
                        continue;
                    }
                    let idx = ni * cols + nj;
                    if values[idx] > best_val {
                        best_val = values[idx];
                        best = idx;
                    }
                }
            }
            best
        })
        .collect()
}

fn find_root(parents: &[usize], mut node: usize) -> usize {
    while parents[node] != node {
        node = parents[node];
    }
    node
}
