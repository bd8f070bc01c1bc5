//! Component labeling from the oracle's parent array.
//!
//! A pixel adopts its neighbors' parent index as its label when all eight
//! neighbors agree on it. Any disagreement, and any window that reaches
//! past the image border, leaves the pixel labeled with its own index.

use crate::oracle::NEIGHBOR_OFFSETS;

/// Label every pixel of a `rows x cols` grid from its parent array.
#[must_use]
pub fn consistency_labels(parents: &[usize], rows: usize, cols: usize) -> Vec<usize> {
    (0..rows * cols)
        .map(|index| neighbor_consensus(parents, rows, cols, index).unwrap_or(index))
        .collect()
}

/// The parent index shared by all eight neighbors of `index`, if any.
fn neighbor_consensus(parents: &[usize], rows: usize, cols: usize, index: usize) -> Option<usize> {
    let (row, col) = (index / cols, index % cols);
    if row == 0 || col == 0 || row + 1 >= rows || col + 1 >= cols {
        return None;
    }

    let mut shared = None;
    for (dr, dc) in NEIGHBOR_OFFSETS {
        let r = row.checked_add_signed(dr)?;
        let c = col.checked_add_signed(dc)?;
        let parent = parents[r * cols + c];
        match shared {
            None => shared = Some(parent),
            Some(p) if p != parent => return None,
            Some(_) => {}
        }
    }
    shared
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn border_pixels_keep_own_index() {
        let parents = vec![4; 9];
        let labels = consistency_labels(&parents, 3, 3);
        assert_eq!(labels, vec![0, 1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn interior_pixel_adopts_shared_parent() {
        // 4x4 grid: interior pixels 5, 6, 9, 10.
        let parents = vec![6; 16];
        let labels = consistency_labels(&parents, 4, 4);
        assert_eq!(labels[5], 6);
        assert_eq!(labels[10], 6);
        assert_eq!(labels[0], 0);
        assert_eq!(labels[15], 15);
    }

    #[test]
    fn disagreement_keeps_own_index() {
        let mut parents = vec![6; 16];
        parents[0] = 0;
        let labels = consistency_labels(&parents, 4, 4);
        assert_eq!(labels[5], 5, "neighbor 0 disagrees");
        assert_eq!(labels[10], 6, "pixel 10 does not see pixel 0");
    }

    #[test]
    fn center_value_is_ignored() {
        // Only the eight neighbors vote; the pixel's own parent does not.
        let mut parents = vec![3; 9];
        parents[4] = 4;
        let labels = consistency_labels(&parents, 3, 3);
        assert_eq!(labels[4], 3);
    }

    #[test]
    fn single_row_is_all_border() {
        let parents = vec![0, 0, 0, 0];
        assert_eq!(consistency_labels(&parents, 1, 4), vec![0, 1, 2, 3]);
    }
}
