//! Post-processing for label segmentations.

use std::collections::{BTreeMap, VecDeque};

/// Split every non-zero label of a row-major `rows x cols` segmentation
/// into its 4-connected regions and number the regions `1..`.
///
/// Labels are visited in ascending order and, within a label, regions in
/// raster order of their first pixel. Zero stays background.
#[must_use]
pub fn relabel_connected(segmentation: &[usize], rows: usize, cols: usize) -> Vec<usize> {
    let n = segmentation.len().min(rows * cols);
    let mut by_label: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
    for (i, &label) in segmentation[..n].iter().enumerate() {
        if label != 0 {
            by_label.entry(label).or_default().push(i);
        }
    }

    let mut out = vec![0; n];
    let mut next = 1;
    let mut queue = VecDeque::new();
    for (label, pixels) in by_label {
        for start in pixels {
            if out[start] != 0 {
                continue;
            }
            out[start] = next;
            queue.push_back(start);
            while let Some(i) = queue.pop_front() {
                let (r, c) = (i / cols, i % cols);
                let neighbors = [
                    r.checked_sub(1).map(|r| r * cols + c),
                    (r + 1 < rows).then(|| (r + 1) * cols + c),
                    c.checked_sub(1).map(|c| r * cols + c),
                    (c + 1 < cols).then(|| r * cols + c + 1),
                ];
                for j in neighbors.into_iter().flatten() {
                    if j < n && segmentation[j] == label && out[j] == 0 {
                        out[j] = next;
                        queue.push_back(j);
                    }
                }
            }
            next += 1;
        }
    }
    out
}
