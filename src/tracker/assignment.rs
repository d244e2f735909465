//! Greedy nearest-centroid assignment.
//!
//! Not a globally optimal matching. Rows (live objects) are visited in order
//! of their best distance; each row takes its own arg-min column or nothing.
//! A row whose arg-min column was already taken stays unmatched even if a
//! second-best column is free. Counting relies on this tie-break being
//! reproducible, so do not swap in Hungarian matching here.
//!
//! A non-finite distance (NaN, or a far-off centroid overflowing to `inf`)
//! never matches. Such rows stay unmatched and age like any missed object.

use crate::detect::Centroid;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Assignment {
    /// `(row, col)` pairs in the order they were accepted.
    pub matches: Vec<(usize, usize)>,
    /// Rows left without a detection, ascending.
    pub unmatched_rows: Vec<usize>,
    /// Columns left without an object, ascending.
    pub unmatched_cols: Vec<usize>,
}

/// Full pairwise Euclidean distance matrix, `rows x cols`.
pub fn distance_matrix(rows: &[Centroid], cols: &[Centroid]) -> Vec<Vec<f32>> {
    rows.iter()
        .map(|r| cols.iter().map(|c| r.distance(c)).collect())
        .collect()
}

pub fn greedy_assign(rows: &[Centroid], cols: &[Centroid], max_distance: f32) -> Assignment {
    if rows.is_empty() || cols.is_empty() {
        return Assignment {
            matches: Vec::new(),
            unmatched_rows: (0..rows.len()).collect(),
            unmatched_cols: (0..cols.len()).collect(),
        };
    }

    let d = distance_matrix(rows, cols);

    // Best finite column per row; first minimum wins on ties.
    let mut best: Vec<(usize, usize, f32)> = Vec::with_capacity(rows.len());
    for (row, dists) in d.iter().enumerate() {
        let mut nearest: Option<(usize, f32)> = None;
        for (col, &dist) in dists.iter().enumerate() {
            if !dist.is_finite() {
                continue;
            }
            if nearest.map_or(true, |(_, min)| dist < min) {
                nearest = Some((col, dist));
            }
        }
        match nearest {
            Some((col, dist)) => best.push((row, col, dist)),
            None => log::debug!("assignment: row {} has no finite distance", row),
        }
    }

    // Stable: equal minima keep row order.
    best.sort_by(|a, b| a.2.total_cmp(&b.2));

    let mut used_rows = vec![false; rows.len()];
    let mut used_cols = vec![false; cols.len()];
    let mut matches = Vec::new();
    for (row, col, dist) in best {
        if used_rows[row] || used_cols[col] {
            continue;
        }
        if dist > max_distance {
            continue;
        }
        used_rows[row] = true;
        used_cols[col] = true;
        matches.push((row, col));
    }

    Assignment {
        matches,
        unmatched_rows: (0..rows.len()).filter(|&r| !used_rows[r]).collect(),
        unmatched_cols: (0..cols.len()).filter(|&c| !used_cols[c]).collect(),
    }
}
