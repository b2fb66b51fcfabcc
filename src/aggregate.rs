//! Track-vector aggregation.
//!
//! Collapses per-track slice matrices into one vector per track using a
//! TF-IDF weighting over cosine neighborhoods inside the batch: slices
//! that many tracks share sit near a batch centroid and are damped, rare
//! identifying slices dominate, and motifs repeated within a track
//! accumulate term frequency and reinforce the direction they define.

use std::collections::HashMap;

use crate::error::Error;
use crate::store::{Matrix, VectorMap};
use crate::vecmath;

/// Aggregate the slice matrices of `keys` into one vector per key.
///
/// Keys with a zero-norm slice row are dropped with a notice (a
/// well-formed model never emits one). A single-key batch has no
/// cross-track contrast to weigh, so it falls back to the mean of the
/// normalised rows.
pub fn aggregate(slices: &HashMap<String, Matrix>, keys: &[String], epsilon: f32) -> VectorMap {
    let mut rows: Vec<Vec<f32>> = Vec::new();
    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut kept: Vec<&String> = Vec::new();

    for key in keys {
        let Some(matrix) = slices.get(key) else {
            log::warn!("{key}: no slice matrix in this batch, skipping");
            continue;
        };
        if matrix.rows == 0 {
            log::warn!("{key}: empty slice matrix, skipping");
            continue;
        }
        let start = rows.len();
        let mut degenerate = false;
        for r in 0..matrix.rows {
            let mut row = matrix.row(r).to_vec();
            if !vecmath::normalize(&mut row) {
                degenerate = true;
                break;
            }
            rows.push(row);
        }
        if degenerate {
            eprintln!(
                "skipping: {}",
                Error::DegenerateEmbedding { key: key.clone() }
            );
            rows.truncate(start);
            continue;
        }
        kept.push(key);
        ranges.push((start, rows.len()));
    }

    if kept.is_empty() {
        return VectorMap::new();
    }
    if kept.len() == 1 {
        let (start, end) = ranges[0];
        return VectorMap::from([(kept[0].clone(), mean_rows(&rows[start..end]))]);
    }

    // Pairwise cosine distances over all normalised rows; symmetric with
    // a zero diagonal, so every row is inside its own neighborhood.
    let n = rows.len();
    let mut dist = vec![0.0f32; n * n];
    for i in 0..n {
        for j in i + 1..n {
            let d = 1.0 - vecmath::dot(&rows[i], &rows[j]);
            dist[i * n + j] = d;
            dist[j * n + i] = d;
        }
    }

    // IDF: how many tracks of the batch come within epsilon of row i.
    let key_count = kept.len() as f32;
    let mut idf = vec![0.0f32; n];
    for (i, idf_i) in idf.iter_mut().enumerate() {
        let matches = ranges
            .iter()
            .filter(|&&(start, end)| (start..end).any(|j| dist[i * n + j] < epsilon))
            .count();
        *idf_i = -(matches as f32 / key_count).ln();
    }

    let mut out = VectorMap::with_capacity(kept.len());
    for (key, &(start, end)) in kept.iter().zip(&ranges) {
        let dim = rows[start].len();
        let mut acc = vec![0.0f32; dim];
        for i in start..end {
            let tf = (start..end).filter(|&j| dist[i * n + j] < epsilon).count() as f32;
            let weight = tf * idf[i];
            for (a, v) in acc.iter_mut().zip(&rows[i]) {
                *a += v * weight;
            }
        }
        out.insert((*key).clone(), acc);
    }
    out
}

fn mean_rows(rows: &[Vec<f32>]) -> Vec<f32> {
    let dim = rows.first().map_or(0, Vec::len);
    let mut mean = vec![0.0f32; dim];
    for row in rows {
        for (m, v) in mean.iter_mut().zip(row) {
            *m += v;
        }
    }
    let scale = 1.0 / rows.len() as f32;
    for m in &mut mean {
        *m *= scale;
    }
    mean
}
