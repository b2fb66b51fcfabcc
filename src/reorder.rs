//! Playlist reordering.
//!
//! Treats a playlist as a cyclic tour whose edge weights are cosine
//! distances between track vectors, shortens it with simulated annealing,
//! then rotates the result so the requested first song leads and checks
//! whether walking the cycle backwards gives a shorter first step.

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;

use crate::store::VectorMap;
use crate::vecmath;

const INITIAL_TEMPERATURE: f64 = 10.0;
const COOLING_RATE: f64 = 0.9995;
const MIN_TEMPERATURE: f64 = 1e-4;

/// Norm-product floor under which the cosine angle is unmeasurable; the
/// distance is pinned to 1 there.
const NORM_FLOOR: f32 = 1e-3;

pub fn cos_distance(a: &[f32], b: &[f32]) -> f32 {
    let denom = vecmath::norm(a) * vecmath::norm(b);
    if denom < NORM_FLOOR {
        return 1.0;
    }
    1.0 - vecmath::dot(a, b) / denom
}

/// Reorder `tracks` into a short tour. When given, `first_song` is added
/// to the set if missing and anchors position 0 of the result. Unknown
/// tracks are dropped with a notice; the output is a permutation of what
/// remains.
pub fn reorder(vectors: &VectorMap, tracks: &[String], first_song: Option<&str>) -> Vec<String> {
    let mut positions = StdRng::from_entropy();
    let mut acceptance = StdRng::from_entropy();
    reorder_with(vectors, tracks, first_song, &mut positions, &mut acceptance)
}

/// [`reorder`] with caller-supplied RNGs. Position proposals and
/// acceptance draws come from separate generators so either can be
/// seeded independently.
pub fn reorder_with<P: Rng, A: Rng>(
    vectors: &VectorMap,
    tracks: &[String],
    first_song: Option<&str>,
    positions: &mut P,
    acceptance: &mut A,
) -> Vec<String> {
    let mut working: Vec<String> = tracks.to_vec();
    if let Some(first) = first_song {
        if !working.iter().any(|t| t == first) {
            working.push(first.to_string());
        }
    }
    working.retain(|track| {
        let known = vectors.contains_key(track);
        if !known {
            eprintln!("{track}: not in the scanned vector index, dropping from input");
        }
        known
    });
    if working.is_empty() {
        return working;
    }

    let mut best = anneal(vectors, working, positions, acceptance);

    if let Some(first) = first_song {
        if let Some(at) = best.iter().position(|t| t == first) {
            best.rotate_left(at);
        }
    }

    // The first edge out of the anchor should be the shortest one; if the
    // closing edge beats it, walk the cycle the other way round.
    if best.len() >= 3 {
        let (Some(anchor), Some(last), Some(second)) = (
            vectors.get(&best[0]),
            vectors.get(&best[best.len() - 1]),
            vectors.get(&best[1]),
        ) else {
            return best;
        };
        if cos_distance(last, anchor) < cos_distance(anchor, second) {
            best[1..].reverse();
        }
    }
    best
}

/// Simulated annealing over random position swaps with Metropolis
/// acceptance, tracking the best tour seen.
fn anneal<P: Rng, A: Rng>(
    vectors: &VectorMap,
    tour: Vec<String>,
    positions: &mut P,
    acceptance: &mut A,
) -> Vec<String> {
    if tour.len() < 2 {
        return tour;
    }

    let mut current = tour.clone();
    let mut best = tour;
    let mut current_cost = tour_cost(vectors, &current);
    let mut best_cost = current_cost;

    let mut temperature = INITIAL_TEMPERATURE;
    while temperature > MIN_TEMPERATURE {
        let i = positions.gen_range(0..current.len());
        let j = positions.gen_range(0..current.len());
        current.swap(i, j);

        let cost = tour_cost(vectors, &current);
        let delta = cost - current_cost;
        if delta < 0.0 || acceptance.gen::<f64>() < (-delta / temperature).exp() {
            current_cost = cost;
            if current_cost < best_cost {
                best_cost = current_cost;
                best.clone_from(&current);
            }
        } else {
            current.swap(i, j);
        }
        temperature *= COOLING_RATE;
    }
    best
}

/// Sum of cosine distances around the cyclic tour.
fn tour_cost(vectors: &VectorMap, tour: &[String]) -> f64 {
    (0..tour.len())
        .map(|i| {
            let from = &tour[i];
            let to = &tour[(i + 1) % tour.len()];
            match (vectors.get(from), vectors.get(to)) {
                (Some(a), Some(b)) => cos_distance(a, b) as f64,
                _ => 1.0,
            }
        })
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};

    fn vectors() -> VectorMap {
        let mut map = HashMap::new();
        map.insert("a".to_string(), vec![1.0, 0.0]);
        map.insert("b".to_string(), vec![0.9, 0.1]);
        map.insert("c".to_string(), vec![0.0, 1.0]);
        map.insert("d".to_string(), vec![-1.0, 0.0]);
        map
    }

    fn tracks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn rngs() -> (StdRng, StdRng) {
        (StdRng::seed_from_u64(11), StdRng::seed_from_u64(23))
    }

    #[test]
    fn cos_distance_of_identical_vectors_is_zero() {
        assert!(cos_distance(&[1.0, 0.0], &[2.0, 0.0]).abs() < 1e-6);
    }

    #[test]
    fn cos_distance_of_opposite_vectors_is_two() {
        assert!((cos_distance(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn cos_distance_guards_tiny_norms() {
        assert_eq!(cos_distance(&[1e-4, 0.0], &[1.0, 0.0]), 1.0);
        assert_eq!(cos_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
    }

    #[test]
    fn tour_cost_is_cyclic() {
        let vecs = vectors();
        let tour = tracks(&["a", "b", "c"]);
        let cost = tour_cost(&vecs, &tour);
        let rotated = tracks(&["b", "c", "a"]);
        assert!((cost - tour_cost(&vecs, &rotated)).abs() < 1e-9);
    }

    #[test]
    fn output_is_a_permutation_of_the_input() {
        let vecs = vectors();
        let input = tracks(&["a", "b", "c", "d"]);
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &input, None, &mut p, &mut a);

        let expected: HashSet<&String> = input.iter().collect();
        let got: HashSet<&String> = out.iter().collect();
        assert_eq!(out.len(), input.len());
        assert_eq!(expected, got);
    }

    #[test]
    fn first_song_anchors_position_zero() {
        let vecs = vectors();
        let input = tracks(&["a", "b", "c", "d"]);
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &input, Some("c"), &mut p, &mut a);
        assert_eq!(out[0], "c");
        assert_eq!(out.len(), 4);
    }

    #[test]
    fn missing_first_song_is_appended_before_ordering() {
        let vecs = vectors();
        let input = tracks(&["a", "b"]);
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &input, Some("d"), &mut p, &mut a);
        assert_eq!(out[0], "d");
        assert_eq!(out.len(), 3);
    }

    #[test]
    fn unknown_tracks_are_pruned() {
        let vecs = vectors();
        let input = tracks(&["a", "ghost", "b"]);
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &input, None, &mut p, &mut a);
        assert_eq!(out.len(), 2);
        assert!(!out.contains(&"ghost".to_string()));
    }

    #[test]
    fn all_unknown_tracks_yield_an_empty_playlist() {
        let vecs = vectors();
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &tracks(&["x", "y"]), None, &mut p, &mut a);
        assert!(out.is_empty());
    }

    #[test]
    fn seeded_runs_are_deterministic() {
        let vecs = vectors();
        let input = tracks(&["a", "b", "c", "d"]);
        let (mut p1, mut a1) = rngs();
        let (mut p2, mut a2) = rngs();
        let one = reorder_with(&vecs, &input, None, &mut p1, &mut a1);
        let two = reorder_with(&vecs, &input, None, &mut p2, &mut a2);
        assert_eq!(one, two);
    }

    #[test]
    fn annealing_finds_the_obvious_grouping() {
        // Two tight clusters; the cheap tour keeps each cluster together.
        let mut vecs = HashMap::new();
        vecs.insert("a1".to_string(), vec![1.0, 0.0]);
        vecs.insert("a2".to_string(), vec![0.99, 0.01]);
        vecs.insert("b1".to_string(), vec![0.0, 1.0]);
        vecs.insert("b2".to_string(), vec![0.01, 0.99]);

        let worst = tracks(&["a1", "b1", "a2", "b2"]);
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &worst, None, &mut p, &mut a);

        let cost = tour_cost(&vecs, &out);
        let ideal = tour_cost(&vecs, &tracks(&["a1", "a2", "b2", "b1"]));
        assert!(
            cost <= ideal + 1e-6,
            "annealed cost {cost} should reach the ideal {ideal}"
        );
    }

    #[test]
    fn single_track_passes_through() {
        let vecs = vectors();
        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &tracks(&["a"]), None, &mut p, &mut a);
        assert_eq!(out, tracks(&["a"]));
    }

    #[test]
    fn terminal_reversal_prefers_the_shorter_first_edge() {
        // Anchor x; y is nearly opposite, z is close. If annealing ends
        // with x, y, z the closing edge z->x (short) beats x->y (long), so
        // the tail must be reversed to x, z, y.
        let mut vecs = HashMap::new();
        vecs.insert("x".to_string(), vec![1.0, 0.0]);
        vecs.insert("y".to_string(), vec![-1.0, 0.05]);
        vecs.insert("z".to_string(), vec![0.95, 0.05]);

        let (mut p, mut a) = rngs();
        let out = reorder_with(&vecs, &tracks(&["x", "y", "z"]), Some("x"), &mut p, &mut a);

        assert_eq!(out[0], "x");
        let first_edge = cos_distance(&vecs[&out[0]], &vecs[&out[1]]);
        let closing_edge = cos_distance(&vecs[&out[out.len() - 1]], &vecs[&out[0]]);
        assert!(
            first_edge <= closing_edge + 1e-6,
            "first edge {first_edge} should not exceed closing edge {closing_edge}"
        );
    }
}
