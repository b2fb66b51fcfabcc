//! Similarity-driven playlist generation.
//!
//! Loads the bundled vector map once and serves the three generation
//! methods over it. All three share the same primitives — an exact
//! Top-K cosine search and Gaussian noise injection — and differ only in
//! how the context vector is built: append sums a sliding lookback
//! window, cluster sums the seeds once, connect blends adjacent seed
//! pairs with weights biased toward the earlier seed.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{Error, Result};
use crate::reorder;
use crate::store::{self, VectorMap};
use crate::vecmath;

/// Candidate pool consulted for each connect bridge position.
const CONNECT_CANDIDATES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Append,
    Connect,
    Cluster,
}

impl FromStr for Method {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "append" => Ok(Self::Append),
            "connect" => Ok(Self::Connect),
            "cluster" => Ok(Self::Cluster),
            other => Err(format!(
                "unknown method '{other}', expected append, connect or cluster"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateConfig {
    /// Target playlist length (bridge tracks per pair in connect).
    pub nsongs: usize,
    /// Context window for append.
    pub lookback: usize,
    /// Gaussian noise scale, relative to the context vector's norm.
    pub noise: f32,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            nsongs: 10,
            lookback: 3,
            noise: 0.0,
        }
    }
}

#[derive(Debug)]
pub struct Generator {
    vectors: VectorMap,
}

impl Generator {
    /// Load the bundled vector map under `vec_dir`. A corrupt bundle
    /// fails fast here; an empty or missing one is unusable.
    pub fn load(vec_dir: &Path) -> Result<Self> {
        let path = vec_dir
            .join(store::BUNDLED_DIRNAME)
            .join(store::BUNDLED_FILENAME);
        let map = store::load_map(&path)?;
        if map.is_empty() {
            return Err(Error::EmptyIndex { path });
        }
        Ok(Self::from_vectors(store::into_vectors(map)))
    }

    /// Build a generator directly from an in-memory map.
    pub fn from_vectors(vectors: VectorMap) -> Self {
        Self { vectors }
    }

    pub fn generate(&self, method: Method, seeds: &[String], config: &GenerateConfig) -> Vec<String> {
        let mut rng = StdRng::from_entropy();
        self.generate_with(method, seeds, config, &mut rng)
    }

    pub fn generate_with<R: Rng>(
        &self,
        method: Method,
        seeds: &[String],
        config: &GenerateConfig,
        rng: &mut R,
    ) -> Vec<String> {
        let seeds = self.retain_known(seeds);
        if seeds.is_empty() {
            return Vec::new();
        }

        // connect needs two endpoints; with one seed it degenerates to
        // append with the same parameters.
        if method == Method::Connect && seeds.len() >= 2 {
            return self.connect(&seeds, config, rng);
        }

        let mut playlist = seeds;
        let mut seen: HashSet<String> = playlist.iter().cloned().collect();
        let mut context = if method == Method::Cluster {
            self.context_vector(&playlist, config.noise, rng)
        } else {
            Vec::new()
        };

        while playlist.len() < config.nsongs {
            if method != Method::Cluster {
                let start = playlist.len().saturating_sub(config.lookback);
                context = self.context_vector(&playlist[start..], config.noise, rng);
            }
            let Some((next, _)) = self.most_similar(&seen, &context, 1).into_iter().next() else {
                break;
            };
            seen.insert(next.clone());
            playlist.push(next);
        }
        playlist
    }

    fn connect<R: Rng>(
        &self,
        seeds: &[String],
        config: &GenerateConfig,
        rng: &mut R,
    ) -> Vec<String> {
        let mut playlist = vec![seeds[0].clone()];
        let mut seen: HashSet<String> = seeds.iter().cloned().collect();

        for pair in seeds.windows(2) {
            let (from, to) = (&pair[0], &pair[1]);
            let (Some(from_vec), Some(to_vec)) =
                (self.vectors.get(from), self.vectors.get(to))
            else {
                continue;
            };

            for step in 0..config.nsongs {
                // The blend leans toward the previous seed for the whole
                // bridge; beta stays short of 1.
                let alpha = (config.nsongs - step + 1) as f32 / (config.nsongs + 1) as f32;
                let beta = 1.0 - alpha;
                let mut blended: Vec<f32> = from_vec
                    .iter()
                    .zip(to_vec)
                    .map(|(a, b)| alpha * a + beta * b)
                    .collect();
                add_noise(&mut blended, config.noise, rng);

                let next = self
                    .most_similar(&seen, &blended, CONNECT_CANDIDATES)
                    .into_iter()
                    .find(|(candidate, _)| candidate != to);
                let Some((next, _)) = next else {
                    break;
                };
                seen.insert(next.clone());
                playlist.push(next);
            }
            playlist.push(to.clone());
        }
        playlist
    }

    /// Exact cosine similarity of `query` against every non-excluded
    /// track, best first, truncated to `topn`. Candidates without a
    /// measurable angle (zero norms on either side) are left out.
    pub fn most_similar(
        &self,
        excluded: &HashSet<String>,
        query: &[f32],
        topn: usize,
    ) -> Vec<(String, f32)> {
        let query_norm = vecmath::norm(query);
        let mut similar: Vec<(String, f32)> = Vec::new();
        for (track, vector) in &self.vectors {
            if excluded.contains(track) {
                continue;
            }
            let denom = query_norm * vecmath::norm(vector);
            if denom <= 0.0 {
                continue;
            }
            similar.push((track.clone(), vecmath::dot(query, vector) / denom));
        }
        similar.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        similar.truncate(topn);
        similar
    }

    /// Reorder a playlist into a short cosine tour (see [`crate::reorder`]).
    pub fn reorder(&self, tracks: &[String], first_song: Option<&str>) -> Vec<String> {
        reorder::reorder(&self.vectors, tracks, first_song)
    }

    /// Sum of the (known) track vectors plus noise.
    fn context_vector<R: Rng>(&self, tracks: &[String], noise: f32, rng: &mut R) -> Vec<f32> {
        let dim = self.vectors.values().next().map_or(0, Vec::len);
        let mut sum = vec![0.0f32; dim];
        for track in tracks {
            if let Some(vector) = self.vectors.get(track) {
                for (acc, v) in sum.iter_mut().zip(vector) {
                    *acc += v;
                }
            }
        }
        add_noise(&mut sum, noise, rng);
        sum
    }

    /// Drop seeds that were never scanned, with a notice per drop.
    fn retain_known(&self, tracks: &[String]) -> Vec<String> {
        tracks
            .iter()
            .filter(|track| {
                let known = self.vectors.contains_key(*track);
                if !known {
                    eprintln!("{track}: not in the scanned vector index, dropping from input");
                }
                known
            })
            .cloned()
            .collect()
    }
}

/// Add Gaussian noise with per-coordinate stddev `noise * ||vec||`.
fn add_noise<R: Rng>(vec: &mut [f32], noise: f32, rng: &mut R) {
    if noise <= 0.0 {
        return;
    }
    let sigma = noise * vecmath::norm(vec);
    let Ok(normal) = Normal::new(0.0f32, sigma) else {
        return;
    };
    for v in vec.iter_mut() {
        *v += normal.sample(rng);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn generator() -> Generator {
        let mut vectors = VectorMap::new();
        vectors.insert("k1".to_string(), vec![1.0, 0.0, 0.0]);
        vectors.insert("k2".to_string(), vec![0.9, 0.1, 0.0]);
        vectors.insert("k3".to_string(), vec![0.0, 1.0, 0.0]);
        Generator::from_vectors(vectors)
    }

    fn seeded() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    fn tracks(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn method_parses_known_names_only() {
        assert_eq!(Method::from_str("append"), Ok(Method::Append));
        assert_eq!(Method::from_str("connect"), Ok(Method::Connect));
        assert_eq!(Method::from_str("cluster"), Ok(Method::Cluster));
        assert!(Method::from_str("shuffle").is_err());
    }

    #[test]
    fn most_similar_sorts_descending_and_truncates() {
        let gen = generator();
        let hits = gen.most_similar(&HashSet::new(), &[1.0, 0.0, 0.0], 2);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].0, "k1");
        assert_eq!(hits[1].0, "k2");
        assert!(hits[0].1 >= hits[1].1);
    }

    #[test]
    fn most_similar_honours_exclusions() {
        let gen = generator();
        let excluded: HashSet<String> = ["k1".to_string()].into();
        let hits = gen.most_similar(&excluded, &[1.0, 0.0, 0.0], 10);
        assert!(hits.iter().all(|(k, _)| k != "k1"));
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn most_similar_skips_zero_norm_queries() {
        let gen = generator();
        assert!(gen.most_similar(&HashSet::new(), &[0.0, 0.0, 0.0], 5).is_empty());
    }

    #[test]
    fn append_extends_toward_the_nearest_neighbour() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 2,
            lookback: 3,
            noise: 0.0,
        };
        let playlist = gen.generate_with(Method::Append, &tracks(&["k1"]), &config, &mut seeded());
        assert_eq!(playlist, tracks(&["k1", "k2"]));
    }

    #[test]
    fn append_caps_the_playlist_at_nsongs() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 3,
            lookback: 2,
            noise: 0.0,
        };
        let playlist = gen.generate_with(Method::Append, &tracks(&["k1"]), &config, &mut seeded());
        assert_eq!(playlist.len(), 3);
        let unique: HashSet<&String> = playlist.iter().collect();
        assert_eq!(unique.len(), 3, "no track repeats");
    }

    #[test]
    fn cluster_uses_a_fixed_context() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 2,
            lookback: 3,
            noise: 0.0,
        };
        let playlist =
            gen.generate_with(Method::Cluster, &tracks(&["k3"]), &config, &mut seeded());
        assert_eq!(playlist[0], "k3");
        assert_eq!(playlist.len(), 2);
    }

    #[test]
    fn connect_with_one_seed_falls_back_to_append() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 2,
            lookback: 3,
            noise: 0.0,
        };
        let connected =
            gen.generate_with(Method::Connect, &tracks(&["k1"]), &config, &mut seeded());
        let appended =
            gen.generate_with(Method::Append, &tracks(&["k1"]), &config, &mut seeded());
        assert_eq!(connected, appended);
    }

    #[test]
    fn connect_keeps_seed_endpoints_in_order() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 1,
            lookback: 3,
            noise: 0.0,
        };
        let playlist =
            gen.generate_with(Method::Connect, &tracks(&["k1", "k3"]), &config, &mut seeded());
        assert_eq!(playlist.first().map(String::as_str), Some("k1"));
        assert_eq!(playlist.last().map(String::as_str), Some("k3"));
        // One bridge position between the pair, filled by the remaining track.
        assert_eq!(playlist, tracks(&["k1", "k2", "k3"]));
    }

    #[test]
    fn connect_bridge_count_is_bounded() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 10,
            lookback: 3,
            noise: 0.0,
        };
        let seeds = tracks(&["k1", "k3"]);
        let playlist = gen.generate_with(Method::Connect, &seeds, &config, &mut seeded());
        assert!(playlist.len() <= seeds.len() + (seeds.len() - 1) * config.nsongs);
    }

    #[test]
    fn unknown_seeds_are_filtered_with_survivors_kept() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 1,
            lookback: 3,
            noise: 0.0,
        };
        let playlist = gen.generate_with(
            Method::Append,
            &tracks(&["missing", "k2"]),
            &config,
            &mut seeded(),
        );
        assert_eq!(playlist, tracks(&["k2"]));
    }

    #[test]
    fn all_unknown_seeds_produce_an_empty_playlist() {
        let gen = generator();
        let playlist = gen.generate_with(
            Method::Cluster,
            &tracks(&["nope", "nada"]),
            &GenerateConfig::default(),
            &mut seeded(),
        );
        assert!(playlist.is_empty());
    }

    #[test]
    fn noise_perturbs_but_zero_noise_is_deterministic() {
        let gen = generator();
        let config = GenerateConfig {
            nsongs: 3,
            lookback: 3,
            noise: 0.0,
        };
        let a = gen.generate_with(Method::Append, &tracks(&["k1"]), &config, &mut seeded());
        let b = gen.generate_with(Method::Append, &tracks(&["k1"]), &config, &mut seeded());
        assert_eq!(a, b);
    }

    #[test]
    fn add_noise_scales_with_vector_norm() {
        let mut rng = seeded();
        let mut quiet = vec![1.0f32, 0.0];
        add_noise(&mut quiet, 0.0, &mut rng);
        assert_eq!(quiet, vec![1.0, 0.0], "zero noise leaves the vector alone");

        let mut loud = vec![1.0f32, 0.0];
        add_noise(&mut loud, 0.5, &mut rng);
        assert_ne!(loud, vec![1.0, 0.0]);
    }

    #[test]
    fn load_fails_on_missing_bundle() {
        let dir = tempfile::tempdir().expect("temp dir");
        match Generator::load(dir.path()) {
            Err(Error::EmptyIndex { .. }) => {}
            other => panic!("expected EmptyIndex, got {other:?}"),
        }
    }

    #[test]
    fn load_fails_fast_on_a_corrupt_bundle() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bundled = dir.path().join(store::BUNDLED_DIRNAME);
        std::fs::create_dir(&bundled).expect("bundled dir");
        std::fs::write(bundled.join(store::BUNDLED_FILENAME), b"junk").expect("corrupt");

        assert!(matches!(
            Generator::load(dir.path()),
            Err(Error::CorruptedIndex { .. })
        ));
    }
}
