//! Scan coordinator.
//!
//! Drives the extract/embed pipeline over a music library and keeps the
//! on-disk index in step with it: discovers audio files, embeds the ones
//! without a per-file artefact on up to J worker threads, reconciles the
//! bundled vector map against the filesystem (pruning deleted tracks),
//! aggregates whatever is new in fixed-size batches, and consolidates the
//! batches into `bundled/audio_vecs.bin`. Batch files left behind by an
//! interrupted run are picked up and resumed on the next scan.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use walkdir::WalkDir;

use crate::aggregate;
use crate::audio;
use crate::embed::{Embedder, N_MELS, SLICE_SIZE};
use crate::error::{Error, Result};
use crate::features;
use crate::store::{self, MatrixMap, VectorMap};

#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Tracks aggregated per TF-IDF batch.
    pub batch_size: usize,
    /// Cosine-distance neighborhood radius for the TF-IDF weights.
    pub epsilon: f32,
    /// Worker thread cap; -1 means hardware concurrency.
    pub jobs: i32,
    /// Fixed shuffle seed, used by tests for deterministic ordering.
    pub shuffle_seed: Option<u64>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            epsilon: 0.001,
            jobs: -1,
            shuffle_seed: None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ScanStats {
    pub discovered: usize,
    pub embedded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub pruned: usize,
    pub aggregated: usize,
}

pub struct Scanner {
    embedder: Arc<Embedder>,
    save_dir: PathBuf,
    config: ScanConfig,
    ffmpeg: Option<String>,
    cancelled: Arc<AtomicBool>,
}

impl Scanner {
    pub fn new(
        embedder: Arc<Embedder>,
        save_dir: PathBuf,
        config: ScanConfig,
        ffmpeg: Option<String>,
    ) -> Self {
        Self {
            embedder,
            save_dir,
            config,
            ffmpeg,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Cooperative cancellation handle: once set, no new files are
    /// dispatched; workers already in flight run to completion.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn scan(&self, roots: &[PathBuf]) -> Result<ScanStats> {
        let bundled_dir = self.save_dir.join(store::BUNDLED_DIRNAME);
        std::fs::create_dir_all(&bundled_dir).map_err(|e| {
            Error::Io(format!(
                "failed to create index directory {}: {e}",
                bundled_dir.display()
            ))
        })?;

        let mut rng = match self.config.shuffle_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        // Shuffled so a partial scan still covers diverse directories.
        let mut files = find_audio_files(roots);
        files.shuffle(&mut rng);

        let mut stats = ScanStats {
            discovered: files.len(),
            ..ScanStats::default()
        };
        self.embed_files(&files, &mut stats);

        // Reconcile the index with what is actually on disk.
        let mut slices = load_slice_artifacts(&self.save_dir)?;
        let (mut bundle, next_batch) = load_bundle(&bundled_dir)?;
        stats.pruned = prune_deleted(&mut bundle, &mut slices, &self.save_dir);

        let mut pending = pending_keys(&slices, &bundle);
        pending.shuffle(&mut rng);

        let mut batch_no = next_batch;
        for group in pending.chunks(self.config.batch_size.max(1)) {
            let vectors = aggregate::aggregate(&slices, group, self.config.epsilon);
            if vectors.is_empty() {
                continue;
            }
            let batch_path = bundled_dir.join(format!("batch_{batch_no}.bin"));
            store::save_map(&batch_path, &store::as_matrices(&vectors)).map_err(|e| {
                Error::ScanFailed(format!("failed to persist {}: {e}", batch_path.display()))
            })?;
            stats.aggregated += vectors.len();
            bundle.extend(vectors);
            batch_no += 1;
        }

        let bundle_path = bundled_dir.join(store::BUNDLED_FILENAME);
        store::save_map(&bundle_path, &store::as_matrices(&bundle)).map_err(|e| {
            Error::ScanFailed(format!("failed to persist {}: {e}", bundle_path.display()))
        })?;
        remove_batch_files(&bundled_dir);

        Ok(stats)
    }

    /// Dispatch per-file embed work across up to J workers, retiring the
    /// oldest in-flight handle whenever the queue is full.
    fn embed_files(&self, files: &[String], stats: &mut ScanStats) {
        let total = files.len();
        let jobs = worker_count(self.config.jobs);
        let completed = AtomicUsize::new(0);
        let embedded = AtomicUsize::new(0);
        let skipped = AtomicUsize::new(0);
        let failed = AtomicUsize::new(0);
        let progress = Mutex::new(());

        std::thread::scope(|scope| {
            let mut in_flight: VecDeque<std::thread::ScopedJoinHandle<'_, ()>> = VecDeque::new();
            for file in files {
                if self.cancelled.load(Ordering::Relaxed) {
                    eprintln!("scan cancelled, letting in-flight work finish");
                    break;
                }
                while in_flight.len() >= jobs {
                    if let Some(handle) = in_flight.pop_front() {
                        let _ = handle.join();
                    }
                }

                let completed = &completed;
                let embedded = &embedded;
                let skipped = &skipped;
                let failed = &failed;
                let progress = &progress;
                in_flight.push_back(scope.spawn(move || {
                    let artefact = self.save_dir.join(store::scanned_filename(file));
                    if artefact.is_file() {
                        skipped.fetch_add(1, Ordering::Relaxed);
                    } else {
                        match self.embed_file(file) {
                            Ok(()) => {
                                embedded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(err) => {
                                failed.fetch_add(1, Ordering::Relaxed);
                                if let Ok(_guard) = progress.lock() {
                                    eprintln!("skipping {file}: {err}");
                                }
                            }
                        }
                    }
                    let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                    if done % 10 == 0 {
                        if let Ok(_guard) = progress.lock() {
                            eprintln!("scan progress: {done} / {total}");
                        }
                    }
                }));
            }
            while let Some(handle) = in_flight.pop_front() {
                let _ = handle.join();
            }
        });

        stats.embedded = embedded.into_inner();
        stats.skipped = skipped.into_inner();
        stats.failed = failed.into_inner();
    }

    /// Decode, slice, embed and persist one track as a single-entry map.
    fn embed_file(&self, track: &str) -> Result<()> {
        let path = Path::new(track);
        let samples = audio::load_mono(path, audio::SAMPLE_RATE, self.ffmpeg.as_deref())?;
        let tensor = features::slice_tensor(&samples, audio::SAMPLE_RATE, N_MELS, SLICE_SIZE)
            .ok_or_else(|| Error::TooShort {
                path: path.to_path_buf(),
            })?;
        let matrix = self.embedder.embed(tensor)?;

        let mut map = MatrixMap::new();
        map.insert(track.to_string(), matrix);
        store::save_map(&self.save_dir.join(store::scanned_filename(track)), &map)
    }
}

/// J = min(hardware concurrency, configured jobs), at least 1; a
/// non-positive setting means "use the hardware".
fn worker_count(jobs: i32) -> usize {
    let hardware = std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(1);
    match jobs {
        jobs if jobs > 0 => hardware.min(jobs as usize),
        _ => hardware,
    }
}

/// Walk the roots for audio files, returning absolute paths. A root that
/// is itself an eligible file is accepted directly; unreadable entries
/// are skipped.
pub(crate) fn find_audio_files(roots: &[PathBuf]) -> Vec<String> {
    let mut files = Vec::new();
    for root in roots {
        if root.is_file() {
            if let Some(path) = eligible(root) {
                files.push(path);
            }
            continue;
        }
        for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Some(path) = eligible(entry.path()) {
                    files.push(path);
                }
            }
        }
    }
    files
}

fn eligible(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?.to_lowercase();
    if !(name.ends_with(".mp3") || name.ends_with(".flac") || name.ends_with(".m4a")) {
        return None;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    Some(absolute.to_string_lossy().into_owned())
}

/// Read every per-file artefact in `save_dir` into one transient slice
/// map. A corrupt artefact is logged and treated as absent.
fn load_slice_artifacts(save_dir: &Path) -> Result<MatrixMap> {
    let entries = std::fs::read_dir(save_dir)
        .map_err(|e| Error::Io(format!("failed to read {}: {e}", save_dir.display())))?;

    let mut map = MatrixMap::new();
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some("bin") {
            continue;
        }
        match store::load_map(&path) {
            Ok(loaded) => map.extend(loaded),
            Err(err) => log::warn!("ignoring unreadable artefact: {err}"),
        }
    }
    Ok(map)
}

/// Load the bundled map and merge every batch fragment on top of it, in
/// index order (batch entries shadow bundle entries). Returns the merged
/// map and the next free batch index.
fn load_bundle(bundled_dir: &Path) -> Result<(VectorMap, u64)> {
    let bundle_path = bundled_dir.join(store::BUNDLED_FILENAME);
    let mut bundle = match store::load_map(&bundle_path) {
        Ok(map) => store::into_vectors(map),
        Err(err @ Error::CorruptedIndex { .. }) => {
            log::warn!("starting from an empty bundle: {err}");
            VectorMap::new()
        }
        Err(err) => return Err(err),
    };

    let entries = std::fs::read_dir(bundled_dir)
        .map_err(|e| Error::Io(format!("failed to read {}: {e}", bundled_dir.display())))?;
    let mut batches: Vec<(u64, PathBuf)> = entries
        .filter_map(|e| e.ok())
        .filter_map(|entry| {
            let path = entry.path();
            let index = path.file_name().and_then(|n| n.to_str()).and_then(batch_index)?;
            path.is_file().then_some((index, path))
        })
        .collect();
    batches.sort_unstable_by_key(|(index, _)| *index);

    let next = batches.last().map_or(1, |(index, _)| index + 1);
    for (_, path) in batches {
        match store::load_map(&path) {
            Ok(map) => bundle.extend(store::into_vectors(map)),
            Err(err) => log::warn!("ignoring unreadable batch: {err}"),
        }
    }
    Ok((bundle, next))
}

/// Parse `batch_<n>.bin` into `n`.
fn batch_index(name: &str) -> Option<u64> {
    name.strip_prefix("batch_")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Drop every key whose file no longer exists from both maps, removing
/// the per-file artefact on disk as well. Returns the number of bundled
/// entries pruned.
fn prune_deleted(bundle: &mut VectorMap, slices: &mut MatrixMap, save_dir: &Path) -> usize {
    let mut pruned = 0;
    bundle.retain(|key, _| {
        if Path::new(key).is_file() {
            return true;
        }
        remove_artifact(save_dir, key);
        pruned += 1;
        false
    });
    slices.retain(|key, _| {
        if Path::new(key).is_file() {
            return true;
        }
        remove_artifact(save_dir, key);
        false
    });
    pruned
}

fn remove_artifact(save_dir: &Path, key: &str) {
    let path = save_dir.join(store::scanned_filename(key));
    if path.exists() {
        if let Err(err) = std::fs::remove_file(&path) {
            log::warn!("failed to remove stale artefact {}: {err}", path.display());
        }
    }
}

/// Keys that have a slice matrix but no bundled vector yet.
fn pending_keys(slices: &MatrixMap, bundle: &VectorMap) -> Vec<String> {
    slices
        .keys()
        .filter(|key| !bundle.contains_key(*key))
        .cloned()
        .collect()
}

fn remove_batch_files(bundled_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(bundled_dir) else {
        return;
    };
    for entry in entries.filter_map(|e| e.ok()) {
        let path = entry.path();
        let is_batch = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(batch_index)
            .is_some();
        if is_batch && path.is_file() {
            if let Err(err) = std::fs::remove_file(&path) {
                log::warn!("failed to remove {}: {err}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Matrix;
    use std::collections::HashMap;
    use std::fs;

    fn touch(path: &Path) {
        fs::write(path, b"x").expect("write fixture");
    }

    fn vector_map(entries: &[(&str, &[f32])]) -> VectorMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_vec()))
            .collect()
    }

    #[test]
    fn batch_index_parses_only_well_formed_names() {
        assert_eq!(batch_index("batch_7.bin"), Some(7));
        assert_eq!(batch_index("batch_123.bin"), Some(123));
        assert_eq!(batch_index("batch_.bin"), None);
        assert_eq!(batch_index("batch_x.bin"), None);
        assert_eq!(batch_index("audio_vecs.bin"), None);
        assert_eq!(batch_index("batch_3.tmp"), None);
    }

    #[test]
    fn find_audio_files_filters_on_extension_case_insensitively() {
        let dir = tempfile::tempdir().expect("temp dir");
        touch(&dir.path().join("a.mp3"));
        touch(&dir.path().join("b.FLAC"));
        touch(&dir.path().join("c.M4A"));
        touch(&dir.path().join("d.wav"));
        touch(&dir.path().join("e.txt"));
        fs::create_dir(dir.path().join("sub")).expect("subdir");
        touch(&dir.path().join("sub/f.mp3"));

        let mut files = find_audio_files(&[dir.path().to_path_buf()]);
        files.sort();
        assert_eq!(files.len(), 4);
        assert!(files.iter().all(|f| Path::new(f).is_absolute()));
        assert!(files.iter().any(|f| f.ends_with("sub/f.mp3")));
    }

    #[test]
    fn find_audio_files_accepts_a_file_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        let file = dir.path().join("solo.flac");
        touch(&file);

        let files = find_audio_files(&[file]);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn pending_keys_are_slices_missing_from_the_bundle() {
        let mut slices = MatrixMap::new();
        slices.insert("a".into(), Matrix::from_vector(vec![1.0]));
        slices.insert("b".into(), Matrix::from_vector(vec![2.0]));
        let bundle = vector_map(&[("a", &[1.0])]);

        let pending = pending_keys(&slices, &bundle);
        assert_eq!(pending, vec!["b".to_string()]);
    }

    #[test]
    fn prune_removes_deleted_keys_and_artifacts_from_both_maps() {
        let dir = tempfile::tempdir().expect("temp dir");
        let alive = dir.path().join("alive.mp3");
        touch(&alive);
        let alive_key = alive.to_string_lossy().into_owned();
        let dead_key = dir.path().join("dead.mp3").to_string_lossy().into_owned();

        let dead_artifact = dir.path().join(store::scanned_filename(&dead_key));
        touch(&dead_artifact);

        let mut bundle = vector_map(&[(alive_key.as_str(), &[1.0]), (dead_key.as_str(), &[2.0])]);
        let mut slices = MatrixMap::new();
        slices.insert(alive_key.clone(), Matrix::from_vector(vec![1.0]));
        slices.insert(dead_key.clone(), Matrix::from_vector(vec![2.0]));

        let pruned = prune_deleted(&mut bundle, &mut slices, dir.path());

        assert_eq!(pruned, 1);
        assert!(bundle.contains_key(&alive_key));
        assert!(!bundle.contains_key(&dead_key));
        assert!(!slices.contains_key(&dead_key), "slice map must be pruned too");
        assert!(!dead_artifact.exists(), "stale artefact must be deleted");
    }

    #[test]
    fn load_bundle_applies_batches_over_the_bundle() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bundled = dir.path().join(store::BUNDLED_DIRNAME);
        fs::create_dir(&bundled).expect("bundled dir");

        let base = vector_map(&[("a", &[1.0]), ("b", &[2.0])]);
        store::save_map(
            &bundled.join(store::BUNDLED_FILENAME),
            &store::as_matrices(&base),
        )
        .expect("save bundle");

        // batch_2 rewrites b; batch_5 adds c.
        store::save_map(
            &bundled.join("batch_2.bin"),
            &store::as_matrices(&vector_map(&[("b", &[9.0])])),
        )
        .expect("save batch 2");
        store::save_map(
            &bundled.join("batch_5.bin"),
            &store::as_matrices(&vector_map(&[("c", &[3.0])])),
        )
        .expect("save batch 5");

        let (bundle, next) = load_bundle(&bundled).expect("load");
        assert_eq!(next, 6, "next index continues after the highest batch");
        assert_eq!(bundle["a"], vec![1.0]);
        assert_eq!(bundle["b"], vec![9.0], "batch entries shadow the bundle");
        assert_eq!(bundle["c"], vec![3.0]);
    }

    #[test]
    fn load_bundle_survives_a_corrupt_bundle_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bundled = dir.path().join(store::BUNDLED_DIRNAME);
        fs::create_dir(&bundled).expect("bundled dir");
        fs::write(bundled.join(store::BUNDLED_FILENAME), b"garbage").expect("corrupt file");

        let (bundle, next) = load_bundle(&bundled).expect("load");
        assert!(bundle.is_empty());
        assert_eq!(next, 1);
    }

    #[test]
    fn load_slice_artifacts_merges_per_file_maps_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("temp dir");
        let mut one = MatrixMap::new();
        one.insert("/m/a.mp3".into(), Matrix::from_vector(vec![1.0, 2.0]));
        store::save_map(&dir.path().join(store::scanned_filename("/m/a.mp3")), &one)
            .expect("save artefact");
        fs::write(dir.path().join("broken.bin"), b"nope").expect("garbage artefact");
        fs::create_dir(dir.path().join(store::BUNDLED_DIRNAME)).expect("bundled dir");

        let slices = load_slice_artifacts(dir.path()).expect("load");
        assert_eq!(slices.len(), 1);
        assert!(slices.contains_key("/m/a.mp3"));
    }

    #[test]
    fn remove_batch_files_leaves_the_bundle_alone() {
        let dir = tempfile::tempdir().expect("temp dir");
        let bundled = dir.path();
        store::save_map(
            &bundled.join(store::BUNDLED_FILENAME),
            &store::as_matrices(&vector_map(&[("a", &[1.0])])),
        )
        .expect("save bundle");
        store::save_map(
            &bundled.join("batch_1.bin"),
            &store::as_matrices(&vector_map(&[("a", &[1.0])])),
        )
        .expect("save batch");

        remove_batch_files(bundled);
        assert!(bundled.join(store::BUNDLED_FILENAME).exists());
        assert!(!bundled.join("batch_1.bin").exists());
    }

    #[test]
    fn worker_count_respects_the_jobs_cap() {
        let hardware = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        assert_eq!(worker_count(-1), hardware);
        assert_eq!(worker_count(0), hardware);
        assert_eq!(worker_count(1), 1);
        assert_eq!(worker_count(i32::MAX), hardware);
    }
}
