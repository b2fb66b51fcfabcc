//! Binary persistence for matrix maps.
//!
//! Two artefact kinds share one format: per-file slice maps (one entry per
//! track, under `<vec_dir>/`) and the bundled vector map
//! (`<vec_dir>/bundled/audio_vecs.bin`, plus transient `batch_<n>.bin`
//! fragments). The layout is little-endian throughout:
//!
//! ```text
//! map    := u32 count, entry{count}
//! entry  := u32 key_len, key_len bytes of UTF-8 key, matrix
//! matrix := i32 rows, i32 cols, f32 data[rows * cols]   // row-major
//! ```
//!
//! Saves go through a temp file and a rename so readers never observe a
//! partial write; a partial file on disk is treated as corruption.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};

pub const BUNDLED_DIRNAME: &str = "bundled";
pub const BUNDLED_FILENAME: &str = "audio_vecs.bin";

/// Filesystem cap for derived artefact names, in bytes.
const MAX_SCANNED_NAME_BYTES: usize = 255;

/// Row-major f32 matrix as stored on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl Matrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    /// A single-row matrix wrapping a track vector.
    pub fn from_vector(data: Vec<f32>) -> Self {
        Self {
            rows: 1,
            cols: data.len(),
            data,
        }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }
}

pub type MatrixMap = HashMap<String, Matrix>;
pub type VectorMap = HashMap<String, Vec<f32>>;

/// Flatten a map of (1, D) matrices into plain vectors.
pub fn into_vectors(map: MatrixMap) -> VectorMap {
    map.into_iter().map(|(k, m)| (k, m.data)).collect()
}

/// Wrap track vectors as single-row matrices for persistence.
pub fn as_matrices(map: &VectorMap) -> MatrixMap {
    map.iter()
        .map(|(k, v)| (k.clone(), Matrix::from_vector(v.clone())))
        .collect()
}

/// Artefact filename for a track key: append `.bin`, substitute the
/// separator-ish characters, and keep the tail if the result exceeds the
/// filesystem cap. The tail is kept because path suffixes discriminate
/// better than prefixes.
pub fn scanned_filename(track: &str) -> String {
    let name: String = format!("{track}.bin")
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '?' => '_',
            other => other,
        })
        .collect();
    truncate_tail(&name, MAX_SCANNED_NAME_BYTES).to_string()
}

/// Last `max_bytes` of `s`, never splitting a codepoint.
fn truncate_tail(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut start = s.len() - max_bytes;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}

pub fn save_map(path: &Path, map: &MatrixMap) -> Result<()> {
    let mut buf = Vec::with_capacity(16 + map.len() * 64);
    buf.extend_from_slice(&(map.len() as u32).to_le_bytes());
    for (key, matrix) in map {
        buf.extend_from_slice(&(key.len() as u32).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&(matrix.rows as i32).to_le_bytes());
        buf.extend_from_slice(&(matrix.cols as i32).to_le_bytes());
        for &value in &matrix.data {
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }

    let tmp = path.with_extension("bin.tmp");
    fs::write(&tmp, &buf)
        .map_err(|e| Error::Io(format!("failed to write {}: {e}", tmp.display())))?;
    fs::rename(&tmp, path)
        .map_err(|e| Error::Io(format!("failed to move {} into place: {e}", tmp.display())))
}

/// Load a matrix map. A missing file is an empty map; anything malformed
/// is `CorruptedIndex`.
pub fn load_map(path: &Path) -> Result<MatrixMap> {
    let buf = match fs::read(path) {
        Ok(buf) => buf,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(MatrixMap::new()),
        Err(e) => return Err(Error::Io(format!("failed to read {}: {e}", path.display()))),
    };

    let mut reader = Reader {
        buf: &buf,
        pos: 0,
        path,
    };
    let count = reader.read_u32()? as usize;
    // Every entry carries at least key_len + rows + cols.
    if count.checked_mul(12).map_or(true, |min| min > reader.remaining()) {
        return Err(reader.corrupted(format!("entry count {count} exceeds file size")));
    }

    let mut map = MatrixMap::with_capacity(count);
    for _ in 0..count {
        let key_len = reader.read_u32()? as usize;
        let key_bytes = reader.take(key_len, "key")?;
        let key = String::from_utf8(key_bytes.to_vec())
            .map_err(|_| reader.corrupted("key is not valid UTF-8".to_string()))?;

        let rows = reader.read_i32()?;
        let cols = reader.read_i32()?;
        if rows < 0 || cols < 0 {
            return Err(reader.corrupted(format!("negative matrix shape ({rows}, {cols})")));
        }
        let (rows, cols) = (rows as usize, cols as usize);
        let len = rows
            .checked_mul(cols)
            .ok_or_else(|| reader.corrupted(format!("matrix shape ({rows}, {cols}) overflows")))?;
        let bytes = reader.take(len * 4, "matrix data")?;
        let data = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        map.insert(key, Matrix { rows, cols, data });
    }
    if reader.remaining() != 0 {
        return Err(reader.corrupted(format!("{} trailing bytes", reader.remaining())));
    }
    Ok(map)
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn corrupted(&self, detail: String) -> Error {
        Error::CorruptedIndex {
            path: self.path.to_path_buf(),
            detail,
        }
    }

    fn take(&mut self, n: usize, what: &str) -> Result<&'a [u8]> {
        if n > self.remaining() {
            return Err(self.corrupted(format!(
                "truncated: {what} needs {n} bytes, {} left",
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4, "u32 field")?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32> {
        let b = self.take(4, "i32 field")?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
}
