//! Embedding model driver.
//!
//! Wraps the ONNX Runtime session that maps mel-spectrogram slices to
//! embedding vectors. Input is the 4-D tensor from [`crate::features`];
//! output is one raw embedding row per slice — normalisation happens
//! later, in the aggregator. `Session::run` takes `&mut self`, so the
//! session sits behind a mutex and one `Embedder` is shared across scan
//! workers.

use std::path::Path;
use std::sync::Mutex;

use ndarray::Array4;
use ort::session::Session;
use ort::value::Tensor;

use crate::error::{Error, Result};
use crate::store::Matrix;

/// Mel bands in the model's input contract.
pub const N_MELS: usize = 96;
/// Spectrogram frames per input slice.
pub const SLICE_SIZE: usize = 216;

pub struct Embedder {
    session: Mutex<Session>,
    input_name: String,
}

// Safety: ort::Session is Send+Sync by design
unsafe impl Send for Embedder {}
unsafe impl Sync for Embedder {}

impl Embedder {
    pub fn load(model_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_intra_threads(1))
            .and_then(|b| b.commit_from_file(model_path))
            .map_err(|e| Error::Model(format!("failed to load {}: {e}", model_path.display())))?;

        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| Error::Model("model declares no inputs".to_string()))?;

        Ok(Self {
            session: Mutex::new(session),
            input_name,
        })
    }

    /// Run the model on a batch of slices. Returns the raw `(batch, D)`
    /// output matrix.
    pub fn embed(&self, input: Array4<f32>) -> Result<Matrix> {
        let batch = input.shape()[0];
        let tensor = Tensor::from_array(input)
            .map_err(|e| Error::Embedding(format!("input tensor rejected: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Embedding("model session poisoned".to_string()))?;
        let outputs = session
            .run(ort::inputs![self.input_name.as_str() => tensor])
            .map_err(|e| Error::Embedding(format!("inference failed: {e}")))?;

        let (_, value) = outputs
            .iter()
            .next()
            .ok_or_else(|| Error::Embedding("model produced no output".to_string()))?;
        let (shape, data) = value
            .try_extract_tensor::<f32>()
            .map_err(|e| Error::Embedding(format!("output extraction failed: {e}")))?;

        if shape.len() != 2 {
            return Err(Error::Embedding(format!(
                "expected a 2-D output, got {} dimensions",
                shape.len()
            )));
        }
        let rows = shape[0] as usize;
        let cols = shape[1] as usize;
        if rows != batch {
            return Err(Error::Embedding(format!(
                "output rows {rows} do not match input batch {batch}"
            )));
        }
        Ok(Matrix::new(rows, cols, data.to_vec()))
    }
}
