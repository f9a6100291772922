//! Boundary to the face embedding model.

use crate::types::DetectedFace;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractorError {
    #[error("extractor unavailable: {0}")]
    Unavailable(String),
    #[error("extractor returned malformed output: {0}")]
    Malformed(String),
    #[error("extractor i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Turns image bytes into zero or more detected faces.
///
/// Must be deterministic for identical bytes under a fixed model version.
/// Errors mean the image could not be evaluated at all (corrupt input, model
/// missing); an image without faces is `Ok(vec![])`.
pub trait Extractor: Send + Sync {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractorError>;

    /// Length of every descriptor this extractor produces.
    fn dimension(&self) -> usize;

    fn model_version(&self) -> &str;
}
