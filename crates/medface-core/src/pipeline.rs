//! Resolution pipeline: extractor → single-face gate → matcher / store.

use crate::extractor::{Extractor, ExtractorError};
use crate::matcher::{EuclideanMatcher, Matcher, DEFAULT_DISTANCE_THRESHOLD};
use crate::store::{EnrollmentStore, StoreError};
use crate::types::{
    EnrollmentRecord, ExtractionFailure, FaceDescriptor, IdentityKey, MatchResult,
};
use std::sync::Arc;
use thiserror::Error;

/// Detections below this confidence are rejected (face-api ssdMobilenetv1 default).
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.5;

/// Descriptor length of the face-api recognition net.
pub const DEFAULT_DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("photo rejected: {0}")]
    ExtractionFailed(ExtractionFailure),
    #[error("descriptor has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("could not evaluate photo: {0}")]
    ExtractionUnavailable(#[from] ExtractorError),
    #[error("enrollment store: {0}")]
    Store(StoreError),
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DimensionMismatch { expected, actual } => {
                Self::DimensionMismatch { expected, actual }
            }
            other => Self::Store(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    /// Maximum Euclidean distance for a positive match.
    pub distance_threshold: f32,
    /// Minimum detection confidence for the single face in a photo.
    pub confidence_floor: f32,
    /// Descriptor length fixed by the extraction model.
    pub descriptor_dim: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            distance_threshold: DEFAULT_DISTANCE_THRESHOLD,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            descriptor_dim: DEFAULT_DESCRIPTOR_DIM,
        }
    }
}

/// Stateless orchestration of enrollment and verification.
///
/// Holds explicit handles to the extractor, store and matcher; nothing is
/// process-global. Safe to share across threads.
pub struct ResolutionPipeline {
    extractor: Arc<dyn Extractor>,
    store: Arc<dyn EnrollmentStore>,
    matcher: Arc<dyn Matcher>,
    config: PipelineConfig,
}

impl ResolutionPipeline {
    /// Build a pipeline using the exhaustive [`EuclideanMatcher`] at the
    /// configured threshold.
    pub fn new(
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn EnrollmentStore>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        let matcher = Arc::new(EuclideanMatcher::new(config.distance_threshold));
        Self::with_matcher(extractor, store, matcher, config)
    }

    pub fn with_matcher(
        extractor: Arc<dyn Extractor>,
        store: Arc<dyn EnrollmentStore>,
        matcher: Arc<dyn Matcher>,
        config: PipelineConfig,
    ) -> Result<Self, PipelineError> {
        if extractor.dimension() != config.descriptor_dim {
            return Err(PipelineError::ConfigMismatch(format!(
                "extractor {} produces {}-dim descriptors, configured for {}",
                extractor.model_version(),
                extractor.dimension(),
                config.descriptor_dim
            )));
        }
        if store.dimension() != config.descriptor_dim {
            return Err(PipelineError::ConfigMismatch(format!(
                "enrollment store holds {}-dim descriptors, configured for {}",
                store.dimension(),
                config.descriptor_dim
            )));
        }

        Ok(Self {
            extractor,
            store,
            matcher,
            config,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn model_version(&self) -> &str {
        self.extractor.model_version()
    }

    /// Resolve the single face in `image` to an enrolled identity.
    ///
    /// Photos without exactly one confident face yield
    /// [`MatchResult::ExtractionFailed`]; extractor and store faults are errors.
    pub fn verify(&self, image: &[u8]) -> Result<MatchResult, PipelineError> {
        let descriptor = match self.single_face(image)? {
            Ok(descriptor) => descriptor,
            Err(reason) => {
                tracing::debug!(reason = reason.as_str(), "verify: extraction rejected photo");
                return Ok(MatchResult::ExtractionFailed { reason });
            }
        };

        let snapshot = self.store.snapshot()?;
        let result = self.matcher.resolve(&descriptor, &snapshot);
        tracing::debug!(
            enrolled = snapshot.len(),
            outcome = result.outcome(),
            distance = ?result.distance(),
            "verify: resolved"
        );
        Ok(result)
    }

    /// Extract the single face in `image` and store it as the reference
    /// descriptor for `key`, replacing any previous one.
    pub fn enroll(
        &self,
        key: IdentityKey,
        image: &[u8],
    ) -> Result<EnrollmentRecord, PipelineError> {
        let descriptor = self
            .single_face(image)?
            .map_err(PipelineError::ExtractionFailed)?;

        let record = self.store.put(key, descriptor)?;
        tracing::info!(
            identity = %record.identity_key,
            model = self.extractor.model_version(),
            "enrolled"
        );
        Ok(record)
    }

    pub fn remove(&self, key: &IdentityKey) -> Result<bool, PipelineError> {
        let removed = self.store.remove(key)?;
        tracing::info!(identity = %key, removed, "enrollment removed");
        Ok(removed)
    }

    pub fn lookup(&self, key: &IdentityKey) -> Result<Option<EnrollmentRecord>, PipelineError> {
        Ok(self.store.get(key)?)
    }

    pub fn enrolled(&self) -> Result<Vec<EnrollmentRecord>, PipelineError> {
        Ok(self.store.snapshot()?.to_vec())
    }

    pub fn enrolled_count(&self) -> Result<usize, PipelineError> {
        Ok(self.store.len()?)
    }

    /// Run the extractor and apply the exactly-one-confident-face rule.
    ///
    /// The outer `Result` carries faults; the inner one the rejection reason.
    fn single_face(
        &self,
        image: &[u8],
    ) -> Result<Result<FaceDescriptor, ExtractionFailure>, PipelineError> {
        let mut faces = self.extractor.extract(image)?;

        let face = match faces.len() {
            0 => return Ok(Err(ExtractionFailure::NoFace)),
            1 => faces.remove(0),
            _ => return Ok(Err(ExtractionFailure::MultipleFaces)),
        };

        if face.confidence < self.config.confidence_floor {
            return Ok(Err(ExtractionFailure::LowConfidence));
        }

        if face.descriptor.dimension() != self.config.descriptor_dim {
            return Err(PipelineError::DimensionMismatch {
                expected: self.config.descriptor_dim,
                actual: face.descriptor.dimension(),
            });
        }

        Ok(Ok(face.descriptor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::DetectedFace;

    /// Reports one face whose descriptor is the first byte spread over 4 dims.
    struct ByteExtractor;

    impl Extractor for ByteExtractor {
        fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractorError> {
            Ok(image
                .iter()
                .map(|b| DetectedFace {
                    descriptor: FaceDescriptor::new(vec![*b as f32 / 10.0; 4]),
                    confidence: 0.9,
                })
                .collect())
        }

        fn dimension(&self) -> usize {
            4
        }

        fn model_version(&self) -> &str {
            "bytes-v1"
        }
    }

    fn pipeline() -> ResolutionPipeline {
        let config = PipelineConfig {
            descriptor_dim: 4,
            ..PipelineConfig::default()
        };
        ResolutionPipeline::new(Arc::new(ByteExtractor), Arc::new(MemoryStore::new(4)), config)
            .unwrap()
    }

    #[test]
    fn test_rejects_mismatched_store_dimension() {
        let config = PipelineConfig {
            descriptor_dim: 4,
            ..PipelineConfig::default()
        };
        let result =
            ResolutionPipeline::new(Arc::new(ByteExtractor), Arc::new(MemoryStore::new(8)), config);
        assert!(matches!(result, Err(PipelineError::ConfigMismatch(_))));
    }

    #[test]
    fn test_rejects_mismatched_extractor_dimension() {
        let result = ResolutionPipeline::new(
            Arc::new(ByteExtractor),
            Arc::new(MemoryStore::new(128)),
            PipelineConfig::default(),
        );
        assert!(matches!(result, Err(PipelineError::ConfigMismatch(_))));
    }

    #[test]
    fn test_enroll_then_verify() {
        let p = pipeline();
        p.enroll("alice".into(), &[3]).unwrap();
        let result = p.verify(&[3]).unwrap();
        assert_eq!(
            result,
            MatchResult::Matched {
                identity_key: "alice".into(),
                distance: 0.0
            }
        );
    }

    #[test]
    fn test_enroll_without_face_is_rejected() {
        let p = pipeline();
        let err = p.enroll("alice".into(), &[]).unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ExtractionFailed(ExtractionFailure::NoFace)
        ));
        assert_eq!(p.enrolled_count().unwrap(), 0);
    }

    #[test]
    fn test_remove_and_lookup() {
        let p = pipeline();
        p.enroll("alice".into(), &[3]).unwrap();
        assert!(p.lookup(&"alice".into()).unwrap().is_some());
        assert!(p.remove(&"alice".into()).unwrap());
        assert!(p.lookup(&"alice".into()).unwrap().is_none());
        assert!(p.enrolled().unwrap().is_empty());
    }

    #[test]
    fn test_store_dimension_error_is_lifted() {
        let err: PipelineError = StoreError::DimensionMismatch {
            expected: 128,
            actual: 64,
        }
        .into();
        assert!(matches!(
            err,
            PipelineError::DimensionMismatch {
                expected: 128,
                actual: 64
            }
        ));
    }
}
