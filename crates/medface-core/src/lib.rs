//! medface-core: biometric identity resolution.
//!
//! Stores one reference face descriptor per enrolled identity and resolves
//! a probe photo to the nearest identity under a Euclidean distance
//! threshold. Descriptor extraction is delegated to an [`Extractor`].

pub mod extractor;
pub mod matcher;
pub mod pipeline;
pub mod store;
pub mod types;

pub use extractor::{Extractor, ExtractorError};
pub use matcher::{EuclideanMatcher, Matcher};
pub use pipeline::{PipelineConfig, PipelineError, ResolutionPipeline};
pub use store::{EnrollmentStore, MemoryStore, Snapshot, StoreError};
pub use types::{
    DetectedFace, EnrollmentRecord, ExtractionFailure, FaceDescriptor, IdentityKey, MatchResult,
};
