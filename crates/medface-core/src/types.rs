use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Face descriptor produced by the extractor (128-dimensional for the
/// face-api recognition net).
///
/// Values are shared behind an `Arc`, so clones are cheap and a descriptor
/// can never be mutated after it has been produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor {
    values: Arc<[f32]>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values: values.into(),
        }
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn dimension(&self) -> usize {
        self.values.len()
    }

    /// Euclidean distance to `other`.
    ///
    /// Returns `None` when the two descriptors have different dimensionality;
    /// such descriptors are never compared.
    pub fn distance(&self, other: &FaceDescriptor) -> Option<f32> {
        if self.dimension() != other.dimension() {
            return None;
        }
        let sum = self
            .values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>();
        Some(sum.sqrt())
    }
}

impl From<Vec<f32>> for FaceDescriptor {
    fn from(values: Vec<f32>) -> Self {
        Self::new(values)
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.values.to_vec()
    }
}

/// Opaque identity key of an enrolled individual.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityKey(String);

impl IdentityKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh random (UUIDv4) key.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for IdentityKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

impl From<String> for IdentityKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

/// One face reported by the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub descriptor: FaceDescriptor,
    /// Detection confidence in [0, 1].
    pub confidence: f32,
}

/// The single active reference descriptor of an enrolled identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrollmentRecord {
    pub identity_key: IdentityKey,
    pub descriptor: FaceDescriptor,
    pub enrolled_at: DateTime<Utc>,
}

/// Why a photo could not be reduced to exactly one usable face.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExtractionFailure {
    #[error("no face detected")]
    NoFace,
    #[error("more than one face detected")]
    MultipleFaces,
    #[error("face detection confidence below floor")]
    LowConfidence,
}

impl ExtractionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoFace => "no-face",
            Self::MultipleFaces => "multiple-faces",
            Self::LowConfidence => "low-confidence",
        }
    }
}

/// Outcome of resolving a probe photo against the enrolled identities.
///
/// `NoMatch` and `Ambiguous` are successful evaluations, not errors. Every
/// variant that involved a comparison carries its distance for auditing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum MatchResult {
    Matched {
        identity_key: IdentityKey,
        distance: f32,
    },
    NoMatch {
        /// Smallest distance seen, if any record was comparable.
        nearest_distance: Option<f32>,
    },
    /// Two or more identities tie at the minimum distance, which is within
    /// the threshold. Candidates are sorted by key.
    Ambiguous {
        candidates: Vec<IdentityKey>,
        distance: f32,
    },
    ExtractionFailed {
        reason: ExtractionFailure,
    },
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    pub fn identity_key(&self) -> Option<&IdentityKey> {
        match self {
            Self::Matched { identity_key, .. } => Some(identity_key),
            _ => None,
        }
    }

    pub fn distance(&self) -> Option<f32> {
        match self {
            Self::Matched { distance, .. } | Self::Ambiguous { distance, .. } => Some(*distance),
            Self::NoMatch { nearest_distance } => *nearest_distance,
            Self::ExtractionFailed { .. } => None,
        }
    }

    /// Short outcome label used in logs.
    pub fn outcome(&self) -> &'static str {
        match self {
            Self::Matched { .. } => "matched",
            Self::NoMatch { .. } => "no_match",
            Self::Ambiguous { .. } => "ambiguous",
            Self::ExtractionFailed { .. } => "extraction_failed",
        }
    }
}
