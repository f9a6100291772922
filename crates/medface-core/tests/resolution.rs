use std::collections::HashMap;
use std::sync::Arc;

use medface_core::{
    DetectedFace, EnrollmentStore, ExtractionFailure, Extractor, ExtractorError, FaceDescriptor,
    IdentityKey, MatchResult, MemoryStore, PipelineConfig, PipelineError, ResolutionPipeline,
};

const DIM: usize = 128;

/// Extractor that returns canned faces per photo; unknown photos are corrupt.
struct ScriptedExtractor {
    photos: HashMap<Vec<u8>, Vec<DetectedFace>>,
    dimension: usize,
}

impl ScriptedExtractor {
    fn new() -> Self {
        Self {
            photos: HashMap::new(),
            dimension: DIM,
        }
    }

    fn photo(mut self, name: &str, faces: Vec<DetectedFace>) -> Self {
        self.photos.insert(name.as_bytes().to_vec(), faces);
        self
    }
}

impl Extractor for ScriptedExtractor {
    fn extract(&self, image: &[u8]) -> Result<Vec<DetectedFace>, ExtractorError> {
        self.photos
            .get(image)
            .cloned()
            .ok_or_else(|| ExtractorError::Unavailable("cannot decode image".into()))
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_version(&self) -> &str {
        "scripted"
    }
}

fn face_at(axis: usize, offset: f32) -> DetectedFace {
    let mut values = vec![0.0; DIM];
    values[axis] = offset;
    DetectedFace {
        descriptor: FaceDescriptor::new(values),
        confidence: 0.98,
    }
}

fn origin_face() -> DetectedFace {
    face_at(0, 0.0)
}

fn build(extractor: ScriptedExtractor) -> (ResolutionPipeline, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new(DIM));
    let pipeline =
        ResolutionPipeline::new(Arc::new(extractor), store.clone(), PipelineConfig::default())
            .unwrap();
    (pipeline, store)
}

#[test]
fn empty_store_yields_no_match() {
    let (pipeline, _) = build(ScriptedExtractor::new().photo("probe", vec![origin_face()]));
    let result = pipeline.verify(b"probe").unwrap();
    assert_eq!(
        result,
        MatchResult::NoMatch {
            nearest_distance: None
        }
    );
}

#[test]
fn enrolling_then_verifying_same_photo_self_matches() {
    let (pipeline, _) = build(ScriptedExtractor::new().photo("alice.jpg", vec![face_at(3, 0.7)]));
    pipeline.enroll("alice".into(), b"alice.jpg").unwrap();

    let result = pipeline.verify(b"alice.jpg").unwrap();
    assert_eq!(
        result,
        MatchResult::Matched {
            identity_key: "alice".into(),
            distance: 0.0
        }
    );
}

#[test]
fn threshold_is_inclusive_of_close_faces_only() {
    let (pipeline, _) = build(
        ScriptedExtractor::new()
            .photo("enroll", vec![origin_face()])
            .photo("far", vec![face_at(5, 0.61)])
            .photo("near", vec![face_at(5, 0.59)]),
    );
    pipeline.enroll("zero".into(), b"enroll").unwrap();

    assert!(matches!(
        pipeline.verify(b"far").unwrap(),
        MatchResult::NoMatch {
            nearest_distance: Some(_)
        }
    ));
    assert_eq!(
        pipeline.verify(b"near").unwrap().identity_key(),
        Some(&IdentityKey::from("zero"))
    );
}

#[test]
fn two_faces_in_probe_fail_regardless_of_store() {
    let (pipeline, _) = build(
        ScriptedExtractor::new()
            .photo("alice.jpg", vec![origin_face()])
            .photo("group", vec![origin_face(), face_at(1, 0.2)]),
    );
    let before = pipeline.verify(b"group").unwrap();
    pipeline.enroll("alice".into(), b"alice.jpg").unwrap();
    let after = pipeline.verify(b"group").unwrap();

    let expected = MatchResult::ExtractionFailed {
        reason: ExtractionFailure::MultipleFaces,
    };
    assert_eq!(before, expected);
    assert_eq!(after, expected);
}

#[test]
fn no_face_and_low_confidence_are_reported() {
    let mut blurry = origin_face();
    blurry.confidence = 0.2;
    let (pipeline, _) = build(
        ScriptedExtractor::new()
            .photo("wall", vec![])
            .photo("blurry", vec![blurry]),
    );

    assert_eq!(
        pipeline.verify(b"wall").unwrap(),
        MatchResult::ExtractionFailed {
            reason: ExtractionFailure::NoFace
        }
    );
    assert_eq!(
        pipeline.verify(b"blurry").unwrap(),
        MatchResult::ExtractionFailed {
            reason: ExtractionFailure::LowConfidence
        }
    );
    assert!(matches!(
        pipeline.enroll("x".into(), b"blurry"),
        Err(PipelineError::ExtractionFailed(ExtractionFailure::LowConfidence))
    ));
}

#[test]
fn equidistant_identities_are_ambiguous() {
    let (pipeline, _) = build(
        ScriptedExtractor::new()
            .photo("a.jpg", vec![face_at(0, 0.3)])
            .photo("b.jpg", vec![face_at(1, 0.3)])
            .photo("probe", vec![origin_face()]),
    );
    pipeline.enroll("a".into(), b"a.jpg").unwrap();
    pipeline.enroll("b".into(), b"b.jpg").unwrap();

    match pipeline.verify(b"probe").unwrap() {
        MatchResult::Ambiguous {
            candidates,
            distance,
        } => {
            assert_eq!(candidates, vec![IdentityKey::from("a"), "b".into()]);
            assert!((distance - 0.3).abs() < 1e-6);
        }
        other => panic!("expected ambiguous, got {other:?}"),
    }
}

#[test]
fn verify_is_idempotent() {
    let (pipeline, _) = build(
        ScriptedExtractor::new()
            .photo("a.jpg", vec![face_at(0, 0.3)])
            .photo("b.jpg", vec![face_at(1, 0.1)])
            .photo("probe", vec![face_at(1, 0.15)]),
    );
    pipeline.enroll("a".into(), b"a.jpg").unwrap();
    pipeline.enroll("b".into(), b"b.jpg").unwrap();

    let first = pipeline.verify(b"probe").unwrap();
    let second = pipeline.verify(b"probe").unwrap();
    assert_eq!(first, second);
    assert_eq!(first.identity_key(), Some(&IdentityKey::from("b")));
}

#[test]
fn reenrollment_replaces_reference() {
    let (pipeline, store) = build(
        ScriptedExtractor::new()
            .photo("old.jpg", vec![face_at(0, 0.9)])
            .photo("new.jpg", vec![face_at(2, 0.9)]),
    );
    pipeline.enroll("alice".into(), b"old.jpg").unwrap();
    pipeline.enroll("alice".into(), b"new.jpg").unwrap();

    assert_eq!(store.len().unwrap(), 1);
    assert!(pipeline.verify(b"new.jpg").unwrap().is_match());
    assert!(!pipeline.verify(b"old.jpg").unwrap().is_match());
}

#[test]
fn short_descriptor_is_rejected_and_store_unchanged() {
    let short = DetectedFace {
        descriptor: FaceDescriptor::new(vec![0.0; 64]),
        confidence: 0.99,
    };
    let (pipeline, store) = build(ScriptedExtractor::new().photo("short", vec![short]));

    let err = pipeline.enroll("alice".into(), b"short").unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DimensionMismatch {
            expected: 128,
            actual: 64
        }
    ));
    assert!(store.is_empty().unwrap());

    // The store enforces the same rule on its own.
    let err = store
        .put("alice".into(), FaceDescriptor::new(vec![0.0; 64]))
        .unwrap_err();
    assert!(err.to_string().contains("64"));
    assert!(store.is_empty().unwrap());
}

#[test]
fn extractor_fault_is_not_a_no_match() {
    let (pipeline, _) = build(ScriptedExtractor::new());
    let err = pipeline.verify(b"corrupt").unwrap_err();
    assert!(matches!(err, PipelineError::ExtractionUnavailable(_)));
}
