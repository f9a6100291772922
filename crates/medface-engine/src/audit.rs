//! Audit trail for biometric decisions.
//!
//! Every enroll and verify emits one event on the `medface::audit` target.
//! Probe photos are identified by their SHA-256 digest only.

use medface_core::{IdentityKey, MatchResult};
use sha2::{Digest, Sha256};
use std::fmt::Write;
use std::time::Duration;

/// Lowercase hex SHA-256 of the image bytes.
pub fn probe_digest(image: &[u8]) -> String {
    let digest = Sha256::digest(image);
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest.iter() {
        let _ = write!(hex, "{byte:02x}");
    }
    hex
}

pub fn record_verify(digest: &str, result: &MatchResult, elapsed: Duration) {
    let candidates = match result {
        MatchResult::Ambiguous { candidates, .. } => candidates.len(),
        _ => 0,
    };
    let reason = match result {
        MatchResult::ExtractionFailed { reason } => reason.as_str(),
        _ => "-",
    };
    tracing::info!(
        target: "medface::audit",
        action = "verify",
        probe = digest,
        outcome = result.outcome(),
        identity = result.identity_key().map(IdentityKey::as_str).unwrap_or("-"),
        distance = ?result.distance(),
        candidates,
        reason,
        elapsed_ms = elapsed.as_millis() as u64,
        "verification decided"
    );
}

pub fn record_enroll(digest: &str, identity: &IdentityKey, outcome: Result<(), &str>) {
    match outcome {
        Ok(()) => tracing::info!(
            target: "medface::audit",
            action = "enroll",
            probe = digest,
            identity = identity.as_str(),
            outcome = "enrolled",
            "enrollment committed"
        ),
        Err(error) => tracing::warn!(
            target: "medface::audit",
            action = "enroll",
            probe = digest,
            identity = identity.as_str(),
            outcome = "rejected",
            error,
            "enrollment rejected"
        ),
    }
}

pub fn record_error(action: &str, digest: &str, error: &dyn std::error::Error) {
    tracing::error!(
        target: "medface::audit",
        action,
        probe = digest,
        outcome = "error",
        error = %error,
        "request could not be evaluated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_digest_known_vector() {
        assert_eq!(
            probe_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_probe_digest_distinguishes_inputs() {
        assert_ne!(probe_digest(b"photo-a"), probe_digest(b"photo-b"));
        assert_eq!(probe_digest(b"photo-a").len(), 64);
    }
}
