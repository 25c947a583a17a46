use crate::core::error::DynoError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of (device type, region content). Artifacts compiled under one
/// fingerprint are never reused under another, so a fingerprint must change
/// whenever the device or the region's graph content changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint {
    pub device: String,
    pub graph: String,
}

impl Fingerprint {
    pub fn new(device: &str, graph: &str) -> Self {
        Self {
            device: device.to_string(),
            graph: graph.to_string(),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short: String = self.graph.chars().take(24).collect();
        write!(f, "{}::{}", self.device, short)
    }
}

/// Cache address for one candidate compile: fingerprint plus the serialized
/// candidate descriptor. Two keys are equal iff the fingerprint and the
/// serialized bytes are both identical; the descriptor itself is opaque here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    fingerprint: Fingerprint,
    candidate_bytes: Vec<u8>,
}

impl ProbeKey {
    pub fn new<C: Serialize>(fingerprint: &Fingerprint, candidate: &C) -> Result<Self, DynoError> {
        let candidate_bytes =
            serde_json::to_vec(candidate).map_err(|e| DynoError::Candidate(e.to_string()))?;
        Ok(Self {
            fingerprint: fingerprint.clone(),
            candidate_bytes,
        })
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    pub fn candidate_bytes(&self) -> &[u8] {
        &self.candidate_bytes
    }
}

impl fmt::Display for ProbeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.candidate_bytes.hash(&mut hasher);
        write!(f, "{}#{:x}", self.fingerprint, hasher.finish())
    }
}
