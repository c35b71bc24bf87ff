use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One detection attached to a quarantined object.
///
/// Serialised into the `threats` custom data as a JSON array of
/// `{"type", "name", "sha256"}` objects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreatRecord {
    #[serde(rename = "type")]
    pub threat_type: String,
    pub name: String,
    #[serde(default)]
    pub sha256: String,
}

impl ThreatRecord {
    pub fn new(
        threat_type: impl Into<String>,
        name: impl Into<String>,
        sha256: impl Into<String>,
    ) -> Self {
        Self {
            threat_type: threat_type.into(),
            name: name.into(),
            sha256: sha256.into(),
        }
    }

    pub fn has_sha256(&self) -> bool {
        !self.sha256.trim().is_empty()
    }
}

/// Encode an ordered threat list for the `threats` custom data.
pub fn threats_to_json(threats: &[ThreatRecord]) -> serde_json::Result<String> {
    serde_json::to_string(threats)
}

/// Decode the `threats` custom data.
pub fn threats_from_json(json: &str) -> serde_json::Result<Vec<ThreatRecord>> {
    serde_json::from_str(json)
}

/// A single finding reported by the content scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Detection {
    pub path: PathBuf,
    #[serde(rename = "type")]
    pub threat_type: String,
    pub name: String,
    pub sha256: String,
}

impl From<&Detection> for ThreatRecord {
    fn from(detection: &Detection) -> Self {
        ThreatRecord::new(
            detection.threat_type.clone(),
            detection.name.clone(),
            detection.sha256.clone(),
        )
    }
}
