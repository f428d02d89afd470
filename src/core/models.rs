use serde::{Deserialize, Serialize};
use std::fmt;

/// Length in hex characters of every fingerprint the pool produces.
pub const FINGERPRINT_LEN: usize = 16;

/// Request body accepted by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageRequest {
    #[serde(default)]
    pub claim_id: String,
    pub images: Vec<String>,
    #[serde(default)]
    pub loss_type: String,
}

/// A URL accepted for triage, with its bytes once fetched.
#[derive(Debug, Clone)]
pub struct ImageTask {
    pub url: String,
    pub bytes: Option<Vec<u8>>,
}

impl ImageTask {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            bytes: None,
        }
    }

    pub fn is_fetched(&self) -> bool {
        self.bytes.is_some()
    }
}

/// A weighted label returned by the label-detection service.
///
/// `confidence` is a percentage in `0.0..=100.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub confidence: f32,
}

impl Label {
    pub fn new(name: impl Into<String>, confidence: f32) -> Self {
        Self {
            name: name.into(),
            confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Area {
    Roof,
    Garage,
    Siding,
    /// Kept on damage evidence alone; no area label survived the floor.
    Unknown,
}

impl fmt::Display for Area {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Area::Roof => "roof",
            Area::Garage => "garage",
            Area::Siding => "siding",
            Area::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub area: Area,
    pub severity: u8,
    pub quality_score: f64,
    pub blurry: bool,
    pub dark: bool,
    pub damage_evidence: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DiscardReason {
    FetchFailed,
    ClassifierUnavailable(String),
    Unidentifiable,
    HashFailed(String),
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::FetchFailed => write!(f, "fetch attempts exhausted"),
            DiscardReason::ClassifierUnavailable(msg) => {
                write!(f, "label detection failed: {}", msg)
            }
            DiscardReason::Unidentifiable => write!(f, "no area and no visible damage"),
            DiscardReason::HashFailed(msg) => write!(f, "fingerprinting failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClassificationOutcome {
    Kept(Classification),
    Discarded(DiscardReason),
}

/// Fixed-length hexadecimal similarity key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when the fingerprint has the pool's fixed length and is all hex.
    pub fn is_well_formed(&self) -> bool {
        self.0.len() == FINGERPRINT_LEN && self.0.chars().all(|c| c.is_ascii_hexdigit())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit passed into clustering.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageRecord {
    pub url: String,
    pub area: Area,
    pub severity: u8,
    pub quality_score: f64,
    pub fingerprint: Fingerprint,
}

#[derive(Debug, Clone)]
pub struct Cluster {
    pub members: Vec<ImageRecord>,
    pub representative: usize,
}

impl Cluster {
    pub fn representative(&self) -> &ImageRecord {
        &self.members[self.representative]
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaAggregate {
    pub area: Area,
    pub damage_confirmed: bool,
    pub avg_severity: f64,
    pub primary_peril: String,
    pub representative_images: Vec<String>,
    pub notes: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceImages {
    pub total: usize,
    pub analyzed: usize,
    pub discarded: usize,
    pub clusters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineReport {
    pub claim_id: String,
    pub source_images: SourceImages,
    pub overall_damage_severity: f64,
    pub areas: Vec<AreaAggregate>,
    pub data_gaps: Vec<String>,
    pub confidence: f64,
    pub generated_at: String,
}
