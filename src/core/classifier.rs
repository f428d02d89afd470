use crate::core::models::{Area, Classification, ClassificationOutcome, DiscardReason, Label};
use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

const BLUR_HINTS: &[&str] = &["blur"];
const DARK_HINTS: &[&str] = &["dark", "shadow", "night"];

const ROOF_HINTS: &[&str] = &["roof", "shingle"];
const GARAGE_HINTS: &[&str] = &["garage", "door"];
const SIDING_HINTS: &[&str] = &["wall", "siding"];

const DAMAGE_KEYWORDS: &[&str] = &[
    "damage",
    "shingle uplift",
    "material detachment",
    "wind damage",
    "hail damage",
    "roof damage",
];

const DEGRADED_QUALITY: f64 = 0.6;
const FULL_QUALITY: f64 = 1.0;
const MAX_SEVERITY: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectError {
    #[error("Label service transport error: {0}")]
    Transport(String),

    #[error("Label service returned HTTP {0}")]
    Status(u16),

    #[error("Malformed label service response: {0}")]
    Malformed(String),
}

/// External label-detection service, treated as a black box.
pub trait LabelDetector: Send + Sync + 'static {
    fn detect_labels(
        &self,
        bytes: &[u8],
        max_labels: usize,
        min_confidence: f32,
    ) -> impl Future<Output = Result<Vec<Label>, DetectError>> + Send;
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct DetectLabelsRequest {
    image: ImagePayload,
    max_labels: usize,
    min_confidence: f32,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ImagePayload {
    bytes: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DetectLabelsResponse {
    #[serde(default)]
    labels: Vec<WireLabel>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WireLabel {
    name: String,
    confidence: f32,
}

/// JSON client for a DetectLabels-style endpoint.
#[derive(Clone)]
pub struct HttpLabelDetector {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLabelDetector {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, DetectError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

impl LabelDetector for HttpLabelDetector {
    async fn detect_labels(
        &self,
        bytes: &[u8],
        max_labels: usize,
        min_confidence: f32,
    ) -> Result<Vec<Label>, DetectError> {
        let request = DetectLabelsRequest {
            image: ImagePayload {
                bytes: general_purpose::STANDARD.encode(bytes),
            },
            max_labels,
            min_confidence,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| DetectError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DetectError::Status(status.as_u16()));
        }

        let body: DetectLabelsResponse = response
            .json()
            .await
            .map_err(|e| DetectError::Malformed(e.to_string()))?;

        Ok(body
            .labels
            .into_iter()
            .map(|l| Label::new(l.name, l.confidence))
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClassifierSettings {
    /// Labels requested from the service per image.
    pub max_labels: usize,
    /// Confidence floor sent to the service, in percent.
    pub service_min_confidence: f32,
    /// Stricter floor applied locally before any rule runs, in percent.
    pub decision_floor: f32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            max_labels: 15,
            service_min_confidence: 30.0,
            decision_floor: 50.0,
        }
    }
}

/// Rule engine over label-detection output, with its own concurrency ceiling.
pub struct Classifier<D: LabelDetector> {
    detector: Arc<D>,
    permits: Arc<Semaphore>,
    settings: ClassifierSettings,
}

impl<D: LabelDetector> Classifier<D> {
    pub fn new(detector: Arc<D>, concurrency: usize, settings: ClassifierSettings) -> Self {
        Self {
            detector,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            settings,
        }
    }

    /// Classify one image. Service failures discard this image only.
    pub async fn classify(&self, url: &str, bytes: &[u8]) -> ClassificationOutcome {
        let labels = {
            let Ok(_permit) = self.permits.acquire().await else {
                return ClassificationOutcome::Discarded(DiscardReason::ClassifierUnavailable(
                    "classification limiter closed".to_string(),
                ));
            };
            self.detector
                .detect_labels(
                    bytes,
                    self.settings.max_labels,
                    self.settings.service_min_confidence,
                )
                .await
        };

        match labels {
            Ok(labels) => {
                let outcome = classify_labels(&labels, self.settings.decision_floor);
                if let ClassificationOutcome::Kept(c) = &outcome {
                    log::debug!(
                        "{}: area={} severity={} quality={}",
                        url,
                        c.area,
                        c.severity,
                        c.quality_score
                    );
                }
                outcome
            }
            Err(e) => {
                log::warn!("Label detection failed for {}: {}", url, e);
                ClassificationOutcome::Discarded(DiscardReason::ClassifierUnavailable(e.to_string()))
            }
        }
    }
}

fn contains_any(name: &str, hints: &[&str]) -> bool {
    hints.iter().any(|hint| name.contains(hint))
}

/// Derive keep/discard and area, severity, quality from weighted labels.
///
/// Labels under `floor` are ignored. Area goes to whichever surviving label
/// matched last (roof, then garage, then siding are checked per label), not
/// the most confident one.
pub fn classify_labels(labels: &[Label], floor: f32) -> ClassificationOutcome {
    let mut area = None;
    let mut blurry = false;
    let mut dark = false;
    let mut damage_evidence = Vec::new();

    for label in labels.iter().filter(|l| l.confidence >= floor) {
        let name = label.name.to_lowercase();

        if contains_any(&name, BLUR_HINTS) {
            blurry = true;
        }
        if contains_any(&name, DARK_HINTS) {
            dark = true;
        }

        if contains_any(&name, ROOF_HINTS) {
            area = Some(Area::Roof);
        }
        if contains_any(&name, GARAGE_HINTS) {
            area = Some(Area::Garage);
        }
        if contains_any(&name, SIDING_HINTS) {
            area = Some(Area::Siding);
        }

        if contains_any(&name, DAMAGE_KEYWORDS) {
            damage_evidence.push(label.clone());
        }
    }

    if area.is_none() && damage_evidence.is_empty() {
        return ClassificationOutcome::Discarded(DiscardReason::Unidentifiable);
    }

    let quality_score = if blurry || dark {
        DEGRADED_QUALITY
    } else {
        FULL_QUALITY
    };

    ClassificationOutcome::Kept(Classification {
        area: area.unwrap_or(Area::Unknown),
        severity: severity_from_evidence(&damage_evidence),
        quality_score,
        blurry,
        dark,
        damage_evidence,
    })
}

/// Mean evidence confidence on a 0-4 scale (25 points per step).
pub fn severity_from_evidence(evidence: &[Label]) -> u8 {
    if evidence.is_empty() {
        return 0;
    }
    let mean = evidence.iter().map(|l| l.confidence as f64).sum::<f64>() / evidence.len() as f64;
    (mean / 25.0).round().clamp(0.0, MAX_SEVERITY as f64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::future::join_all;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn kept(outcome: ClassificationOutcome) -> Classification {
        match outcome {
            ClassificationOutcome::Kept(c) => c,
            other => panic!("expected kept image, got {:?}", other),
        }
    }

    #[test]
    fn test_last_matching_area_wins() {
        let labels = vec![
            Label::new("Roof", 99.0),
            Label::new("Wall", 60.0),
        ];
        let c = kept(classify_labels(&labels, 50.0));
        assert_eq!(c.area, Area::Siding);

        let labels = vec![
            Label::new("Siding", 95.0),
            Label::new("Garage Door", 70.0),
            Label::new("Roof Damage", 55.0),
        ];
        assert_eq!(kept(classify_labels(&labels, 50.0)).area, Area::Roof);
    }

    #[test]
    fn test_single_label_matching_several_areas() {
        // "Garage Roof" hits roof then garage in the same pass.
        let labels = vec![Label::new("Garage Roof", 80.0)];
        assert_eq!(kept(classify_labels(&labels, 50.0)).area, Area::Garage);
    }

    #[test]
    fn test_labels_under_floor_are_ignored() {
        let labels = vec![
            Label::new("Roof", 90.0),
            Label::new("Wall", 49.9),
            Label::new("Blurry", 40.0),
        ];
        let c = kept(classify_labels(&labels, 50.0));
        assert_eq!(c.area, Area::Roof);
        assert!(!c.blurry);
        assert_eq!(c.quality_score, 1.0);
    }

    #[test]
    fn test_quality_degraders() {
        let blurry = kept(classify_labels(
            &[Label::new("Roof", 90.0), Label::new("Blur", 70.0)],
            50.0,
        ));
        assert!(blurry.blurry);
        assert_eq!(blurry.quality_score, 0.6);

        let dark = kept(classify_labels(
            &[Label::new("Roof", 90.0), Label::new("Shadow", 70.0)],
            50.0,
        ));
        assert!(dark.dark);
        assert_eq!(dark.quality_score, 0.6);

        let both = kept(classify_labels(
            &[Label::new("Night", 90.0), Label::new("Blurry", 70.0), Label::new("Roof", 60.0)],
            50.0,
        ));
        assert_eq!(both.quality_score, 0.6);
    }

    #[test]
    fn test_discard_without_area_or_damage() {
        let labels = vec![Label::new("Tree", 99.0), Label::new("Sky", 95.0)];
        assert_eq!(
            classify_labels(&labels, 50.0),
            ClassificationOutcome::Discarded(DiscardReason::Unidentifiable)
        );
        assert_eq!(
            classify_labels(&[], 50.0),
            ClassificationOutcome::Discarded(DiscardReason::Unidentifiable)
        );
    }

    #[test]
    fn test_damage_without_area_is_kept_as_unknown() {
        let labels = vec![Label::new("Hail Damage", 80.0)];
        let c = kept(classify_labels(&labels, 50.0));
        assert_eq!(c.area, Area::Unknown);
        assert_eq!(c.severity, 3);
        assert_eq!(c.damage_evidence.len(), 1);
    }

    #[test]
    fn test_severity_scale() {
        assert_eq!(severity_from_evidence(&[]), 0);
        assert_eq!(severity_from_evidence(&[Label::new("damage", 50.0)]), 2);
        assert_eq!(severity_from_evidence(&[Label::new("damage", 62.4)]), 2);
        assert_eq!(severity_from_evidence(&[Label::new("damage", 62.5)]), 3);
        assert_eq!(severity_from_evidence(&[Label::new("damage", 100.0)]), 4);
        assert_eq!(
            severity_from_evidence(&[Label::new("wind damage", 90.0), Label::new("damage", 60.0)]),
            3
        );
    }

    #[test]
    fn test_damage_keywords_match_by_substring() {
        let labels = vec![
            Label::new("Roof", 90.0),
            Label::new("Shingle Uplift", 88.0),
            Label::new("Material Detachment", 92.0),
            Label::new("Storm", 95.0),
        ];
        let c = kept(classify_labels(&labels, 50.0));
        assert_eq!(c.damage_evidence.len(), 2);
        assert_eq!(c.severity, 4);
    }

    struct FailingDetector;

    impl LabelDetector for FailingDetector {
        async fn detect_labels(
            &self,
            _bytes: &[u8],
            _max_labels: usize,
            _min_confidence: f32,
        ) -> Result<Vec<Label>, DetectError> {
            Err(DetectError::Status(503))
        }
    }

    struct FixedDetector(Vec<Label>);

    impl LabelDetector for FixedDetector {
        async fn detect_labels(
            &self,
            _bytes: &[u8],
            max_labels: usize,
            min_confidence: f32,
        ) -> Result<Vec<Label>, DetectError> {
            assert_eq!(max_labels, 15);
            assert_eq!(min_confidence, 30.0);
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_service_failure_discards_image() {
        let classifier = Classifier::new(Arc::new(FailingDetector), 5, ClassifierSettings::default());
        let outcome = classifier.classify("https://claims/a.jpg", b"bytes").await;
        assert!(matches!(
            outcome,
            ClassificationOutcome::Discarded(DiscardReason::ClassifierUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_classify_passes_service_settings() {
        let detector = FixedDetector(vec![Label::new("Roof", 90.0), Label::new("Roof Damage", 75.0)]);
        let classifier = Classifier::new(Arc::new(detector), 5, ClassifierSettings::default());
        let c = kept(classifier.classify("https://claims/a.jpg", b"bytes").await);
        assert_eq!(c.area, Area::Roof);
        assert_eq!(c.severity, 3);
    }

    /// Sleeps inside every call and records the highest overlap seen.
    #[derive(Default)]
    struct SlowDetector {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl LabelDetector for SlowDetector {
        async fn detect_labels(
            &self,
            _bytes: &[u8],
            _max_labels: usize,
            _min_confidence: f32,
        ) -> Result<Vec<Label>, DetectError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![Label::new("Garage", 90.0)])
        }
    }

    #[tokio::test]
    async fn test_classification_ceiling_is_respected() {
        let detector = Arc::new(SlowDetector::default());
        let classifier = Classifier::new(detector.clone(), 5, ClassifierSettings::default());

        let outcomes = join_all(
            (0..40).map(|i| {
                let classifier = &classifier;
                async move { classifier.classify(&format!("https://claims/{}.jpg", i), b"px").await }
            }),
        )
        .await;

        assert_eq!(outcomes.len(), 40);
        assert!(outcomes
            .iter()
            .all(|o| matches!(o, ClassificationOutcome::Kept(_))));
        assert_eq!(detector.peak.load(Ordering::SeqCst), 5);
        assert_eq!(detector.in_flight.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_wire_format() {
        let request = DetectLabelsRequest {
            image: ImagePayload {
                bytes: general_purpose::STANDARD.encode(b"abc"),
            },
            max_labels: 15,
            min_confidence: 30.0,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["Image"]["Bytes"], "YWJj");
        assert_eq!(json["MaxLabels"], 15);

        let response: DetectLabelsResponse =
            serde_json::from_str(r#"{"Labels": [{"Name": "Roof", "Confidence": 97.5}]}"#).unwrap();
        assert_eq!(response.labels[0].name, "Roof");
        assert_eq!(response.labels[0].confidence, 97.5);
    }
}
