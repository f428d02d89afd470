use crate::config::{ConfigError, PipelineConfig};
use crate::core::aggregate::{self, AggregateSettings, ReportInput};
use crate::core::classifier::{Classifier, DetectError, HttpLabelDetector, LabelDetector};
use crate::core::duplicate::{ClusterError, DuplicateDetector};
use crate::core::fetcher::{FetchError, Fetcher, HttpTransport, ImageTransport};
use crate::core::models::{
    ClassificationOutcome, DiscardReason, ImageRecord, ImageTask, PipelineReport, TriageRequest,
};
use crate::core::worker_pool::{WorkerError, WorkerPool};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum TriageError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Worker pool error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Fetcher setup error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Label detector setup error: {0}")]
    Detector(#[from] DetectError),

    #[error("Clustering error: {0}")]
    Clustering(#[from] ClusterError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriageProgress {
    pub images_processed: usize,
    pub total_images: usize,
    pub current_url: String,
    pub phase: TriagePhase,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum TriagePhase {
    Processing,
    Clustering,
    Aggregating,
    Complete,
}

/// Terminal state of one image after fetch, classify and hash.
#[derive(Debug, Clone)]
enum ImageOutcome {
    Analyzed(ImageRecord),
    Discarded { url: String, reason: DiscardReason },
}

/// Fetch → classify → fingerprint → cluster → aggregate.
///
/// Every image runs its fetch, classification and hashing as one future; all
/// of them resolve (kept or discarded) before clustering starts. Counts are
/// tallied once, after that barrier.
pub struct TriagePipeline<T: ImageTransport, D: LabelDetector> {
    fetcher: Fetcher<T>,
    classifier: Classifier<D>,
    pool: WorkerPool,
    duplicates: DuplicateDetector,
    aggregate: AggregateSettings,
    progress_sender: Option<mpsc::UnboundedSender<TriageProgress>>,
}

impl TriagePipeline<HttpTransport, HttpLabelDetector> {
    /// Pipeline backed by reqwest for both image fetches and label detection.
    pub fn http(config: &PipelineConfig) -> Result<Self, TriageError> {
        let endpoint = config
            .labels_endpoint
            .clone()
            .ok_or(ConfigError::Invalid {
                field: "labels_endpoint",
                message: "a label detection endpoint is required".to_string(),
            })?;
        let transport = Arc::new(HttpTransport::new(config.request_timeout())?);
        let detector = Arc::new(HttpLabelDetector::new(endpoint, config.request_timeout())?);
        Self::new(config, transport, detector)
    }
}

impl<T: ImageTransport, D: LabelDetector> TriagePipeline<T, D> {
    pub fn new(
        config: &PipelineConfig,
        transport: Arc<T>,
        detector: Arc<D>,
    ) -> Result<Self, TriageError> {
        config.validate()?;
        Ok(Self {
            fetcher: Fetcher::new(transport, config.fetch_concurrency, config.retry_policy()),
            classifier: Classifier::new(
                detector,
                config.classify_concurrency,
                config.classifier_settings(),
            ),
            pool: WorkerPool::new(config.hash_workers, config.fingerprint_mode)?,
            duplicates: DuplicateDetector::new(config.cluster_threshold),
            aggregate: config.aggregate_settings(),
            progress_sender: None,
        })
    }

    pub fn with_progress_sender(mut self, sender: mpsc::UnboundedSender<TriageProgress>) -> Self {
        self.progress_sender = Some(sender);
        self
    }

    /// Parse a raw request body and run it. A body without an `images` array
    /// is the only request-level failure.
    pub async fn run_json(&self, body: &str) -> Result<PipelineReport, TriageError> {
        let request: TriageRequest = serde_json::from_str(body)
            .map_err(|e| TriageError::InvalidRequest(e.to_string()))?;
        self.run(&request).await
    }

    pub async fn run(&self, request: &TriageRequest) -> Result<PipelineReport, TriageError> {
        let start_time = Instant::now();
        let total = request.images.len();
        log::info!(
            "Triaging {} image(s) for claim {} ({})",
            total,
            request.claim_id,
            request.loss_type
        );

        let processed = Arc::new(AtomicUsize::new(0));
        let outcomes = join_all(
            request
                .images
                .iter()
                .map(|url| self.process_image(url, total, processed.clone())),
        )
        .await;

        let mut records = Vec::with_capacity(total);
        let mut discarded = 0;
        for outcome in outcomes {
            match outcome {
                ImageOutcome::Analyzed(record) => records.push(record),
                ImageOutcome::Discarded { url, reason } => {
                    discarded += 1;
                    log::warn!("Discarded {}: {}", url, reason);
                }
            }
        }
        let analyzed = records.len();
        debug_assert_eq!(analyzed + discarded, total);
        log::info!("{} analyzed, {} discarded", analyzed, discarded);

        self.send_progress(TriageProgress {
            images_processed: total,
            total_images: total,
            current_url: String::new(),
            phase: TriagePhase::Clustering,
        });
        let clusters = self.duplicates.cluster(records)?;
        log::info!("Formed {} cluster(s)", clusters.len());

        self.send_progress(TriageProgress {
            images_processed: total,
            total_images: total,
            current_url: String::new(),
            phase: TriagePhase::Aggregating,
        });
        let confidence = aggregate::placeholder_confidence(&mut rand::rng());
        let report = aggregate::build_report(
            ReportInput {
                claim_id: &request.claim_id,
                loss_type: &request.loss_type,
                total,
                analyzed,
                discarded,
                clusters: &clusters,
                confidence,
            },
            &self.aggregate,
        );

        self.send_progress(TriageProgress {
            images_processed: total,
            total_images: total,
            current_url: String::new(),
            phase: TriagePhase::Complete,
        });
        log::info!(
            "Claim {} triaged in {:.2?}: overall severity {}",
            report.claim_id,
            start_time.elapsed(),
            report.overall_damage_severity
        );

        Ok(report)
    }

    /// Stop the worker threads.
    pub fn shutdown(self) {
        self.pool.shutdown();
    }

    async fn process_image(
        &self,
        url: &str,
        total: usize,
        processed: Arc<AtomicUsize>,
    ) -> ImageOutcome {
        let outcome = self.triage_one(url).await;

        let done = processed.fetch_add(1, Ordering::Relaxed) + 1;
        self.send_progress(TriageProgress {
            images_processed: done,
            total_images: total,
            current_url: url.to_string(),
            phase: TriagePhase::Processing,
        });

        outcome
    }

    async fn triage_one(&self, url: &str) -> ImageOutcome {
        let discard = |reason| ImageOutcome::Discarded {
            url: url.to_string(),
            reason,
        };

        let ImageTask { url: _, bytes } = self.fetcher.fetch(url).await;
        let Some(bytes) = bytes else {
            return discard(DiscardReason::FetchFailed);
        };

        let classification = match self.classifier.classify(url, &bytes).await {
            ClassificationOutcome::Kept(classification) => classification,
            ClassificationOutcome::Discarded(reason) => return discard(reason),
        };

        let fingerprint = match self.pool.hash(bytes).await {
            Ok(fingerprint) if fingerprint.is_well_formed() => fingerprint,
            Ok(fingerprint) => {
                return discard(DiscardReason::HashFailed(format!(
                    "malformed fingerprint {:?}",
                    fingerprint.as_str()
                )));
            }
            Err(e) => return discard(DiscardReason::HashFailed(e.to_string())),
        };

        ImageOutcome::Analyzed(ImageRecord {
            url: url.to_string(),
            area: classification.area,
            severity: classification.severity,
            quality_score: classification.quality_score,
            fingerprint,
        })
    }

    fn send_progress(&self, progress: TriageProgress) {
        if let Some(sender) = &self.progress_sender {
            let _ = sender.send(progress);
        }
    }
}
