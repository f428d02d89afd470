use crate::core::models::{
    Area, AreaAggregate, Cluster, ImageRecord, PipelineReport, SourceImages,
};
use chrono::Utc;
use rand::Rng;

pub const NOTE_SEVERE: &str = "Shingle uplift or material detachment";
pub const NOTE_MINOR: &str = "Minor cosmetic or no visible damage";
pub const LOW_SAMPLE_WARNING: &str =
    "Fewer than 3 images were successfully analyzed; findings may be incomplete";

const SEVERE_AVERAGE: f64 = 2.5;
const CONFIRMING_SEVERITY: u8 = 2;
const CONFIRMING_COUNT: usize = 2;

/// Knobs for report assembly that are not part of the per-area math.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AggregateSettings {
    pub max_representative_images: usize,
    pub low_sample_threshold: usize,
}

impl Default for AggregateSettings {
    fn default() -> Self {
        Self {
            max_representative_images: 3,
            low_sample_threshold: 3,
        }
    }
}

/// Quality-weighted mean severity; `None` for an empty slice.
pub fn weighted_severity(records: &[&ImageRecord]) -> Option<f64> {
    let weight: f64 = records.iter().map(|r| r.quality_score).sum();
    if records.is_empty() || weight == 0.0 {
        return None;
    }
    let weighted: f64 = records
        .iter()
        .map(|r| r.severity as f64 * r.quality_score)
        .sum();
    Some(weighted / weight)
}

pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Partition representatives by area, in order of first appearance.
fn group_by_area<'a>(representatives: &[&'a ImageRecord]) -> Vec<(Area, Vec<&'a ImageRecord>)> {
    let mut groups: Vec<(Area, Vec<&ImageRecord>)> = Vec::new();
    for &record in representatives {
        match groups.iter_mut().find(|(area, _)| *area == record.area) {
            Some((_, members)) => members.push(record),
            None => groups.push((record.area, vec![record])),
        }
    }
    groups
}

pub fn aggregate_areas(
    representatives: &[&ImageRecord],
    primary_peril: &str,
    settings: &AggregateSettings,
) -> Vec<AreaAggregate> {
    group_by_area(representatives)
        .into_iter()
        .map(|(area, members)| {
            let avg_severity = round1(weighted_severity(&members).unwrap_or(0.0));
            let confirming = members
                .iter()
                .filter(|r| r.severity >= CONFIRMING_SEVERITY)
                .count();
            let notes = if avg_severity > SEVERE_AVERAGE {
                NOTE_SEVERE
            } else {
                NOTE_MINOR
            };

            AreaAggregate {
                area,
                damage_confirmed: confirming >= CONFIRMING_COUNT,
                avg_severity,
                primary_peril: primary_peril.to_string(),
                representative_images: members
                    .iter()
                    .take(settings.max_representative_images)
                    .map(|r| r.url.clone())
                    .collect(),
                notes: notes.to_string(),
            }
        })
        .collect()
}

/// Weighted across every representative, not an average of area averages.
pub fn overall_severity(representatives: &[&ImageRecord]) -> f64 {
    weighted_severity(representatives).map(round1).unwrap_or(0.0)
}

/// Reliability indicator shown to callers.
///
/// This is a placeholder: a uniform draw from `[0.70, 0.95]`, unrelated to the
/// images. Replace it with a calibrated score before relying on it.
pub fn placeholder_confidence<R: Rng>(rng: &mut R) -> f64 {
    let raw: f64 = rng.random_range(0.70..=0.95);
    (raw * 100.0).round() / 100.0
}

/// Request identity plus the collector's tallies for one run.
pub struct ReportInput<'a> {
    pub claim_id: &'a str,
    pub loss_type: &'a str,
    pub total: usize,
    pub analyzed: usize,
    pub discarded: usize,
    pub clusters: &'a [Cluster],
    pub confidence: f64,
}

/// Fold clusters into the final report.
pub fn build_report(input: ReportInput<'_>, settings: &AggregateSettings) -> PipelineReport {
    debug_assert_eq!(
        input.analyzed,
        input.clusters.iter().map(Cluster::len).sum::<usize>()
    );
    let representatives: Vec<&ImageRecord> =
        input.clusters.iter().map(Cluster::representative).collect();

    let mut data_gaps = Vec::new();
    if input.analyzed < settings.low_sample_threshold {
        data_gaps.push(LOW_SAMPLE_WARNING.to_string());
    }

    PipelineReport {
        claim_id: input.claim_id.to_string(),
        source_images: SourceImages {
            total: input.total,
            analyzed: input.analyzed,
            discarded: input.discarded,
            clusters: input.clusters.len(),
        },
        overall_damage_severity: overall_severity(&representatives),
        areas: aggregate_areas(&representatives, input.loss_type, settings),
        data_gaps,
        confidence: input.confidence,
        generated_at: Utc::now().to_rfc3339(),
    }
}
