pub mod config;
pub mod core;

pub use config::{ConfigError, PipelineConfig};
pub use crate::core::models::{PipelineReport, TriageRequest};
pub use crate::core::pipeline::{TriageError, TriagePhase, TriagePipeline, TriageProgress};
