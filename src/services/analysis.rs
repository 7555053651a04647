use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::AnalysisService;

/// Shown in place of a report when the analysis could not be fetched.
pub const ANALYSIS_FAILED: &str = "Could not load analysis results. Please try again.";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimilarPatent {
    pub id: String,
    pub title: String,
    pub similarity: f64,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PatentAnalysis {
    pub title: String,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub applicant: Option<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub novelty_score: u8,
    #[serde(default)]
    pub potential_issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
    #[serde(default)]
    pub similar_patents: Vec<SimilarPatent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisState {
    Loaded(PatentAnalysis),
    Failed(String),
}

/// Fetch the analysis report for a processed document. Service failures
/// become `AnalysisState::Failed` with a user-facing message.
pub async fn load_analysis(service: &dyn AnalysisService, document_id: &str) -> AnalysisState {
    let document_id = document_id.trim();
    if document_id.is_empty() {
        warn!("analysis requested without a document id");
        return AnalysisState::Failed(ANALYSIS_FAILED.to_string());
    }

    match service.analyze(document_id).await {
        Ok(report) => {
            info!(
                document_id,
                similar = report.similar_patents.len(),
                "analysis loaded"
            );
            AnalysisState::Loaded(report)
        }
        Err(e) => {
            warn!(document_id, error = %e, "analysis fetch failed");
            AnalysisState::Failed(ANALYSIS_FAILED.to_string())
        }
    }
}
