pub mod analysis;
pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::models::UploadFile;

pub use analysis::{PatentAnalysis, SimilarPatent};
pub use http::HttpBackend;

/// Receives upload progress as a fraction in `[0, 1]`.
pub type ProgressFn = Arc<dyn Fn(f32) + Send + Sync>;

/// Body returned by the Upload Service on success. Every field is optional;
/// any 2xx body counts as a processed upload.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct UploadReceipt {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub document_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct QueryRequest {
    pub question: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct QueryReply {
    #[serde(default)]
    pub answer: Option<String>,
    #[serde(default)]
    pub sources: Option<Vec<String>>,
}

/// Transfers a document to the backend, reporting progress as bytes go out.
#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(
        &self,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<UploadReceipt, ServiceError>;
}

#[async_trait]
pub trait QueryService: Send + Sync {
    async fn query(&self, question: &str) -> Result<QueryReply, ServiceError>;
}

#[async_trait]
pub trait AnalysisService: Send + Sync {
    async fn analyze(&self, document_id: &str) -> Result<PatentAnalysis, ServiceError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid configuration: {0}")]
    Config(String),
    #[error("Service call aborted: {0}")]
    Aborted(String),
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Aborted(e.to_string())
    }
}

impl Serialize for ServiceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
