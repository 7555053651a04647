use super::{
    AnalysisService, PatentAnalysis, ProgressFn, QueryReply, QueryRequest, QueryService,
    ServiceError, UploadReceipt, UploadService,
};
use crate::config::ServiceConfig;
use crate::models::UploadFile;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client, Response};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Size of each body chunk handed to the transport. Progress is reported
/// once per chunk.
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// HTTP client for the upload, query and analysis endpoints.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: Client,
    config: ServiceConfig,
}

impl HttpBackend {
    pub fn new(config: ServiceConfig) -> Result<Self, ServiceError> {
        if config.base_url.trim().is_empty() {
            return Err(ServiceError::Config("base_url is empty".into()));
        }
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }
}

async fn check_status(resp: Response) -> Result<Response, ServiceError> {
    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let text = resp.text().await.unwrap_or_default();
        return Err(ServiceError::Api {
            status,
            message: text,
        });
    }
    Ok(resp)
}

/// Split the file into chunks that report the fraction of bytes pulled so
/// far as the transport consumes them.
fn progress_stream(
    contents: &Bytes,
    on_progress: ProgressFn,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let total = contents.len() as u64;
    let chunks: Vec<Bytes> = (0..contents.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| contents.slice(start..(start + UPLOAD_CHUNK_SIZE).min(contents.len())))
        .collect();

    let sent = Arc::new(AtomicU64::new(0));
    futures::stream::iter(chunks).map(move |chunk| {
        let len = chunk.len() as u64;
        let done = sent.fetch_add(len, Ordering::SeqCst) + len;
        on_progress(done as f32 / total as f32);
        Ok::<Bytes, std::io::Error>(chunk)
    })
}

#[async_trait]
impl UploadService for HttpBackend {
    async fn upload(
        &self,
        file: &UploadFile,
        on_progress: ProgressFn,
    ) -> Result<UploadReceipt, ServiceError> {
        let url = self.config.endpoint(&self.config.upload_path);
        debug!(%url, name = %file.name, size = file.size(), "uploading document");

        let part = Part::stream_with_length(
            Body::wrap_stream(progress_stream(&file.contents, on_progress)),
            file.size(),
        )
        .file_name(file.name.clone())
        .mime_str(&file.media_type)?;
        let form = Form::new().part(self.config.upload_field.clone(), part);

        let resp = self.client.post(&url).multipart(form).send().await?;
        let resp = check_status(resp).await?;

        let text = resp.text().await?;
        let receipt: UploadReceipt = serde_json::from_str(&text).unwrap_or_default();
        info!(name = %file.name, document_id = ?receipt.document_id, "upload accepted");
        Ok(receipt)
    }
}

#[async_trait]
impl QueryService for HttpBackend {
    async fn query(&self, question: &str) -> Result<QueryReply, ServiceError> {
        let url = self.config.endpoint(&self.config.query_path);
        let body = QueryRequest {
            question: question.to_string(),
        };

        let resp = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;
        let resp = check_status(resp).await?;

        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ServiceError::Parse(e.to_string()))
    }
}

#[async_trait]
impl AnalysisService for HttpBackend {
    async fn analyze(&self, document_id: &str) -> Result<PatentAnalysis, ServiceError> {
        let base = self.config.endpoint(&self.config.analyze_path);
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| ServiceError::Config(format!("{}: {}", base, e)))?;
        url.path_segments_mut()
            .map_err(|_| ServiceError::Config(format!("{} cannot be a base URL", base)))?
            .pop_if_empty()
            .push(document_id);

        let resp = self.client.get(url).send().await?;
        let resp = check_status(resp).await?;

        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| ServiceError::Parse(e.to_string()))
    }
}
