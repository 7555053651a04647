use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::config::PDF_MEDIA_TYPE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One entry of the conversation log. Never mutated after it is appended.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub role: Role,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<String>>,
}

impl Message {
    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            content: content.into(),
            role,
            created_at: Utc::now(),
            sources: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    /// Provenance entry that follows an answer: `Sources: a, b`.
    pub fn sources(sources: Vec<String>) -> Self {
        let mut msg = Self::assistant(format!("Sources: {}", sources.join(", ")));
        msg.sources = Some(sources);
        msg
    }
}

/// A document staged for upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadFile {
    pub name: String,
    pub media_type: String,
    pub contents: Bytes,
}

impl UploadFile {
    pub fn new(
        name: impl Into<String>,
        media_type: impl Into<String>,
        contents: impl Into<Bytes>,
    ) -> Self {
        Self {
            name: name.into(),
            media_type: media_type.into(),
            contents: contents.into(),
        }
    }

    /// Read a file from disk, declaring its media type from the extension.
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unknown")
            .to_string();
        let contents = tokio::fs::read(path).await?;
        Ok(Self::new(name, media_type_for(path), contents))
    }

    pub fn size(&self) -> u64 {
        self.contents.len() as u64
    }

    pub fn descriptor(&self) -> FileDescriptor {
        FileDescriptor {
            name: self.name.clone(),
            size: self.size(),
            media_type: self.media_type.clone(),
        }
    }
}

fn media_type_for(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase();

    match ext.as_str() {
        "pdf" => PDF_MEDIA_TYPE,
        "txt" => "text/plain",
        "md" | "markdown" => "text/markdown",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    pub media_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Processed,
}

/// Emitted once per successful transfer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProcessedFile {
    pub name: String,
    pub size: u64,
    pub status: FileStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
}

impl ProcessedFile {
    /// Title used to seed a query session: the file name without extension.
    pub fn document_context(&self) -> String {
        Path::new(&self.name)
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.name)
            .to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Idle,
    Uploading,
    Success,
    Error,
}
