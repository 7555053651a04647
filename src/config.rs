use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const PDF_MEDIA_TYPE: &str = "application/pdf";

const BASE_URL_KEY: &str = "PATENT_ASSISTANT_BASE_URL";
const TIMEOUT_KEY: &str = "PATENT_ASSISTANT_TIMEOUT_SECS";
const MEDIA_TYPE_KEY: &str = "PATENT_ASSISTANT_MEDIA_TYPE";

/// Where the backend lives and how documents are handed to it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub base_url: String,
    pub upload_path: String,
    pub query_path: String,
    pub analyze_path: String,
    /// Multipart field the Upload Service reads the file from.
    pub upload_field: String,
    pub accepted_media_type: String,
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            upload_path: "/upload".to_string(),
            query_path: "/query".to_string(),
            analyze_path: "/analyze".to_string(),
            upload_field: "file".to_string(),
            accepted_media_type: PDF_MEDIA_TYPE.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

impl ServiceConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults, overridden by any `PATENT_ASSISTANT_*` variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            base_url: non_empty(BASE_URL_KEY).unwrap_or(defaults.base_url),
            timeout: non_empty(TIMEOUT_KEY)
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            accepted_media_type: non_empty(MEDIA_TYPE_KEY).unwrap_or(defaults.accepted_media_type),
            ..defaults
        }
    }

    /// Join `path` onto the base URL with exactly one slash between them.
    pub fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}
