pub mod config;
pub mod models;
pub mod query;
pub mod services;
pub mod transfer;
pub mod upload;

pub use config::ServiceConfig;
pub use models::{FileDescriptor, FileStatus, Message, ProcessedFile, Role, UploadFile, UploadStatus};
pub use query::{AskOutcome, PendingAnswer, QueryError, QuerySession};
pub use services::analysis::{load_analysis, AnalysisState};
pub use services::{HttpBackend, ServiceError};
pub use transfer::{AttemptToken, Progress};
pub use upload::{TransferHandle, TransferOutcome, UploadError, UploadEvent, UploadSession};

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `RUST_LOG`-driven subscriber, defaulting to `info`. Safe to call
/// more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_target(true).with_line_number(true))
        .try_init();
}
