//! Upload lifecycle: `idle -> uploading -> {success | error}`.
//!
//! One candidate is held at a time. Each `begin_transfer` issues a fresh
//! [`AttemptToken`]; progress and completions carry the token they were
//! started with and are dropped once it is no longer current. Discarding or
//! replacing the candidate clears the current token, so a transfer that is
//! still running in the background can never touch the new state.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ServiceConfig, PDF_MEDIA_TYPE};
use crate::models::{FileDescriptor, FileStatus, ProcessedFile, UploadFile, UploadStatus};
use crate::services::{ProgressFn, ServiceError, UploadReceipt, UploadService};
use crate::transfer::{lock, AttemptCounter, AttemptToken, Progress};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("Invalid file format: expected {expected}, got {actual}")]
    InvalidFormat { expected: String, actual: String },
    #[error("No file selected")]
    NoCandidate,
    #[error("An upload is already in progress")]
    AlreadyInProgress,
    #[error("No async runtime to run the transfer on")]
    NoRuntime,
}

impl Serialize for UploadError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UploadEvent {
    Started {
        attempt: AttemptToken,
        file: FileDescriptor,
    },
    Progress {
        attempt: AttemptToken,
        progress: Progress,
    },
    Processed(ProcessedFile),
    Failed {
        attempt: AttemptToken,
        reason: String,
    },
}

/// How a spawned transfer ended, from the point of view of its own attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Processed(ProcessedFile),
    Failed(String),
    /// The candidate was discarded or replaced before the result arrived.
    Discarded,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadSnapshot {
    pub candidate: Option<FileDescriptor>,
    pub status: UploadStatus,
    pub progress: Progress,
    pub last_error: Option<String>,
}

#[derive(Debug)]
struct UploadState {
    candidate: Option<UploadFile>,
    status: UploadStatus,
    progress: Progress,
    current: Option<AttemptToken>,
    attempts: AttemptCounter,
    last_error: Option<String>,
}

impl UploadState {
    fn reset(&mut self) {
        self.status = UploadStatus::Idle;
        self.progress = Progress::ZERO;
        self.current = None;
        self.last_error = None;
    }

    fn is_current(&self, attempt: AttemptToken) -> bool {
        self.current == Some(attempt)
    }
}

/// Handle to a running transfer. Dropping it does not cancel the transfer.
#[derive(Debug)]
pub struct TransferHandle {
    attempt: AttemptToken,
    task: JoinHandle<TransferOutcome>,
}

impl TransferHandle {
    pub fn attempt(&self) -> AttemptToken {
        self.attempt
    }

    pub async fn outcome(self) -> TransferOutcome {
        match self.task.await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(attempt = self.attempt.get(), error = %e, "transfer task did not finish");
                TransferOutcome::Failed(e.to_string())
            }
        }
    }
}

#[derive(Clone)]
pub struct UploadSession {
    service: Arc<dyn UploadService>,
    accepted_media_type: String,
    state: Arc<Mutex<UploadState>>,
    events: broadcast::Sender<UploadEvent>,
}

impl UploadSession {
    /// Session accepting PDF documents only.
    pub fn new(service: Arc<dyn UploadService>) -> Self {
        Self::with_accepted_media_type(service, PDF_MEDIA_TYPE)
    }

    pub fn from_config(service: Arc<dyn UploadService>, config: &ServiceConfig) -> Self {
        Self::with_accepted_media_type(service, config.accepted_media_type.clone())
    }

    pub fn with_accepted_media_type(
        service: Arc<dyn UploadService>,
        accepted_media_type: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            service,
            accepted_media_type: accepted_media_type.into(),
            state: Arc::new(Mutex::new(UploadState {
                candidate: None,
                status: UploadStatus::Idle,
                progress: Progress::ZERO,
                current: None,
                attempts: AttemptCounter::default(),
                last_error: None,
            })),
            events,
        }
    }

    /// Events for every attempt made by this session. The channel holds 256
    /// events and a progress event is sent per 64 KiB chunk, so a receiver
    /// that falls behind on a file over ~16 MiB gets `RecvError::Lagged` and
    /// skips ahead; `snapshot()` always has the settled state.
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self) -> UploadSnapshot {
        let state = lock(&self.state);
        UploadSnapshot {
            candidate: state.candidate.as_ref().map(UploadFile::descriptor),
            status: state.status,
            progress: state.progress,
            last_error: state.last_error.clone(),
        }
    }

    pub fn status(&self) -> UploadStatus {
        lock(&self.state).status
    }

    pub fn progress(&self) -> Progress {
        lock(&self.state).progress
    }

    /// Stage `file` for upload, replacing any current candidate. A file of
    /// the wrong media type is rejected and nothing changes.
    pub fn select_candidate(&self, file: UploadFile) -> Result<FileDescriptor, UploadError> {
        let actual = file.media_type.trim();
        if !actual.eq_ignore_ascii_case(&self.accepted_media_type) {
            warn!(name = %file.name, media_type = %file.media_type, "rejected candidate");
            return Err(UploadError::InvalidFormat {
                expected: self.accepted_media_type.clone(),
                actual: file.media_type.clone(),
            });
        }

        let descriptor = file.descriptor();
        let mut state = lock(&self.state);
        if let Some(stale) = state.current {
            debug!(attempt = stale.get(), "candidate replaced mid-transfer");
        }
        state.candidate = Some(file);
        state.reset();
        info!(name = %descriptor.name, size = descriptor.size, "candidate selected");
        Ok(descriptor)
    }

    /// Drop the candidate from any state. A transfer still in flight keeps
    /// running but its result is ignored.
    pub fn discard_candidate(&self) {
        let mut state = lock(&self.state);
        if let Some(stale) = state.current {
            debug!(attempt = stale.get(), "discarding candidate mid-transfer");
        }
        state.candidate = None;
        state.reset();
    }

    /// Start transferring the candidate. Fails with `NoRuntime`, changing
    /// nothing, when called outside a tokio runtime.
    pub fn begin_transfer(&self) -> Result<TransferHandle, UploadError> {
        let runtime = Handle::try_current().map_err(|_| UploadError::NoRuntime)?;
        let (attempt, file) = {
            let mut state = lock(&self.state);
            let file = state.candidate.clone().ok_or(UploadError::NoCandidate)?;
            if state.status == UploadStatus::Uploading {
                return Err(UploadError::AlreadyInProgress);
            }

            let attempt = state.attempts.issue();
            state.current = Some(attempt);
            state.status = UploadStatus::Uploading;
            state.progress = Progress::ZERO;
            state.last_error = None;
            let _ = self.events.send(UploadEvent::Started {
                attempt,
                file: file.descriptor(),
            });
            (attempt, file)
        };
        info!(attempt = attempt.get(), name = %file.name, "transfer started");

        let session = self.clone();
        let task = runtime.spawn(async move {
            let on_progress: ProgressFn = {
                let session = session.clone();
                Arc::new(move |fraction| session.apply_progress(attempt, fraction))
            };
            // A panicking service must still settle the attempt.
            let service = session.service.clone();
            let payload = file.clone();
            let result = match tokio::spawn(async move {
                service.upload(&payload, on_progress).await
            })
            .await
            {
                Ok(result) => result,
                Err(e) => Err(ServiceError::from(e)),
            };
            session.apply_completion(attempt, &file, result)
        });

        Ok(TransferHandle { attempt, task })
    }

    fn apply_progress(&self, attempt: AttemptToken, fraction: f32) {
        let mut state = lock(&self.state);
        if !state.is_current(attempt) || state.status != UploadStatus::Uploading {
            debug!(attempt = attempt.get(), fraction, "dropping stale progress");
            return;
        }
        let progress = Progress::new(fraction);
        if state.progress.advance(progress) {
            let _ = self.events.send(UploadEvent::Progress { attempt, progress });
        } else {
            debug!(attempt = attempt.get(), fraction, "ignoring regressed progress");
        }
    }

    fn apply_completion(
        &self,
        attempt: AttemptToken,
        file: &UploadFile,
        result: Result<UploadReceipt, ServiceError>,
    ) -> TransferOutcome {
        let mut state = lock(&self.state);
        if !state.is_current(attempt) {
            debug!(attempt = attempt.get(), "dropping stale completion");
            return TransferOutcome::Discarded;
        }

        match result {
            Ok(receipt) => {
                state.status = UploadStatus::Success;
                state.progress = Progress::COMPLETE;
                let processed = ProcessedFile {
                    name: file.name.clone(),
                    size: file.size(),
                    status: FileStatus::Processed,
                    document_id: receipt.document_id,
                };
                info!(attempt = attempt.get(), name = %processed.name, "upload processed");
                let _ = self.events.send(UploadEvent::Processed(processed.clone()));
                TransferOutcome::Processed(processed)
            }
            Err(e) => {
                let reason = e.to_string();
                state.status = UploadStatus::Error;
                state.last_error = Some(reason.clone());
                warn!(attempt = attempt.get(), error = %reason, "upload failed");
                let _ = self.events.send(UploadEvent::Failed {
                    attempt,
                    reason: reason.clone(),
                });
                TransferOutcome::Failed(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::{oneshot, Mutex as AsyncMutex};

    fn pdf(name: &str) -> UploadFile {
        UploadFile::new(name, PDF_MEDIA_TYPE, vec![1u8; 100])
    }

    /// Reports the scripted progress values, then succeeds or fails.
    struct ScriptedUpload {
        steps: Vec<f32>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl ScriptedUpload {
        fn ok(steps: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                fail: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(steps: Vec<f32>) -> Arc<Self> {
            Arc::new(Self {
                steps,
                fail: true,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl UploadService for ScriptedUpload {
        async fn upload(
            &self,
            file: &UploadFile,
            on_progress: ProgressFn,
        ) -> Result<UploadReceipt, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            for step in &self.steps {
                on_progress(*step);
            }
            if self.fail {
                return Err(ServiceError::Api {
                    status: 500,
                    message: "Server error during file processing.".into(),
                });
            }
            Ok(UploadReceipt {
                message: None,
                document_id: Some(file.name.trim_end_matches(".pdf").to_string()),
            })
        }
    }

    /// Blocks until released, so the test controls when the result arrives.
    struct GatedUpload {
        release: AsyncMutex<Option<oneshot::Receiver<()>>>,
        started: AsyncMutex<Option<oneshot::Sender<()>>>,
    }

    impl GatedUpload {
        fn new() -> (Arc<Self>, oneshot::Receiver<()>, oneshot::Sender<()>) {
            let (release_tx, release_rx) = oneshot::channel();
            let (started_tx, started_rx) = oneshot::channel();
            let gate = Arc::new(Self {
                release: AsyncMutex::new(Some(release_rx)),
                started: AsyncMutex::new(Some(started_tx)),
            });
            (gate, started_rx, release_tx)
        }
    }

    #[async_trait]
    impl UploadService for GatedUpload {
        async fn upload(
            &self,
            _file: &UploadFile,
            on_progress: ProgressFn,
        ) -> Result<UploadReceipt, ServiceError> {
            on_progress(0.5);
            if let Some(tx) = self.started.lock().await.take() {
                let _ = tx.send(());
            }
            if let Some(rx) = self.release.lock().await.take() {
                let _ = rx.await;
            }
            on_progress(0.9);
            Ok(UploadReceipt::default())
        }
    }

    #[tokio::test]
    async fn test_successful_transfer_ends_complete() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![0.25, 0.6]));
        let mut events = session.subscribe();
        session.select_candidate(pdf("claims.pdf")).unwrap();

        let handle = session.begin_transfer().unwrap();
        let outcome = handle.outcome().await;

        let TransferOutcome::Processed(processed) = outcome else {
            panic!("expected processed outcome");
        };
        assert_eq!(processed.name, "claims.pdf");
        assert_eq!(processed.size, 100);
        assert_eq!(processed.status, FileStatus::Processed);
        assert_eq!(processed.document_id.as_deref(), Some("claims"));
        assert_eq!(session.status(), UploadStatus::Success);
        assert_eq!(session.progress(), Progress::COMPLETE);

        assert!(matches!(events.recv().await.unwrap(), UploadEvent::Started { .. }));
        let mut fractions = Vec::new();
        loop {
            match events.recv().await.unwrap() {
                UploadEvent::Progress { progress, .. } => fractions.push(progress.fraction()),
                UploadEvent::Processed(file) => {
                    assert_eq!(file, processed);
                    break;
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
        assert_eq!(fractions, vec![0.25, 0.6]);
    }

    #[tokio::test]
    async fn test_regressing_progress_is_not_applied() {
        let session = UploadSession::new(ScriptedUpload::failing(vec![0.3, 0.7, 0.5]));
        session.select_candidate(pdf("a.pdf")).unwrap();

        let outcome = session.begin_transfer().unwrap().outcome().await;
        assert!(matches!(outcome, TransferOutcome::Failed(_)));

        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Error);
        assert_eq!(snapshot.progress.fraction(), 0.7);
        assert!(snapshot.last_error.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn test_failure_then_retry_on_same_candidate() {
        let service = ScriptedUpload::failing(vec![0.4]);
        let session = UploadSession::new(service.clone());
        session.select_candidate(pdf("a.pdf")).unwrap();

        session.begin_transfer().unwrap().outcome().await;
        assert_eq!(session.status(), UploadStatus::Error);
        assert_eq!(session.progress().fraction(), 0.4);

        let handle = session.begin_transfer().unwrap();
        assert_eq!(session.progress(), Progress::ZERO);
        handle.outcome().await;
        assert_eq!(service.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalid_format_leaves_state_unchanged() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![]));
        let err = session
            .select_candidate(UploadFile::new("scan.png", "image/png", vec![0u8; 4]))
            .unwrap_err();
        assert_eq!(
            err,
            UploadError::InvalidFormat {
                expected: PDF_MEDIA_TYPE.into(),
                actual: "image/png".into(),
            }
        );
        let snapshot = session.snapshot();
        assert!(snapshot.candidate.is_none());
        assert_eq!(snapshot.status, UploadStatus::Idle);

        session.select_candidate(pdf("keep.pdf")).unwrap();
        session
            .select_candidate(UploadFile::new("x.png", "image/png", vec![]))
            .unwrap_err();
        assert_eq!(session.snapshot().candidate.unwrap().name, "keep.pdf");
    }

    #[tokio::test]
    async fn test_media_type_match_ignores_case() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![]));
        assert!(session
            .select_candidate(UploadFile::new("a.pdf", "Application/PDF", vec![]))
            .is_ok());
    }

    #[tokio::test]
    async fn test_begin_without_candidate() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![]));
        assert_eq!(session.begin_transfer().unwrap_err(), UploadError::NoCandidate);
    }

    #[tokio::test]
    async fn test_begin_while_uploading_is_rejected() {
        let (gate, started, release) = GatedUpload::new();
        let session = UploadSession::new(gate);
        session.select_candidate(pdf("a.pdf")).unwrap();

        let handle = session.begin_transfer().unwrap();
        started.await.unwrap();
        assert_eq!(
            session.begin_transfer().unwrap_err(),
            UploadError::AlreadyInProgress
        );

        release.send(()).unwrap();
        assert!(matches!(handle.outcome().await, TransferOutcome::Processed(_)));
    }

    #[tokio::test]
    async fn test_discard_mid_transfer_ignores_completion() {
        let (gate, started, release) = GatedUpload::new();
        let session = UploadSession::new(gate);
        let mut events = session.subscribe();
        session.select_candidate(pdf("a.pdf")).unwrap();

        let handle = session.begin_transfer().unwrap();
        started.await.unwrap();
        assert_eq!(session.progress().fraction(), 0.5);

        session.discard_candidate();
        release.send(()).unwrap();

        assert_eq!(handle.outcome().await, TransferOutcome::Discarded);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Idle);
        assert_eq!(snapshot.progress, Progress::ZERO);
        assert!(snapshot.candidate.is_none());

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            seen.push(event);
        }
        assert!(!seen.iter().any(|e| matches!(e, UploadEvent::Processed(_))));
        assert!(!seen.iter().any(|e| matches!(
            e,
            UploadEvent::Progress { progress, .. } if progress.fraction() > 0.5
        )));
    }

    #[tokio::test]
    async fn test_reselect_mid_transfer_ignores_old_completion() {
        let (gate, started, release) = GatedUpload::new();
        let session = UploadSession::new(gate);
        session.select_candidate(pdf("old.pdf")).unwrap();

        let handle = session.begin_transfer().unwrap();
        started.await.unwrap();
        session.select_candidate(pdf("new.pdf")).unwrap();
        release.send(()).unwrap();

        assert_eq!(handle.outcome().await, TransferOutcome::Discarded);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Idle);
        assert_eq!(snapshot.candidate.unwrap().name, "new.pdf");
    }

    #[tokio::test]
    async fn test_empty_file_success_reports_complete() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![]));
        session
            .select_candidate(UploadFile::new("empty.pdf", PDF_MEDIA_TYPE, Vec::<u8>::new()))
            .unwrap();
        session.begin_transfer().unwrap().outcome().await;
        assert_eq!(session.progress(), Progress::COMPLETE);
    }

    /// Panics on the first call, succeeds afterwards.
    struct PanicOnceUpload {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UploadService for PanicOnceUpload {
        async fn upload(
            &self,
            _file: &UploadFile,
            on_progress: ProgressFn,
        ) -> Result<UploadReceipt, ServiceError> {
            on_progress(0.3);
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("upload client blew up");
            }
            Ok(UploadReceipt::default())
        }
    }

    #[tokio::test]
    async fn test_panicking_service_settles_as_error() {
        let session = UploadSession::new(Arc::new(PanicOnceUpload {
            calls: AtomicUsize::new(0),
        }));
        let mut events = session.subscribe();
        session.select_candidate(pdf("a.pdf")).unwrap();

        let outcome = session.begin_transfer().unwrap().outcome().await;
        assert!(matches!(outcome, TransferOutcome::Failed(_)));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Error);
        assert_eq!(snapshot.progress.fraction(), 0.3);
        assert!(snapshot.last_error.is_some());

        let mut failed = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UploadEvent::Failed { .. }) {
                failed += 1;
            }
        }
        assert_eq!(failed, 1);

        let outcome = session.begin_transfer().unwrap().outcome().await;
        assert!(matches!(outcome, TransferOutcome::Processed(_)));
        assert_eq!(session.status(), UploadStatus::Success);
    }

    #[test]
    fn test_begin_outside_runtime_changes_nothing() {
        let session = UploadSession::new(ScriptedUpload::ok(vec![]));
        session.select_candidate(pdf("a.pdf")).unwrap();

        assert_eq!(session.begin_transfer().unwrap_err(), UploadError::NoRuntime);
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Idle);
        assert_eq!(snapshot.progress, Progress::ZERO);
        assert!(snapshot.last_error.is_none());
        assert_eq!(snapshot.candidate.unwrap().name, "a.pdf");
    }

    #[tokio::test]
    async fn test_lagging_subscriber_resyncs_from_snapshot() {
        let steps = (1..=EVENT_CAPACITY + 44)
            .map(|i| i as f32 / (EVENT_CAPACITY + 44) as f32)
            .collect();
        let session = UploadSession::new(ScriptedUpload::ok(steps));
        let mut events = session.subscribe();
        session.select_candidate(pdf("big.pdf")).unwrap();

        session.begin_transfer().unwrap().outcome().await;
        assert!(matches!(
            events.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let snapshot = session.snapshot();
        assert_eq!(snapshot.status, UploadStatus::Success);
        assert_eq!(snapshot.progress, Progress::COMPLETE);
    }

    #[test]
    fn test_upload_error_serializes_as_message() {
        let json = serde_json::to_string(&UploadError::NoCandidate).unwrap();
        assert_eq!(json, r#""No file selected""#);
    }
}
