use crate::enhancement_client::ImageEnhancer;
use crate::image_store::{ImageRecord, ImageStore};
use crate::status::{StatusKind, Transition, TransitionError};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur when starting enhancement work
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("A batch is already running")]
    AlreadyRunning,

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Live progress of the current (or last) batch run
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchProgress {
    /// True from invocation until every snapshot entry is terminal
    pub processing: bool,
    /// Records in the snapshot
    pub total: usize,
    /// Snapshot entries handled so far (including skipped)
    pub completed: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Entries no longer Idle when their turn came
    pub skipped: usize,
    /// Record currently being enhanced
    pub current: Option<String>,
    /// Whether the run stopped early on request
    pub cancelled: bool,
}

/// Summary of a finished batch run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: bool,
}

/// Outcome of one snapshot entry
enum Outcome {
    Succeeded,
    Failed,
    Skipped,
}

/// Drives single and batch enhancement over the shared image store.
///
/// A batch works on a snapshot of the Idle records taken at invocation and
/// enhances them one at a time, in upload order, each reaching a terminal
/// state before the next begins.
pub struct BatchOrchestrator {
    store: Arc<ImageStore>,
    enhancer: Arc<dyn ImageEnhancer>,
    processing: AtomicBool,
    progress: RwLock<BatchProgress>,
    cancel: Mutex<CancellationToken>,
}

impl BatchOrchestrator {
    pub fn new(store: Arc<ImageStore>, enhancer: Arc<dyn ImageEnhancer>) -> Self {
        Self {
            store,
            enhancer,
            processing: AtomicBool::new(false),
            progress: RwLock::new(BatchProgress::default()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> BatchProgress {
        self.progress.read().clone()
    }

    /// Whether the enhancer has everything it needs to make requests
    pub fn is_ready(&self) -> bool {
        self.enhancer.check_ready().is_ok()
    }

    /// Ask the running batch to stop before its next record.
    ///
    /// Returns false when no batch is running.
    pub fn cancel(&self) -> bool {
        if !self.is_processing() {
            return false;
        }
        info!("Batch cancellation requested");
        self.cancel.lock().cancel();
        true
    }

    /// Enhance one record, whatever its current terminal or idle state.
    #[instrument(skip(self))]
    pub async fn enhance_one(&self, id: &str) -> Result<ImageRecord, BatchError> {
        self.run_record(id, None).await.map(|(record, _)| record)
    }

    /// Claim the batch slot and snapshot the Idle records.
    ///
    /// Split from [`BatchRun::run`] so callers can report the snapshot
    /// before the work completes.
    pub fn start(self: &Arc<Self>) -> Result<BatchRun, BatchError> {
        if self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BatchError::AlreadyRunning);
        }

        let snapshot = self.store.idle_ids();
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        *self.progress.write() = BatchProgress {
            processing: true,
            total: snapshot.len(),
            ..BatchProgress::default()
        };

        metrics::counter!("enhancer_batches_total").increment(1);
        info!(total = snapshot.len(), "Batch enhancement started");

        Ok(BatchRun {
            orchestrator: Arc::clone(self),
            snapshot,
            token,
        })
    }

    /// Enhance every record that is Idle right now.
    pub async fn enhance_all(self: &Arc<Self>) -> Result<BatchReport, BatchError> {
        Ok(self.start()?.run().await)
    }

    /// Full single-image flow: readiness, request, remote call, outcome.
    async fn run_record(
        &self,
        id: &str,
        require: Option<StatusKind>,
    ) -> Result<(ImageRecord, Outcome), BatchError> {
        if let Err(e) = self.enhancer.check_ready() {
            warn!(id = %id, error = %e, "Enhancer not ready, rejecting image");
            let record = match require {
                Some(kind) => self.store.apply_if(id, kind, Transition::Reject(e.to_string()))?,
                None => self.store.apply(id, Transition::Reject(e.to_string()))?,
            };
            metrics::counter!("enhancer_enhancements_total", "outcome" => "rejected").increment(1);
            return Ok((record, Outcome::Failed));
        }

        let record = match require {
            Some(kind) => self.store.apply_if(id, kind, Transition::Request)?,
            None => self.store.apply(id, Transition::Request)?,
        };

        debug!(id = %id, name = %record.name, "Enhancing image");

        let result = self
            .enhancer
            .enhance(&record.source.data, &record.source.media_type)
            .await;

        let (transition, outcome) = match result {
            Ok(image) => {
                metrics::counter!("enhancer_enhancements_total", "outcome" => "success").increment(1);
                (Transition::Succeed(image), Outcome::Succeeded)
            }
            Err(e) => {
                error!(id = %id, error = %e, "Image enhancement failed");
                metrics::counter!("enhancer_enhancements_total", "outcome" => "error").increment(1);
                (Transition::Fail(e.to_string()), Outcome::Failed)
            }
        };

        let record = self.store.apply(id, transition)?;
        Ok((record, outcome))
    }
}

/// A claimed batch with its snapshot.
///
/// Dropping it releases the batch slot and clears the processing flag, so
/// the flag is reset on every exit path.
pub struct BatchRun {
    orchestrator: Arc<BatchOrchestrator>,
    snapshot: Vec<String>,
    token: CancellationToken,
}

impl Drop for BatchRun {
    fn drop(&mut self) {
        let mut progress = self.orchestrator.progress.write();
        progress.processing = false;
        progress.current = None;
        self.orchestrator.processing.store(false, Ordering::SeqCst);
    }
}

impl BatchRun {
    /// IDs captured at start, in processing order
    pub fn snapshot(&self) -> &[String] {
        &self.snapshot
    }

    /// Process the snapshot sequentially.
    pub async fn run(self) -> BatchReport {
        let orchestrator = &self.orchestrator;
        let mut cancelled = false;

        for id in &self.snapshot {
            if self.token.is_cancelled() {
                cancelled = true;
                break;
            }

            orchestrator.progress.write().current = Some(id.clone());

            let outcome = match orchestrator.run_record(id, Some(StatusKind::Idle)).await {
                Ok((_, outcome)) => outcome,
                Err(BatchError::Transition(TransitionError::Invalid { from, .. })) => {
                    debug!(id = %id, state = %from, "Image no longer idle, skipping");
                    Outcome::Skipped
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "Skipping image");
                    Outcome::Skipped
                }
            };

            {
                let mut progress = orchestrator.progress.write();
                progress.completed += 1;
                match outcome {
                    Outcome::Succeeded => progress.succeeded += 1,
                    Outcome::Failed => progress.failed += 1,
                    Outcome::Skipped => progress.skipped += 1,
                }
            }
        }

        let report = {
            let mut progress = orchestrator.progress.write();
            progress.cancelled = cancelled;
            BatchReport {
                total: progress.total,
                succeeded: progress.succeeded,
                failed: progress.failed,
                skipped: progress.skipped,
                cancelled,
            }
        };

        info!(
            total = report.total,
            succeeded = report.succeeded,
            failed = report.failed,
            skipped = report.skipped,
            cancelled = report.cancelled,
            "Batch enhancement finished"
        );

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enhancement_client::{EnhanceError, MockImageEnhancer};
    use crate::image_store::UploadedFile;
    use crate::status::{EnhancedImage, ImageStatus};
    use async_trait::async_trait;
    use bytes::Bytes;

    fn image_file(name: &str) -> UploadedFile {
        UploadedFile {
            name: name.to_string(),
            media_type: Some("image/png".to_string()),
            data: Bytes::from(name.to_string()),
        }
    }

    fn enhanced(data: &[u8]) -> EnhancedImage {
        EnhancedImage {
            data: Bytes::copy_from_slice(data),
            media_type: "image/png".to_string(),
        }
    }

    /// Enhancer that records call order and checks that no other image in
    /// the store is mid-enhancement when a call starts.
    struct SequentialEnhancer {
        store: Arc<ImageStore>,
        calls: Mutex<Vec<String>>,
        fail_on: Option<String>,
        on_call: Option<Box<dyn Fn(&ImageStore, usize) + Send + Sync>>,
    }

    impl SequentialEnhancer {
        fn new(store: Arc<ImageStore>) -> Self {
            Self {
                store,
                calls: Mutex::new(Vec::new()),
                fail_on: None,
                on_call: None,
            }
        }
    }

    #[async_trait]
    impl ImageEnhancer for SequentialEnhancer {
        fn check_ready(&self) -> Result<(), EnhanceError> {
            Ok(())
        }

        async fn enhance(&self, image: &[u8], _media_type: &str) -> Result<EnhancedImage, EnhanceError> {
            let name = String::from_utf8(image.to_vec()).unwrap();

            let enhancing = self
                .store
                .list()
                .iter()
                .filter(|r| r.status == ImageStatus::Enhancing)
                .count();
            assert_eq!(enhancing, 1, "exactly one image may be enhancing at a time");

            let call_index = {
                let mut calls = self.calls.lock();
                calls.push(name.clone());
                calls.len()
            };
            if let Some(hook) = &self.on_call {
                hook(&self.store, call_index);
            }

            tokio::task::yield_now().await;

            if self.fail_on.as_deref() == Some(name.as_str()) {
                return Err(EnhanceError::Api(500, "internal error".to_string()));
            }
            Ok(enhanced(format!("enhanced {}", name).as_bytes()))
        }
    }

    #[tokio::test]
    async fn test_enhance_all_processes_in_order() {
        let store = Arc::new(ImageStore::new());
        store.add(vec![image_file("a.png"), image_file("b.png"), image_file("c.png")]);

        let enhancer = Arc::new(SequentialEnhancer::new(store.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), enhancer.clone()));

        let report = orchestrator.enhance_all().await.unwrap();

        assert_eq!(*enhancer.calls.lock(), vec!["a.png", "b.png", "c.png"]);
        assert_eq!(
            report,
            BatchReport {
                total: 3,
                succeeded: 3,
                failed: 0,
                skipped: 0,
                cancelled: false
            }
        );
        assert!(store.list().iter().all(|r| r.enhanced().is_some()));
        assert!(!orchestrator.is_processing());
    }

    #[tokio::test]
    async fn test_failure_does_not_abort_batch() {
        let store = Arc::new(ImageStore::new());
        store.add(vec![image_file("a.png"), image_file("b.png"), image_file("c.png")]);

        let mut enhancer = SequentialEnhancer::new(store.clone());
        enhancer.fail_on = Some("b.png".to_string());
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), Arc::new(enhancer)));

        let report = orchestrator.enhance_all().await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);

        let records = store.list();
        assert_eq!(records[0].status.kind(), StatusKind::Success);
        assert_eq!(records[1].status.kind(), StatusKind::Error);
        assert!(records[1].error_detail().unwrap().contains("internal error"));
        assert!(records[1].enhanced().is_none());
        assert_eq!(records[2].status.kind(), StatusKind::Success);
    }

    #[tokio::test]
    async fn test_records_added_during_run_are_excluded() {
        let store = Arc::new(ImageStore::new());
        store.add(vec![image_file("a.png"), image_file("b.png")]);

        let mut enhancer = SequentialEnhancer::new(store.clone());
        enhancer.on_call = Some(Box::new(|store: &ImageStore, call_index: usize| {
            if call_index == 1 {
                store.add(vec![UploadedFile {
                    name: "late.png".to_string(),
                    media_type: Some("image/png".to_string()),
                    data: Bytes::from_static(b"late.png"),
                }]);
            }
        }));
        let enhancer = Arc::new(enhancer);
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), enhancer.clone()));

        let report = orchestrator.enhance_all().await.unwrap();

        assert_eq!(report.total, 2);
        assert_eq!(*enhancer.calls.lock(), vec!["a.png", "b.png"]);
        let late = store.list().into_iter().find(|r| r.name == "late.png").unwrap();
        assert_eq!(late.status, ImageStatus::Idle);
    }

    #[tokio::test]
    async fn test_only_idle_records_are_snapshotted() {
        let store = Arc::new(ImageStore::new());
        let added = store.add(vec![image_file("a.png"), image_file("b.png")]);
        store.update_status(&added[0].id, ImageStatus::Error("earlier".to_string()));

        let enhancer = Arc::new(SequentialEnhancer::new(store.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), enhancer.clone()));
        orchestrator.enhance_all().await.unwrap();

        assert_eq!(*enhancer.calls.lock(), vec!["b.png"]);
        assert_eq!(store.get(&added[0].id).unwrap().error_detail(), Some("earlier"));
    }

    #[tokio::test]
    async fn test_entry_enhanced_elsewhere_is_skipped() {
        let store = Arc::new(ImageStore::new());
        let added = store.add(vec![image_file("a.png"), image_file("b.png")]);
        let b_id = added[1].id.clone();

        let mut enhancer = SequentialEnhancer::new(store.clone());
        enhancer.on_call = Some(Box::new(move |store: &ImageStore, call_index: usize| {
            if call_index == 1 {
                store.update_status(&b_id, ImageStatus::Success(enhanced(b"by hand")));
            }
        }));
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), Arc::new(enhancer)));

        let report = orchestrator.enhance_all().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.succeeded, 1);
        assert_eq!(
            store.get(&added[1].id).unwrap().enhanced().unwrap().data,
            Bytes::from_static(b"by hand")
        );
    }

    #[tokio::test]
    async fn test_missing_credential_goes_straight_to_error() {
        let store = Arc::new(ImageStore::new());
        let id = store.add(vec![image_file("a.png")])[0].id.clone();

        let mut mock = MockImageEnhancer::new();
        mock.expect_check_ready()
            .returning(|| Err(EnhanceError::MissingCredential));
        mock.expect_enhance().never();

        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), Arc::new(mock)));
        let record = orchestrator.enhance_one(&id).await.unwrap();

        assert_eq!(record.status.kind(), StatusKind::Error);
        assert!(record.error_detail().unwrap().contains("API key"));
        assert!(!orchestrator.is_ready());
    }

    #[tokio::test]
    async fn test_enhance_one_with_mock() {
        let store = Arc::new(ImageStore::new());
        let id = store.add(vec![image_file("a.png")])[0].id.clone();

        let mut mock = MockImageEnhancer::new();
        mock.expect_check_ready().returning(|| Ok(()));
        mock.expect_enhance()
            .times(2)
            .returning(|image, _| Ok(enhanced(image)));

        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), Arc::new(mock)));
        let record = orchestrator.enhance_one(&id).await.unwrap();
        assert_eq!(record.status.kind(), StatusKind::Success);

        // A finished image may be enhanced again on request
        let again = orchestrator.enhance_one(&id).await.unwrap();
        assert_eq!(again.status.kind(), StatusKind::Success);
    }

    #[tokio::test]
    async fn test_enhance_one_unknown_id() {
        let store = Arc::new(ImageStore::new());
        let orchestrator = Arc::new(BatchOrchestrator::new(
            store.clone(),
            Arc::new(SequentialEnhancer::new(store.clone())),
        ));

        assert!(matches!(
            orchestrator.enhance_one("missing").await,
            Err(BatchError::Transition(TransitionError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_second_batch_is_refused_while_running() {
        let store = Arc::new(ImageStore::new());
        store.add(vec![image_file("a.png")]);
        let orchestrator = Arc::new(BatchOrchestrator::new(
            store.clone(),
            Arc::new(SequentialEnhancer::new(store.clone())),
        ));

        let run = orchestrator.start().unwrap();
        assert!(orchestrator.is_processing());
        assert!(orchestrator.progress().processing);
        assert!(matches!(orchestrator.start(), Err(BatchError::AlreadyRunning)));

        run.run().await;
        assert!(!orchestrator.is_processing());
        assert!(!orchestrator.progress().processing);
        assert_eq!(orchestrator.progress().completed, 1);
    }

    #[tokio::test]
    async fn test_dropping_a_run_releases_the_slot() {
        let store = Arc::new(ImageStore::new());
        let orchestrator = Arc::new(BatchOrchestrator::new(
            store.clone(),
            Arc::new(SequentialEnhancer::new(store.clone())),
        ));

        drop(orchestrator.start().unwrap());
        assert!(!orchestrator.is_processing());
        tokio_test::assert_ok!(orchestrator.start());
    }

    #[tokio::test]
    async fn test_cancel_stops_before_next_record() {
        let store = Arc::new(ImageStore::new());
        store.add(vec![image_file("a.png"), image_file("b.png"), image_file("c.png")]);

        let enhancer = Arc::new(SequentialEnhancer::new(store.clone()));
        let orchestrator = Arc::new(BatchOrchestrator::new(store.clone(), enhancer.clone()));

        let run = orchestrator.start().unwrap();
        assert!(orchestrator.cancel());
        let report = run.run().await;

        assert!(report.cancelled);
        assert!(enhancer.calls.lock().is_empty());
        assert_eq!(store.idle_ids().len(), 3);
        assert!(!orchestrator.cancel());
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let store = Arc::new(ImageStore::new());
        let orchestrator = Arc::new(BatchOrchestrator::new(
            store.clone(),
            Arc::new(SequentialEnhancer::new(store.clone())),
        ));

        let report = orchestrator.enhance_all().await.unwrap();
        assert_eq!(report.total, 0);
        assert!(!orchestrator.is_processing());
    }
}
