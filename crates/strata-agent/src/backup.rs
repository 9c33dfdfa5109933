//! Single-flight backup execution
//!
//! At most one backup runs per agent. Accepting a request records it as
//! `Waiting` and flips the service-wide flag to `Running` under one lock;
//! a second request while the flag is set is a conflict. The worker dumps,
//! pushes, and records the final state, then frees the slot. The ledger
//! lock is only held for bookkeeping, never across dump or push I/O.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use strata_common::agent::{BackupRecord, BackupState, CreateBackupRequest};

use crate::dump::{DumpError, Dumper};
use crate::storage::{StorageError, StorageRegistry};

/// Terminal records kept for `list_backups`
const MAX_FINISHED_RECORDS: usize = 100;

/// Failures accepting or running a backup
#[derive(Debug, Error)]
pub enum BackupError {
    /// Another backup is in progress
    #[error("backup {0} is already in progress")]
    Conflict(Uuid),

    /// The backup was cancelled before it finished
    #[error("cancelled")]
    Cancelled,

    /// Dumping the database failed
    #[error(transparent)]
    Dump(#[from] DumpError),

    /// Pushing the dump failed
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The record vanished from the ledger
    #[error("backup {0} not found")]
    NotFound(Uuid),

    /// The worker task panicked or was aborted
    #[error("backup worker failed: {0}")]
    Worker(String),
}

#[derive(Default)]
struct Ledger {
    flag: BackupState,
    current: Option<Uuid>,
    records: Vec<BackupRecord>,
}

impl Ledger {
    fn record_mut(&mut self, id: Uuid) -> Option<&mut BackupRecord> {
        self.records.iter_mut().find(|r| r.id == id)
    }

    fn prune(&mut self) {
        let finished = self
            .records
            .iter()
            .filter(|r| r.status.is_terminal())
            .count();
        let mut excess = finished.saturating_sub(MAX_FINISHED_RECORDS);
        self.records.retain(|r| {
            if excess > 0 && r.status.is_terminal() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

struct Inner {
    ledger: Mutex<Ledger>,
    dumper: Arc<dyn Dumper>,
    storage: StorageRegistry,
    work_dir: PathBuf,
}

impl Inner {
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_running(&self, id: Uuid) {
        if let Some(record) = self.ledger().record_mut(id) {
            record.status = BackupState::Running;
        }
    }

    async fn execute(&self, id: Uuid, request: &CreateBackupRequest) -> Result<(), BackupError> {
        let path = self.dump_path(id);
        self.dumper.dump(&path).await?;
        self.storage
            .push(
                &request.backend,
                &request.bucket,
                &request.location,
                &path,
                &request.variables,
            )
            .await?;
        Ok(())
    }

    fn dump_path(&self, id: Uuid) -> PathBuf {
        self.work_dir.join(format!("{id}.sql"))
    }

    fn finish(
        &self,
        id: Uuid,
        result: Result<(), BackupError>,
    ) -> Result<BackupRecord, BackupError> {
        let mut ledger = self.ledger();
        if ledger.current == Some(id) {
            ledger.flag = BackupState::Waiting;
            ledger.current = None;
        }
        let record = ledger.record_mut(id).ok_or(BackupError::NotFound(id))?;
        record.end_time = Some(Utc::now());
        match result {
            Ok(()) => {
                record.status = BackupState::Succeeded;
                info!(backup = %id, location = %record.location, "backup succeeded");
            }
            Err(e) => {
                record.status = BackupState::Failed;
                record.message = e.to_string();
                error!(backup = %id, error = %e, "backup failed");
            }
        }
        let finished = record.clone();
        ledger.prune();
        Ok(finished)
    }
}

async fn run(
    inner: Arc<Inner>,
    id: Uuid,
    request: CreateBackupRequest,
    cancel: CancellationToken,
) -> Result<BackupRecord, BackupError> {
    inner.mark_running(id);
    debug!(backup = %id, backend = %request.backend, "backup worker started");

    let result = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled),
        result = inner.execute(id, &request) => result,
    };

    match tokio::fs::remove_file(inner.dump_path(id)).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(backup = %id, error = %e, "failed to remove dump file"),
    }
    inner.finish(id, result)
}

/// Join and cancel handle for a running backup
pub struct BackupHandle {
    id: Uuid,
    join: JoinHandle<Result<BackupRecord, BackupError>>,
    cancel: CancellationToken,
}

impl BackupHandle {
    /// Id of the backup this handle controls
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Wait for the worker and return the final record
    pub async fn wait(self) -> Result<BackupRecord, BackupError> {
        self.join
            .await
            .map_err(|e| BackupError::Worker(e.to_string()))?
    }

    /// Stop the backup, fail its record, and free the slot.
    ///
    /// A backup that already finished keeps its outcome.
    pub async fn cancel(self) -> Result<BackupRecord, BackupError> {
        info!(backup = %self.id, "cancelling backup");
        self.cancel.cancel();
        self.wait().await
    }
}

/// An accepted backup: the record as accepted plus its handle
pub struct BackupTicket {
    /// Record at acceptance time
    pub record: BackupRecord,
    /// Control over the running worker
    pub handle: BackupHandle,
}

/// Accepts and runs backups, one at a time
#[derive(Clone)]
pub struct BackupService {
    inner: Arc<Inner>,
}

impl BackupService {
    /// Service dumping with `dumper` into `work_dir` and pushing through `storage`
    pub fn new(
        dumper: Arc<dyn Dumper>,
        storage: StorageRegistry,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                ledger: Mutex::new(Ledger::default()),
                dumper,
                storage,
                work_dir: work_dir.into(),
            }),
        }
    }

    /// Accept a backup and start its worker
    pub fn create_backup(&self, request: CreateBackupRequest) -> Result<BackupTicket, BackupError> {
        let record = {
            let mut ledger = self.inner.ledger();
            if ledger.flag != BackupState::Waiting {
                let current = ledger.current.unwrap_or_default();
                debug!(current = %current, "backup rejected, slot busy");
                return Err(BackupError::Conflict(current));
            }
            let record = BackupRecord {
                id: Uuid::new_v4(),
                bucket: request.bucket.clone(),
                location: request.location.clone(),
                status: BackupState::Waiting,
                start_time: Utc::now(),
                end_time: None,
                message: String::new(),
            };
            ledger.records.push(record.clone());
            ledger.flag = BackupState::Running;
            ledger.current = Some(record.id);
            record
        };
        info!(
            backup = %record.id,
            bucket = %record.bucket,
            location = %record.location,
            "backup accepted"
        );

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run(
            self.inner.clone(),
            record.id,
            request,
            cancel.clone(),
        ));
        Ok(BackupTicket {
            handle: BackupHandle {
                id: record.id,
                join,
                cancel,
            },
            record,
        })
    }

    /// Snapshot of one record
    pub fn get_backup(&self, id: Uuid) -> Option<BackupRecord> {
        self.inner.ledger().records.iter().find(|r| r.id == id).cloned()
    }

    /// Snapshot of all records, oldest first
    pub fn list_backups(&self) -> Vec<BackupRecord> {
        self.inner.ledger().records.clone()
    }

    /// Whether a backup currently holds the slot
    pub fn is_busy(&self) -> bool {
        self.inner.ledger().flag != BackupState::Waiting
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::dump::MockDumper;
    use crate::storage::MockStorageBackend;

    fn request(backend: &str) -> CreateBackupRequest {
        CreateBackupRequest {
            backend: backend.to_string(),
            bucket: "archive".to_string(),
            location: "pg-main/1.sql".to_string(),
            variables: Default::default(),
        }
    }

    fn accepting_storage() -> StorageRegistry {
        let mut backend = MockStorageBackend::new();
        backend
            .expect_push()
            .withf(|bucket, location, _, _| bucket == "archive" && location == "pg-main/1.sql")
            .returning(|_, _, _, _| Ok(()));
        let mut registry = StorageRegistry::new();
        registry.register("mock", Arc::new(backend));
        registry
    }

    fn instant_dumper() -> Arc<dyn Dumper> {
        let mut dumper = MockDumper::new();
        dumper.expect_dump().returning(|_| Ok(()));
        Arc::new(dumper)
    }

    /// Dumper that blocks until released
    struct GatedDumper {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl Dumper for GatedDumper {
        async fn dump(&self, _destination: &Path) -> Result<(), DumpError> {
            self.gate.notified().await;
            Ok(())
        }
    }

    fn gated() -> (Arc<dyn Dumper>, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        (Arc::new(GatedDumper { gate: gate.clone() }), gate)
    }

    #[tokio::test]
    async fn backup_succeeds_and_frees_the_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = BackupService::new(instant_dumper(), accepting_storage(), dir.path());

        let ticket = service.create_backup(request("mock")).expect("accepted");
        assert_eq!(ticket.record.status, BackupState::Waiting);
        let record = ticket.handle.wait().await.expect("worker");

        assert_eq!(record.status, BackupState::Succeeded);
        assert!(record.end_time.is_some());
        assert!(record.message.is_empty());
        assert!(!service.is_busy());
        assert_eq!(service.get_backup(record.id), Some(record));
    }

    #[tokio::test]
    async fn second_backup_conflicts_while_one_runs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (dumper, gate) = gated();
        let service = BackupService::new(dumper, accepting_storage(), dir.path());

        let first = service.create_backup(request("mock")).expect("accepted");
        let err = service
            .create_backup(request("mock"))
            .err()
            .expect("conflict");
        assert!(matches!(err, BackupError::Conflict(id) if id == first.record.id));
        assert_eq!(service.list_backups().len(), 1);

        gate.notify_one();
        first.handle.wait().await.expect("worker");

        let again = service.create_backup(request("mock")).expect("slot freed");
        assert_ne!(again.record.id, first.record.id);
        gate.notify_one();
        again.handle.wait().await.expect("worker");
        assert_eq!(service.list_backups().len(), 2);
    }

    #[tokio::test]
    async fn unknown_backend_fails_the_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let service = BackupService::new(instant_dumper(), StorageRegistry::new(), dir.path());

        let ticket = service.create_backup(request("s3")).expect("accepted");
        let record = ticket.handle.wait().await.expect("worker");
        assert_eq!(record.status, BackupState::Failed);
        assert!(record.message.contains("unknown storage backend"));
        assert!(!service.is_busy());
    }

    #[tokio::test]
    async fn dump_failure_fails_the_record() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut dumper = MockDumper::new();
        dumper.expect_dump().returning(|_| {
            Err(DumpError::Failed {
                code: Some(1),
                stderr: "connection refused".to_string(),
            })
        });
        let service = BackupService::new(Arc::new(dumper), accepting_storage(), dir.path());

        let record = service
            .create_backup(request("mock"))
            .expect("accepted")
            .handle
            .wait()
            .await
            .expect("worker");
        assert_eq!(record.status, BackupState::Failed);
        assert!(record.message.contains("connection refused"));
    }

    #[tokio::test]
    async fn cancel_fails_the_record_and_frees_the_slot() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (dumper, _gate) = gated();
        let service = BackupService::new(dumper, accepting_storage(), dir.path());

        let ticket = service.create_backup(request("mock")).expect("accepted");
        assert!(service.is_busy());
        let record = ticket.handle.cancel().await.expect("worker");

        assert_eq!(record.status, BackupState::Failed);
        assert_eq!(record.message, "cancelled");
        assert!(!service.is_busy());
        assert_eq!(
            service.get_backup(record.id).map(|r| r.status),
            Some(BackupState::Failed)
        );
    }

    #[test]
    fn unknown_id_has_no_record() {
        let service = BackupService::new(instant_dumper(), StorageRegistry::new(), "/unused");
        assert_eq!(service.get_backup(Uuid::new_v4()), None);
        assert!(service.list_backups().is_empty());
    }

    #[test]
    fn ledger_prunes_only_the_oldest_finished_records() {
        let mut ledger = Ledger::default();
        let record = |status| BackupRecord {
            id: Uuid::new_v4(),
            bucket: String::new(),
            location: String::new(),
            status,
            start_time: Utc::now(),
            end_time: None,
            message: String::new(),
        };
        let running = record(BackupState::Running);
        ledger.records.push(running.clone());
        for _ in 0..MAX_FINISHED_RECORDS + 5 {
            ledger.records.push(record(BackupState::Succeeded));
        }
        let newest = ledger.records.last().cloned().expect("records");

        ledger.prune();
        assert_eq!(ledger.records.len(), MAX_FINISHED_RECORDS + 1);
        assert_eq!(ledger.records[0], running);
        assert_eq!(ledger.records.last(), Some(&newest));
    }
}
