use std::{
    path::{Path, PathBuf},
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use log::{error, info, warn};
use rand::Rng;
use rusqlite::{Connection, ErrorCode, Transaction};
use tokio::sync::oneshot;

use super::migrations::run_migrations;
use crate::error::{PipelineError, PipelineResult};

type DbTask = Box<dyn FnOnce(&mut Connection) + Send + 'static>;

enum DbCommand {
    Execute(DbTask),
    Shutdown,
}

struct DatabaseInner {
    sender: mpsc::Sender<DbCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for DatabaseInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(DbCommand::Shutdown) {
                error!("Failed to send shutdown to DB thread: {err}");
            }
            if let Err(join_err) = handle.join() {
                error!("Failed to join DB thread: {join_err:?}");
            }
        }
    }
}

/// Bounded retry for writes that fail with a transient SQLite error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WritePolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 25,
        }
    }
}

impl WritePolicy {
    fn delay(&self, attempt: u32) -> Duration {
        if self.backoff_ms == 0 {
            return Duration::ZERO;
        }
        let base = self.backoff_ms.saturating_mul(u64::from(attempt));
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_ms / 2);
        Duration::from_millis(base + jitter)
    }
}

/// Handle to the SQLite store.
///
/// A single worker thread owns the connection and runs tasks in the order
/// they are sent, so every write is serialized at the transaction boundary.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
    db_path: Option<Arc<PathBuf>>,
    write_policy: WritePolicy,
}

impl Database {
    pub fn new(db_path: PathBuf) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory {}", parent.display())
            })?;
        }

        let path_for_thread = db_path.clone();
        let database = Self::spawn(move || Connection::open(&path_for_thread))?;

        info!("Database initialized at {}", db_path.as_path().display());

        Ok(Self {
            db_path: Some(Arc::new(db_path)),
            ..database
        })
    }

    /// Private in-memory store; data is gone once the last handle drops.
    pub fn in_memory() -> Result<Self> {
        Self::spawn(Connection::open_in_memory)
    }

    fn spawn<F>(open: F) -> Result<Self>
    where
        F: FnOnce() -> rusqlite::Result<Connection> + Send + 'static,
    {
        let (command_tx, command_rx) = mpsc::channel::<DbCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();

        let worker = thread::Builder::new()
            .name("framechat-db".into())
            .spawn(move || {
                let mut conn = match open() {
                    Ok(connection) => connection,
                    Err(err) => {
                        let _ = ready_tx.send(Err(anyhow::Error::new(err)
                            .context("failed to open SQLite database")));
                        return;
                    }
                };

                if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
                    error!("Failed to enable WAL mode: {err}");
                }
                if let Err(err) = conn.pragma_update(None, "foreign_keys", "ON") {
                    error!("Failed to enable foreign keys: {err}");
                }

                let init_result =
                    run_migrations(&mut conn).context("failed to run database migrations");
                if ready_tx.send(init_result).is_err() {
                    error!("DB initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        DbCommand::Execute(task) => {
                            task(&mut conn);
                        }
                        DbCommand::Shutdown => break,
                    }
                }

                info!("Database thread shutting down");
            })
            .with_context(|| "failed to spawn database worker thread")?;

        ready_rx
            .recv()
            .context("database worker exited before signaling readiness")??;

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            db_path: None,
            write_policy: WritePolicy::default(),
        })
    }

    pub fn with_write_policy(mut self, policy: WritePolicy) -> Self {
        self.write_policy = WritePolicy {
            max_attempts: policy.max_attempts.max(1),
            ..policy
        };
        self
    }

    pub fn path(&self) -> Option<&Path> {
        self.db_path.as_deref().map(PathBuf::as_path)
    }

    pub fn write_policy(&self) -> WritePolicy {
        self.write_policy
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let sender = self.inner.sender.clone();
        let (reply_tx, reply_rx) = oneshot::channel();

        let command = DbCommand::Execute(Box::new(move |conn| {
            let result = task(conn);
            if reply_tx.send(result).is_err() {
                error!("DB caller dropped before receiving result");
            }
        }));

        sender
            .send(command)
            .map_err(|err| anyhow!("failed to send command to DB thread: {err}"))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("database thread terminated unexpectedly"))?
    }

    /// Run a read task, converting failures into [`PipelineError`].
    pub async fn read<F, T>(&self, operation: &'static str, task: F) -> PipelineResult<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute(task)
            .await
            .map_err(|err| PipelineError::from_store(operation, 1, err))
    }

    /// Run a write task, retrying transient SQLite failures in place.
    ///
    /// Retries happen on the database thread before it takes the next
    /// command, so no other write can slip in between attempts.
    pub async fn execute_write<F, T>(&self, operation: &'static str, mut task: F) -> PipelineResult<T>
    where
        F: FnMut(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let policy = self.write_policy;
        let outcome = self
            .execute(move |conn| {
                let mut attempt = 1;
                loop {
                    match task(conn) {
                        Ok(value) => return Ok(Ok(value)),
                        Err(err) if attempt < policy.max_attempts && is_transient(&err) => {
                            warn!(
                                "{operation} attempt {attempt}/{} hit a transient error, retrying: {err:#}",
                                policy.max_attempts
                            );
                            thread::sleep(policy.delay(attempt));
                            attempt += 1;
                        }
                        Err(err) => return Ok(Err((err, attempt))),
                    }
                }
            })
            .await;

        match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err((err, attempts))) => {
                let converted = PipelineError::from_store(operation, attempts, err);
                if matches!(converted, PipelineError::Persistence { .. }) {
                    error!("{converted}");
                }
                Err(converted)
            }
            Err(err) => Err(PipelineError::from_store(operation, 1, err)),
        }
    }

    /// Run `work` inside one SQLite transaction.
    ///
    /// Everything `work` writes commits together. Any error it returns,
    /// including a validation failure halfway through a batch, drops the
    /// transaction and rolls all of it back.
    pub async fn transaction<F, T>(&self, operation: &'static str, mut work: F) -> PipelineResult<T>
    where
        F: FnMut(&mut StoreTx<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.execute_write(operation, move |conn| {
            let tx = conn
                .transaction()
                .context("failed to open transaction")?;
            let mut handle = StoreTx { tx };
            let value = work(&mut handle)?;
            handle.tx.commit().context("failed to commit transaction")?;
            Ok(value)
        })
        .await
    }
}

/// Scoped write handle passed to [`Database::transaction`].
pub struct StoreTx<'conn> {
    pub(crate) tx: Transaction<'conn>,
}

impl StoreTx<'_> {
    pub fn connection(&self) -> &Connection {
        &self.tx
    }
}

fn is_transient(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| match cause.downcast_ref::<rusqlite::Error>() {
        Some(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::DiskFull
        ),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ValidationError;

    fn busy_error() -> anyhow::Error {
        anyhow::Error::new(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        ))
        .context("failed to insert")
    }

    fn fast_policy() -> WritePolicy {
        WritePolicy {
            max_attempts: 3,
            backoff_ms: 0,
        }
    }

    #[tokio::test]
    async fn transient_write_errors_are_retried() {
        let db = Database::in_memory().unwrap().with_write_policy(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let value = db
            .execute_write("flaky_write", move |_conn| {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy_error())
                } else {
                    Ok(42)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_are_bounded_and_surface_persistence_error() {
        let db = Database::in_memory().unwrap().with_write_policy(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = db
            .execute_write("always_busy", move |_conn| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(busy_error())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(matches!(
            err,
            PipelineError::Persistence { attempts: 3, ref operation, .. } if operation == "always_busy"
        ));
    }

    #[tokio::test]
    async fn validation_errors_are_not_retried() {
        let db = Database::in_memory().unwrap().with_write_policy(fast_policy());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let err = db
            .execute_write("bad_record", move |_conn| -> Result<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ValidationError::new("text", "must not be empty").into())
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn failed_transaction_rolls_back_earlier_writes() {
        let db = Database::in_memory().unwrap();
        let result = db
            .transaction("partial_batch", |store| -> Result<()> {
                store.connection().execute(
                    "INSERT INTO videos (id, filename, storage_path, uploaded_at, status, updated_at)
                     VALUES ('v1', 'a.mp4', '/tmp/a.mp4', '2024-01-01T00:00:00Z', 'pending', '2024-01-01T00:00:00Z')",
                    [],
                )?;
                Err(ValidationError::new("confidence", "must be within [0, 1]").into())
            })
            .await;
        assert!(result.is_err());

        let count: i64 = db
            .execute(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM videos", [], |row| row.get(0))?)
            })
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn file_database_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("framechat.sqlite3");
        let db = Database::new(path.clone()).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());
    }
}
