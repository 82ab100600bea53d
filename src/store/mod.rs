use std::{
    sync::{mpsc, Arc, Mutex},
    thread::{self, JoinHandle},
};

use anyhow::{anyhow, bail, Context, Result};
use log::{error, info, warn};
use tokio::sync::oneshot;

mod engines;
mod migrations;

pub use engines::{JsonFileStore, KeyValueStore, MemoryStore, SqliteStore};

use crate::{
    log_error,
    settings::{StorageDriver, StorageSettings},
};

// Worker lifecycle tracing.
const ENABLE_LOGS: bool = true;

type StoreTask = Box<dyn FnOnce(&mut dyn KeyValueStore) + Send + 'static>;

enum StoreCommand {
    Execute(StoreTask),
    Shutdown,
}

struct StoreInner {
    sender: mpsc::Sender<StoreCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let mut guard = match self.worker.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        if let Some(handle) = guard.take() {
            if let Err(err) = self.sender.send(StoreCommand::Shutdown) {
                log_error!("Failed to send shutdown to store thread: {err}");
            }
            // The last handle can be released by a task running on the worker itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if let Err(join_err) = handle.join() {
                log_error!("Failed to join store thread: {join_err:?}");
            }
        }
    }
}

/// Handle to a key/value engine owned by a dedicated worker thread.
///
/// Commands run in submission order, so a `set` followed by a `remove` of the
/// same key always converges to the key being absent.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
    driver: StorageDriver,
}

impl Store {
    /// Opens the first engine in `settings.drivers` that comes up.
    pub fn open(settings: &StorageSettings) -> Result<Self> {
        if settings.drivers.is_empty() {
            bail!("no storage drivers configured");
        }

        let mut last_err = None;
        for driver in &settings.drivers {
            match Self::spawn(*driver, settings) {
                Ok(store) => return Ok(store),
                Err(err) => {
                    warn!(
                        "Storage driver {} unavailable, trying next: {err:#}",
                        driver.as_str()
                    );
                    last_err = Some(err);
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| anyhow!("no storage driver could be opened"))
            .context("all storage drivers failed"))
    }

    fn spawn(driver: StorageDriver, settings: &StorageSettings) -> Result<Self> {
        let (command_tx, command_rx) = mpsc::channel::<StoreCommand>();
        let (ready_tx, ready_rx) = mpsc::channel();
        let settings_for_thread = settings.clone();

        let worker = thread::Builder::new()
            .name(format!("trackchain-{}", driver.as_str()))
            .spawn(move || {
                let mut engine = match open_engine(driver, &settings_for_thread) {
                    Ok(engine) => engine,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };

                if ready_tx.send(Ok(())).is_err() {
                    log_error!("Store initialization receiver dropped before ready signal");
                    return;
                }

                while let Ok(command) = command_rx.recv() {
                    match command {
                        StoreCommand::Execute(task) => task(engine.as_mut()),
                        StoreCommand::Shutdown => break,
                    }
                }

                info!("Store thread ({}) shutting down", driver.as_str());
            })
            .with_context(|| "failed to spawn store worker thread")?;

        let ready = ready_rx
            .recv()
            .context("store worker exited before signaling readiness");
        if let Err(err) = ready.and_then(|result| result) {
            let _ = worker.join();
            return Err(err);
        }

        info!(
            "Cache store opened with {} driver in {}",
            driver.as_str(),
            settings.directory.display()
        );

        Ok(Self {
            inner: Arc::new(StoreInner {
                sender: command_tx,
                worker: Mutex::new(Some(worker)),
            }),
            driver,
        })
    }

    pub fn driver(&self) -> StorageDriver {
        self.driver
    }

    pub async fn execute<F, T>(&self, task: F) -> Result<T>
    where
        F: FnOnce(&mut dyn KeyValueStore) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();

        self.dispatch(Box::new(move |store| {
            let result = task(store);
            if reply_tx.send(result).is_err() {
                error!("Store caller dropped before receiving result");
            }
        }))?;

        reply_rx
            .await
            .map_err(|_| anyhow!("store thread terminated unexpectedly"))?
    }

    /// Queues `task` without waiting for it. Failures are logged under `label`.
    pub fn submit<F>(&self, label: &'static str, task: F)
    where
        F: FnOnce(&mut dyn KeyValueStore) -> Result<()> + Send + 'static,
    {
        let dispatched = self.dispatch(Box::new(move |store| {
            if let Err(err) = task(store) {
                error!("{label} failed: {err:#}");
            }
        }));
        if let Err(err) = dispatched {
            error!("{label} not queued: {err:#}");
        }
    }

    fn dispatch(&self, task: StoreTask) -> Result<()> {
        self.inner
            .sender
            .send(StoreCommand::Execute(task))
            .map_err(|err| anyhow!("failed to send command to store thread: {err}"))
    }
}

fn open_engine(
    driver: StorageDriver,
    settings: &StorageSettings,
) -> Result<Box<dyn KeyValueStore>> {
    let engine: Box<dyn KeyValueStore> = match driver {
        StorageDriver::Sqlite => Box::new(SqliteStore::open(
            settings.directory.join(format!("{}.sqlite3", settings.name)),
            &settings.store_name,
        )?),
        StorageDriver::Json => Box::new(JsonFileStore::open(
            settings
                .directory
                .join(format!("{}.{}.json", settings.name, settings.store_name)),
        )?),
        StorageDriver::Memory => Box::new(MemoryStore::default()),
    };
    Ok(engine)
}
