use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use log::{error, warn};
use tokio::{runtime::Handle, sync::watch};

use super::Plugin;
use crate::{
    models::{ActionKind, ActionRecord},
    page::SessionStorage,
    settings::{StorageDriver, StorageSettings},
    store::{KeyValueStore, Store},
    tracker::{stored_session_id, CacheBackend, TrackContext},
};

pub const CACHE_PLUGIN: &str = "CachePlugin";

/// `<seq padded to 3>_<session id>_<action>`.
pub fn cache_key(action_seq: u64, session_id: &str, kind: ActionKind) -> String {
    format!("{action_seq:03}_{session_id}_{}", kind.as_str())
}

#[derive(Default)]
struct CacheState {
    context: Option<Arc<TrackContext>>,
    store: Option<Store>,
    /// Records loaded during the last rehydration.
    scratch: Vec<ActionRecord>,
}

struct CacheShared {
    settings: StorageSettings,
    session_storage: Arc<dyn SessionStorage>,
    state: Mutex<CacheState>,
    ready: watch::Sender<bool>,
}

/// Write-behind mirror of the chain in local storage.
///
/// Cloning yields another handle to the same mirror.
#[derive(Clone)]
pub struct CacheMirror {
    shared: Arc<CacheShared>,
}

impl CacheMirror {
    pub fn new(settings: StorageSettings, session_storage: Arc<dyn SessionStorage>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            shared: Arc::new(CacheShared {
                settings,
                session_storage,
                state: Mutex::new(CacheState::default()),
                ready,
            }),
        }
    }

    /// Resolves once startup rehydration (or clearing) has been handled.
    pub async fn wait_ready(&self) {
        let mut rx = self.shared.ready.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Waits until every cache operation queued so far has run.
    pub async fn flush(&self) -> Result<()> {
        match self.store() {
            Some(store) => store.execute(|_| Ok(())).await,
            None => Ok(()),
        }
    }

    /// Persisted entries in key order.
    pub async fn entries(&self) -> Result<Vec<(String, ActionRecord)>> {
        let store = self.store().ok_or_else(|| anyhow!("cache store is not open"))?;
        let raw = store.execute(|store| store.entries()).await?;
        Ok(decode_entries(raw))
    }

    pub fn driver(&self) -> Option<StorageDriver> {
        self.store().map(|store| store.driver())
    }

    pub fn rehydrated(&self) -> Vec<ActionRecord> {
        self.lock().scratch.clone()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        match self.shared.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn store(&self) -> Option<Store> {
        self.lock().store.clone()
    }

    /// Store and context, but only while caching is enabled and open.
    fn active(&self) -> Option<(Store, Arc<TrackContext>)> {
        let state = self.lock();
        let context = state.context.clone()?;
        if !context.options().enable_cache {
            return None;
        }
        Some((state.store.clone()?, context))
    }

    fn mark_ready(&self) {
        self.shared.ready.send_replace(true);
    }

    fn init_cache(&self, context: &Arc<TrackContext>) {
        if !context.options().enable_cache {
            self.mark_ready();
            return;
        }

        let store = match Store::open(&self.shared.settings) {
            Ok(store) => store,
            Err(err) => {
                error!("Cache mirror disabled, no storage engine available: {err:#}");
                self.mark_ready();
                return;
            }
        };
        self.lock().store = Some(store.clone());
        context.register_cache(Arc::new(self.clone()));

        // Read storage directly: the context's session id is not established yet.
        if stored_session_id(self.shared.session_storage.as_ref()).is_none() {
            store.submit("Clear cache", |store| store.clear());
            context.log("No SessionID", "clear storage data");
            self.mark_ready();
            return;
        }

        self.rehydrate(store, context.clone());
    }

    fn rehydrate(&self, store: Store, context: Arc<TrackContext>) {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!("Cache rehydration skipped, no tokio runtime: {err}");
                self.mark_ready();
                return;
            }
        };

        let mirror = self.clone();
        runtime.spawn(async move {
            match store.execute(|store| store.entries()).await {
                Ok(raw) => {
                    let mut records: Vec<ActionRecord> =
                        decode_entries(raw).into_iter().map(|(_, record)| record).collect();
                    records.sort_by_key(|record| record.action_seq);

                    mirror.lock().scratch = records.clone();
                    context.overwrite_track_data(records);
                    context.log_json("Get track data", &context.track_data());
                }
                Err(err) => warn!("Failed to read cached track data: {err:#}"),
            }
            mirror.mark_ready();
        });
    }
}

impl CacheBackend for CacheMirror {
    fn set(&self, record: &ActionRecord) {
        let Some((store, context)) = self.active() else {
            return;
        };
        let key = cache_key(record.action_seq, &context.session_id(), record.kind());
        let value = match serde_json::to_string(record) {
            Ok(value) => value,
            Err(err) => {
                error!("Failed to encode track {key}: {err}");
                return;
            }
        };

        store.submit("Set cache", move |store: &mut dyn KeyValueStore| {
            store.set_item(&key, &value)?;
            context.log("Set cache", &key);
            Ok(())
        });
    }

    fn remove(&self, record: &ActionRecord) {
        let Some((store, context)) = self.active() else {
            return;
        };
        let key = cache_key(record.action_seq, &context.session_id(), record.kind());

        store.submit("Remove cache", move |store: &mut dyn KeyValueStore| {
            store.remove_item(&key)?;
            context.log("Remove cache", &key);
            Ok(())
        });
    }
}

impl Plugin for CacheMirror {
    fn name(&self) -> &str {
        CACHE_PLUGIN
    }

    fn install(&self, context: Arc<TrackContext>) -> Result<()> {
        self.shared.ready.send_replace(false);
        {
            let mut state = self.lock();
            state.context = Some(context.clone());
            state.scratch.clear();
        }
        self.init_cache(&context);
        context.log(CACHE_PLUGIN, format!("{CACHE_PLUGIN} installed"));
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        // Take everything out first: dropping the store joins its worker,
        // which may itself be waiting on this lock.
        let released = std::mem::take(&mut *self.lock());
        drop(released);
        Ok(())
    }
}

fn decode_entries(raw: Vec<(String, String)>) -> Vec<(String, ActionRecord)> {
    raw.into_iter()
        .filter_map(|(key, value)| match serde_json::from_str::<ActionRecord>(&value) {
            Ok(record) => Some((key, record)),
            Err(err) => {
                warn!("Skipping unreadable cache entry {key}: {err}");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::ActionDetail,
        page::MemorySessionStorage,
        settings::TrackOptions,
        tracker::{test_context, SESSION_ID_KEY},
    };
    use std::time::Duration;

    fn click(seq: u64) -> ActionRecord {
        ActionRecord {
            action_seq: seq,
            current_uri: "https://example.test/".into(),
            detail: ActionDetail::Click {
                element: Some("A".into()),
                text: Some(format!("link {seq}")),
                classes: None,
                trigger_timing: 1_700_000_000_000 + seq as i64,
            },
        }
    }

    fn seeded_session() -> Arc<MemorySessionStorage> {
        let storage = Arc::new(MemorySessionStorage::default());
        storage.set_item(SESSION_ID_KEY, "sid").unwrap();
        storage
    }

    #[test]
    fn key_is_padded_and_ordered() {
        assert_eq!(cache_key(7, "abc", ActionKind::Click), "007_abc_Click");
        assert_eq!(cache_key(42, "abc", ActionKind::Error), "042_abc_ERROR");
        assert!(cache_key(9, "s", ActionKind::Init) < cache_key(10, "s", ActionKind::Init));
    }

    #[tokio::test]
    async fn appends_are_mirrored_and_evictions_deleted() {
        let dir = tempfile::tempdir().unwrap();
        let (context, chain) = test_context(TrackOptions {
            max_actions: 2,
            ..TrackOptions::default()
        });
        context.publish_session_id("sid");

        let mirror = CacheMirror::new(StorageSettings::in_directory(dir.path()), seeded_session());
        mirror.install(context.clone()).unwrap();
        mirror.wait_ready().await;
        assert_eq!(mirror.driver(), Some(StorageDriver::Sqlite));

        chain.append(ActionRecord::init("https://example.test/"));
        chain.append(click(0));
        chain.append(click(0));
        mirror.flush().await.unwrap();

        let keys: Vec<String> = mirror.entries().await.unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["002_sid_Click", "003_sid_Click"]);
    }

    #[tokio::test]
    async fn rehydration_sorts_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings::in_directory(dir.path());

        let store = Store::open(&settings).unwrap();
        for seq in [3u64, 1, 12, 2] {
            let record = click(seq);
            let key = cache_key(seq, "sid", record.kind());
            let value = serde_json::to_string(&record).unwrap();
            store.submit("seed", move |s| s.set_item(&key, &value));
        }
        store.submit("seed", |s| s.set_item("zzz", "not a record"));
        store.execute(|_| Ok(())).await.unwrap();
        drop(store);

        let (context, chain) = test_context(TrackOptions::default());
        let mirror = CacheMirror::new(settings, seeded_session());
        mirror.install(context.clone()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), mirror.wait_ready())
            .await
            .unwrap();

        let expected: Vec<ActionRecord> = [1u64, 2, 3, 12].into_iter().map(click).collect();
        assert_eq!(chain.snapshot(), expected);
        assert_eq!(context.track_data(), expected);
        assert_eq!(mirror.rehydrated(), expected);
    }

    #[tokio::test]
    async fn missing_session_clears_persisted_entries() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings::in_directory(dir.path());

        let store = Store::open(&settings).unwrap();
        store.submit("seed", |s| s.set_item("001_old_Init", "{}"));
        store.execute(|_| Ok(())).await.unwrap();
        drop(store);

        let (context, chain) = test_context(TrackOptions::default());
        let mirror = CacheMirror::new(settings, Arc::new(MemorySessionStorage::default()));
        mirror.install(context).unwrap();
        mirror.wait_ready().await;
        mirror.flush().await.unwrap();

        assert!(mirror.entries().await.unwrap().is_empty());
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn blank_session_id_counts_as_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings::in_directory(dir.path());

        let store = Store::open(&settings).unwrap();
        let old = ActionRecord::init("https://example.test/");
        let value = serde_json::to_string(&old).unwrap();
        store.submit("seed", move |s| s.set_item("001_old_Init", &value));
        store.execute(|_| Ok(())).await.unwrap();
        drop(store);

        let storage = Arc::new(MemorySessionStorage::default());
        storage.set_item(SESSION_ID_KEY, "").unwrap();

        let (context, chain) = test_context(TrackOptions::default());
        let mirror = CacheMirror::new(settings, storage);
        mirror.install(context).unwrap();
        mirror.wait_ready().await;
        mirror.flush().await.unwrap();

        assert!(mirror.entries().await.unwrap().is_empty());
        assert!(chain.is_empty());
        assert!(mirror.rehydrated().is_empty());
    }

    #[tokio::test]
    async fn disabled_cache_opens_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (context, chain) = test_context(TrackOptions {
            enable_cache: false,
            ..TrackOptions::default()
        });

        let mirror = CacheMirror::new(StorageSettings::in_directory(dir.path()), seeded_session());
        mirror.install(context).unwrap();
        mirror.wait_ready().await;
        chain.append(click(0));

        assert_eq!(mirror.driver(), None);
        assert!(!dir.path().join("trackchain.sqlite3").exists());
    }

    #[tokio::test]
    async fn uninstall_keeps_persisted_data() {
        let dir = tempfile::tempdir().unwrap();
        let settings = StorageSettings::in_directory(dir.path());
        let (context, chain) = test_context(TrackOptions::default());
        context.publish_session_id("sid");

        let mirror = CacheMirror::new(settings.clone(), seeded_session());
        mirror.install(context).unwrap();
        mirror.wait_ready().await;
        chain.append(click(0));
        mirror.uninstall().unwrap();
        assert_eq!(mirror.driver(), None);

        // Writes queued before uninstall still land before the worker exits.
        let store = Store::open(&settings).unwrap();
        let entries = store.execute(|s| s.entries()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, "001_sid_Click");
    }
}
