use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};

use anyhow::Result;
use log::{error, warn};

mod chain;
mod context;
mod reactive;
mod session;

pub use chain::{CacheBackend, TrackChain};
pub use context::{ContextHooks, ContextState, TrackContext};
pub use reactive::Reactive;
pub use session::{stored_session_id, SessionIdentity, SESSION_ID_KEY};

use crate::{
    models::{ActionRecord, TrackReport},
    page::{Location, PageEvent, PageEvents, SessionStorage},
    plugins::{CacheMirror, ElementPlugin, ErrorPlugin, Plugin, RouterPlugin, Subscription},
    settings::{StorageSettings, TrackOptions, TrackOptionsPatch},
};

const UNLOAD_LISTENER: &str = "UnloadListener";

/// Receives the chain when a collector asks for an upload.
pub trait ChainUploader: Send + Sync {
    fn upload(&self, report: TrackReport) -> Result<()>;
}

pub struct NoopUploader;

impl ChainUploader for NoopUploader {
    fn upload(&self, _report: TrackReport) -> Result<()> {
        Ok(())
    }
}

/// Everything the tracker needs from the hosting page.
pub struct Environment {
    pub events: Arc<PageEvents>,
    pub location: Arc<dyn Location>,
    pub session_storage: Arc<dyn SessionStorage>,
    pub storage: StorageSettings,
    pub uploader: Arc<dyn ChainUploader>,
}

impl Environment {
    pub fn new(
        events: Arc<PageEvents>,
        location: Arc<dyn Location>,
        session_storage: Arc<dyn SessionStorage>,
        storage: StorageSettings,
    ) -> Self {
        Self {
            events,
            location,
            session_storage,
            storage,
            uploader: Arc::new(NoopUploader),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn ChainUploader>) -> Self {
        self.uploader = uploader;
        self
    }
}

struct HostHooks {
    chain: Arc<TrackChain>,
    state: Arc<Reactive<ContextState>>,
    client_id: Arc<RwLock<String>>,
    uploader: Arc<dyn ChainUploader>,
}

impl ContextHooks for HostHooks {
    fn add_track_chain(&self, record: ActionRecord) {
        self.chain.append(record);
    }

    fn upload_track_chain(&self) {
        let user_id = match self.client_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let report = self.state.get(|state| TrackReport {
            session_id: state.session_id.clone(),
            user_id,
            browser_id: None,
            ip: None,
            tracks: state.track_data.clone(),
        });

        if let Err(err) = self.uploader.upload(report) {
            warn!("Track chain upload failed: {err:#}");
        }
    }

    fn overwrite_track_data(&self, records: Vec<ActionRecord>) {
        self.chain.overwrite(records);
    }

    fn register_cache(&self, cache: Arc<dyn CacheBackend>) {
        self.chain.register_cache(cache);
    }
}

struct TrackerInner {
    env: Environment,
    chain: Arc<TrackChain>,
    context: Arc<TrackContext>,
    client_id: Arc<RwLock<String>>,
    plugins: Mutex<Vec<Arc<dyn Plugin>>>,
    unload: Mutex<Option<Subscription>>,
}

/// One session's tracking engine and plugin host.
///
/// Built once per page by [`Tracker::initialize`] and passed to whoever needs
/// it; clones share the same engine.
#[derive(Clone)]
pub struct Tracker {
    inner: Arc<TrackerInner>,
}

impl Tracker {
    /// Waits for the document, installs the cache mirror, establishes the
    /// session id, seeds the chain with Init and then installs the built-in
    /// collectors.
    pub async fn initialize(env: Environment, options: TrackOptionsPatch) -> Result<Self> {
        env.events.wait_loaded().await;

        let options = TrackOptions::default()
            .merged(options)
            .with_env_overrides();
        let tracker = Self::with_options(env, options);
        let context = tracker.context();
        let env = &tracker.inner.env;

        let cache = CacheMirror::new(env.storage.clone(), env.session_storage.clone());
        tracker.use_plugin(Arc::new(cache.clone()));
        // Collectors must not append before persisted records are restored.
        cache.wait_ready().await;

        context.log_json("Tracking init", &context.options());
        let identity = SessionIdentity::establish(env.session_storage.as_ref());
        context.publish_session_id(identity.id());
        context.log("Create sessionId", identity.id());

        // Seeded before any collector subscribes: cache keys need the session
        // id and Init must lead a fresh chain.
        tracker
            .inner
            .chain
            .append_if_empty(ActionRecord::init(env.location.href()));

        tracker
            .use_plugin(Arc::new(RouterPlugin::new(
                env.events.clone(),
                env.location.clone(),
            )))
            .use_plugin(Arc::new(ElementPlugin::new(
                env.events.clone(),
                env.location.clone(),
            )))
            .use_plugin(Arc::new(ErrorPlugin::new(
                env.events.clone(),
                env.location.clone(),
            )));
        tracker.listen_for_unload()?;

        Ok(tracker)
    }

    /// A bare host with an empty registry and no session id yet.
    pub fn with_options(env: Environment, options: TrackOptions) -> Self {
        let state = Arc::new(Reactive::new(ContextState {
            options: options.clone(),
            ..ContextState::default()
        }));
        let chain = Arc::new(TrackChain::new(options.capacity(), state.clone()));
        let client_id = Arc::new(RwLock::new(String::new()));
        let hooks = Arc::new(HostHooks {
            chain: chain.clone(),
            state: state.clone(),
            client_id: client_id.clone(),
            uploader: env.uploader.clone(),
        });

        Self {
            inner: Arc::new(TrackerInner {
                env,
                chain,
                context: Arc::new(TrackContext::new(state, hooks)),
                client_id,
                plugins: Mutex::new(Vec::new()),
                unload: Mutex::new(None),
            }),
        }
    }

    /// Installs `plugin` unless one with the same name is already registered.
    pub fn use_plugin(&self, plugin: Arc<dyn Plugin>) -> &Self {
        let name = plugin.name().to_string();
        let mut plugins = lock(&self.inner.plugins);

        if plugins.iter().any(|installed| installed.name() == name) {
            warn!("Plugin \"{name}\" is already registered.");
            return self;
        }

        if let Err(err) = plugin.install(self.inner.context.clone()) {
            error!("Failed to install plugin \"{name}\": {err:#}");
            return self;
        }

        plugins.push(plugin);
        self.inner
            .context
            .log("Add plugin", format!("Add plugin [{name}] success."));
        self
    }

    /// Uninstalls every plugin, logging failures without stopping, and
    /// empties the registry.
    pub fn teardown(&self) {
        if let Some(listener) = lock(&self.inner.unload).take() {
            listener.cancel();
        }

        let plugins = std::mem::take(&mut *lock(&self.inner.plugins));
        for plugin in plugins {
            let name = plugin.name().to_string();
            match plugin.uninstall() {
                Ok(()) => self
                    .inner
                    .context
                    .log(&name, format!("{name} unmounted")),
                Err(err) => error!("Error uninstalling plugin \"{name}\": {err:#}"),
            }
        }
    }

    pub fn set_client_id(&self, id: impl Into<String>) {
        let mut guard = match self.inner.client_id.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = id.into();
    }

    pub fn client_id(&self) -> String {
        match self.inner.client_id.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn session_id(&self) -> String {
        self.inner.context.session_id()
    }

    pub fn track_data(&self) -> Vec<ActionRecord> {
        self.inner.chain.snapshot()
    }

    pub fn options(&self) -> TrackOptions {
        self.inner.context.options()
    }

    pub fn context(&self) -> Arc<TrackContext> {
        self.inner.context.clone()
    }

    pub fn plugin_names(&self) -> Vec<String> {
        lock(&self.inner.plugins)
            .iter()
            .map(|plugin| plugin.name().to_string())
            .collect()
    }

    fn listen_for_unload(&self) -> Result<()> {
        let host: Weak<TrackerInner> = Arc::downgrade(&self.inner);

        let listener = Subscription::listen(
            UNLOAD_LISTENER,
            self.inner.env.events.subscribe(),
            move |event| {
                if event != PageEvent::BeforeUnload {
                    return;
                }
                if let Some(inner) = host.upgrade() {
                    Tracker { inner }.teardown();
                }
            },
        )?;

        if let Some(previous) = lock(&self.inner.unload).replace(listener) {
            previous.cancel();
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Context wired to a fresh chain, for exercising plugins in isolation.
#[cfg(test)]
pub(crate) fn test_context(options: TrackOptions) -> (Arc<TrackContext>, Arc<TrackChain>) {
    let state = Arc::new(Reactive::new(ContextState {
        options: options.clone(),
        ..ContextState::default()
    }));
    let chain = Arc::new(TrackChain::new(options.capacity(), state.clone()));
    let hooks = Arc::new(HostHooks {
        chain: chain.clone(),
        state: state.clone(),
        client_id: Arc::new(RwLock::new(String::new())),
        uploader: Arc::new(NoopUploader),
    });
    (Arc::new(TrackContext::new(state, hooks)), chain)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::{MemoryLocation, MemorySessionStorage};
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct NamedPlugin {
        name: &'static str,
        installs: AtomicUsize,
        uninstalls: AtomicUsize,
        fail_uninstall: bool,
    }

    impl NamedPlugin {
        fn new(name: &'static str, fail_uninstall: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                installs: AtomicUsize::new(0),
                uninstalls: AtomicUsize::new(0),
                fail_uninstall,
            })
        }
    }

    impl Plugin for NamedPlugin {
        fn name(&self) -> &str {
            self.name
        }

        fn install(&self, _context: Arc<TrackContext>) -> Result<()> {
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn uninstall(&self) -> Result<()> {
            self.uninstalls.fetch_add(1, Ordering::SeqCst);
            if self.fail_uninstall {
                bail!("{} refused to stop", self.name);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingUploader {
        reports: Mutex<Vec<TrackReport>>,
    }

    impl ChainUploader for RecordingUploader {
        fn upload(&self, report: TrackReport) -> Result<()> {
            self.reports.lock().unwrap().push(report);
            Ok(())
        }
    }

    fn environment() -> Environment {
        Environment::new(
            Arc::new(PageEvents::new()),
            Arc::new(MemoryLocation::new("https://example.test/")),
            Arc::new(MemorySessionStorage::default()),
            StorageSettings::default(),
        )
    }

    #[test]
    fn duplicate_names_are_ignored() {
        let tracker = Tracker::with_options(environment(), TrackOptions::default());
        let first = NamedPlugin::new("X", false);
        let second = NamedPlugin::new("X", false);

        tracker.use_plugin(first.clone()).use_plugin(second.clone());

        assert_eq!(tracker.plugin_names(), vec!["X".to_string()]);
        assert_eq!(first.installs.load(Ordering::SeqCst), 1);
        assert_eq!(second.installs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn teardown_continues_past_failures() {
        let tracker = Tracker::with_options(environment(), TrackOptions::default());
        let failing = NamedPlugin::new("Failing", true);
        let healthy = NamedPlugin::new("Healthy", false);
        tracker.use_plugin(failing.clone()).use_plugin(healthy.clone());

        tracker.teardown();

        assert_eq!(failing.uninstalls.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.uninstalls.load(Ordering::SeqCst), 1);
        assert!(tracker.plugin_names().is_empty());
    }

    #[test]
    fn upload_reports_session_client_and_chain() {
        let uploader = Arc::new(RecordingUploader::default());
        let tracker = Tracker::with_options(
            environment().with_uploader(uploader.clone()),
            TrackOptions::default(),
        );
        let context = tracker.context();
        context.publish_session_id("sid");
        tracker.set_client_id("user-7");

        context.add_track_chain(ActionRecord::init("https://example.test/"));
        context.upload_track_chain();

        let reports = uploader.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].session_id, "sid");
        assert_eq!(reports[0].user_id, "user-7");
        assert_eq!(reports[0].tracks, tracker.track_data());
    }
}
