use std::{fmt::Display, sync::Arc};

use log::{info, warn};
use serde::Serialize;
use tokio::sync::watch;

use super::{chain::CacheBackend, reactive::Reactive};
use crate::{models::ActionRecord, settings::TrackOptions};

/// Data half of the shared context, observable through [`TrackContext::subscribe`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextState {
    pub options: TrackOptions,
    pub track_data: Vec<ActionRecord>,
    pub session_id: String,
}

/// Capabilities the host hands to every plugin through the context.
pub trait ContextHooks: Send + Sync {
    fn add_track_chain(&self, record: ActionRecord);
    fn upload_track_chain(&self);
    fn overwrite_track_data(&self, records: Vec<ActionRecord>);
    fn register_cache(&self, cache: Arc<dyn CacheBackend>);
}

/// The record shared by the host and all installed plugins.
///
/// State is read-only from a plugin's point of view and the callbacks are
/// fixed when the context is built: there is no way to swap them afterwards.
pub struct TrackContext {
    state: Arc<Reactive<ContextState>>,
    hooks: Arc<dyn ContextHooks>,
}

impl TrackContext {
    pub(crate) fn new(state: Arc<Reactive<ContextState>>, hooks: Arc<dyn ContextHooks>) -> Self {
        Self { state, hooks }
    }

    pub fn options(&self) -> TrackOptions {
        self.state.get(|state| state.options.clone())
    }

    pub fn track_data(&self) -> Vec<ActionRecord> {
        self.state.get(|state| state.track_data.clone())
    }

    pub fn track_len(&self) -> usize {
        self.state.get(|state| state.track_data.len())
    }

    pub fn session_id(&self) -> String {
        self.state.get(|state| state.session_id.clone())
    }

    pub fn subscribe(&self) -> watch::Receiver<ContextState> {
        self.state.subscribe()
    }

    /// Diagnostic trace, emitted only when the `log` option is on.
    pub fn log(&self, step: &str, message: impl Display) {
        if self.state.get(|state| state.options.log) {
            info!("[{step}]: {message}");
        }
    }

    pub fn log_json<T: Serialize + ?Sized>(&self, step: &str, value: &T) {
        if !self.state.get(|state| state.options.log) {
            return;
        }
        match serde_json::to_string(value) {
            Ok(json) => info!("[{step}]: {json}"),
            Err(err) => warn!("[{step}]: unserializable trace payload: {err}"),
        }
    }

    pub fn add_track_chain(&self, record: ActionRecord) {
        self.hooks.add_track_chain(record);
    }

    pub fn upload_track_chain(&self) {
        self.hooks.upload_track_chain();
    }

    pub fn overwrite_track_data(&self, records: Vec<ActionRecord>) {
        self.hooks.overwrite_track_data(records);
    }

    pub fn register_cache(&self, cache: Arc<dyn CacheBackend>) {
        self.hooks.register_cache(cache);
    }

    /// Sets the session id once. Later attempts with a different id are ignored.
    pub(crate) fn publish_session_id(&self, session_id: &str) -> bool {
        let mut accepted = false;
        self.state.set(|state| {
            if state.session_id.is_empty() || state.session_id == session_id {
                state.session_id = session_id.to_string();
                accepted = true;
            }
        });
        if !accepted {
            warn!("Session id already established; ignoring {session_id}");
        }
        accepted
    }
}
