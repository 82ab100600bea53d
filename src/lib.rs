//! Records a bounded, ordered chain of user actions for one browsing session,
//! mirrors it into local storage and lets collectors feed it through a
//! shared context.

pub mod models;
pub mod page;
pub mod plugins;
pub mod settings;
pub mod store;
pub mod tracker;
mod utils;

pub use models::{ActionDetail, ActionKind, ActionRecord, TrackReport};
pub use page::{
    Location, MemoryLocation, MemorySessionStorage, PageEvent, PageEvents, SessionStorage,
};
pub use plugins::{CacheMirror, ElementPlugin, ErrorPlugin, Plugin, RouterPlugin};
pub use settings::{
    ErrorSource, StorageDriver, StorageSettings, TrackOptions, TrackOptionsPatch,
};
pub use tracker::{
    CacheBackend, ChainUploader, ContextState, Environment, NoopUploader, TrackContext, Tracker,
};
pub use utils::init_logging;
