//! Boundary to the hosting page: its event stream, location and
//! session-scoped storage. Real embeddings forward browser events into
//! [`PageEvents`]; tests drive it directly.

use std::{collections::HashMap, sync::RwLock};

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, watch};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PageEvent {
    /// The document tree changed; the route may have moved.
    DomMutated,
    Click {
        element: Option<String>,
        text: Option<String>,
        classes: Option<String>,
    },
    ScriptError {
        message: String,
        source: Option<String>,
        lineno: Option<u32>,
        colno: Option<u32>,
        stack: Option<String>,
    },
    PromiseRejection {
        reason: Value,
    },
    ResourceError {
        outer_html: String,
    },
    BeforeUnload,
}

pub struct PageEvents {
    sender: broadcast::Sender<PageEvent>,
    loaded: watch::Sender<bool>,
}

impl Default for PageEvents {
    fn default() -> Self {
        Self::new()
    }
}

impl PageEvents {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        let (loaded, _) = watch::channel(false);
        Self { sender, loaded }
    }

    /// Delivers `event` to every live subscriber. Returns how many saw it.
    pub fn emit(&self, event: PageEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PageEvent> {
        self.sender.subscribe()
    }

    pub fn mark_loaded(&self) {
        self.loaded.send_replace(true);
    }

    pub async fn wait_loaded(&self) {
        let mut rx = self.loaded.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|loaded| *loaded).await;
    }
}

pub trait Location: Send + Sync {
    fn href(&self) -> String;
}

#[derive(Default)]
pub struct MemoryLocation {
    href: RwLock<String>,
}

impl MemoryLocation {
    pub fn new(href: impl Into<String>) -> Self {
        Self {
            href: RwLock::new(href.into()),
        }
    }

    pub fn navigate(&self, href: impl Into<String>) {
        let mut guard = match self.href.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = href.into();
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> String {
        match self.href.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

/// Storage scoped to one browser session (tab lifetime).
pub trait SessionStorage: Send + Sync {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&self, key: &str, value: &str) -> Result<()>;
    fn remove_item(&self, key: &str);
    fn clear(&self);
}

#[derive(Default)]
pub struct MemorySessionStorage {
    items: RwLock<HashMap<String, String>>,
}

impl SessionStorage for MemorySessionStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.read().ok()?.get(key).cloned()
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.items
            .write()
            .map_err(|_| anyhow!("session storage lock poisoned"))?
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove_item(&self, key: &str) {
        if let Ok(mut items) = self.items.write() {
            items.remove(key);
        }
    }

    fn clear(&self) {
        if let Ok(mut items) = self.items.write() {
            items.clear();
        }
    }
}
