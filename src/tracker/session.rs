use log::warn;
use uuid::Uuid;

use crate::page::SessionStorage;

/// Session-storage key holding the current session id.
pub const SESSION_ID_KEY: &str = "trackchain_session_id";

/// The session id left by an earlier page load, if any. Blank ids count as absent.
pub fn stored_session_id(storage: &dyn SessionStorage) -> Option<String> {
    storage
        .get_item(SESSION_ID_KEY)
        .filter(|id| !id.trim().is_empty())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    id: String,
    resumed: bool,
}

impl SessionIdentity {
    /// Adopts the id already in session storage, or mints and stores a new one.
    pub fn establish(storage: &dyn SessionStorage) -> Self {
        if let Some(existing) = stored_session_id(storage) {
            return Self {
                id: existing,
                resumed: true,
            };
        }

        let id = Uuid::new_v4().to_string();
        if let Err(err) = storage.set_item(SESSION_ID_KEY, &id) {
            warn!("Failed to persist session id {id}: {err:#}");
        }
        Self { id, resumed: false }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// True when the id came from an earlier page load of the same session.
    pub fn is_resumed(&self) -> bool {
        self.resumed
    }
}
