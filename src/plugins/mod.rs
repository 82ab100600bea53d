use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

use crate::{log_info, log_warn, page::PageEvent, tracker::TrackContext};

// Listener lifecycle tracing.
const ENABLE_LOGS: bool = true;

pub mod cache;
pub mod element;
pub mod error;
pub mod router;

pub use cache::CacheMirror;
pub use element::ElementPlugin;
pub use error::ErrorPlugin;
pub use router::RouterPlugin;

/// A named collector the host installs against the shared context.
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn install(&self, context: Arc<TrackContext>) -> Result<()>;
    /// Releases every subscription taken in `install`.
    fn uninstall(&self) -> Result<()>;
}

/// A page-event listener task and the token that stops it.
pub(crate) struct Subscription {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

impl Subscription {
    /// Subscribes right away so no event emitted after this call is missed.
    pub(crate) fn listen<F>(
        name: &'static str,
        mut events: broadcast::Receiver<PageEvent>,
        mut handler: F,
    ) -> Result<Self>
    where
        F: FnMut(PageEvent) + Send + 'static,
    {
        let runtime = Handle::try_current()
            .with_context(|| format!("{name} needs a tokio runtime to listen for page events"))?;
        let token = CancellationToken::new();
        let token_clone = token.clone();

        let handle = runtime.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token_clone.cancelled() => {
                        log_info!("{name} listener shutting down");
                        break;
                    }
                    received = events.recv() => match received {
                        Ok(event) => handler(event),
                        Err(RecvError::Lagged(skipped)) => {
                            log_warn!("{name} fell behind; {skipped} page events dropped");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        });

        Ok(Self { token, handle })
    }

    pub(crate) fn cancel(self) {
        self.token.cancel();
        // Not awaited: uninstall is synchronous and the task exits on its own.
        drop(self.handle);
    }
}

/// Slot for a plugin's live subscription, swapped on install/uninstall.
#[derive(Default)]
pub(crate) struct SubscriptionSlot {
    inner: Mutex<Option<Subscription>>,
}

impl SubscriptionSlot {
    pub(crate) fn replace(&self, subscription: Option<Subscription>) {
        let previous = {
            let mut guard = match self.inner.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, subscription)
        };
        if let Some(previous) = previous {
            previous.cancel();
        }
    }

    #[cfg(test)]
    pub(crate) fn is_active(&self) -> bool {
        match self.inner.lock() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }
}
