use std::{sync::Arc, time::Instant};

use anyhow::Result;

use super::{Plugin, Subscription, SubscriptionSlot};
use crate::{
    models::{ActionDetail, ActionRecord},
    page::{Location, PageEvent, PageEvents},
    tracker::TrackContext,
};

pub const ROUTER_PLUGIN: &str = "RouterPlugin";

/// Records a Jump whenever a DOM mutation coincides with a changed location.
pub struct RouterPlugin {
    events: Arc<PageEvents>,
    location: Arc<dyn Location>,
    subscription: SubscriptionSlot,
}

impl RouterPlugin {
    pub fn new(events: Arc<PageEvents>, location: Arc<dyn Location>) -> Self {
        Self {
            events,
            location,
            subscription: SubscriptionSlot::default(),
        }
    }
}

impl Plugin for RouterPlugin {
    fn name(&self) -> &str {
        ROUTER_PLUGIN
    }

    fn install(&self, context: Arc<TrackContext>) -> Result<()> {
        let location = self.location.clone();
        let mut route = RouteWatch::new(location.href(), Instant::now());
        let listener_context = context.clone();

        let subscription = Subscription::listen(ROUTER_PLUGIN, self.events.subscribe(), move |event| {
            if event != PageEvent::DomMutated {
                return;
            }
            let previous = route.current_uri.clone();
            if let Some(record) = route.observe(location.href(), Instant::now()) {
                listener_context.log(
                    "Route change",
                    format!("Route change from {previous} to {}", record.current_uri),
                );
                listener_context.add_track_chain(record);
                listener_context.log_json("Add tracking", &listener_context.track_data());
            }
        })?;
        self.subscription.replace(Some(subscription));

        context.log(ROUTER_PLUGIN, format!("{ROUTER_PLUGIN} installed"));
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.subscription.replace(None);
        Ok(())
    }
}

struct RouteWatch {
    current_uri: String,
    entered_at: Instant,
}

impl RouteWatch {
    fn new(current_uri: String, entered_at: Instant) -> Self {
        Self {
            current_uri,
            entered_at,
        }
    }

    fn observe(&mut self, href: String, now: Instant) -> Option<ActionRecord> {
        if href == self.current_uri {
            return None;
        }

        let stay_ms = now.saturating_duration_since(self.entered_at).as_millis();
        let from_uri = std::mem::replace(&mut self.current_uri, href.clone());
        self.entered_at = now;

        Some(ActionRecord::new(
            href,
            ActionDetail::Jump {
                from_uri: Some(from_uri),
                prev_stay_timing: Some(format!("{stay_ms}ms")),
            },
        ))
    }
}
