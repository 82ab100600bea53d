use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::{Plugin, Subscription, SubscriptionSlot};
use crate::{
    models::{ActionDetail, ActionRecord},
    page::{Location, PageEvent, PageEvents},
    tracker::TrackContext,
};

pub const ELEMENT_PLUGIN: &str = "ElementPlugin";

/// Records every click captured on the page.
pub struct ElementPlugin {
    events: Arc<PageEvents>,
    location: Arc<dyn Location>,
    subscription: SubscriptionSlot,
}

impl ElementPlugin {
    pub fn new(events: Arc<PageEvents>, location: Arc<dyn Location>) -> Self {
        Self {
            events,
            location,
            subscription: SubscriptionSlot::default(),
        }
    }
}

impl Plugin for ElementPlugin {
    fn name(&self) -> &str {
        ELEMENT_PLUGIN
    }

    fn install(&self, context: Arc<TrackContext>) -> Result<()> {
        let location = self.location.clone();
        let listener_context = context.clone();

        let subscription = Subscription::listen(ELEMENT_PLUGIN, self.events.subscribe(), move |event| {
            let PageEvent::Click {
                element,
                text,
                classes,
            } = event
            else {
                return;
            };

            listener_context.add_track_chain(ActionRecord::new(
                location.href(),
                ActionDetail::Click {
                    element,
                    text,
                    classes,
                    trigger_timing: Utc::now().timestamp_millis(),
                },
            ));
            listener_context.log_json("Click element", &listener_context.track_data());
        })?;
        self.subscription.replace(Some(subscription));

        context.log(ELEMENT_PLUGIN, format!("{ELEMENT_PLUGIN} installed"));
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.subscription.replace(None);
        Ok(())
    }
}
