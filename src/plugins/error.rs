use std::sync::Arc;

use anyhow::Result;
use serde_json::Value;

use super::{Plugin, Subscription, SubscriptionSlot};
use crate::{
    models::{ActionDetail, ActionRecord},
    page::{Location, PageEvent, PageEvents},
    settings::ErrorSource,
    tracker::TrackContext,
};

pub const ERROR_PLUGIN: &str = "ErrorPlugin";

/// Message browsers report for cross-origin script failures.
const OPAQUE_SCRIPT_ERROR: &str = "Script error.";
/// Rejection description that marks a reason as not worth recording.
const SKIP: &str = "skip";

/// Records script, promise and resource failures for the enabled sources and
/// asks for an upload after each one.
pub struct ErrorPlugin {
    events: Arc<PageEvents>,
    location: Arc<dyn Location>,
    subscription: SubscriptionSlot,
}

impl ErrorPlugin {
    pub fn new(events: Arc<PageEvents>, location: Arc<dyn Location>) -> Self {
        Self {
            events,
            location,
            subscription: SubscriptionSlot::default(),
        }
    }
}

impl Plugin for ErrorPlugin {
    fn name(&self) -> &str {
        ERROR_PLUGIN
    }

    fn install(&self, context: Arc<TrackContext>) -> Result<()> {
        let options = context.options();
        let location = self.location.clone();
        let listener_context = context.clone();

        let subscription = Subscription::listen(ERROR_PLUGIN, self.events.subscribe(), move |event| {
            let source = match &event {
                PageEvent::ScriptError { .. } => ErrorSource::Script,
                PageEvent::PromiseRejection { .. } => ErrorSource::Promise,
                PageEvent::ResourceError { .. } => ErrorSource::Resource,
                _ => return,
            };
            if !options.tracks_error(source) {
                return;
            }
            if let Some(record) = error_record(event, location.href()) {
                listener_context.add_track_chain(record);
                listener_context.log_json("Add error", &listener_context.track_data());
                listener_context.upload_track_chain();
            }
        })?;
        self.subscription.replace(Some(subscription));

        context.log(ERROR_PLUGIN, format!("{ERROR_PLUGIN} installed"));
        Ok(())
    }

    fn uninstall(&self) -> Result<()> {
        self.subscription.replace(None);
        Ok(())
    }
}

/// Builds the record for an error event, or `None` when the event is not actionable.
pub fn error_record(event: PageEvent, current_uri: String) -> Option<ActionRecord> {
    let detail = match event {
        PageEvent::ScriptError {
            message,
            source,
            lineno,
            stack,
            ..
        } => {
            if message == OPAQUE_SCRIPT_ERROR && source.is_none() {
                return None;
            }
            let name = source
                .as_deref()
                .map(|src| src.rsplit('/').next().unwrap_or(src))
                .unwrap_or("script");
            let lineno = lineno.map_or_else(|| "undefined".to_string(), |n| n.to_string());
            ActionDetail::Error {
                error_type: "script error".into(),
                other_message: Some(format!("{name} with lineno: {lineno}")),
                message,
                stack_info: stack.unwrap_or_default(),
                file: source,
            }
        }
        PageEvent::PromiseRejection { reason } => {
            let message = describe_rejection(&reason);
            if message == SKIP {
                return None;
            }
            ActionDetail::Error {
                error_type: "promise error".into(),
                message,
                stack_info: "promise error!".into(),
                file: None,
                other_message: None,
            }
        }
        PageEvent::ResourceError { outer_html } => ActionDetail::Error {
            error_type: "resource error".into(),
            message: format!("{outer_html} is load error"),
            stack_info: "resource is not found".into(),
            file: None,
            other_message: None,
        },
        _ => return None,
    };

    Some(ActionRecord::new(current_uri, detail))
}

/// Turns a rejection reason into a message.
///
/// Failed requests report their response body; reasons that only carry an
/// event target come from elements we cannot instrument and map to `"skip"`.
pub fn describe_rejection(reason: &Value) -> String {
    match reason {
        Value::Object(fields) => {
            if let Some(request) = fields.get("request") {
                return request
                    .get("responseText")
                    .map(value_text)
                    .unwrap_or_default();
            }
            if fields.contains_key("target") {
                return SKIP.to_string();
            }
            match fields.get("message") {
                Some(message) if !message.is_null() => value_text(message),
                _ => reason.to_string(),
            }
        }
        other => value_text(other),
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
