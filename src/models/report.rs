use serde::{Deserialize, Serialize};

use super::ActionRecord;

/// Payload handed to a [`crate::tracker::ChainUploader`].
///
/// Records are correlated server side by session id and user id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TrackReport {
    pub session_id: String,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub tracks: Vec<ActionRecord>,
}
