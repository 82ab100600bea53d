use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ActionKind {
    Init,
    Jump,
    Click,
    #[serde(rename = "ERROR")]
    Error,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Init => "Init",
            ActionKind::Jump => "Jump",
            ActionKind::Click => "Click",
            ActionKind::Error => "ERROR",
        }
    }
}

/// Variant payload of an [`ActionRecord`], tagged by the `action` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action")]
pub enum ActionDetail {
    Init,
    #[serde(rename_all = "camelCase")]
    Jump {
        from_uri: Option<String>,
        /// Dwell time on the previous route, formatted as `"<ms>ms"`.
        prev_stay_timing: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Click {
        element: Option<String>,
        text: Option<String>,
        classes: Option<String>,
        /// Epoch milliseconds.
        trigger_timing: i64,
    },
    #[serde(rename = "ERROR", rename_all = "camelCase")]
    Error {
        error_type: String,
        message: String,
        stack_info: String,
        file: Option<String>,
        other_message: Option<String>,
    },
}

/// One entry of the tracking chain.
///
/// `action_seq` is owned by the chain: whatever a collector puts there is
/// replaced on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActionRecord {
    pub action_seq: u64,
    pub current_uri: String,
    #[serde(flatten)]
    pub detail: ActionDetail,
}

impl ActionRecord {
    pub fn new(current_uri: impl Into<String>, detail: ActionDetail) -> Self {
        Self {
            action_seq: 0,
            current_uri: current_uri.into(),
            detail,
        }
    }

    pub fn init(current_uri: impl Into<String>) -> Self {
        Self::new(current_uri, ActionDetail::Init)
    }

    pub fn kind(&self) -> ActionKind {
        match self.detail {
            ActionDetail::Init => ActionKind::Init,
            ActionDetail::Jump { .. } => ActionKind::Jump,
            ActionDetail::Click { .. } => ActionKind::Click,
            ActionDetail::Error { .. } => ActionKind::Error,
        }
    }
}
