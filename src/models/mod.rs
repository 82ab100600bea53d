pub mod action;
pub mod report;

pub use action::{ActionDetail, ActionKind, ActionRecord};
pub use report::TrackReport;
