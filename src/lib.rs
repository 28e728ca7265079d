//! worktrace is the activity interval engine of a desktop time tracker:
//! it folds a stream of foreground-activity samples into non-overlapping
//! per-kind `TrackItem` intervals, persists them in SQLite, survives
//! system suspend/resume, and reconstructs clamped, gap-filled timelines
//! for charting and aggregation.
//!
//! The GUI shell, OS polling, and power-signal plumbing live outside this
//! crate; hosts provide a [`SampleSource`] and forward suspend/resume
//! notifications to the [`TrackingController`].

pub mod db;
pub mod errors;
pub mod models;
pub mod settings;
pub mod timeline;
pub mod tracking;

pub use db::{Database, TrackItemStore};
pub use errors::EngineError;
pub use models::{ActivityKind, QueryWindow, Sample, Segment, Status, TrackItem};
pub use settings::{SettingsStore, TrackerSettings};
pub use tracking::{SampleSource, TrackingController};
