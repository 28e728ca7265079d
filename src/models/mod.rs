pub mod sample;
pub mod track_item;

pub use sample::Sample;
pub use track_item::{ActivityKind, QueryWindow, Segment, Status, TrackItem, TRANSPARENT};
