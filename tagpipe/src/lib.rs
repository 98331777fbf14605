//! Streaming stages for time tag data: dead time, sorting, solitary event
//! filtering, counting, correlation, multi-board merging and grouping

pub mod cfg;
pub mod coinc;
pub mod corr;
pub mod count;
pub mod deadtime;
pub mod merge;
pub mod pipeline;
pub mod processor;
pub mod slot;
pub mod solo;
pub mod sort;

pub use coinc::CoincidenceGroup;
pub use corr::{CorrelationCounter, Window};
pub use count::EventCounter;
pub use deadtime::DeadTimeFilter;
pub use merge::{DeadTime, MultiMerge};
pub use pipeline::Pipeline;
pub use solo::SoloFilter;
pub use sort::SortBuffer;

use tagwire::Tag;

/// A stream stage that may hold events back between batches
///
/// `process` takes the next batch and returns whatever the stage is ready
/// to pass on; `flush` returns everything still held at the end of the
/// stream.
pub trait Stage {
    fn process(&mut self, batch: &[Tag]) -> Vec<Tag>;
    fn flush(&mut self) -> Vec<Tag>;
}
