pub mod controller;
pub mod pruner;
pub mod recorder;

pub use controller::TriggerController;
pub use pruner::{PruneHandle, PruneService, StoragePruner};
pub use recorder::{RecorderHandle, RecorderSettings, SegmentRecorder};
