//! Conversion pipeline: tiled batched inference and the file-level orchestrator.

mod batch;
mod convert;
mod device;
mod inference;
mod queue;
mod tasks;

pub use batch::{
    convert_file, convert_files, BatchOptions, BatchReport, FileFailure, DEFAULT_QUEUE_CAPACITY,
};
pub use convert::{ConvertedImage, Converter};
pub use device::DevicePool;
pub use inference::{infer_batch, Augmentation, InferenceOptions, TTA_AUGMENTATIONS};
pub use queue::{CancelFlag, LoadQueue, QueueStats, Queued};
pub use tasks::{TaskGroup, TaskId, TaskOutcome};
