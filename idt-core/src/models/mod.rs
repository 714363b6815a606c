//! Data models for idt-core

pub mod image_task;
pub mod item_record;
pub mod workflow_run;

pub use image_task::{ImageFormat, ImageTask};
pub use item_record::{FinalOutcome, ItemRecord};
pub use workflow_run::{RunManifest, WorkflowRun};
