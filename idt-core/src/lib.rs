//! idt-core library interface
//!
//! Orchestration core of the image description toolkit: runs a batch of images
//! through geocoding and AI description stages with resumable progress, a shared
//! geocode cache and a live status stream.

pub mod error;
pub mod models;
pub mod services;
pub mod utils;

pub use crate::error::{RunError, RunResult};
pub use crate::models::{FinalOutcome, ImageTask, ItemRecord, WorkflowRun};
pub use crate::services::{GeocodeCache, ProviderGateway, ResumeLedger, StageSequencer, StatusReporter};
