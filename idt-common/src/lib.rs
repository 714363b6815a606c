//! # IDT Common Library
//!
//! Shared code for the image description toolkit crates:
//! - Domain types (stages, outcomes, item ids, metadata records)
//! - Status event types and the in-process EventBus
//! - Provider configuration, validation and the TOML config model
//! - Prompt templates
//! - Error types

pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod prompts;

pub use config::{BackoffConfig, ProviderConfig, ProviderKind, RunContext};
pub use error::{ConfigError, Error, Result};
pub use events::{EventBus, StatusEvent};
pub use models::{
    Coordinate, DescriptionResult, ItemId, MetadataRecord, Stage, StageOutcome, TokenUsage,
};
