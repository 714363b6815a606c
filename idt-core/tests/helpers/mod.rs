//! Test Helper Utilities
//!
//! Shared fakes and fixtures for the idt-core integration tests

#![allow(dead_code)]

pub mod fake_backend;
pub mod fake_geocoder;
pub mod fixtures;

pub use fake_backend::FakeBackend;
pub use fake_geocoder::FakeGeocoder;
pub use fixtures::{fast_config, gateway_with, open_sequencer, task, write_jpeg, SequencerSetup};
