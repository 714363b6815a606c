//! Utility modules for idt-core

pub mod run_lock;

pub use run_lock::RunLock;
