//! Service modules for the image description pipeline
//!
//! Leaves first: provider gateway and geocode cache, the run-scoped ledger and
//! status stream, then the stage sequencer that drives them.

pub mod file_scanner;
pub mod geocode_cache;
pub mod provider_gateway;
pub mod resume_ledger;
pub mod stage_sequencer;
pub mod status_reporter;

pub use file_scanner::{FileScanner, ScanError};
pub use geocode_cache::{CacheError, CoordKey, GeocodeCache, GeocodeEntry, NominatimGeocoder, ReverseGeocoder};
pub use provider_gateway::{
    BackendReply, DescribeError, ProviderError, ProviderErrorKind, ProviderGateway, VisionBackend,
    VisionRequest,
};
pub use resume_ledger::{LedgerEntry, LedgerError, ResumeLedger, StagePayload};
pub use stage_sequencer::{RunState, RunSummary, StageSequencer, StageTally};
pub use status_reporter::StatusReporter;
