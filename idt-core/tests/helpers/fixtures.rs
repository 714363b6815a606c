//! Fixture images, configs and sequencer setup

use idt_common::{BackoffConfig, MetadataRecord, ProviderConfig, ProviderKind, RunContext, Stage};
use idt_core::services::{GeocodeCache, ProviderGateway, VisionBackend};
use idt_core::{ImageTask, RunResult, StageSequencer, WorkflowRun};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Write a tiny file that passes the JPEG signature check; the name follows the
/// signature so fake backends can identify it
pub fn write_jpeg(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(format!("{}.jpg", name));
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend_from_slice(name.as_bytes());
    std::fs::write(&path, bytes).unwrap();
    path
}

/// Task with a stable id equal to its name
pub fn task(dir: &Path, name: &str, metadata: Option<MetadataRecord>) -> ImageTask {
    ImageTask::with_id(name, write_jpeg(dir, name), metadata)
}

/// Ollama config with millisecond backoff so retry tests run fast
pub fn fast_config(max_retries: u32) -> ProviderConfig {
    let mut config = ProviderConfig::new(ProviderKind::Ollama, "llava");
    config.max_retries = max_retries;
    config.timeout_ms = 5_000;
    config.max_in_flight = Some(4);
    config.backoff = BackoffConfig {
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter: 0.0,
    };
    config
}

pub fn gateway_with(config: ProviderConfig, backend: Arc<dyn VisionBackend>) -> Arc<ProviderGateway> {
    Arc::new(ProviderGateway::with_backend(config, backend).unwrap())
}

/// Everything a sequencer test varies
pub struct SequencerSetup {
    pub output_dir: PathBuf,
    pub cache_path: PathBuf,
    pub stages: Vec<Stage>,
    pub force: Vec<Stage>,
    pub workers: usize,
    pub config: ProviderConfig,
}

impl SequencerSetup {
    pub fn new(root: &Path) -> Self {
        Self {
            output_dir: root.join("run"),
            cache_path: root.join("geocode_cache.json"),
            stages: vec![Stage::Describe],
            force: Vec::new(),
            workers: 2,
            config: fast_config(2),
        }
    }
}

pub async fn open_sequencer(
    setup: &SequencerSetup,
    backend: Arc<dyn VisionBackend>,
    geocoder: Option<GeocodeCache>,
) -> RunResult<StageSequencer> {
    let ctx = RunContext::new(&setup.output_dir, &setup.cache_path);
    let run = WorkflowRun::new("holiday", setup.stages.clone())?.with_force_rerun(setup.force.clone());
    let gateway = gateway_with(setup.config.clone(), backend);
    StageSequencer::open(ctx, run, gateway, geocoder, None, setup.workers).await
}
