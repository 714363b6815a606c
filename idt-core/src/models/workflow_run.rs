//! Workflow run definition and its on-disk manifest
//!
//! A `WorkflowRun` names one batch execution. Once written to `run.json` the stage
//! list and provider identity are fixed; later processes resuming the same output
//! directory must request the same ones.

use crate::error::{RunError, RunResult};
use chrono::{DateTime, Utc};
use idt_common::{ConfigError, ProviderConfig, RunContext, Stage};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// One batch execution
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRun {
    pub run_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    stages: Vec<Stage>,
    force: BTreeSet<Stage>,
}

impl WorkflowRun {
    /// Define a run with an ordered stage list
    ///
    /// The list must be non-empty and must not name a stage twice.
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::invalid("run.stages", "at least one stage is required"));
        }
        let mut seen = BTreeSet::new();
        for stage in &stages {
            if !seen.insert(*stage) {
                return Err(ConfigError::invalid(
                    "run.stages",
                    format!("stage '{}' listed more than once", stage),
                ));
            }
        }

        Ok(Self {
            run_id: Uuid::new_v4(),
            name: name.into(),
            created_at: Utc::now(),
            stages,
            force: BTreeSet::new(),
        })
    }

    /// Re-run the given stages for every item, ignoring recorded outcomes
    pub fn with_force_rerun(mut self, stages: impl IntoIterator<Item = Stage>) -> Self {
        self.force.extend(stages);
        self
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn is_forced(&self, stage: Stage) -> bool {
        self.force.contains(&stage)
    }

    /// Adopt the identity of a previously started run
    fn adopt(&mut self, manifest: &RunManifest) {
        self.run_id = manifest.run_id;
        self.created_at = manifest.created_at;
    }
}

/// Contents of `<output_dir>/run.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
    pub provider: String,
    pub model: String,
    pub prompt_style: String,
}

impl RunManifest {
    fn describe(run: &WorkflowRun, provider: &ProviderConfig) -> Self {
        Self {
            run_id: run.run_id,
            name: run.name.clone(),
            created_at: run.created_at,
            stages: run.stages.clone(),
            provider: provider.provider.as_str().to_string(),
            model: provider.model.clone(),
            prompt_style: provider.prompt_style.clone(),
        }
    }

    /// Load the manifest for a resumed run, or write one for a fresh run
    ///
    /// On resume the run keeps its original id and creation time. A different stage
    /// list or provider identity is rejected with a `ConfigError`.
    pub fn load_or_create(
        ctx: &RunContext,
        run: &mut WorkflowRun,
        provider: &ProviderConfig,
    ) -> RunResult<Self> {
        let path = ctx.manifest_path();
        let requested = Self::describe(run, provider);

        if !path.exists() {
            write_atomic(&path, &requested)?;
            tracing::info!(run_id = %run.run_id, path = %path.display(), "Created run manifest");
            return Ok(requested);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| RunError::io(&path, e))?;
        let existing: RunManifest = serde_json::from_str(&content).map_err(|e| {
            RunError::Manifest {
                path: path.clone(),
                source: e,
            }
        })?;

        existing.check_compatible(&requested)?;
        run.adopt(&existing);

        tracing::info!(
            run_id = %existing.run_id,
            created_at = %existing.created_at,
            "Resuming existing run"
        );
        Ok(existing)
    }

    fn check_compatible(&self, requested: &RunManifest) -> Result<(), ConfigError> {
        if self.stages != requested.stages {
            return Err(ConfigError::ManifestMismatch {
                field: "stages".to_string(),
                existing: join_stages(&self.stages),
                requested: join_stages(&requested.stages),
            });
        }

        let fields = [
            ("provider", &self.provider, &requested.provider),
            ("model", &self.model, &requested.model),
            ("prompt_style", &self.prompt_style, &requested.prompt_style),
        ];
        for (field, existing, wanted) in fields {
            if existing != wanted {
                return Err(ConfigError::ManifestMismatch {
                    field: field.to_string(),
                    existing: existing.clone(),
                    requested: wanted.clone(),
                });
            }
        }
        Ok(())
    }
}

fn join_stages(stages: &[Stage]) -> String {
    stages
        .iter()
        .map(Stage::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

fn write_atomic(path: &Path, manifest: &RunManifest) -> RunResult<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let json = serde_json::to_vec_pretty(manifest).map_err(|e| RunError::Manifest {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RunError::io(dir, e))?;
    tmp.write_all(&json).map_err(|e| RunError::io(tmp.path(), e))?;
    tmp.as_file().sync_all().map_err(|e| RunError::io(path, e))?;
    tmp.persist(path).map_err(|e| RunError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use idt_common::ProviderKind;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> RunContext {
        RunContext::new(dir.path(), dir.path().join("geo.json"))
    }

    fn provider() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Ollama, "llava")
    }

    #[test]
    fn test_stage_list_validation() {
        assert!(WorkflowRun::new("empty", vec![]).is_err());
        assert!(WorkflowRun::new("dup", vec![Stage::Describe, Stage::Describe]).is_err());
        let run = WorkflowRun::new("ok", vec![Stage::Describe]).unwrap();
        assert_eq!(run.stages(), &[Stage::Describe]);
        assert!(!run.is_forced(Stage::Describe));
    }

    #[test]
    fn test_force_rerun_flags_stage() {
        let run = WorkflowRun::new("r", Stage::DEFAULT_ORDER.to_vec())
            .unwrap()
            .with_force_rerun([Stage::Describe]);
        assert!(run.is_forced(Stage::Describe));
        assert!(!run.is_forced(Stage::Geocode));
    }

    #[test]
    fn test_resume_keeps_original_identity() {
        let dir = TempDir::new().unwrap();
        let mut first = WorkflowRun::new("trip", vec![Stage::Describe]).unwrap();
        let created = RunManifest::load_or_create(&ctx(&dir), &mut first, &provider()).unwrap();

        let mut second = WorkflowRun::new("trip", vec![Stage::Describe]).unwrap();
        assert_ne!(second.run_id, first.run_id);
        let resumed = RunManifest::load_or_create(&ctx(&dir), &mut second, &provider()).unwrap();

        assert_eq!(resumed, created);
        assert_eq!(second.run_id, first.run_id);
        assert_eq!(second.created_at, first.created_at);
    }

    #[test]
    fn test_changed_model_is_rejected() {
        let dir = TempDir::new().unwrap();
        let mut run = WorkflowRun::new("trip", vec![Stage::Describe]).unwrap();
        RunManifest::load_or_create(&ctx(&dir), &mut run, &provider()).unwrap();

        let other = ProviderConfig::new(ProviderKind::Ollama, "moondream");
        let mut again = WorkflowRun::new("trip", vec![Stage::Describe]).unwrap();
        match RunManifest::load_or_create(&ctx(&dir), &mut again, &other) {
            Err(RunError::Config(ConfigError::ManifestMismatch { field, .. })) => {
                assert_eq!(field, "model")
            }
            other => panic!("expected manifest mismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_changed_stages_are_rejected() {
        let dir = TempDir::new().unwrap();
        let mut run = WorkflowRun::new("trip", vec![Stage::Describe]).unwrap();
        RunManifest::load_or_create(&ctx(&dir), &mut run, &provider()).unwrap();

        let mut again = WorkflowRun::new("trip", Stage::DEFAULT_ORDER.to_vec()).unwrap();
        assert!(matches!(
            RunManifest::load_or_create(&ctx(&dir), &mut again, &provider()),
            Err(RunError::Config(ConfigError::ManifestMismatch { .. }))
        ));
    }
}
