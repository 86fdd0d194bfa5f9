//! Compilation Pipeline - Single Entry Point
//!
//! One job at a time: detect needed fonts, widen the engine if required,
//! feed it the job's files and compile. Every failure becomes a
//! [`CompileOutcome::Failed`]; nothing escapes `run`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::detect::{detect_bundles, list_custom_asset_candidates};
use crate::engine::{ArtifactFormat, CompileOptions, DiagnosticFormat, EngineError};
use crate::hashing::{compute_job_hash, short};
use crate::lifecycle::EngineLifecycle;

/// Error detail used when the engine fails without saying why.
pub const GENERIC_FAILURE_MESSAGE: &str = "Typst compilation failed with no diagnostic information";

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{message}")]
    CompilationFailed {
        message: String,
        diagnostics: Vec<String>,
    },
}

/// One compilation request's full input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileJob {
    pub id: String,
    /// Logical path to text content.
    pub sources: BTreeMap<String, String>,
    /// Entry path, a key into `sources`.
    pub entry: String,
    /// Logical path to binary content (images, fonts).
    #[serde(default)]
    pub auxiliary: BTreeMap<String, Vec<u8>>,
}

impl CompileJob {
    pub fn new(id: impl Into<String>, entry: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entry: entry.into(),
            ..Self::default()
        }
    }

    pub fn with_source(mut self, path: impl Into<String>, text: impl Into<String>) -> Self {
        self.sources.insert(path.into(), text.into());
        self
    }

    pub fn with_auxiliary(mut self, path: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.auxiliary.insert(path.into(), bytes.into());
        self
    }

    /// All source texts joined, the input of bundle detection.
    pub fn all_text(&self) -> String {
        self.sources
            .values()
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileOutcome {
    /// Diagnostics here are warnings.
    Compiled {
        artifact: Vec<u8>,
        diagnostics: Vec<String>,
    },
    Failed {
        message: String,
        diagnostics: Vec<String>,
    },
}

impl CompileOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::Compiled { .. })
    }

    pub fn diagnostics(&self) -> &[String] {
        match self {
            CompileOutcome::Compiled { diagnostics, .. }
            | CompileOutcome::Failed { diagnostics, .. } => diagnostics,
        }
    }
}

impl From<PipelineError> for CompileOutcome {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::CompilationFailed {
                message,
                diagnostics,
            } => CompileOutcome::Failed {
                message,
                diagnostics,
            },
            other => CompileOutcome::Failed {
                message: other.to_string(),
                diagnostics: vec![],
            },
        }
    }
}

/// Prefix `path` with `/` unless it already starts with one.
pub fn normalize_path(path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    }
}

/// The compilation pipeline - owns the engine lifecycle it drives
pub struct CompilationPipeline {
    lifecycle: EngineLifecycle,
    font_suffixes: Vec<String>,
}

impl CompilationPipeline {
    pub fn new(lifecycle: EngineLifecycle, font_suffixes: Vec<String>) -> Self {
        Self {
            lifecycle,
            font_suffixes,
        }
    }

    pub fn lifecycle(&self) -> &EngineLifecycle {
        &self.lifecycle
    }

    pub fn reset(&mut self) {
        self.lifecycle.reset();
    }

    /// Compile one job
    pub async fn run(&mut self, job: &CompileJob) -> CompileOutcome {
        let job_hash = compute_job_hash(&job.sources, &job.entry, &job.auxiliary);
        info!(
            job_id = %job.id,
            job_hash = short(&job_hash),
            sources = job.sources.len(),
            auxiliary = job.auxiliary.len(),
            "compiling job"
        );

        match self.compile(job).await {
            Ok((artifact, diagnostics)) => {
                if !diagnostics.is_empty() {
                    warn!(job_id = %job.id, warnings = %diagnostics.join("\n"), "compilation warnings");
                }
                CompileOutcome::Compiled {
                    artifact,
                    diagnostics,
                }
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "compilation failed");
                err.into()
            }
        }
    }

    async fn compile(&mut self, job: &CompileJob) -> Result<(Vec<u8>, Vec<String>), PipelineError> {
        self.lifecycle.touch();

        let candidates = list_custom_asset_candidates(&job.auxiliary, &self.font_suffixes);
        let new_custom: Vec<(&str, &[u8])> = candidates
            .iter()
            .filter(|id| !self.lifecycle.is_custom_loaded(id))
            .filter_map(|id| {
                job.auxiliary
                    .get(id)
                    .map(|bytes| (id.as_str(), bytes.as_slice()))
            })
            .collect();

        // A fresh custom-font build already covers this job; bundles detected
        // in its content wait for the next job that needs them.
        let custom_rebuilt = if new_custom.is_empty() {
            false
        } else {
            self.lifecycle.ensure_custom_assets(&new_custom).await?
        };

        if !custom_rebuilt {
            for bundle in detect_bundles(&job.all_text()) {
                self.lifecycle.ensure_bundles(&[bundle]).await?;
            }
        }

        let engine = self.lifecycle.acquire().await?;

        for (path, text) in &job.sources {
            engine.add_source(&normalize_path(path), text).await?;
        }
        for (path, bytes) in &job.auxiliary {
            engine.map_shadow(&normalize_path(path), bytes).await?;
        }

        let output = engine
            .compile(&CompileOptions {
                main_file_path: normalize_path(&job.entry),
                format: ArtifactFormat::Pdf,
                diagnostics: DiagnosticFormat::Unix,
            })
            .await?;

        match output.artifact {
            Some(artifact) => Ok((artifact, output.diagnostics)),
            None => {
                let message = if output.diagnostics.is_empty() {
                    GENERIC_FAILURE_MESSAGE.to_string()
                } else {
                    output.diagnostics.join("\n")
                };
                Err(PipelineError::CompilationFailed {
                    message,
                    diagnostics: output.diagnostics,
                })
            }
        }
    }
}
