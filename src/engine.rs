//! Engine Seams - Opaque Compilation Capability
//!
//! An engine is immutable once built: its font set is fixed at construction
//! and widening it means building a new one. Builders are the only way to
//! obtain an engine.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::assets::{AssetError, Locator};

/// Errors raised while building or driving an engine.
///
/// `Clone` because a pending construction is shared by every caller awaiting it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Engine construction failed: {0}")]
    Construction(String),

    #[error("Asset unavailable: {0}")]
    Asset(String),

    #[error("Engine version {found} is older than required {required}")]
    VersionMismatch { found: String, required: String },

    #[error("Invalid path in job: {0}")]
    InvalidPath(String),

    #[error("Engine host failure: {0}")]
    Host(String),
}

impl From<AssetError> for EngineError {
    fn from(err: AssetError) -> Self {
        EngineError::Asset(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ArtifactFormat {
    #[default]
    Pdf,
}

/// One line per diagnostic: `path:line:col: severity: message`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DiagnosticFormat {
    #[default]
    Unix,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    /// Absolute (root-prefixed) path of the entry file.
    pub main_file_path: String,
    pub format: ArtifactFormat,
    pub diagnostics: DiagnosticFormat,
}

/// What the engine reports for one compilation. A missing artifact means the
/// document did not compile; diagnostics then explain why.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineOutput {
    pub artifact: Option<Vec<u8>>,
    pub diagnostics: Vec<String>,
}

#[async_trait]
pub trait Engine: Send + Sync {
    /// Register a source file under an absolute path.
    async fn add_source(&self, path: &str, text: &str) -> Result<(), EngineError>;

    /// Map opaque binary content (images, data) under an absolute path.
    async fn map_shadow(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError>;

    async fn compile(&self, options: &CompileOptions) -> Result<EngineOutput, EngineError>;
}

/// Slow, side-effecting construction of one engine from a complete asset set.
#[async_trait]
pub trait EngineBuilder: Send + Sync {
    async fn build(&self, assets: Vec<Locator>) -> Result<Arc<dyn Engine>, EngineError>;
}
