//! Typeset Core - Single-Lane Document Compilation
//!
//! # Guarantees
//! 1. One Engine, Built Rarely
//! 2. One Job At A Time, In Arrival Order
//! 3. Fonts Only Grow Within A Generation
//! 4. Idle Engines Are Reclaimed
//! 5. Every Well-Formed Request Gets Exactly One Response

pub mod assets;
pub mod config;
pub mod detect;
pub mod engine;
pub mod hashing;
pub mod lane;
pub mod lifecycle;
pub mod logging;
pub mod pipeline;
pub mod protocol;
pub mod typst_cli;

pub use assets::{bytes_to_embedded_locator, AssetError, AssetResolver, Locator};
pub use config::{ConfigError, WorkerConfig};
pub use detect::{detect_bundles, list_custom_asset_candidates, requires_bundle, AssetId, BundleId};
pub use engine::{CompileOptions, Engine, EngineBuilder, EngineError, EngineOutput};
pub use lane::{CompileLane, LaneError};
pub use lifecycle::{Clock, EngineLifecycle, LifecycleSettings, ManualClock, SystemClock};
pub use pipeline::{normalize_path, CompilationPipeline, CompileJob, CompileOutcome, PipelineError};
pub use protocol::{CompileRequest, CompileResponse, Request, Response};
pub use typst_cli::TypstCliBuilder;

pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
