//! Typeset CLI - Bridge interface for hosts
//!
//! Commands: serve, compile
//! `serve` speaks newline-delimited JSON on stdin/stdout.
//! `compile` returns non-zero when the document fails to compile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::io::BufReader;
use tracing::level_filters::LevelFilter;
use tracing::{error, info};
use walkdir::WalkDir;

use typeset_core::{
    logging::{self, LogFormat},
    protocol, CompilationPipeline, CompileJob, CompileLane, CompileOutcome, EngineLifecycle,
    SystemClock, TypstCliBuilder, WorkerConfig, ENGINE_VERSION,
};

#[derive(Parser)]
#[command(name = "typeset-cli", version)]
#[command(about = "Typeset CLI - single-lane Typst compilation worker")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a JSON configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL fonts are resolved against (overrides the config file)
    #[arg(long, global = true)]
    asset_root: Option<String>,

    /// Path to the typst executable (overrides the config file)
    #[arg(long, global = true)]
    typst: Option<PathBuf>,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value_t = LogFormat::Compact, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve compile requests from stdin, one JSON message per line
    Serve,

    /// Compile a project directory once
    Compile {
        /// Project directory; `.typ` files are sources, everything else auxiliary
        dir: PathBuf,

        /// Entry file, relative to the project directory
        #[arg(short, long, default_value = "main.typ")]
        main: String,

        /// Where to write the PDF
        #[arg(short, long, default_value = "out.pdf")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::init(cli.log_format, LevelFilter::INFO) {
        eprintln!(r#"{{"error": "Failed to install logging: {}"}}"#, e);
        return ExitCode::FAILURE;
    }

    let lane = match start_lane(&cli) {
        Ok(lane) => lane,
        Err(e) => {
            error!(error = %e, "failed to start compile lane");
            eprintln!(r#"{{"error": "{}"}}"#, e);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Serve => {
            let stdin = BufReader::new(tokio::io::stdin());
            match protocol::serve(lane, stdin, tokio::io::stdout()).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!(error = %e, "serve loop stopped");
                    ExitCode::FAILURE
                }
            }
        }

        Commands::Compile { dir, main, output } => {
            let job = match load_project(&dir, &main) {
                Ok(job) => job,
                Err(e) => {
                    println!(r#"{{"success": false, "error": "Failed to read project: {}"}}"#, e);
                    return ExitCode::FAILURE;
                }
            };

            match lane.enqueue(job).await {
                Ok(CompileOutcome::Compiled {
                    artifact,
                    diagnostics,
                }) => {
                    if let Err(e) = tokio::fs::write(&output, &artifact).await {
                        println!(r#"{{"success": false, "error": "Failed to write output: {}"}}"#, e);
                        return ExitCode::FAILURE;
                    }
                    let summary = serde_json::json!({
                        "success": true,
                        "output": output,
                        "bytes": artifact.len(),
                        "diagnostics": diagnostics,
                    });
                    println!("{}", summary);
                    ExitCode::SUCCESS
                }
                Ok(CompileOutcome::Failed {
                    message,
                    diagnostics,
                }) => {
                    let summary = serde_json::json!({
                        "success": false,
                        "error": message,
                        "diagnostics": diagnostics,
                    });
                    println!("{}", summary);
                    ExitCode::from(2) // Document did not compile
                }
                Err(e) => {
                    println!(r#"{{"success": false, "error": "{}"}}"#, e);
                    ExitCode::FAILURE
                }
            }
        }
    }
}

fn start_lane(cli: &Cli) -> Result<CompileLane, Box<dyn std::error::Error>> {
    let mut config = match &cli.config {
        Some(path) => WorkerConfig::load(path)?,
        None => WorkerConfig::default(),
    };
    if let Some(root) = &cli.asset_root {
        config.asset_root = root.clone();
    }
    if let Some(typst) = &cli.typst {
        config.typst_executable = typst.clone();
    }

    let builder = TypstCliBuilder::new(config.typst_executable.clone(), config.min_engine_version()?);
    let lifecycle = EngineLifecycle::new(
        Arc::new(builder),
        Arc::new(SystemClock),
        config.lifecycle_settings()?,
    );
    let pipeline = CompilationPipeline::new(lifecycle, config.font_suffixes.clone());

    info!(
        version = ENGINE_VERSION,
        asset_root = %config.asset_root,
        idle_timeout_secs = config.idle_timeout_secs,
        "compile lane starting"
    );
    let (lane, _task) = CompileLane::spawn(pipeline);
    Ok(lane)
}

/// Read a project tree into a job: `.typ` files as sources, the rest as
/// auxiliary bytes, all keyed by their `/`-joined path relative to `dir`.
fn load_project(dir: &Path, main: &str) -> std::io::Result<CompileJob> {
    let mut sources = BTreeMap::new();
    let mut auxiliary = BTreeMap::new();

    for entry in WalkDir::new(dir) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let logical = path
            .strip_prefix(dir)
            .unwrap_or(path)
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        if path.extension().is_some_and(|e| e == "typ") {
            sources.insert(logical, std::fs::read_to_string(path)?);
        } else {
            auxiliary.insert(logical, std::fs::read(path)?);
        }
    }

    Ok(CompileJob {
        id: uuid::Uuid::new_v4().to_string(),
        sources,
        entry: main.to_string(),
        auxiliary,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_load_project_splits_sources_and_auxiliary() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("chapters")).unwrap();
        fs::create_dir_all(dir.path().join("fonts")).unwrap();
        fs::write(dir.path().join("main.typ"), "#include \"chapters/one.typ\"").unwrap();
        fs::write(dir.path().join("chapters/one.typ"), "= One").unwrap();
        fs::write(dir.path().join("fonts/Brand.otf"), [1u8, 2, 3]).unwrap();

        let job = load_project(dir.path(), "main.typ").unwrap();

        assert_eq!(job.entry, "main.typ");
        assert_eq!(
            job.sources.keys().collect::<Vec<_>>(),
            vec!["chapters/one.typ", "main.typ"]
        );
        assert_eq!(job.sources["chapters/one.typ"], "= One");
        assert_eq!(job.auxiliary.keys().collect::<Vec<_>>(), vec!["fonts/Brand.otf"]);
        assert_eq!(job.auxiliary["fonts/Brand.otf"], vec![1, 2, 3]);
    }

    #[test]
    fn test_load_project_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_project(&dir.path().join("absent"), "main.typ").is_err());
    }
}
