//! Typst CLI Engine - Engine backed by an external `typst` executable
//!
//! Construction materializes the font set into a private directory (the slow
//! part); compilation runs `typst compile` against a private source tree
//! built up from `add_source` / `map_shadow` calls. Both directories live as
//! long as the engine.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::assets::{fetch, Locator};
use crate::engine::{
    ArtifactFormat, CompileOptions, DiagnosticFormat, Engine, EngineBuilder, EngineError,
    EngineOutput,
};

#[derive(Debug, Clone)]
pub struct TypstCliBuilder {
    executable: PathBuf,
    min_version: semver::Version,
}

impl TypstCliBuilder {
    pub fn new(executable: PathBuf, min_version: semver::Version) -> Self {
        Self {
            executable,
            min_version,
        }
    }

    async fn check_version(&self) -> Result<semver::Version, EngineError> {
        let output = Command::new(&self.executable)
            .arg("--version")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                EngineError::Construction(format!(
                    "cannot run {}: {e}",
                    self.executable.display()
                ))
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let version = parse_version(&stdout).ok_or_else(|| {
            EngineError::Construction(format!("unrecognized version output: {}", stdout.trim()))
        })?;

        if version < self.min_version {
            return Err(EngineError::VersionMismatch {
                found: version.to_string(),
                required: self.min_version.to_string(),
            });
        }
        Ok(version)
    }
}

/// Parses `typst 0.12.0 (abcdef12)` into `0.12.0`.
fn parse_version(output: &str) -> Option<semver::Version> {
    output
        .split_whitespace()
        .find_map(|token| semver::Version::parse(token.trim_start_matches('v')).ok())
}

#[async_trait]
impl EngineBuilder for TypstCliBuilder {
    async fn build(&self, assets: Vec<Locator>) -> Result<Arc<dyn Engine>, EngineError> {
        let started_at = Instant::now();
        let version = self.check_version().await?;

        let workspace = tempfile::Builder::new()
            .prefix("typeset-engine-")
            .tempdir()
            .map_err(|e| EngineError::Construction(format!("cannot create workspace: {e}")))?;
        let fonts_dir = workspace.path().join("fonts");
        let root_dir = workspace.path().join("root");
        for dir in [&fonts_dir, &root_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| EngineError::Construction(format!("cannot create {}: {e}", dir.display())))?;
        }

        let mut font_bytes = 0usize;
        for (index, locator) in assets.iter().enumerate() {
            let bytes = fetch(locator).await?;
            font_bytes += bytes.len();
            let target = fonts_dir.join(font_file_name(index, locator));
            tokio::fs::write(&target, &bytes)
                .await
                .map_err(|e| EngineError::Construction(format!("cannot write {}: {e}", target.display())))?;
        }

        info!(
            %version,
            fonts = assets.len(),
            font_bytes,
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "typst engine ready"
        );

        Ok(Arc::new(TypstCliEngine {
            executable: self.executable.clone(),
            fonts_dir,
            root_dir,
            _workspace: workspace,
        }))
    }
}

// Index prefix keeps same-named fonts from different locators apart.
fn font_file_name(index: usize, locator: &Locator) -> String {
    if locator.is_embedded() {
        let extension = match locator.as_str() {
            s if s.starts_with("data:font/ttf") => "ttf",
            s if s.starts_with("data:font/collection") => "ttc",
            _ => "otf",
        };
        return format!("{index:03}-embedded.{extension}");
    }

    let name = Url::parse(locator.as_str())
        .ok()
        .and_then(|url| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "font".to_string());
    format!("{index:03}-{name}")
}

pub struct TypstCliEngine {
    executable: PathBuf,
    fonts_dir: PathBuf,
    root_dir: PathBuf,
    _workspace: TempDir,
}

impl TypstCliEngine {
    /// Map an absolute virtual path into the source tree, refusing escapes.
    fn host_path(&self, path: &str) -> Result<PathBuf, EngineError> {
        let relative = Path::new(path.trim_start_matches('/'));
        let mut resolved = self.root_dir.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => return Err(EngineError::InvalidPath(path.to_string())),
            }
        }
        if resolved == self.root_dir {
            return Err(EngineError::InvalidPath(path.to_string()));
        }
        Ok(resolved)
    }

    async fn write_file(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError> {
        let target = self.host_path(path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| EngineError::Host(format!("cannot create {}: {e}", parent.display())))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| EngineError::Host(format!("cannot write {path}: {e}")))
    }
}

#[async_trait]
impl Engine for TypstCliEngine {
    async fn add_source(&self, path: &str, text: &str) -> Result<(), EngineError> {
        self.write_file(path, text.as_bytes()).await
    }

    async fn map_shadow(&self, path: &str, bytes: &[u8]) -> Result<(), EngineError> {
        self.write_file(path, bytes).await
    }

    async fn compile(&self, options: &CompileOptions) -> Result<EngineOutput, EngineError> {
        let started_at = Instant::now();
        let input = self.host_path(&options.main_file_path)?;
        let extension = match options.format {
            ArtifactFormat::Pdf => "pdf",
        };
        let output_path = self
            .fonts_dir
            .with_file_name(format!("out-{}.{extension}", Uuid::new_v4()));
        let diagnostic_format = match options.diagnostics {
            DiagnosticFormat::Unix => "short",
        };

        let output = Command::new(&self.executable)
            .arg("compile")
            .arg("--root")
            .arg(&self.root_dir)
            .arg("--font-path")
            .arg(&self.fonts_dir)
            .arg("--ignore-system-fonts")
            .arg("--diagnostic-format")
            .arg(diagnostic_format)
            .arg(&input)
            .arg(&output_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| EngineError::Host(format!("cannot run {}: {e}", self.executable.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        let diagnostics = collect_diagnostics(&stderr);

        let artifact = if output.status.success() {
            match tokio::fs::read(&output_path).await {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    warn!(error = %err, "typst reported success but produced no artifact");
                    None
                }
            }
        } else {
            None
        };
        let _ = tokio::fs::remove_file(&output_path).await;

        info!(
            exit_code = output.status.code().unwrap_or(-1),
            diagnostics = diagnostics.len(),
            elapsed_ms = started_at.elapsed().as_millis() as u64,
            "typst compile finished"
        );

        Ok(EngineOutput {
            artifact,
            diagnostics,
        })
    }
}

// `short` format prints one diagnostic per line.
fn collect_diagnostics(stderr: &str) -> Vec<String> {
    stderr
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::assets::{bytes_to_embedded_locator, AssetResolver};
    use std::{fs, os::unix::fs::PermissionsExt};

    const FAKE_TYPST: &str = r##"#!/bin/sh
if [ "$1" = "--version" ]; then
  echo "typst 0.12.0 (737895d7)"
  exit 0
fi
input=""
output=""
for arg in "$@"; do
  input="$output"
  output="$arg"
done
if grep -q "#undefined" "$input"; then
  echo "main.typ:1:2: error: unknown variable: undefined" >&2
  exit 1
fi
if grep -q "#warn" "$input"; then
  echo "main.typ:1:1: warning: unused" >&2
fi
printf '%%PDF-1.7 fake' > "$output"
"##;

    fn fake_typst(dir: &Path) -> PathBuf {
        let path = dir.join("typst");
        fs::write(&path, FAKE_TYPST).expect("write script");
        let mut perms = fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).expect("set perms");
        path
    }

    fn min_version(version: &str) -> semver::Version {
        semver::Version::parse(version).unwrap()
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(
            parse_version("typst 0.12.0 (737895d7)"),
            Some(min_version("0.12.0"))
        );
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_font_file_names() {
        let resolver = AssetResolver::new("file:///srv/").unwrap();
        let plain = resolver.to_locator("fonts/A.ttf").unwrap();
        assert_eq!(font_file_name(2, &plain), "002-A.ttf");
        let embedded = bytes_to_embedded_locator(b"x", "b.ttf");
        assert_eq!(font_file_name(7, &embedded), "007-embedded.ttf");
    }

    #[tokio::test]
    async fn test_build_and_compile() {
        let dir = tempfile::tempdir().unwrap();
        let builder = TypstCliBuilder::new(fake_typst(dir.path()), min_version("0.11.0"));
        let font = bytes_to_embedded_locator(b"font-bytes", "Brand.otf");
        let engine = builder.build(vec![font]).await.expect("engine");

        engine.add_source("/main.typ", "= Hello #warn").await.unwrap();
        engine.map_shadow("/img/logo.png", &[1, 2, 3]).await.unwrap();
        let output = engine
            .compile(&CompileOptions {
                main_file_path: "/main.typ".to_string(),
                format: ArtifactFormat::Pdf,
                diagnostics: DiagnosticFormat::Unix,
            })
            .await
            .unwrap();

        assert_eq!(output.artifact.as_deref(), Some(b"%PDF-1.7 fake".as_slice()));
        assert_eq!(output.diagnostics, vec!["main.typ:1:1: warning: unused"]);
    }

    #[tokio::test]
    async fn test_compile_failure_has_no_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let builder = TypstCliBuilder::new(fake_typst(dir.path()), min_version("0.11.0"));
        let engine = builder.build(vec![]).await.unwrap();

        engine.add_source("/main.typ", "#undefined").await.unwrap();
        let output = engine
            .compile(&CompileOptions {
                main_file_path: "/main.typ".to_string(),
                format: ArtifactFormat::Pdf,
                diagnostics: DiagnosticFormat::Unix,
            })
            .await
            .unwrap();

        assert!(output.artifact.is_none());
        assert_eq!(output.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_old_engine() {
        let dir = tempfile::tempdir().unwrap();
        let builder = TypstCliBuilder::new(fake_typst(dir.path()), min_version("1.0.0"));
        let err = builder.build(vec![]).await.err().expect("version gate");
        assert!(matches!(err, EngineError::VersionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let builder = TypstCliBuilder::new(fake_typst(dir.path()), min_version("0.11.0"));
        let engine = builder.build(vec![]).await.unwrap();
        let err = engine.add_source("/../etc/passwd", "x").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidPath(_)));
    }
}
