//! Worker Configuration - Fixed Defaults
//!
//! The font catalogue and timeouts are fixed per deployment. They can be read
//! from a JSON file, but nothing renegotiates them at runtime.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::assets::{AssetError, AssetResolver};
use crate::detect::BundleId;
use crate::lifecycle::LifecycleSettings;

pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_ASSET_ROOT: &str = "file:///usr/share/typeset/";
pub const DEFAULT_TYPST_EXECUTABLE: &str = "typst";
pub const MIN_ENGINE_VERSION: &str = "0.11.0";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {0}: {1}")]
    Io(PathBuf, std::io::Error),

    #[error("Invalid config {0}: {1}")]
    Parse(PathBuf, serde_json::Error),

    #[error(transparent)]
    Asset(#[from] AssetError),

    #[error("Invalid minimum engine version {0}: {1}")]
    InvalidVersion(String, semver::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    pub idle_timeout_secs: u64,
    /// Base URL every relative font reference is resolved against.
    pub asset_root: String,
    /// Always loaded.
    pub core_bundle: Vec<String>,
    pub emoji_bundle: Vec<String>,
    pub cjk_bundle: Vec<String>,
    /// Extensions of auxiliary files treated as custom fonts.
    pub font_suffixes: Vec<String>,
    pub typst_executable: PathBuf,
    pub min_engine_version: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            asset_root: DEFAULT_ASSET_ROOT.to_string(),
            core_bundle: strings(&[
                "fonts/IBMPlexSans-Regular.ttf",
                "fonts/IBMPlexSans-Bold.ttf",
                "fonts/NewCMMath-Regular.otf",
                "fonts/NewCMMath-Book.otf",
            ]),
            emoji_bundle: strings(&["fonts/NotoColorEmoji.ttf"]),
            cjk_bundle: strings(&[
                "fonts/NotoSansCJKsc-Regular.otf",
                "fonts/NotoSansCJKsc-Bold.otf",
            ]),
            font_suffixes: strings(&["ttf", "otf"]),
            typst_executable: PathBuf::from(DEFAULT_TYPST_EXECUTABLE),
            min_engine_version: MIN_ENGINE_VERSION.to_string(),
        }
    }
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

impl WorkerConfig {
    /// Load from a JSON file; missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))
    }

    pub fn idle_timeout(&self) -> Duration {
        let secs = i64::try_from(self.idle_timeout_secs).unwrap_or(i64::MAX);
        Duration::seconds(secs.min(i64::MAX / 1000))
    }

    pub fn bundle(&self, bundle: BundleId) -> &[String] {
        match bundle {
            BundleId::Emoji => &self.emoji_bundle,
            BundleId::Cjk => &self.cjk_bundle,
        }
    }

    pub fn resolver(&self) -> Result<AssetResolver, AssetError> {
        AssetResolver::new(&self.asset_root)
    }

    pub fn min_engine_version(&self) -> Result<semver::Version, ConfigError> {
        semver::Version::parse(&self.min_engine_version)
            .map_err(|e| ConfigError::InvalidVersion(self.min_engine_version.clone(), e))
    }

    /// Resolve every configured font reference into lifecycle inputs.
    pub fn lifecycle_settings(&self) -> Result<LifecycleSettings, ConfigError> {
        let resolver = self.resolver()?;
        let mut optional_bundles = BTreeMap::new();
        for bundle in BundleId::ALL {
            optional_bundles.insert(bundle, resolver.to_locators(self.bundle(bundle))?);
        }
        Ok(LifecycleSettings {
            idle_timeout: self.idle_timeout(),
            core_bundle: resolver.to_locators(&self.core_bundle)?,
            optional_bundles,
        })
    }
}
