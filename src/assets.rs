//! Asset Resolution - Logical References to Engine Locators
//!
//! Font references in the configuration are relative to an asset root; fonts
//! supplied by callers only exist as bytes and are embedded as `data:` URIs.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const DATA_SCHEME_PREFIX: &str = "data:";

#[derive(Debug, Error)]
pub enum AssetError {
    #[error("Invalid asset root {0}: {1}")]
    InvalidRoot(String, url::ParseError),

    #[error("Cannot resolve asset reference {0}: {1}")]
    Unresolvable(String, url::ParseError),

    #[error("Malformed embedded locator: {0}")]
    MalformedEmbedded(String),

    #[error("Unsupported locator scheme: {0}")]
    UnsupportedScheme(String),

    #[error("Failed to read asset {0}: {1}")]
    Read(String, std::io::Error),
}

/// A resolved asset reference: an absolute URL or a self-contained `data:` URI.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Locator(String);

impl Locator {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_embedded(&self) -> bool {
        self.0.starts_with(DATA_SCHEME_PREFIX)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Embedded payloads can be megabytes long.
        if self.is_embedded() {
            let header = self.0.split(',').next().unwrap_or(DATA_SCHEME_PREFIX);
            write!(f, "{header},<{} chars>", self.0.len())
        } else {
            f.write_str(&self.0)
        }
    }
}

/// Turns configured asset references into absolute locators.
#[derive(Debug, Clone)]
pub struct AssetResolver {
    root: Url,
}

impl AssetResolver {
    pub fn new(root: &str) -> Result<Self, AssetError> {
        // Without a trailing slash `Url::join` would replace the last segment.
        let normalized = if root.ends_with('/') {
            root.to_string()
        } else {
            format!("{root}/")
        };
        let root = Url::parse(&normalized)
            .map_err(|e| AssetError::InvalidRoot(root.to_string(), e))?;
        Ok(Self { root })
    }

    /// Resolve a reference against the asset root. Embedded and already
    /// absolute references pass through unchanged.
    pub fn to_locator(&self, reference: &str) -> Result<Locator, AssetError> {
        if reference.starts_with(DATA_SCHEME_PREFIX) {
            return Ok(Locator(reference.to_string()));
        }
        if let Ok(absolute) = Url::parse(reference) {
            return Ok(Locator(absolute.into()));
        }

        let relative = reference.trim_start_matches('/');
        self.root
            .join(relative)
            .map(|url| Locator(url.into()))
            .map_err(|e| AssetError::Unresolvable(reference.to_string(), e))
    }

    pub fn to_locators<S: AsRef<str>>(&self, references: &[S]) -> Result<Vec<Locator>, AssetError> {
        references
            .iter()
            .map(|reference| self.to_locator(reference.as_ref()))
            .collect()
    }
}

/// Embed raw font bytes as a self-contained `data:` locator.
pub fn bytes_to_embedded_locator(bytes: &[u8], filename: &str) -> Locator {
    let mime = font_mime_type(filename);
    Locator(format!("data:{mime};base64,{}", STANDARD.encode(bytes)))
}

fn font_mime_type(filename: &str) -> &'static str {
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "ttf" => "font/ttf",
        "ttc" | "otc" => "font/collection",
        _ => "font/otf",
    }
}

/// Load the bytes a locator points at. Supports `data:` and `file:` locators.
pub async fn fetch(locator: &Locator) -> Result<Vec<u8>, AssetError> {
    if locator.is_embedded() {
        return decode_embedded(locator);
    }

    let url = Url::parse(locator.as_str())
        .map_err(|e| AssetError::Unresolvable(locator.to_string(), e))?;
    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| AssetError::UnsupportedScheme(locator.to_string()))?;
            tokio::fs::read(&path)
                .await
                .map_err(|e| AssetError::Read(locator.to_string(), e))
        }
        other => Err(AssetError::UnsupportedScheme(other.to_string())),
    }
}

fn decode_embedded(locator: &Locator) -> Result<Vec<u8>, AssetError> {
    let (header, payload) = locator
        .as_str()
        .split_once(',')
        .ok_or_else(|| AssetError::MalformedEmbedded(locator.to_string()))?;
    if !header.ends_with(";base64") {
        return Err(AssetError::MalformedEmbedded(locator.to_string()));
    }
    STANDARD
        .decode(payload)
        .map_err(|_| AssetError::MalformedEmbedded(locator.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_and_rooted_references() {
        let resolver = AssetResolver::new("https://cdn.example.com/static").unwrap();
        assert_eq!(
            resolver.to_locator("fonts/A.ttf").unwrap().as_str(),
            "https://cdn.example.com/static/fonts/A.ttf"
        );
        assert_eq!(
            resolver.to_locator("/fonts/A.ttf").unwrap().as_str(),
            "https://cdn.example.com/static/fonts/A.ttf"
        );
    }

    #[test]
    fn test_embedded_passthrough() {
        let resolver = AssetResolver::new("file:///srv/assets/").unwrap();
        let embedded = bytes_to_embedded_locator(b"abc", "x.ttf");
        let resolved = resolver.to_locator(embedded.as_str()).unwrap();
        assert_eq!(resolved, embedded);
        assert!(resolved.is_embedded());
    }

    #[test]
    fn test_embedded_mime_types() {
        assert!(bytes_to_embedded_locator(b"1", "a.TTF")
            .as_str()
            .starts_with("data:font/ttf;base64,"));
        assert!(bytes_to_embedded_locator(b"1", "a.otf")
            .as_str()
            .starts_with("data:font/otf;base64,"));
    }

    #[tokio::test]
    async fn test_fetch_embedded_roundtrip() {
        let locator = bytes_to_embedded_locator(&[0, 159, 146, 150], "f.otf");
        assert_eq!(fetch(&locator).await.unwrap(), vec![0, 159, 146, 150]);
    }

    #[tokio::test]
    async fn test_fetch_file_locator() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("fonts")).unwrap();
        std::fs::write(dir.path().join("fonts/A.ttf"), b"font").unwrap();

        let root = Url::from_directory_path(dir.path()).unwrap();
        let resolver = AssetResolver::new(root.as_str()).unwrap();
        let locator = resolver.to_locator("/fonts/A.ttf").unwrap();
        assert_eq!(fetch(&locator).await.unwrap(), b"font".to_vec());
    }

    #[tokio::test]
    async fn test_fetch_rejects_remote_scheme() {
        let locator = AssetResolver::new("https://cdn.example.com/")
            .unwrap()
            .to_locator("fonts/A.ttf")
            .unwrap();
        assert!(matches!(
            fetch(&locator).await,
            Err(AssetError::UnsupportedScheme(_))
        ));
    }
}
