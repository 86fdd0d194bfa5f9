//! Capability Detection - Content Sniffing
//!
//! Decides which optional font bundles a job needs by looking at the
//! characters it contains. Pure functions, no state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of a caller-supplied asset (its logical path in the job).
pub type AssetId = String;

/// Optional font bundles loaded only on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BundleId {
    Emoji,
    Cjk,
}

impl BundleId {
    /// Every optional bundle, in upgrade order.
    pub const ALL: [BundleId; 2] = [BundleId::Emoji, BundleId::Cjk];

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleId::Emoji => "emoji",
            BundleId::Cjk => "cjk",
        }
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `text` contains characters only covered by `bundle`.
pub fn requires_bundle(text: &str, bundle: BundleId) -> bool {
    match bundle {
        BundleId::Emoji => text.chars().any(is_emoji_char),
        BundleId::Cjk => text.chars().any(is_cjk_char),
    }
}

/// All optional bundles `text` requires, in upgrade order.
pub fn detect_bundles(text: &str) -> Vec<BundleId> {
    BundleId::ALL
        .into_iter()
        .filter(|bundle| requires_bundle(text, *bundle))
        .collect()
}

// Astral planes (where most pictographs live), misc symbols, dingbats.
fn is_emoji_char(c: char) -> bool {
    matches!(c as u32, 0x10000.. | 0x2600..=0x26FF | 0x2700..=0x27BF)
}

// Han ideographs and extension A, compatibility ideographs, kana, hangul.
fn is_cjk_char(c: char) -> bool {
    matches!(
        c as u32,
        0x4E00..=0x9FFF
            | 0x3400..=0x4DBF
            | 0xF900..=0xFAFF
            | 0x3040..=0x309F
            | 0x30A0..=0x30FF
            | 0xAC00..=0xD7AF
    )
}

/// Auxiliary files whose name ends with one of `suffixes` (case-insensitive).
///
/// Everything else (images, data files) is only mapped into the engine's
/// file system and never triggers an engine rebuild.
pub fn list_custom_asset_candidates<V>(
    auxiliary: &BTreeMap<String, V>,
    suffixes: &[String],
) -> BTreeSet<AssetId> {
    auxiliary
        .keys()
        .filter(|path| has_font_suffix(path, suffixes))
        .cloned()
        .collect()
}

fn has_font_suffix(path: &str, suffixes: &[String]) -> bool {
    let lower = path.to_lowercase();
    suffixes.iter().any(|suffix| {
        let suffix = suffix.trim_start_matches('.').to_lowercase();
        lower
            .strip_suffix(suffix.as_str())
            .map_or(false, |stem| stem.ends_with('.'))
    })
}
