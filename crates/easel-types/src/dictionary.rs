// Domain and banned-word dictionaries.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A curated keyword set steering selection toward accounts specialised
/// in a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainTag {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

/// A banned-word set applied to prompts at submit time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BannedWordSet {
    pub id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub keywords: BTreeSet<String>,
}

fn default_enabled() -> bool {
    true
}

impl DomainTag {
    pub fn new(id: impl Into<String>, keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            keywords: normalize(keywords),
        }
    }
}

impl BannedWordSet {
    pub fn new(id: impl Into<String>, keywords: impl IntoIterator<Item = String>) -> Self {
        Self {
            id: id.into(),
            enabled: true,
            keywords: normalize(keywords),
        }
    }
}

/// Keywords are stored trimmed, lower-cased and unique.
fn normalize(keywords: impl IntoIterator<Item = String>) -> BTreeSet<String> {
    keywords
        .into_iter()
        .map(|k| k.trim().to_lowercase())
        .filter(|k| !k.is_empty())
        .collect()
}
