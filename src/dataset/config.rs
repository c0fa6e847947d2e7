use std::collections::BTreeMap;
use std::path::Path;
use std::sync::LazyLock;

use ini::{EscapePolicy, Ini, ParseOption, WriteOption};
use regex::Regex;

use super::{DatasetError, Result};
use crate::store;

pub const DATASET_SECTION: &str = "Dataset";
pub const SITE_HIERARCHY_SECTION: &str = "Site Hierarchy";

static SITELEVEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^sitelevel_(\d+)$").expect("valid sitelevel regex"));

/// Sidecar configuration of one dataset.
///
/// ```ini
/// [Dataset]
/// name = Sheffield
/// id = 1
/// audio_path = /data/audio/sheffield
///
/// [Site Hierarchy]
/// sitelevel_1 = Region
/// sitelevel_2 = Site
/// ```
///
/// Values are taken verbatim: no quote stripping, no escapes. Only `Site Hierarchy` is edited at runtime;
/// other sections and keys survive a load/save cycle untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetConfig {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl DatasetConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let opt = ParseOption {
            enabled_quote: false,
            enabled_escape: false,
            ..ParseOption::default()
        };
        let doc = Ini::load_from_str_opt(text, opt)?;
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for (name, props) in doc.iter() {
            let Some(name) = name else {
                if let Some((key, _)) = props.iter().next() {
                    return Err(DatasetError::Config(format!(
                        "key `{key}` appears before any section"
                    )));
                }
                continue;
            };
            let entries = sections.entry(name.to_string()).or_default();
            for (k, v) in props.iter() {
                entries.insert(k.to_string(), v.to_string());
            }
        }
        sections
            .entry(SITE_HIERARCHY_SECTION.to_string())
            .or_default();

        let config = Self { sections };
        for key in ["name", "audio_path"] {
            if config.dataset_value(key).is_none_or(str::is_empty) {
                return Err(DatasetError::Config(format!(
                    "missing `{DATASET_SECTION}.{key}`"
                )));
            }
        }
        Ok(config)
    }

    fn dataset_value(&self, key: &str) -> Option<&str> {
        self.sections
            .get(DATASET_SECTION)
            .and_then(|s| s.get(key))
            .map(String::as_str)
    }

    pub fn name(&self) -> &str {
        self.dataset_value("name").unwrap_or_default()
    }

    /// Dataset id; falls back to the name when the sidecar has none.
    pub fn id(&self) -> &str {
        self.dataset_value("id").unwrap_or_else(|| self.name())
    }

    pub fn audio_path(&self) -> &str {
        self.dataset_value("audio_path").unwrap_or_default()
    }

    /// Absolute path prefix to strip from feature rows (legacy deployments).
    pub fn strip_path_prefix(&self) -> Option<&str> {
        self.dataset_value("strip_path_prefix").filter(|s| !s.is_empty())
    }

    pub fn section(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.sections.get(name)
    }

    /// Site-level labels in level order (`sitelevel_1`, `sitelevel_2`, ...).
    pub fn site_labels(&self) -> Vec<String> {
        let Some(section) = self.sections.get(SITE_HIERARCHY_SECTION) else {
            return Vec::new();
        };
        let mut levels: Vec<(u32, &String)> = section
            .iter()
            .filter_map(|(k, v)| {
                let caps = SITELEVEL_RE.captures(k)?;
                Some((caps[1].parse().ok()?, v))
            })
            .collect();
        levels.sort_by_key(|(k, _)| *k);
        levels.into_iter().map(|(_, v)| v.clone()).collect()
    }

    /// Label for a `sitelevel_k` column, if configured.
    pub fn site_label(&self, column: &str) -> Option<&str> {
        self.sections
            .get(SITE_HIERARCHY_SECTION)
            .and_then(|s| s.get(column))
            .map(String::as_str)
    }

    /// Replace `sitelevel_k` entries with `labels`, in order. Higher levels from
    /// the previous configuration are dropped; unrelated keys are kept.
    pub fn set_site_labels(&mut self, labels: &[String]) {
        let section = self
            .sections
            .entry(SITE_HIERARCHY_SECTION.to_string())
            .or_default();
        section.retain(|k, _| !SITELEVEL_RE.is_match(k));
        for (i, label) in labels.iter().enumerate() {
            section.insert(format!("sitelevel_{}", i + 1), label.clone());
        }
    }

    pub fn to_ini_string(&self) -> Result<String> {
        let mut doc = Ini::new();
        for (name, entries) in &self.sections {
            let mut section = doc.with_section(Some(name.as_str()));
            for (k, v) in entries {
                section.set(k.as_str(), v.as_str());
            }
        }
        let opt = WriteOption {
            escape_policy: EscapePolicy::Nothing,
            kv_separator: " = ",
            ..WriteOption::default()
        };
        let mut buf = Vec::new();
        doc.write_to_opt(&mut buf, opt)?;
        String::from_utf8(buf).map_err(|e| DatasetError::Config(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = self.to_ini_string()?;
        store::write_atomic(path, text.as_bytes())?;
        log::info!("Saved dataset config to {}", path.display());
        Ok(())
    }

    /// Section → key → value mapping for transport.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.sections).unwrap_or_default()
    }
}
