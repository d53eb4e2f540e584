//! Sekret core types: the editable key/value pair list, the dirty
//! comparison against the last-confirmed cluster value, and the backup
//! history wire format.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Secret payload as the cluster hands it over. Pair order follows the
/// map's own iteration order; no further sort is applied anywhere.
pub type Mapping = BTreeMap<String, String>;

/// Reserved field inside a backup secret holding the JSON-encoded history.
pub const BACKUP_FIELD: &str = "BACKUP";

/// Name of the sibling secret carrying the backup history for `name`.
pub fn backup_name(name: &str) -> String {
    format!("{}-backup", name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretEntry {
    pub key: String,
    pub value: String,
}

impl SecretEntry {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }

    fn is_blank(&self) -> bool {
        self.key.is_empty() && self.value.is_empty()
    }
}

/// Ordered key/value pairs under edit. Always carries exactly one trailing
/// blank entry (the data-entry row); the blank is stripped before any
/// comparison or emission. Duplicate keys are representable mid-edit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditableSecret {
    entries: Vec<SecretEntry>,
}

impl Default for EditableSecret {
    fn default() -> Self {
        Self { entries: vec![SecretEntry::new("", "")] }
    }
}

impl EditableSecret {
    /// Pair sequence for a freshly fetched mapping, in the mapping's
    /// iteration order, plus the data-entry row.
    pub fn from_mapping(mapping: &Mapping) -> Self {
        let mut entries: Vec<SecretEntry> = mapping
            .iter()
            .map(|(k, v)| SecretEntry::new(k.clone(), v.clone()))
            .collect();
        entries.push(SecretEntry::new("", ""));
        Self { entries }
    }

    /// Adopt an explicit pair list (restores, tests). Normalized like any
    /// other edit.
    pub fn from_pairs(pairs: Vec<SecretEntry>) -> Self {
        let mut s = Self { entries: pairs };
        s.normalize();
        s
    }

    /// All rows as displayed, including the trailing blank.
    pub fn entries(&self) -> &[SecretEntry] {
        &self.entries
    }

    /// The meaningful rows: everything but the trailing blank.
    pub fn pairs(&self) -> &[SecretEntry] {
        &self.entries[..self.entries.len() - 1]
    }

    pub fn set_key(&mut self, index: usize, key: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.key = key.into();
            self.normalize();
        }
    }

    pub fn set_value(&mut self, index: usize, value: impl Into<String>) {
        if let Some(entry) = self.entries.get_mut(index) {
            entry.value = value.into();
            self.normalize();
        }
    }

    pub fn remove(&mut self, index: usize) {
        if index < self.entries.len() {
            self.entries.remove(index);
            self.normalize();
        }
    }

    /// Mapping for emission: blank row stripped, entries with an empty key
    /// rejected. On duplicate keys the last occurrence wins; the dirty
    /// evaluator blocks saves before that policy can matter.
    pub fn to_mapping(&self) -> Mapping {
        self.pairs()
            .iter()
            .filter(|e| !e.key.is_empty())
            .map(|e| (e.key.clone(), e.value.clone()))
            .collect()
    }

    /// Drop rows blank in both fields, then re-establish exactly one
    /// trailing blank.
    fn normalize(&mut self) {
        self.entries.retain(|e| !e.is_blank());
        self.entries.push(SecretEntry::new("", ""));
    }
}

/// Whether the edited pairs differ from the last-confirmed cluster value.
///
/// A repeated non-empty key forces `false`: a save must never be offered
/// against an ambiguous pair list, and the only user-visible signal is the
/// disabled save control.
pub fn is_dirty(secret: &EditableSecret, original: &Mapping) -> bool {
    let pairs = secret.pairs();
    let mut seen = BTreeSet::new();
    for entry in pairs {
        if !entry.key.is_empty() && !seen.insert(entry.key.as_str()) {
            return false;
        }
    }
    let mapping: Mapping = pairs
        .iter()
        .map(|e| (e.key.clone(), e.value.clone()))
        .collect();
    &mapping != original
}

/// One entry of the backup history embedded in a `<name>-backup` secret.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backup {
    pub data: Mapping,
    #[serde(rename = "backupTime")]
    pub backup_time: String,
}

/// Parse the JSON history payload. Elements that do not carry the
/// `{data, backupTime}` shape are dropped individually; an unparsable
/// payload yields an empty history rather than an error.
pub fn parse_backups(payload: &str) -> Vec<Backup> {
    let elements: Vec<serde_json::Value> = match serde_json::from_str(payload) {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };
    elements
        .into_iter()
        .filter_map(|v| serde_json::from_value(v).ok())
        .collect()
}
