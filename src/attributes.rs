//! Camera attribute store.
//!
//! An [`AttributeSet`] maps camera setting names (exposure, gain, acquisition
//! mode, ...) to JSON-like values. The store has no schema of its own: the
//! vendor SDK is the only judge of validity, and only when the set is pushed
//! to it by `setup_acquisition`.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{AppResult, CameraError};

/// Value of a single camera attribute.
pub type AttributeValue = serde_json::Value;

/// Attribute visibility levels used by IMAQdx-style cameras.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VisibilityLevel {
    /// Attributes shown to every user.
    Simple,
    /// Attributes for experienced users.
    Intermediate,
    /// Every attribute the camera exposes.
    Advanced,
}

impl VisibilityLevel {
    /// Lower-case name as written in run files.
    pub fn as_str(&self) -> &'static str {
        match self {
            VisibilityLevel::Simple => "simple",
            VisibilityLevel::Intermediate => "intermediate",
            VisibilityLevel::Advanced => "advanced",
        }
    }
}

impl fmt::Display for VisibilityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VisibilityLevel {
    type Err = CameraError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "simple" => Ok(VisibilityLevel::Simple),
            "intermediate" => Ok(VisibilityLevel::Intermediate),
            "advanced" => Ok(VisibilityLevel::Advanced),
            other => Err(CameraError::RunFile(format!(
                "Invalid attribute visibility level '{}'",
                other
            ))),
        }
    }
}

/// Mapping from attribute name to value.
///
/// Names are kept sorted so that listings and saved attribute dumps are
/// stable from shot to shot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeSet {
    values: BTreeMap<String, AttributeValue>,
}

impl AttributeSet {
    /// Empty attribute set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a single attribute, overwriting any previous value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        self.values.insert(name.into(), value.into());
    }

    /// Merge many attributes into the store. Existing keys are overwritten.
    pub fn set_many<I, K, V>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<AttributeValue>,
    {
        for (name, value) in attributes {
            self.set(name, value);
        }
    }

    /// Look up an attribute by name.
    ///
    /// # Errors
    ///
    /// Returns [`CameraError::AttributeNotFound`] if the name is not set.
    pub fn get(&self, name: &str) -> AppResult<&AttributeValue> {
        self.values
            .get(name)
            .ok_or_else(|| CameraError::AttributeNotFound(name.to_string()))
    }

    /// All known attribute names.
    ///
    /// The visibility level and writeable filter are accepted for interface
    /// compatibility with IMAQdx cameras but not applied: the SDK reports no
    /// per-attribute visibility, so every name is returned.
    pub fn names(&self, _visibility: VisibilityLevel, _writeable_only: bool) -> Vec<String> {
        self.values.keys().cloned().collect()
    }

    /// Whether `name` has a value.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Number of attributes.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the set holds no attributes.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttributeValue)> {
        self.values.iter()
    }

    /// Underlying name to value map.
    pub fn as_map(&self) -> &BTreeMap<String, AttributeValue> {
        &self.values
    }

    /// Render as `name: value` lines, one per attribute.
    pub fn to_text(&self) -> String {
        self.values
            .iter()
            .map(|(name, value)| format!("{}: {}\n", name, value))
            .collect()
    }
}

impl From<BTreeMap<String, AttributeValue>> for AttributeSet {
    fn from(values: BTreeMap<String, AttributeValue>) -> Self {
        Self { values }
    }
}

impl<K: Into<String>, V: Into<AttributeValue>> FromIterator<(K, V)> for AttributeSet {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut set = AttributeSet::new();
        set.set_many(iter);
        set
    }
}

impl<'a> IntoIterator for &'a AttributeSet {
    type Item = (&'a String, &'a AttributeValue);
    type IntoIter = std::collections::btree_map::Iter<'a, String, AttributeValue>;

    fn into_iter(self) -> Self::IntoIter {
        self.values.iter()
    }
}
