//! Endpoint label sets and their four-category partition
//!
//! Labels attached to an endpoint are partitioned by key into four disjoint
//! categories:
//!
//! - [`OpLabels::orchestration_identity`] - identity-relevant labels derived
//!   from the orchestration system
//! - [`OpLabels::orchestration_info`] - informational labels that never
//!   contribute to the security identity
//! - [`OpLabels::custom`] - user-added labels, not (yet) identity-relevant
//! - [`OpLabels::disabled`] - identity-relevant labels explicitly suppressed
//!   via the API
//!
//! A label key appears in at most one category at any instant.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Label source for labels derived from the orchestration system
pub const SOURCE_ORCHESTRATION: &str = "orchestration";
/// Label source for labels reserved by the system itself
pub const SOURCE_RESERVED: &str = "reserved";
/// Label source for labels with no declared origin
pub const SOURCE_UNSPEC: &str = "unspec";

/// A single key/value label with its originating source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    /// Label key, unique within a label set
    pub key: String,
    /// Label value, may be empty
    pub value: String,
    /// Source the label was derived from (e.g. "orchestration")
    pub source: String,
}

impl Label {
    /// Create a new label with the given source.
    pub fn new(
        key: impl Into<String>,
        value: impl Into<String>,
        source: impl Into<String>,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            source: source.into(),
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}={}", self.source, self.key, self.value)
    }
}

/// An ordered set of labels keyed by label key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(pub BTreeMap<String, Label>);

impl Labels {
    /// Create an empty label set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a label, keyed by its key. Returns the previous label for the
    /// key, if any.
    pub fn insert(&mut self, label: Label) -> Option<Label> {
        self.0.insert(label.key.clone(), label)
    }

    /// Look up a label by key.
    pub fn get(&self, key: &str) -> Option<&Label> {
        self.0.get(key)
    }

    /// Remove a label by key.
    pub fn remove(&mut self, key: &str) -> Option<Label> {
        self.0.remove(key)
    }

    /// Whether a label with the given key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Number of labels in the set.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the set holds no labels.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the labels in key order.
    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.values()
    }

    /// Merge all labels of `other` into this set, overwriting same-key labels.
    pub fn merge(&mut self, other: &Labels) {
        for label in other.iter() {
            self.insert(label.clone());
        }
    }

    /// The canonical `source:key=value` representation of every label, in key
    /// order.
    pub fn to_model(&self) -> Vec<String> {
        self.iter().map(|l| l.to_string()).collect()
    }
}

impl FromIterator<Label> for Labels {
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut labels = Labels::new();
        for label in iter {
            labels.insert(label);
        }
        labels
    }
}

impl std::fmt::Display for Labels {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_model().join(","))
    }
}

/// SHA256 over the canonical representation of a label set, hex encoded.
///
/// The hash is stable across insertion order because [`Labels`] iterates in
/// key order.
pub fn labels_sha256(labels: &Labels) -> String {
    let mut hasher = Sha256::new();
    for label in labels.iter() {
        hasher.update(label.to_string().as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

/// The endpoint's label configuration, partitioned into the four categories.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpLabels {
    /// Identity-relevant labels derived from the orchestration system
    #[serde(default)]
    pub orchestration_identity: Labels,
    /// Informational labels, never identity-relevant
    #[serde(default)]
    pub orchestration_info: Labels,
    /// User-added labels, informational until promoted
    #[serde(default)]
    pub custom: Labels,
    /// Identity-relevant labels explicitly suppressed via the API
    #[serde(default)]
    pub disabled: Labels,
}

impl OpLabels {
    /// All labels across every category.
    pub fn all_labels(&self) -> Labels {
        let mut all = Labels::new();
        all.merge(&self.custom);
        all.merge(&self.disabled);
        all.merge(&self.orchestration_info);
        all.merge(&self.orchestration_identity);
        all
    }

    /// The labels that contribute to the security identity: the orchestration
    /// identity labels plus any custom labels.
    pub fn identity_labels(&self) -> Labels {
        let mut enabled = Labels::new();
        enabled.merge(&self.custom);
        enabled.merge(&self.orchestration_identity);
        enabled
    }

    /// Whether every label in `wanted` is present, with an equal value and
    /// source, in any category.
    pub fn contains_all(&self, wanted: &Labels) -> bool {
        let all = self.all_labels();
        wanted
            .iter()
            .all(|l| all.get(&l.key).map(|found| found == l).unwrap_or(false))
    }

    /// Whether any identity-relevant label originates from the reserved
    /// source. Reserved endpoints may not be modified through the API.
    pub fn has_reserved_identity_label(&self) -> bool {
        self.orchestration_identity
            .iter()
            .any(|l| l.source == SOURCE_RESERVED)
    }
}
