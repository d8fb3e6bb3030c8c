//! Structural comparison of version payloads.
//!
//! Payloads are flattened into leaf paths (`headline`, `slides[0].title`,
//! `$` for a scalar root). The diff lists added, removed and changed paths;
//! similarity is the mean per-path score over the union of paths, where an
//! equal value scores 1, two strings score their word-set Jaccard index and
//! anything else scores 0.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use contentforge_core::{JobId, StepKind, VersionId};

use crate::version::{ContentVersion, VersionError};

const ROOT: &str = "$";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValue {
    pub path: String,
    pub value: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangedField {
    pub path: String,
    pub before: JsonValue,
    pub after: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentDiff {
    pub added: Vec<FieldValue>,
    pub removed: Vec<FieldValue>,
    pub changed: Vec<ChangedField>,
    /// In `[0, 1]`; 1 means identical payloads.
    pub similarity: f64,
}

impl ContentDiff {
    pub fn is_identical(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.changed.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRef {
    pub id: VersionId,
    pub step: StepKind,
    pub number: u32,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl From<&ContentVersion> for VersionRef {
    fn from(v: &ContentVersion) -> Self {
        Self {
            id: v.id,
            step: v.step,
            number: v.number,
            is_active: v.is_active,
            created_at: v.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionComparison {
    pub job_id: JobId,
    pub left: VersionRef,
    pub right: VersionRef,
    pub diff: ContentDiff,
}

/// Compares two versions of the same job. Steps may differ.
pub fn compare_versions(left: &ContentVersion, right: &ContentVersion) -> Result<VersionComparison, VersionError> {
    if left.id == right.id {
        return Err(VersionError::SameVersion(left.id));
    }
    if left.job_id != right.job_id {
        return Err(VersionError::CrossJob {
            left: left.id,
            right: right.id,
        });
    }
    Ok(VersionComparison {
        job_id: left.job_id,
        left: left.into(),
        right: right.into(),
        diff: diff(&left.content, &right.content),
    })
}

pub fn diff(left: &JsonValue, right: &JsonValue) -> ContentDiff {
    let before = flatten(left);
    let after = flatten(right);

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut changed = Vec::new();
    let mut score = 0.0;

    let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
    for path in &paths {
        match (before.get(*path), after.get(*path)) {
            (Some(b), Some(a)) if b == a => score += 1.0,
            (Some(b), Some(a)) => {
                if let (JsonValue::String(bs), JsonValue::String(as_)) = (b, a) {
                    score += word_jaccard(bs, as_);
                }
                changed.push(ChangedField {
                    path: (*path).clone(),
                    before: b.clone(),
                    after: a.clone(),
                });
            }
            (Some(b), None) => removed.push(FieldValue {
                path: (*path).clone(),
                value: b.clone(),
            }),
            (None, Some(a)) => added.push(FieldValue {
                path: (*path).clone(),
                value: a.clone(),
            }),
            (None, None) => {}
        }
    }

    let similarity = if paths.is_empty() {
        1.0
    } else {
        score / paths.len() as f64
    };

    ContentDiff {
        added,
        removed,
        changed,
        similarity,
    }
}

fn flatten(value: &JsonValue) -> BTreeMap<String, JsonValue> {
    let mut out = BTreeMap::new();
    flatten_into(String::new(), value, &mut out);
    out
}

fn flatten_into(prefix: String, value: &JsonValue, out: &mut BTreeMap<String, JsonValue>) {
    match value {
        JsonValue::Object(map) if !map.is_empty() => {
            for (key, child) in map {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_into(path, child, out);
            }
        }
        JsonValue::Array(items) if !items.is_empty() => {
            for (i, child) in items.iter().enumerate() {
                flatten_into(format!("{prefix}[{i}]"), child, out);
            }
        }
        leaf => {
            let path = if prefix.is_empty() { ROOT.to_string() } else { prefix };
            out.insert(path, leaf.clone());
        }
    }
}

fn word_jaccard(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let right: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    let union = left.union(&right).count();
    if union == 0 {
        return 1.0;
    }
    left.intersection(&right).count() as f64 / union as f64
}
