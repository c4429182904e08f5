//! Member profile change tracking.
//!
//! A member's identity fields are projected into a [`ProfileSnapshot`] and
//! hashed. A history entry is produced only when the hash moves, and the
//! history embedded in the member row is capped, oldest entries first out.
//! Everything here is pure; persisting the result is the caller's job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::types::Member;

/// Fields that make up a member's identity. Roles and timestamps change
/// independently of identity and are excluded.
pub const IDENTITY_FIELDS: [&str; 8] = [
    "username",
    "global_name",
    "nickname",
    "avatar",
    "guild_avatar",
    "banner",
    "accent_color",
    "public_flags",
];

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Normalized identity projection. Keys are kept sorted, so two snapshots
/// with equal values serialize identically regardless of insertion order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot(BTreeMap<String, Value>);

impl ProfileSnapshot {
    pub fn from_member(member: &Member) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert("username".to_string(), Value::from(member.username.clone()));
        fields.insert("global_name".to_string(), opt(&member.global_name));
        fields.insert("nickname".to_string(), opt(&member.nickname));
        fields.insert("avatar".to_string(), opt(&member.avatar));
        fields.insert("guild_avatar".to_string(), opt(&member.guild_avatar));
        fields.insert("banner".to_string(), opt(&member.banner));
        fields.insert(
            "accent_color".to_string(),
            member.accent_color.map(Value::from).unwrap_or(Value::Null),
        );
        fields.insert("public_flags".to_string(), Value::from(member.public_flags));
        Self(fields)
    }

    /// Build from arbitrary pairs. Fields outside [`IDENTITY_FIELDS`] are dropped.
    pub fn from_fields<I, K>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        Self(
            fields
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .filter(|(k, _)| IDENTITY_FIELDS.contains(&k.as_str()))
                .collect(),
        )
    }

    pub fn get(&self, field: &str) -> &Value {
        self.0.get(field).unwrap_or(&Value::Null)
    }

    /// Deterministic content hash (BLAKE3 over canonical JSON, hex encoded)
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(&canonicalize(&Value::Object(
            self.0.clone().into_iter().collect(),
        )))
        .unwrap_or_default();
        blake3::hash(&canonical).to_hex().to_string()
    }
}

fn opt(value: &Option<String>) -> Value {
    value.clone().map(Value::from).unwrap_or(Value::Null)
}

/// Rebuild nested objects with sorted keys
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, Value> =
                map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
            Value::Object(sorted.into_iter().map(|(k, v)| (k.clone(), v)).collect())
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub old: Value,
    pub new: Value,
}

/// One recorded identity change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileHistoryEntry {
    pub changed_fields: BTreeMap<String, FieldChange>,
    pub profile_hash: String,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProfileHistoryTracker {
    history_limit: usize,
}

impl Default for ProfileHistoryTracker {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

impl ProfileHistoryTracker {
    pub fn new(history_limit: usize) -> Self {
        Self {
            history_limit: history_limit.max(1),
        }
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    /// Compare the current snapshot against the stored one.
    ///
    /// `stored_hash` is the hash recorded on the stored row; when absent it is
    /// recomputed from `stored`. Returns `None` when nothing changed.
    pub fn diff(
        &self,
        current: &ProfileSnapshot,
        stored: &ProfileSnapshot,
        stored_hash: Option<&str>,
        at: DateTime<Utc>,
    ) -> Option<ProfileHistoryEntry> {
        let current_hash = current.hash();
        let previous_hash = stored_hash
            .map(str::to_owned)
            .unwrap_or_else(|| stored.hash());
        if current_hash == previous_hash {
            return None;
        }

        let changed_fields: BTreeMap<String, FieldChange> = IDENTITY_FIELDS
            .iter()
            .filter_map(|field| {
                let old = stored.get(field);
                let new = current.get(field);
                (old != new).then(|| {
                    (
                        field.to_string(),
                        FieldChange {
                            old: old.clone(),
                            new: new.clone(),
                        },
                    )
                })
            })
            .collect();

        // A stale stored hash with identical fields is not a change
        if changed_fields.is_empty() {
            return None;
        }

        Some(ProfileHistoryEntry {
            changed_fields,
            profile_hash: current_hash,
            changed_at: at,
        })
    }

    pub fn diff_members(
        &self,
        current: &Member,
        stored: &Member,
        at: DateTime<Utc>,
    ) -> Option<ProfileHistoryEntry> {
        self.diff(
            &ProfileSnapshot::from_member(current),
            &ProfileSnapshot::from_member(stored),
            stored.profile_hash.as_deref(),
            at,
        )
    }

    /// Append `entry` to the stored history and carry it onto `current`.
    pub fn apply_history(
        &self,
        current: Member,
        stored: &Member,
        entry: ProfileHistoryEntry,
    ) -> Member {
        let mut history = stored.profile_history.clone();
        let hash = entry.profile_hash.clone();
        history.push(entry);
        if history.len() > self.history_limit {
            let excess = history.len() - self.history_limit;
            history.drain(..excess);
        }

        Member {
            profile_hash: Some(hash),
            profile_history: history,
            ..current
        }
    }

    /// Stamp a first-observed member with its profile hash
    pub fn seed(&self, mut member: Member) -> Member {
        member.profile_hash = Some(ProfileSnapshot::from_member(&member).hash());
        member
    }

    /// Combine a live member with its stored row.
    ///
    /// Returns the row to persist and the history entry that was appended, if
    /// any. The stored history always carries over.
    pub fn merge(
        &self,
        current: Member,
        stored: Option<&Member>,
        at: DateTime<Utc>,
    ) -> (Member, Option<ProfileHistoryEntry>) {
        let Some(stored) = stored else {
            return (self.seed(current), None);
        };

        match self.diff_members(&current, stored, at) {
            Some(entry) => {
                let updated = self.apply_history(current, stored, entry.clone());
                (updated, Some(entry))
            }
            None => {
                let mut updated = current;
                updated.profile_history = stored.profile_history.clone();
                updated.profile_hash = Some(ProfileSnapshot::from_member(&updated).hash());
                (updated, None)
            }
        }
    }
}
