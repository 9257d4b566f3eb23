use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// An attribute value, deliberately narrow: the codec layer (`warden-tasks`)
/// is responsible for mapping richer Rust types onto these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttrValue {
    S(String),
    N(i64),
    Bool(bool),
    /// Opaque bytes, stored base64-encoded on the wire backends.
    B(Vec<u8>),
    /// A set of strings (used for `lockIds` / `prerequisiteTaskIds`).
    SS(Vec<String>),
}

impl AttrValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttrValue::S(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttrValue::N(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            AttrValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            AttrValue::B(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_string_set(&self) -> Option<&[String]> {
        match self {
            AttrValue::SS(ss) => Some(ss),
            _ => None,
        }
    }
}

/// A stored record: an attribute map keyed by the short attribute names of
/// spec.md §6.
pub type Item = BTreeMap<String, AttrValue>;

/// The two tables defined by spec.md §6.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    Tasks,
    Locks,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::Tasks => "monitor-tasks",
            Table::Locks => "monitor-locks",
        }
    }
}

/// A secondary index: a hash-key attribute and an optional range-key
/// attribute, scanned in range-key order.
#[derive(Debug, Clone, Copy)]
pub struct IndexDef {
    pub name: &'static str,
    pub hash_attr: &'static str,
    pub range_attr: Option<&'static str>,
}

/// `monitor-tasks` indices (spec.md §6): by monitor, by (entity type,
/// entity id), and their non-terminal mirrors.
pub const TASK_INDICES: &[IndexDef] = &[
    IndexDef { name: "by_monitor", hash_attr: "mid", range_attr: Some("id") },
    IndexDef { name: "by_entity", hash_attr: "ety", range_attr: Some("eid") },
    IndexDef { name: "by_entity_nt", hash_attr: "ntty", range_attr: Some("ntid") },
];

/// `monitor-locks` indices (spec.md §6): by monitor (used for monitor-death
/// recovery), and by lock id (the primary range scan used by release/sweep).
pub const LOCK_INDICES: &[IndexDef] = &[
    IndexDef { name: "by_monitor", hash_attr: "mid", range_attr: Some("lid") },
    IndexDef { name: "by_lock", hash_attr: "lid", range_attr: Some("tid") },
];
