//! Canonical identities for nodes, links and tables.
//!
//! A link requested as (A, B) and one requested as (B, A) must land on the
//! same table entry, so every link and link-attribute key is derived from
//! the two endpoint names ordered lexically.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Name of the table holding every link entry.
pub const LINK_TABLE_NAME: &str = "__ifmap_metadata__.0";

/// Identity of a configuration node: its type and its name within that type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey {
    pub id_type: String,
    pub id_name: String,
}

impl NodeKey {
    pub fn new(id_type: impl Into<String>, id_name: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            id_name: id_name.into(),
        }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.id_type, self.id_name)
    }
}

fn ordered(a: &NodeKey, b: &NodeKey) -> (String, String) {
    let (a, b) = (a.to_string(), b.to_string());
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Key of the link entry for `relation` between `a` and `b`.
///
/// Formatted as `relation,min,max`; symmetric in `a` and `b`.
pub fn link_key(relation: &str, a: &NodeKey, b: &NodeKey) -> String {
    let (lo, hi) = ordered(a, b);
    format!("{},{},{}", relation, lo, hi)
}

/// Name of the link-attribute node carrying the data of a relation
/// between `a` and `b`, formatted as `attr(min,max)`.
pub fn link_attr_key(a: &NodeKey, b: &NodeKey) -> String {
    let (lo, hi) = ordered(a, b);
    format!("attr({},{})", lo, hi)
}

/// Table name for nodes of `id_type`.
pub fn table_name(id_type: &str) -> String {
    format!("__ifmap__.{}.0", id_type.replace('-', "_"))
}
