//! Mutation requests accepted by the store.
//!
//! These are the typed shapes the parsing layer produces from protocol
//! messages. They are serde-enabled so request streams can be recorded and
//! replayed as JSON.

use crate::key::{link_key, NodeKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Property payload of a node or link-attribute node.
pub type Properties = BTreeMap<String, Value>;

/// Requested mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    AddOrChange,
    Delete,
    /// Re-announce an existing entry to listeners without changing it
    Notify,
}

/// Subsystem that asserted a property set or a link.
///
/// Ordering is significant: when several origins carry the same property,
/// the earliest variant wins.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    /// Configuration pushed by the external config source
    MapServer,
    /// Learned over the agent/control-node channel
    Xmpp,
    /// Locally generated
    Local,
    #[default]
    Unknown,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::MapServer => "map-server",
            Origin::Xmpp => "xmpp",
            Origin::Local => "local",
            Origin::Unknown => "unknown",
        }
    }
}

/// Node identity plus the sequence number of the request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeRequestKey {
    pub id_type: String,
    pub id_name: String,
    pub sequence_number: u64,
}

impl NodeRequestKey {
    pub fn new(id_type: impl Into<String>, id_name: impl Into<String>, seq: u64) -> Self {
        Self {
            id_type: id_type.into(),
            id_name: id_name.into(),
            sequence_number: seq,
        }
    }

    pub fn node_key(&self) -> NodeKey {
        NodeKey::new(self.id_type.clone(), self.id_name.clone())
    }

    pub fn matches(&self, key: &NodeKey) -> bool {
        self.id_type == key.id_type && self.id_name == key.id_name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeData {
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub properties: Properties,
}

/// Add/change or delete a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRequest {
    pub operation: Operation,
    pub key: NodeRequestKey,
    /// Present for `AddOrChange` only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<NodeData>,
    /// For `Delete`, limits removal to this origin's property set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl NodeRequest {
    pub fn add(id_type: &str, id_name: &str, seq: u64) -> Self {
        Self {
            operation: Operation::AddOrChange,
            key: NodeRequestKey::new(id_type, id_name, seq),
            data: Some(NodeData::default()),
            origin: None,
        }
    }

    pub fn delete(id_type: &str, id_name: &str, seq: u64) -> Self {
        Self {
            operation: Operation::Delete,
            key: NodeRequestKey::new(id_type, id_name, seq),
            data: None,
            origin: None,
        }
    }

    pub fn notify(id_type: &str, id_name: &str, seq: u64) -> Self {
        Self {
            operation: Operation::Notify,
            ..Self::delete(id_type, id_name, seq)
        }
    }

    /// Set one property of the payload (add requests only).
    pub fn with_property(mut self, name: impl Into<String>, value: Value) -> Self {
        self.data
            .get_or_insert_with(NodeData::default)
            .properties
            .insert(name.into(), value);
        self
    }

    /// Tag the payload origin, or scope a delete to a single origin.
    pub fn with_origin(mut self, origin: Origin) -> Self {
        match self.operation {
            Operation::AddOrChange => self.data.get_or_insert_with(NodeData::default).origin = origin,
            Operation::Delete | Operation::Notify => self.origin = Some(origin),
        }
        self
    }
}

/// Both endpoints of a link and the relation name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LinkRequestKey {
    pub left: NodeRequestKey,
    pub right: NodeRequestKey,
    pub relation: String,
}

impl LinkRequestKey {
    pub fn link_key(&self) -> String {
        link_key(&self.relation, &self.left.node_key(), &self.right.node_key())
    }

    /// Sequence number recorded on the link once applied.
    pub fn sequence_number(&self) -> u64 {
        self.left.sequence_number.max(self.right.sequence_number)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkData {
    #[serde(default)]
    pub origin: Origin,
    /// Data carried by the relation itself; routes the link through a
    /// link-attribute node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attr: Option<Properties>,
}

/// Add/change or delete a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkRequest {
    pub operation: Operation,
    pub key: LinkRequestKey,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<LinkData>,
    /// For `Delete`, limits removal to this origin.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Origin>,
}

impl LinkRequest {
    pub fn add(left: (&str, &str), right: (&str, &str), relation: &str, seq: u64) -> Self {
        Self {
            operation: Operation::AddOrChange,
            key: LinkRequestKey {
                left: NodeRequestKey::new(left.0, left.1, seq),
                right: NodeRequestKey::new(right.0, right.1, seq),
                relation: relation.to_string(),
            },
            data: Some(LinkData::default()),
            origin: None,
        }
    }

    pub fn delete(left: (&str, &str), right: (&str, &str), relation: &str, seq: u64) -> Self {
        Self {
            operation: Operation::Delete,
            key: LinkRequestKey {
                left: NodeRequestKey::new(left.0, left.1, seq),
                right: NodeRequestKey::new(right.0, right.1, seq),
                relation: relation.to_string(),
            },
            data: None,
            origin: None,
        }
    }

    pub fn notify(left: (&str, &str), right: (&str, &str), relation: &str, seq: u64) -> Self {
        Self {
            operation: Operation::Notify,
            ..Self::delete(left, right, relation, seq)
        }
    }

    pub fn with_origin(mut self, origin: Origin) -> Self {
        match self.operation {
            Operation::AddOrChange => self.data.get_or_insert_with(LinkData::default).origin = origin,
            Operation::Delete | Operation::Notify => self.origin = Some(origin),
        }
        self
    }

    pub fn with_attr(mut self, attr: Properties) -> Self {
        self.data.get_or_insert_with(LinkData::default).attr = Some(attr);
        self
    }

    pub fn origin(&self) -> Origin {
        self.data
            .as_ref()
            .map(|d| d.origin)
            .or(self.origin)
            .unwrap_or_default()
    }
}

/// A request for any table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Request {
    Node(NodeRequest),
    Link(LinkRequest),
}

impl From<NodeRequest> for Request {
    fn from(req: NodeRequest) -> Self {
        Request::Node(req)
    }
}

impl From<LinkRequest> for Request {
    fn from(req: LinkRequest) -> Self {
        Request::Link(req)
    }
}
