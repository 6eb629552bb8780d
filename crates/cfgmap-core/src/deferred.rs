//! Deferred link resolution.
//!
//! A link whose endpoints are not both resolvable is parked here, keyed by
//! its link key, and indexed from each endpoint so that either side becoming
//! resolvable can find it. Both index directions point at a single record,
//! so removing a deferred link is one operation.

use crate::key::NodeKey;
use crate::request::{
    LinkData, LinkRequest, LinkRequestKey, NodeRequestKey, Operation, Origin, Properties,
};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::trace;

/// A link waiting for its endpoints.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredLink {
    pub left: NodeRequestKey,
    pub right: NodeRequestKey,
    pub relation: String,
    /// Data carried by the relation itself
    pub attr: Option<Properties>,
    /// Sequence number of each origin claiming the link
    pub origins: BTreeMap<Origin, u64>,
}

impl DeferredLink {
    /// (this side, opposite side) as seen from `key`.
    fn sides(&self, key: &NodeKey) -> Option<(&NodeRequestKey, &NodeRequestKey)> {
        if self.left.matches(key) {
            Some((&self.left, &self.right))
        } else if self.right.matches(key) {
            Some((&self.right, &self.left))
        } else {
            None
        }
    }

    /// One add request per claiming origin, in origin order.
    ///
    /// Each request carries its origin's sequence number, capped by the
    /// recorded side numbers, so an origin older than the link comes back
    /// at its own generation.
    pub fn to_requests(&self) -> Vec<LinkRequest> {
        let side = |key: &NodeRequestKey, seq: u64| NodeRequestKey {
            sequence_number: key.sequence_number.min(seq),
            ..key.clone()
        };
        self.origins
            .iter()
            .map(|(&origin, &seq)| LinkRequest {
                operation: Operation::AddOrChange,
                key: LinkRequestKey {
                    left: side(&self.left, seq),
                    right: side(&self.right, seq),
                    relation: self.relation.clone(),
                },
                data: Some(LinkData {
                    origin,
                    attr: self.attr.clone(),
                }),
                origin: None,
            })
            .collect()
    }
}

/// Pending links indexed by link key and by endpoint.
#[derive(Debug, Default)]
pub struct DeferredLinkResolver {
    records: HashMap<String, DeferredLink>,
    by_endpoint: HashMap<NodeKey, BTreeSet<String>>,
}

impl DeferredLinkResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park a link request whose endpoints could not be resolved.
    ///
    /// An add upserts the claim of its origin. A delete withdraws the claim
    /// of its origin, or the whole record if the delete names none. A
    /// notify has nothing to act on.
    pub fn defer(&mut self, req: &LinkRequest) {
        match req.operation {
            Operation::AddOrChange => {
                let data = req.data.clone().unwrap_or_default();
                let seq = req.key.sequence_number();
                self.park(&req.key, data.attr, [(data.origin, seq)]);
            }
            Operation::Delete => {
                self.cancel(&req.key.link_key(), req.origin);
            }
            Operation::Notify => {
                trace!(link = %req.key.link_key(), "Notify for unresolved link ignored");
            }
        }
    }

    /// Park `key` on behalf of each `(origin, sequence number)` pair,
    /// merging into the record already parked under the same link key.
    pub fn park(
        &mut self,
        key: &LinkRequestKey,
        attr: Option<Properties>,
        origins: impl IntoIterator<Item = (Origin, u64)>,
    ) {
        let link_key = key.link_key();
        if let Some(record) = self.records.get_mut(&link_key) {
            record.left.sequence_number = key.left.sequence_number;
            record.right.sequence_number = key.right.sequence_number;
            record.attr = attr;
            record.origins.extend(origins);
            trace!(link = %link_key, seq = key.sequence_number(), "Deferred link refreshed");
            return;
        }
        let record = DeferredLink {
            left: key.left.clone(),
            right: key.right.clone(),
            relation: key.relation.clone(),
            attr,
            origins: origins.into_iter().collect(),
        };
        self.index(&record.left.node_key(), &link_key);
        self.index(&record.right.node_key(), &link_key);
        self.records.insert(link_key.clone(), record);
        trace!(link = %link_key, seq = key.sequence_number(), "Link deferred");
    }

    /// Withdraw the claim of `origin` on a parked link, or the whole record
    /// for `None`. The record is dropped once no origin claims it.
    pub fn cancel(&mut self, link_key: &str, origin: Option<Origin>) -> bool {
        let empty = match (self.records.get_mut(link_key), origin) {
            (None, _) => return false,
            (Some(_), None) => true,
            (Some(record), Some(origin)) => {
                if record.origins.remove(&origin).is_none() {
                    return false;
                }
                record.origins.is_empty()
            }
        };
        if empty {
            self.remove(link_key);
        }
        trace!(link = %link_key, origin = ?origin, "Deferred link cancelled");
        true
    }

    fn index(&mut self, endpoint: &NodeKey, key: &str) {
        self.by_endpoint
            .entry(endpoint.clone())
            .or_default()
            .insert(key.to_string());
    }

    fn unindex(&mut self, endpoint: &NodeKey, key: &str) {
        if let Some(keys) = self.by_endpoint.get_mut(endpoint) {
            keys.remove(key);
            if keys.is_empty() {
                self.by_endpoint.remove(endpoint);
            }
        }
    }

    /// Remove the record for `link_key` from both sides.
    pub fn remove(&mut self, link_key: &str) -> Option<DeferredLink> {
        let record = self.records.remove(link_key)?;
        self.unindex(&record.left.node_key(), link_key);
        self.unindex(&record.right.node_key(), link_key);
        Some(record)
    }

    /// Re-evaluate links parked on `resolved`, which just became resolvable
    /// at generation `resolved_seq`.
    ///
    /// `lookup` reports the current sequence number of a live node, or
    /// `None` if the node is missing or deleted. Each side is checked
    /// against its own recorded sequence number. A record older than
    /// `resolved_seq` is stale and stays parked until purged. A record
    /// ahead of `resolved_seq` also stays parked: it is applied only when
    /// the node itself reaches the recorded generation.
    ///
    /// Ready records are removed and returned as add requests, one per
    /// claiming origin.
    pub fn eval(
        &mut self,
        resolved: &NodeKey,
        resolved_seq: u64,
        lookup: impl Fn(&NodeKey) -> Option<u64>,
    ) -> Vec<LinkRequest> {
        let Some(keys) = self.by_endpoint.get(resolved) else {
            return Vec::new();
        };

        let ready: Vec<String> = keys
            .iter()
            .filter(|key| {
                let Some((mine, other)) =
                    self.records.get(*key).and_then(|r| r.sides(resolved))
                else {
                    return false;
                };
                if mine.sequence_number != resolved_seq {
                    trace!(
                        link = %key,
                        seq = mine.sequence_number,
                        current = resolved_seq,
                        "Deferred link generation mismatch"
                    );
                    return false;
                }
                lookup(&other.node_key()).is_some_and(|seq| seq >= other.sequence_number)
            })
            .cloned()
            .collect();

        ready
            .iter()
            .filter_map(|key| self.remove(key))
            .flat_map(|record| record.to_requests())
            .collect()
    }

    /// Drop every record with either side older than `watermark`.
    pub fn purge_stale(&mut self, watermark: u64) -> usize {
        let stale: Vec<String> = self
            .records
            .iter()
            .filter(|(_, r)| {
                r.left.sequence_number < watermark || r.right.sequence_number < watermark
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }

    /// Drop everything.
    pub fn destroy(&mut self) {
        self.records.clear();
        self.by_endpoint.clear();
    }

    pub fn get(&self, link_key: &str) -> Option<&DeferredLink> {
        self.records.get(link_key)
    }

    pub fn contains(&self, link_key: &str) -> bool {
        self.records.contains_key(link_key)
    }

    /// Number of endpoints with parked links.
    pub fn endpoint_count(&self) -> usize {
        self.by_endpoint.len()
    }

    /// Link keys parked on `endpoint`, in key order.
    pub fn pending_for(&self, endpoint: &NodeKey) -> Vec<String> {
        self.by_endpoint
            .get(endpoint)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
