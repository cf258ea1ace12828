//! Incremental changes between two consecutive document states.
//!
//! One [`Delta`] describes one completed transaction. Deltas are applied
//! atomically: the changes run against a copy of the document, which only
//! replaces the original once every change succeeded. Applying the same
//! delta to a document already in the resulting state changes nothing.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::model::{Document, Link, ModelError, Node};

/// A single record-level change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum ModelChange {
    InsertNode {
        node: Node,
    },
    RemoveNode {
        key: String,
    },
    /// `value: null` removes the property.
    SetNodeProperty {
        key: String,
        property: String,
        value: Value,
    },
    InsertLink {
        link: Link,
    },
    RemoveLink {
        key: String,
    },
    SetLinkProperty {
        key: String,
        property: String,
        value: Value,
    },
    /// The link stored under `key` was retyped or reconnected; `link`
    /// replaces it in the same slot.
    RekeyLink {
        key: String,
        link: Link,
    },
}

/// Delta application errors.
#[derive(Debug, Clone, PartialEq)]
pub enum DeltaError {
    /// Property change aimed at a node the document does not have
    UnknownNode(String),
    /// Property change aimed at a link the document does not have
    UnknownLink(String),
    /// Property change would produce an invalid record
    InvalidProperty { property: String, reason: String },
    /// Model-level failure
    Model(ModelError),
}

impl fmt::Display for DeltaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownNode(key) => write!(f, "Unknown node: {key}"),
            Self::UnknownLink(key) => write!(f, "Unknown link: {key}"),
            Self::InvalidProperty { property, reason } => {
                write!(f, "Invalid value for property {property:?}: {reason}")
            }
            Self::Model(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DeltaError {}

impl From<ModelError> for DeltaError {
    fn from(e: ModelError) -> Self {
        DeltaError::Model(e)
    }
}

/// Changes produced by one completed transaction.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Delta {
    /// Transaction name ("move", "set multiplicity", ...)
    pub transaction: String,
    pub changes: Vec<ModelChange>,
}

fn record_map<T: Serialize>(record: &T) -> Result<Map<String, Value>, ModelError> {
    match serde_json::to_value(record) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ModelError::Serialization(format!(
            "record serialized to non-object {other}"
        ))),
        Err(e) => Err(ModelError::Serialization(e.to_string())),
    }
}

/// Property-level difference between two serialized records, in the order
/// properties appear (old first, then new-only ones).
fn property_changes(
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) -> Vec<(String, Value)> {
    let mut changes = Vec::new();
    for (property, old) in before {
        match after.get(property) {
            Some(new) if new == old => {}
            Some(new) => changes.push((property.clone(), new.clone())),
            None => changes.push((property.clone(), Value::Null)),
        }
    }
    for (property, new) in after {
        if !before.contains_key(property) {
            changes.push((property.clone(), new.clone()));
        }
    }
    changes
}

fn set_property<T>(record: &T, property: &str, value: &Value) -> Result<T, DeltaError>
where
    T: Serialize + serde::de::DeserializeOwned,
{
    if property == "key" {
        return Err(DeltaError::InvalidProperty {
            property: property.to_string(),
            reason: "keys are immutable".into(),
        });
    }
    let mut map = record_map(record)?;
    if value.is_null() {
        map.remove(property);
    } else {
        map.insert(property.to_string(), value.clone());
    }
    serde_json::from_value(Value::Object(map)).map_err(|e| DeltaError::InvalidProperty {
        property: property.to_string(),
        reason: e.to_string(),
    })
}

/// Whether `after` is `before` retyped or moved at one end.
fn same_relation(before: &Link, after: &Link) -> bool {
    match (before.from == after.from, before.to == after.to) {
        (true, true) => true,
        (true, false) | (false, true) => before.category == after.category,
        (false, false) => false,
    }
}

impl Delta {
    pub fn new(transaction: impl Into<String>) -> Self {
        Self {
            transaction: transaction.into(),
            changes: Vec::new(),
        }
    }

    pub fn push(&mut self, change: ModelChange) {
        self.changes.push(change);
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    /// Compute the changes that turn `before` into `after`.
    pub fn between(
        before: &Document,
        after: &Document,
        transaction: impl Into<String>,
    ) -> Result<Self, ModelError> {
        let mut delta = Self::new(transaction);

        let before_links: HashSet<&str> =
            before.link_data_array.iter().map(|l| l.key.as_str()).collect();
        let after_links: HashSet<&str> =
            after.link_data_array.iter().map(|l| l.key.as_str()).collect();
        let after_nodes: HashSet<&str> =
            after.node_data_array.iter().map(|n| n.key.as_str()).collect();

        // A link edited in place keeps its slot but not its key.
        let rekeyed: HashMap<&str, &Link> = after
            .link_data_array
            .iter()
            .enumerate()
            .filter_map(|(index, link)| {
                let old = before.link_data_array.get(index)?;
                let moved = !before_links.contains(link.key.as_str())
                    && !after_links.contains(old.key.as_str());
                (moved && same_relation(old, link)).then_some((old.key.as_str(), link))
            })
            .collect();
        let rekeyed_to: HashSet<&str> = rekeyed.values().map(|l| l.key.as_str()).collect();

        for link in &before.link_data_array {
            if after_links.contains(link.key.as_str()) {
                continue;
            }
            match rekeyed.get(link.key.as_str()) {
                Some(updated) => delta.push(ModelChange::RekeyLink {
                    key: link.key.clone(),
                    link: (*updated).clone(),
                }),
                None => delta.push(ModelChange::RemoveLink { key: link.key.clone() }),
            }
        }
        for node in &before.node_data_array {
            if !after_nodes.contains(node.key.as_str()) {
                delta.push(ModelChange::RemoveNode { key: node.key.clone() });
            }
        }

        for node in &after.node_data_array {
            match before.node(&node.key) {
                None => delta.push(ModelChange::InsertNode { node: node.clone() }),
                Some(old) if old == node => {}
                Some(old) => {
                    for (property, value) in property_changes(&record_map(old)?, &record_map(node)?) {
                        delta.push(ModelChange::SetNodeProperty {
                            key: node.key.clone(),
                            property,
                            value,
                        });
                    }
                }
            }
        }

        for link in &after.link_data_array {
            match before.link(&link.key) {
                None if rekeyed_to.contains(link.key.as_str()) => {}
                None => delta.push(ModelChange::InsertLink { link: link.clone() }),
                Some(old) if old == link => {}
                Some(old) => {
                    for (property, value) in property_changes(&record_map(old)?, &record_map(link)?) {
                        delta.push(ModelChange::SetLinkProperty {
                            key: link.key.clone(),
                            property,
                            value,
                        });
                    }
                }
            }
        }

        Ok(delta)
    }

    /// Apply every change, or none of them.
    pub fn apply_to(&self, doc: &mut Document) -> Result<(), DeltaError> {
        let mut working = doc.clone();
        for change in &self.changes {
            Self::apply_change(&mut working, change)?;
        }
        *doc = working;
        Ok(())
    }

    fn apply_change(doc: &mut Document, change: &ModelChange) -> Result<(), DeltaError> {
        match change {
            ModelChange::InsertNode { node } => doc.upsert_node(node.clone()),
            ModelChange::RemoveNode { key } => {
                doc.remove_node(key);
            }
            ModelChange::SetNodeProperty { key, property, value } => {
                let node = doc
                    .node(key)
                    .ok_or_else(|| DeltaError::UnknownNode(key.clone()))?;
                let updated = set_property(node, property, value)?;
                doc.upsert_node(updated);
            }
            ModelChange::InsertLink { link } => {
                let mut link = link.clone();
                link.rekey();
                if let Some(existing) = doc.link_mut(&link.key) {
                    *existing = link;
                } else if !doc.add_link(link.clone()) {
                    log::debug!("Skipping duplicate relation {}", link.key);
                }
            }
            ModelChange::RemoveLink { key } => {
                doc.remove_link(key);
            }
            ModelChange::SetLinkProperty { key, property, value } => {
                let link = doc
                    .link(key)
                    .ok_or_else(|| DeltaError::UnknownLink(key.clone()))?;
                let mut updated = set_property(link, property, value)?;
                updated.rekey();
                let clashes = doc
                    .link_data_array
                    .iter()
                    .any(|other| other.key != *key && other.key == updated.key);
                if clashes {
                    return Err(DeltaError::InvalidProperty {
                        property: property.clone(),
                        reason: "relation already exists".into(),
                    });
                }
                if let Some(existing) = doc.link_mut(key) {
                    *existing = updated;
                }
            }
            ModelChange::RekeyLink { key, link } => {
                let mut link = link.clone();
                link.rekey();
                let taken = doc
                    .link_data_array
                    .iter()
                    .any(|other| other.key != *key && other.key == link.key);
                match doc.link_data_array.iter().position(|l| l.key == *key) {
                    Some(index) if taken => {
                        log::debug!("Relation {} already exists; dropping {key}", link.key);
                        doc.link_data_array.remove(index);
                    }
                    Some(index) => doc.link_data_array[index] = link,
                    None => match doc.link_mut(&link.key) {
                        Some(existing) => *existing = link,
                        None => {
                            doc.add_link(link);
                        }
                    },
                }
            }
        }
        Ok(())
    }
}
