//! Canonical class-diagram document.
//!
//! The document is the engine's graph-links model: an ordered node array, an
//! ordered link array and the property-name metadata the engine needs to
//! interpret them. Every snapshot entering the system passes through
//! [`Document::from_value`], which normalizes whatever shape it arrives in
//! (string-encoded, missing arrays, legacy class tag) into a valid value.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use crate::geometry::{Point, Size};

/// Class tag written into every normalized document.
pub const GRAPH_LINKS_MODEL: &str = "go.GraphLinksModel";
/// Legacy class tag accepted on input and rewritten.
const LEGACY_GRAPH_LINKS_MODEL: &str = "GraphLinksModel";

pub const DEFAULT_KEY_PROPERTY: &str = "key";
pub const DEFAULT_CATEGORY_PROPERTY: &str = "category";
pub const DEFAULT_NODE_CATEGORY: &str = "class";

/// Model errors.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelError {
    /// Payload is not valid JSON
    Malformed(String),
    /// JSON is valid but does not describe a document
    InvalidShape(String),
    /// Location/size string could not be parsed
    InvalidGeometry(String),
    /// Serialization failed
    Serialization(String),
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(e) => write!(f, "Malformed document: {e}"),
            Self::InvalidShape(e) => write!(f, "Invalid document shape: {e}"),
            Self::InvalidGeometry(raw) => write!(f, "Invalid geometry string: {raw:?}"),
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
        }
    }
}

impl std::error::Error for ModelError {}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn default_node_category() -> String {
    DEFAULT_NODE_CATEGORY.to_string()
}

/// Record keys arrive as strings or, when the engine assigned them, numbers.
fn record_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(key) => Ok(key),
        Value::Number(key) => Ok(key.to_string()),
        Value::Bool(key) => Ok(key.to_string()),
        other => Err(serde::de::Error::custom(format!("invalid record key {other}"))),
    }
}

fn optional_record_key<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None => Ok(String::new()),
        Some(value) => record_key(value).map_err(serde::de::Error::custom),
    }
}

/// UML attribute row of a class box.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Attribute {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: String,
    pub nullable: bool,
    pub unique: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, ty: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ty: ty.into(),
            ..Self::default()
        }
    }
}

/// UML operation row of a class box.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Operation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub params: Vec<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub return_type: Option<String>,
}

/// One class/entity box.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "NodeRecord", into = "NodeRecord")]
pub struct Node {
    pub key: String,
    pub category: String,
    pub name: String,
    pub stereotype: Option<String>,
    pub is_abstract: bool,
    pub attributes: Vec<Attribute>,
    pub operations: Vec<Operation>,
    pub loc: Option<Point>,
    pub size: Option<Size>,
    /// Engine-owned properties this crate does not interpret. A `loc` or
    /// `size` string that does not parse is kept here verbatim.
    pub extra: Map<String, Value>,
}

/// Wire shape of a node; geometry stays raw JSON until it is parsed.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeRecord {
    #[serde(deserialize_with = "record_key")]
    key: String,
    #[serde(default = "default_node_category")]
    category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    stereotype: Option<String>,
    #[serde(default, rename = "abstract", deserialize_with = "null_as_default")]
    is_abstract: bool,
    #[serde(default, deserialize_with = "null_as_default")]
    attributes: Vec<Attribute>,
    #[serde(default, deserialize_with = "null_as_default")]
    operations: Vec<Operation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    loc: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    size: Option<Value>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn parse_geometry<T: FromStr>(
    raw: Option<Value>,
    property: &str,
    extra: &mut Map<String, Value>,
) -> Option<T> {
    let raw = raw?;
    if let Some(parsed) = raw.as_str().and_then(|text| text.parse().ok()) {
        return Some(parsed);
    }
    log::debug!("Keeping unreadable {property} {raw} as-is");
    extra.insert(property.to_string(), raw);
    None
}

fn geometry_value<T: fmt::Display>(
    parsed: Option<T>,
    property: &str,
    extra: &mut Map<String, Value>,
) -> Option<Value> {
    match parsed {
        Some(parsed) => {
            extra.remove(property);
            Some(Value::String(parsed.to_string()))
        }
        None => extra.remove(property),
    }
}

impl From<NodeRecord> for Node {
    fn from(record: NodeRecord) -> Self {
        let mut extra = record.extra;
        let loc = parse_geometry(record.loc, "loc", &mut extra);
        let size = parse_geometry(record.size, "size", &mut extra);
        Self {
            key: record.key,
            category: record.category,
            name: record.name,
            stereotype: record.stereotype,
            is_abstract: record.is_abstract,
            attributes: record.attributes,
            operations: record.operations,
            loc,
            size,
            extra,
        }
    }
}

impl From<Node> for NodeRecord {
    fn from(node: Node) -> Self {
        let mut extra = node.extra;
        let loc = geometry_value(node.loc, "loc", &mut extra);
        let size = geometry_value(node.size, "size", &mut extra);
        Self {
            key: node.key,
            category: node.category,
            name: node.name,
            stereotype: node.stereotype,
            is_abstract: node.is_abstract,
            attributes: node.attributes,
            operations: node.operations,
            loc,
            size,
            extra,
        }
    }
}

impl Node {
    /// A plain class node.
    pub fn class(key: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            category: default_node_category(),
            name: name.into(),
            stereotype: None,
            is_abstract: false,
            attributes: Vec::new(),
            operations: Vec::new(),
            loc: None,
            size: None,
            extra: Map::new(),
        }
    }

    pub fn at(mut self, x: f64, y: f64) -> Self {
        self.loc = Some(Point::new(x, y));
        self
    }

    pub fn with_attribute(mut self, attribute: Attribute) -> Self {
        self.attributes.push(attribute);
        self
    }
}

/// UML relation kinds.
///
/// A missing or empty category reads as an association. Names this crate
/// does not know are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum LinkCategory {
    #[default]
    Association,
    Aggregation,
    Composition,
    Generalization,
    Realization,
    Dependency,
    Other(String),
}

impl LinkCategory {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Association => "association",
            Self::Aggregation => "aggregation",
            Self::Composition => "composition",
            Self::Generalization => "generalization",
            Self::Realization => "realization",
            Self::Dependency => "dependency",
            Self::Other(name) => name.as_str(),
        }
    }
}

impl From<&str> for LinkCategory {
    fn from(name: &str) -> Self {
        match name {
            "" | "association" => Self::Association,
            "aggregation" => Self::Aggregation,
            "composition" => Self::Composition,
            "generalization" => Self::Generalization,
            "realization" => Self::Realization,
            "dependency" => Self::Dependency,
            other => Self::Other(other.to_string()),
        }
    }
}

impl fmt::Display for LinkCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for LinkCategory {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for LinkCategory {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(deserializer)? {
            Value::Null => Self::default(),
            Value::String(name) => Self::from(name.as_str()),
            other => Self::Other(other.to_string()),
        })
    }
}

/// One relation edge between two nodes.
///
/// The key always follows the endpoints and category; see [`Link::rekey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    #[serde(default, deserialize_with = "optional_record_key")]
    pub key: String,
    #[serde(default)]
    pub category: LinkCategory,
    #[serde(deserialize_with = "record_key")]
    pub from: String,
    #[serde(deserialize_with = "record_key")]
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_multiplicity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_multiplicity: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Link {
    pub fn new(from: impl Into<String>, to: impl Into<String>, category: LinkCategory) -> Self {
        let from = from.into();
        let to = to.into();
        Self {
            key: Self::derive_key(&from, &to, &category),
            category,
            from,
            to,
            from_multiplicity: None,
            to_multiplicity: None,
            extra: Map::new(),
        }
    }

    /// Deterministic key for an endpoint/category triple.
    pub fn derive_key(from: &str, to: &str, category: &LinkCategory) -> String {
        format!("{from}->{to}:{category}")
    }

    /// Reset the key to the one derived from the current endpoints and
    /// category. Returns whether it changed.
    pub fn rekey(&mut self) -> bool {
        let derived = Self::derive_key(&self.from, &self.to, &self.category);
        if self.key == derived {
            return false;
        }
        self.key = derived;
        true
    }

    fn triple(&self) -> (&str, &str, &LinkCategory) {
        (&self.from, &self.to, &self.category)
    }
}

/// Full diagram state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub class: String,
    pub node_key_property: String,
    pub link_key_property: String,
    pub link_category_property: String,
    pub node_data_array: Vec<Node>,
    pub link_data_array: Vec<Link>,
}

impl Default for Document {
    fn default() -> Self {
        Self {
            class: GRAPH_LINKS_MODEL.to_string(),
            node_key_property: DEFAULT_KEY_PROPERTY.to_string(),
            link_key_property: DEFAULT_KEY_PROPERTY.to_string(),
            link_category_property: DEFAULT_CATEGORY_PROPERTY.to_string(),
            node_data_array: Vec::new(),
            link_data_array: Vec::new(),
        }
    }
}

/// Rewrites an arbitrary JSON value into the document shape.
///
/// Strings are decoded up to twice (payloads are sometimes double-encoded),
/// non-objects become an empty document, and missing metadata or arrays are
/// filled with defaults.
pub fn normalize_value(raw: Value) -> Value {
    let mut value = raw;
    for _ in 0..2 {
        let Value::String(text) = &value else { break };
        match serde_json::from_str::<Value>(text) {
            Ok(decoded) => value = decoded,
            Err(_) => break,
        }
    }

    let mut map = match value {
        Value::Object(map) => map,
        _ => Map::new(),
    };

    let class_ok = matches!(
        map.get("class").and_then(Value::as_str),
        Some(class) if !class.is_empty() && class != LEGACY_GRAPH_LINKS_MODEL
    );
    if !class_ok {
        map.insert("class".into(), Value::from(GRAPH_LINKS_MODEL));
    }

    for (property, default) in [
        ("nodeKeyProperty", DEFAULT_KEY_PROPERTY),
        ("linkKeyProperty", DEFAULT_KEY_PROPERTY),
        ("linkCategoryProperty", DEFAULT_CATEGORY_PROPERTY),
    ] {
        let present = map
            .get(property)
            .and_then(Value::as_str)
            .is_some_and(|s| !s.is_empty());
        if !present {
            map.insert(property.into(), Value::from(default));
        }
    }

    for array in ["nodeDataArray", "linkDataArray"] {
        if !map.get(array).is_some_and(Value::is_array) {
            map.insert(array.into(), Value::Array(Vec::new()));
        }
    }

    Value::Object(map)
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a serialized snapshot. Invalid JSON is an error; any valid JSON
    /// is normalized.
    pub fn parse(raw: &str) -> Result<Self, ModelError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| ModelError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Build a document from any JSON value, normalizing it first.
    pub fn from_value(value: Value) -> Result<Self, ModelError> {
        let mut doc: Document = serde_json::from_value(normalize_value(value))
            .map_err(|e| ModelError::InvalidShape(e.to_string()))?;
        doc.repair();
        Ok(doc)
    }

    /// Canonical compact serialization.
    pub fn to_json(&self) -> Result<String, ModelError> {
        serde_json::to_string(self).map_err(|e| ModelError::Serialization(e.to_string()))
    }

    pub fn to_value(&self) -> Result<Value, ModelError> {
        serde_json::to_value(self).map_err(|e| ModelError::Serialization(e.to_string()))
    }

    /// Drop duplicate nodes and re-key links.
    ///
    /// The first node per key wins.
    fn repair(&mut self) {
        let mut seen_nodes = HashSet::new();
        self.node_data_array.retain(|node| {
            let fresh = seen_nodes.insert(node.key.clone());
            if !fresh {
                log::warn!("Dropping duplicate node {:?}", node.key);
            }
            fresh
        });
        self.rekey_links();
    }

    /// Re-derive every link key from its endpoints and category.
    ///
    /// Links are edited in place (retyped, reconnected), so keys go stale;
    /// engines call this when a transaction commits. When two links end up
    /// describing the same relation the first one wins.
    pub fn rekey_links(&mut self) {
        let mut seen = HashSet::new();
        self.link_data_array.retain_mut(|link| {
            let stale = link.key.clone();
            if link.rekey() && !stale.is_empty() {
                log::debug!("Re-keyed link {stale:?} as {:?}", link.key);
            }
            let (from, to, category) = link.triple();
            let fresh = seen.insert((from.to_string(), to.to_string(), category.clone()));
            if !fresh {
                log::warn!("Dropping duplicate link {:?}", link.key);
            }
            fresh
        });
    }

    /// No nodes and no links.
    pub fn is_empty(&self) -> bool {
        self.node_data_array.is_empty() && self.link_data_array.is_empty()
    }

    pub fn node_count(&self) -> usize {
        self.node_data_array.len()
    }

    pub fn link_count(&self) -> usize {
        self.link_data_array.len()
    }

    pub fn node(&self, key: &str) -> Option<&Node> {
        self.node_data_array.iter().find(|n| n.key == key)
    }

    pub fn node_mut(&mut self, key: &str) -> Option<&mut Node> {
        self.node_data_array.iter_mut().find(|n| n.key == key)
    }

    pub fn link(&self, key: &str) -> Option<&Link> {
        self.link_data_array.iter().find(|l| l.key == key)
    }

    pub fn link_mut(&mut self, key: &str) -> Option<&mut Link> {
        self.link_data_array.iter_mut().find(|l| l.key == key)
    }

    /// Insert a node, replacing any node with the same key in place.
    pub fn upsert_node(&mut self, node: Node) {
        match self.node_data_array.iter_mut().find(|n| n.key == node.key) {
            Some(existing) => *existing = node,
            None => self.node_data_array.push(node),
        }
    }

    /// Remove a node and every link touching it.
    pub fn remove_node(&mut self, key: &str) -> Option<Node> {
        let index = self.node_data_array.iter().position(|n| n.key == key)?;
        let removed = self.node_data_array.remove(index);
        self.link_data_array.retain(|l| l.from != key && l.to != key);
        Some(removed)
    }

    /// Whether a relation with this triple already exists.
    pub fn has_relation(&self, from: &str, to: &str, category: &LinkCategory) -> bool {
        self.link_data_array
            .iter()
            .any(|l| l.triple() == (from, to, category))
    }

    /// Insert a relation under its derived key.
    ///
    /// Returns `false` (and leaves the document untouched) when a link with
    /// the same (from, to, category) triple already exists.
    pub fn add_link(&mut self, mut link: Link) -> bool {
        link.rekey();
        if self.has_relation(&link.from, &link.to, &link.category) || self.link(&link.key).is_some()
        {
            return false;
        }
        self.link_data_array.push(link);
        true
    }

    pub fn remove_link(&mut self, key: &str) -> Option<Link> {
        let index = self.link_data_array.iter().position(|l| l.key == key)?;
        Some(self.link_data_array.remove(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_fills_defaults() {
        let doc = Document::from_value(json!({})).unwrap();
        assert_eq!(doc.class, GRAPH_LINKS_MODEL);
        assert_eq!(doc.node_key_property, "key");
        assert_eq!(doc.link_key_property, "key");
        assert_eq!(doc.link_category_property, "category");
        assert!(doc.is_empty());
    }

    #[test]
    fn test_normalize_legacy_class_and_bad_arrays() {
        let doc = Document::from_value(json!({
            "class": "GraphLinksModel",
            "nodeDataArray": "oops",
            "linkDataArray": null,
        }))
        .unwrap();
        assert_eq!(doc.class, GRAPH_LINKS_MODEL);
        assert!(doc.node_data_array.is_empty());
        assert!(doc.link_data_array.is_empty());
    }

    #[test]
    fn test_normalize_double_encoded_string() {
        let inner = json!({ "nodeDataArray": [{ "key": "User", "name": "User" }] }).to_string();
        let twice = Value::String(Value::String(inner).to_string());
        let doc = Document::from_value(twice).unwrap();
        assert_eq!(doc.node_count(), 1);
        assert_eq!(doc.node("User").unwrap().category, "class");
    }

    #[test]
    fn test_non_object_becomes_empty() {
        let doc = Document::from_value(json!([1, 2, 3])).unwrap();
        assert!(doc.is_empty());
        let doc = Document::from_value(Value::String("not json".into())).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_parse_rejects_invalid_json() {
        assert!(matches!(
            Document::parse("{ nodeDataArray: ["),
            Err(ModelError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_node_properties_survive() {
        let doc = Document::from_value(json!({
            "nodeDataArray": [{ "key": "A", "color": "#fff", "loc": "10 20" }]
        }))
        .unwrap();
        let node = doc.node("A").unwrap();
        assert_eq!(node.extra.get("color"), Some(&json!("#fff")));
        assert_eq!(node.loc, Some(Point::new(10.0, 20.0)));

        let json = doc.to_json().unwrap();
        assert!(json.contains("\"color\":\"#fff\""));
        assert!(json.contains("\"loc\":\"10 20\""));
    }

    #[test]
    fn test_link_key_derived() {
        let link = Link::new("User", "Order", LinkCategory::Association);
        assert_eq!(link.key, "User->Order:association");
    }

    #[test]
    fn test_add_link_dedups_triple() {
        let mut doc = Document::new();
        doc.upsert_node(Node::class("User", "User"));
        doc.upsert_node(Node::class("Order", "Order"));

        assert!(doc.add_link(Link::new("User", "Order", LinkCategory::Association)));
        let mut again = Link::new("User", "Order", LinkCategory::Association);
        again.key = "custom".into();
        assert!(!doc.add_link(again));
        assert_eq!(doc.link_count(), 1);

        // Different category is a different relation.
        assert!(doc.add_link(Link::new("User", "Order", LinkCategory::Composition)));
        assert_eq!(doc.link_count(), 2);
    }

    #[test]
    fn test_load_fills_link_keys_and_drops_duplicates() {
        let doc = Document::from_value(json!({
            "nodeDataArray": [{ "key": "A" }, { "key": "B" }, { "key": "A", "name": "dup" }],
            "linkDataArray": [
                { "from": "A", "to": "B" },
                { "from": "A", "to": "B", "category": "association", "key": "other" },
            ]
        }))
        .unwrap();
        assert_eq!(doc.node_count(), 2);
        assert_eq!(doc.node("A").unwrap().name, "");
        assert_eq!(doc.link_count(), 1);
        assert_eq!(doc.link_data_array[0].key, "A->B:association");
    }

    #[test]
    fn test_remove_node_drops_touching_links() {
        let mut doc = Document::new();
        doc.upsert_node(Node::class("A", "A"));
        doc.upsert_node(Node::class("B", "B"));
        doc.upsert_node(Node::class("C", "C"));
        doc.add_link(Link::new("A", "B", LinkCategory::Dependency));
        doc.add_link(Link::new("B", "C", LinkCategory::Dependency));

        assert!(doc.remove_node("A").is_some());
        assert_eq!(doc.link_count(), 1);
        assert!(doc.remove_node("A").is_none());
    }

    #[test]
    fn test_upsert_replaces_in_place() {
        let mut doc = Document::new();
        doc.upsert_node(Node::class("A", "first"));
        doc.upsert_node(Node::class("B", "B"));
        doc.upsert_node(Node::class("A", "second"));
        assert_eq!(doc.node_count(), 2);
        assert_eq!(doc.node_data_array[0].name, "second");
    }

    #[test]
    fn test_abstract_and_attributes_serde() {
        let doc = Document::from_value(json!({
            "nodeDataArray": [{
                "key": "Shape",
                "abstract": true,
                "attributes": [{ "name": "id", "type": "int", "nullable": false }],
                "operations": [{ "name": "area", "params": null, "type": "float" }]
            }]
        }))
        .unwrap();
        let node = doc.node("Shape").unwrap();
        assert!(node.is_abstract);
        assert_eq!(node.attributes[0].ty, "int");
        assert_eq!(node.operations[0].return_type.as_deref(), Some("float"));
        assert!(node.operations[0].params.is_empty());
    }

    #[test]
    fn test_engine_assigned_keys_and_odd_geometry_load() {
        let doc = Document::from_value(json!({
            "class": "GraphLinksModel",
            "nodeDataArray": [
                { "key": "User", "name": "User", "loc": "NaN NaN" },
                { "key": "Order", "name": "Order", "loc": "200 0", "size": 12 },
                { "key": 7, "name": "Seven" }
            ],
            "linkDataArray": [
                { "key": -1, "from": "User", "to": "Order", "category": "association" },
                { "key": -2, "from": "Order", "to": 7, "category": "" },
                { "key": -3, "from": "User", "to": 7, "category": "note" }
            ]
        }))
        .unwrap();

        assert_eq!(doc.node_count(), 3);
        assert!(doc.node("7").is_some());

        let user = doc.node("User").unwrap();
        assert_eq!(user.loc, None);
        assert_eq!(user.extra.get("loc"), Some(&json!("NaN NaN")));
        let order = doc.node("Order").unwrap();
        assert_eq!(order.loc, Some(Point::new(200.0, 0.0)));
        assert_eq!(order.extra.get("size"), Some(&json!(12)));

        let keys: Vec<&str> = doc.link_data_array.iter().map(|l| l.key.as_str()).collect();
        assert_eq!(
            keys,
            ["User->Order:association", "Order->7:association", "User->7:note"]
        );
        assert_eq!(
            doc.link("User->7:note").unwrap().category,
            LinkCategory::Other("note".into())
        );

        // Raw geometry and unknown categories are written back unchanged.
        let value = doc.to_value().unwrap();
        assert_eq!(value["nodeDataArray"][0]["loc"], json!("NaN NaN"));
        assert_eq!(value["nodeDataArray"][1]["size"], json!(12));
        assert_eq!(value["linkDataArray"][2]["category"], json!("note"));
        assert_eq!(Document::from_value(value).unwrap(), doc);
    }

    #[test]
    fn test_parsed_location_replaces_raw_one() {
        let mut doc = Document::from_value(json!({
            "nodeDataArray": [{ "key": "User", "loc": "NaN NaN" }]
        }))
        .unwrap();
        doc.node_mut("User").unwrap().loc = Some(Point::new(10.0, 20.0));

        let json = doc.to_json().unwrap();
        assert!(json.contains("\"loc\":\"10 20\""));
        assert!(!json.contains("NaN"));
    }

    #[test]
    fn test_retyped_link_is_rekeyed() {
        let mut doc = Document::new();
        doc.upsert_node(Node::class("A", "A"));
        doc.upsert_node(Node::class("B", "B"));
        doc.add_link(Link::new("A", "B", LinkCategory::Association));

        doc.link_mut("A->B:association").unwrap().category = LinkCategory::Composition;
        doc.rekey_links();
        assert!(doc.link("A->B:association").is_none());
        assert_eq!(
            doc.link("A->B:composition").unwrap().category,
            LinkCategory::Composition
        );

        // The old relation is free again.
        assert!(doc.add_link(Link::new("A", "B", LinkCategory::Association)));
        assert_eq!(doc.link_count(), 2);
    }

    #[test]
    fn test_rekey_drops_link_retyped_onto_existing_relation() {
        let mut doc = Document::new();
        doc.add_link(Link::new("A", "B", LinkCategory::Association));
        doc.add_link(Link::new("A", "B", LinkCategory::Dependency));
        doc.link_mut("A->B:dependency").unwrap().category = LinkCategory::Association;
        doc.rekey_links();
        assert_eq!(doc.link_count(), 1);
        assert_eq!(doc.link_data_array[0].key, "A->B:association");
    }

    #[test]
    fn test_keyless_node_is_rejected() {
        assert!(matches!(
            Document::from_value(json!({ "nodeDataArray": [{ "name": "NoKey" }] })),
            Err(ModelError::InvalidShape(_))
        ));
    }
}
