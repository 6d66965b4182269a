//! In-memory form of a node bundle and node references.
//!
//! A bundle aggregates everything stored for one node: its types, its
//! properties and its child entries. It exists only for the duration of
//! one load or store call; what persists is the codec's byte image.

use std::collections::{BTreeMap, BTreeSet};

use crate::id::{Name, NodeId, PropertyId};

/// Value type tags. The numeric codes are part of the bundle format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PropertyType {
    String = 1,
    Binary = 2,
    Long = 3,
    Double = 4,
    Date = 5,
    Boolean = 6,
    Name = 7,
    Path = 8,
    Reference = 9,
    WeakReference = 10,
    Uri = 11,
    Decimal = 12,
}

impl PropertyType {
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => Self::String,
            2 => Self::Binary,
            3 => Self::Long,
            4 => Self::Double,
            5 => Self::Date,
            6 => Self::Boolean,
            7 => Self::Name,
            8 => Self::Path,
            9 => Self::Reference,
            10 => Self::WeakReference,
            11 => Self::Uri,
            12 => Self::Decimal,
            _ => return None,
        })
    }
}

/// A binary value, either carried in the bundle or held by the blob store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BinaryValue {
    Inline(Vec<u8>),
    /// Reference issued by the blob store this bundle was stored through
    Stored { blob_id: String, size: u64 },
}

impl BinaryValue {
    pub fn len(&self) -> u64 {
        match self {
            BinaryValue::Inline(bytes) => bytes.len() as u64,
            BinaryValue::Stored { size, .. } => *size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn blob_id(&self) -> Option<&str> {
        match self {
            BinaryValue::Stored { blob_id, .. } => Some(blob_id),
            BinaryValue::Inline(_) => None,
        }
    }
}

/// One property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    String(String),
    Binary(BinaryValue),
    Long(i64),
    Double(f64),
    /// ISO-8601 text as supplied by the runtime
    Date(String),
    Boolean(bool),
    Name(Name),
    Path(String),
    Reference(NodeId),
    WeakReference(NodeId),
    Uri(String),
    Decimal(String),
}

impl PropertyValue {
    pub fn property_type(&self) -> PropertyType {
        match self {
            PropertyValue::String(_) => PropertyType::String,
            PropertyValue::Binary(_) => PropertyType::Binary,
            PropertyValue::Long(_) => PropertyType::Long,
            PropertyValue::Double(_) => PropertyType::Double,
            PropertyValue::Date(_) => PropertyType::Date,
            PropertyValue::Boolean(_) => PropertyType::Boolean,
            PropertyValue::Name(_) => PropertyType::Name,
            PropertyValue::Path(_) => PropertyType::Path,
            PropertyValue::Reference(_) => PropertyType::Reference,
            PropertyValue::WeakReference(_) => PropertyType::WeakReference,
            PropertyValue::Uri(_) => PropertyType::Uri,
            PropertyValue::Decimal(_) => PropertyType::Decimal,
        }
    }
}

/// A property as stored inside its parent's bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyEntry {
    pub name: Name,
    pub kind: PropertyType,
    pub multi_valued: bool,
    pub values: Vec<PropertyValue>,
    pub mod_count: u16,
}

impl PropertyEntry {
    /// Single-valued property of the value's own type.
    pub fn single(name: Name, value: PropertyValue) -> Self {
        Self {
            name,
            kind: value.property_type(),
            multi_valued: false,
            values: vec![value],
            mod_count: 0,
        }
    }

    pub fn multi(name: Name, kind: PropertyType, values: Vec<PropertyValue>) -> Self {
        Self { name, kind, multi_valued: true, values, mod_count: 0 }
    }

    /// Blob ids referenced by this property's values.
    pub fn blob_ids(&self) -> impl Iterator<Item = &str> {
        self.values.iter().filter_map(|v| match v {
            PropertyValue::Binary(b) => b.blob_id(),
            _ => None,
        })
    }
}

/// Child node reference held by the parent.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildNodeEntry {
    pub name: Name,
    pub id: NodeId,
}

/// Serialized aggregate of one node.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeBundle {
    pub id: NodeId,
    /// `None` only for the root
    pub parent_id: Option<NodeId>,
    pub node_type: Name,
    pub mixin_types: BTreeSet<Name>,
    pub properties: BTreeMap<Name, PropertyEntry>,
    pub child_nodes: Vec<ChildNodeEntry>,
    pub referenceable: bool,
    pub shared_set: BTreeSet<NodeId>,
    pub mod_count: u16,
}

impl NodeBundle {
    pub fn new(id: NodeId, parent_id: Option<NodeId>, node_type: Name) -> Self {
        Self {
            id,
            parent_id,
            node_type,
            mixin_types: BTreeSet::new(),
            properties: BTreeMap::new(),
            child_nodes: Vec::new(),
            referenceable: false,
            shared_set: BTreeSet::new(),
            mod_count: 0,
        }
    }

    pub fn add_property(&mut self, entry: PropertyEntry) {
        self.properties.insert(entry.name.clone(), entry);
    }

    pub fn add_child(&mut self, name: Name, id: NodeId) {
        self.child_nodes.push(ChildNodeEntry { name, id });
    }

    pub fn property_id(&self, name: &Name) -> PropertyId {
        PropertyId::new(self.id, name.clone())
    }

    /// Every blob id referenced from this bundle's properties.
    pub fn blob_ids(&self) -> BTreeSet<String> {
        self.properties
            .values()
            .flat_map(|p| p.blob_ids().map(str::to_string))
            .collect()
    }
}

/// The properties that reference one target node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReferences {
    pub target: NodeId,
    pub references: Vec<PropertyId>,
}

impl NodeReferences {
    pub fn new(target: NodeId) -> Self {
        Self { target, references: Vec::new() }
    }

    /// Record one more referencing property; duplicates are kept once.
    pub fn add(&mut self, property: PropertyId) {
        if !self.references.contains(&property) {
            self.references.push(property);
        }
    }

    pub fn remove(&mut self, property: &PropertyId) -> bool {
        let before = self.references.len();
        self.references.retain(|p| p != property);
        before != self.references.len()
    }

    pub fn has_references(&self) -> bool {
        !self.references.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(local: &str) -> Name {
        Name::new("", local)
    }

    #[test]
    fn test_blob_ids_collected_across_properties() {
        let mut bundle = NodeBundle::new(NodeId::from_bytes([1; 16]), None, name("unstructured"));
        bundle.add_property(PropertyEntry::single(
            name("data"),
            PropertyValue::Binary(BinaryValue::Stored { blob_id: "/a/data.0.bin".into(), size: 10 }),
        ));
        bundle.add_property(PropertyEntry::multi(
            name("parts"),
            PropertyType::Binary,
            vec![
                PropertyValue::Binary(BinaryValue::Inline(vec![1, 2])),
                PropertyValue::Binary(BinaryValue::Stored { blob_id: "/a/parts.1.bin".into(), size: 99 }),
            ],
        ));
        bundle.add_property(PropertyEntry::single(name("title"), PropertyValue::String("x".into())));

        let ids: Vec<String> = bundle.blob_ids().into_iter().collect();
        assert_eq!(ids, vec!["/a/data.0.bin".to_string(), "/a/parts.1.bin".to_string()]);
    }

    #[test]
    fn test_references_add_remove() {
        let target = NodeId::from_bytes([2; 16]);
        let prop = PropertyId::new(NodeId::from_bytes([3; 16]), name("ref"));
        let mut refs = NodeReferences::new(target);
        refs.add(prop.clone());
        refs.add(prop.clone());
        assert_eq!(refs.references.len(), 1);
        assert!(refs.remove(&prop));
        assert!(!refs.has_references());
    }

    #[test]
    fn test_property_type_codes_roundtrip() {
        for code in 1..=12u8 {
            let kind = PropertyType::from_code(code).unwrap();
            assert_eq!(kind as u8, code);
        }
        assert_eq!(PropertyType::from_code(0), None);
    }
}
