//! Identifiers handed to us by the content-tree runtime.

use std::fmt;
use std::str::FromStr;

/// Width of a node identifier in bytes; also the engine key width.
pub const NODE_ID_LEN: usize = 16;

/// Fixed-width opaque node identifier, used verbatim as the engine key.
///
/// Ordering is byte-lexicographic, which is the engine's key order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Identifier of the tree root.
    pub const ROOT: NodeId = NodeId([
        0xca, 0xfe, 0xba, 0xbe, 0xca, 0xfe, 0xba, 0xbe,
        0xca, 0xfe, 0xba, 0xbe, 0xca, 0xfe, 0xba, 0xbe,
    ]);

    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Build from a slice; `None` unless it is exactly `NODE_ID_LEN` long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; NODE_ID_LEN] = bytes.try_into().ok()?;
        Some(NodeId(array))
    }

    pub fn raw_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

/// Failure to parse a textual node identifier.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid node id '{0}'")]
pub struct ParseNodeIdError(pub String);

impl FromStr for NodeId {
    type Err = ParseNodeIdError;

    /// Accepts the dashed UUID form or 32 bare hex digits.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: Vec<u8> = s.bytes().filter(|b| *b != b'-').collect();
        if hex.len() != NODE_ID_LEN * 2 {
            return Err(ParseNodeIdError(s.to_string()));
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        for (i, pair) in hex.chunks(2).enumerate() {
            let digits = std::str::from_utf8(pair).map_err(|_| ParseNodeIdError(s.to_string()))?;
            bytes[i] = u8::from_str_radix(digits, 16).map_err(|_| ParseNodeIdError(s.to_string()))?;
        }
        Ok(NodeId(bytes))
    }
}

/// Qualified name: namespace URI plus local name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Name {
    pub namespace: String,
    pub local: String,
}

impl Name {
    pub fn new(namespace: impl Into<String>, local: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), local: local.into() }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}{}", self.namespace, self.local)
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Name({})", self)
    }
}

/// A property addressed by its owning node and name.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PropertyId {
    pub parent: NodeId,
    pub name: Name,
}

impl PropertyId {
    pub fn new(parent: NodeId, name: Name) -> Self {
        Self { parent, name }
    }
}

impl fmt::Display for PropertyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.parent, self.name)
    }
}
