//! Binary encoding of bundles and reference records.
//!
//! The persistence manager only depends on [`BundleCodec`]; [`BundleBinding`]
//! is the format this crate ships.
//!
//! # Bundle image
//!
//! ```text
//! "NB" | version: u8 | body | crc32c(everything before): u32
//!
//! body:
//!   parent      0u8 | 1u8 id[16]
//!   node type   name
//!   mixins      count: u32, name*
//!   referenceable u8, mod_count u16
//!   properties  count: u32, (name, kind u8, multi u8, mod_count u16,
//!                            count: u32, value*)*
//!   children    count: u32, (name, id[16])*
//!   shared set  count: u32, id[16]*
//!
//! name   = namespace code u32 | local-name code u32
//! string = len u32 | utf-8
//! value  = type u8 | payload
//! ```
//!
//! Integers are little-endian. Binary payloads are `0u8 len u32 bytes` when
//! inline and `1u8 size u64 blob-id string` when held by the blob store.

use std::collections::{BTreeMap, BTreeSet};

use crate::blob_store::BlobStore;
use crate::bundle::{
    BinaryValue, ChildNodeEntry, NodeBundle, NodeReferences, PropertyEntry, PropertyType, PropertyValue,
};
use crate::error::CodecError;
use crate::id::{Name, NodeId, PropertyId, NODE_ID_LEN};
use crate::string_index::StringIndex;

pub const BUNDLE_MAGIC: [u8; 2] = *b"NB";
pub const REFERENCES_MAGIC: [u8; 2] = *b"NR";
pub const FORMAT_VERSION: u8 = 1;

/// Magic, version and checksum around every image.
const FRAME_OVERHEAD: usize = 2 + 1 + 4;

const BINARY_INLINE: u8 = 0;
const BINARY_STORED: u8 = 1;

/// Collaborators a codec call may consult.
#[derive(Clone, Copy)]
pub struct CodecContext<'a> {
    pub namespaces: &'a dyn StringIndex,
    pub names: &'a dyn StringIndex,
    pub blobs: &'a dyn BlobStore,
}

/// Serialization of bundles and reference records.
pub trait BundleCodec: Send + Sync {
    /// Encode `bundle`. Binary values the codec moves to the blob store are
    /// replaced in `bundle` by their stored reference, so the bundle then
    /// equals what a later decode returns.
    fn encode(&self, bundle: &mut NodeBundle, ctx: &CodecContext<'_>) -> Result<Vec<u8>, CodecError>;

    fn decode(&self, data: &[u8], id: NodeId, ctx: &CodecContext<'_>) -> Result<NodeBundle, CodecError>;

    fn encode_references(&self, refs: &NodeReferences, ctx: &CodecContext<'_>) -> Result<Vec<u8>, CodecError>;

    fn decode_references(
        &self,
        data: &[u8],
        target: NodeId,
        ctx: &CodecContext<'_>,
    ) -> Result<NodeReferences, CodecError>;
}

/// The shipped binary format.
#[derive(Debug, Clone)]
pub struct BundleBinding {
    /// Binary values at least this long go to the blob store
    min_blob_size: usize,
}

impl BundleBinding {
    pub fn new(min_blob_size: usize) -> Self {
        Self { min_blob_size }
    }

    pub fn min_blob_size(&self) -> usize {
        self.min_blob_size
    }

    /// Move large inline binaries out to the blob store.
    fn spill_binaries(&self, bundle: &mut NodeBundle, blobs: &dyn BlobStore) -> Result<(), CodecError> {
        let node = bundle.id;
        for (name, entry) in bundle.properties.iter_mut() {
            for (index, value) in entry.values.iter_mut().enumerate() {
                let PropertyValue::Binary(BinaryValue::Inline(bytes)) = value else {
                    continue;
                };
                if bytes.len() < self.min_blob_size {
                    continue;
                }
                let blob_id = blobs.create_id(&PropertyId::new(node, name.clone()), index)?;
                blobs.put(&blob_id, bytes)?;
                let size = bytes.len() as u64;
                *value = PropertyValue::Binary(BinaryValue::Stored { blob_id, size });
            }
        }
        Ok(())
    }
}

impl Default for BundleBinding {
    fn default() -> Self {
        Self::new(16 * 1024)
    }
}

impl BundleCodec for BundleBinding {
    fn encode(&self, bundle: &mut NodeBundle, ctx: &CodecContext<'_>) -> Result<Vec<u8>, CodecError> {
        self.spill_binaries(bundle, ctx.blobs)?;

        let mut w = Writer::new(BUNDLE_MAGIC);
        match bundle.parent_id {
            Some(parent) => {
                w.u8(1);
                w.id(&parent);
            }
            None => w.u8(0),
        }
        w.name(&bundle.node_type, ctx)?;
        w.count(bundle.mixin_types.len())?;
        for mixin in &bundle.mixin_types {
            w.name(mixin, ctx)?;
        }
        w.u8(bundle.referenceable as u8);
        w.u16(bundle.mod_count);

        w.count(bundle.properties.len())?;
        for entry in bundle.properties.values() {
            w.name(&entry.name, ctx)?;
            w.u8(entry.kind as u8);
            w.u8(entry.multi_valued as u8);
            w.u16(entry.mod_count);
            w.count(entry.values.len())?;
            for value in &entry.values {
                w.value(value, ctx)?;
            }
        }

        w.count(bundle.child_nodes.len())?;
        for child in &bundle.child_nodes {
            w.name(&child.name, ctx)?;
            w.id(&child.id);
        }

        w.count(bundle.shared_set.len())?;
        for id in &bundle.shared_set {
            w.id(id);
        }
        Ok(w.finish())
    }

    fn decode(&self, data: &[u8], id: NodeId, ctx: &CodecContext<'_>) -> Result<NodeBundle, CodecError> {
        let mut r = Reader::open(data, BUNDLE_MAGIC)?;

        let parent_id = match r.u8()? {
            0 => None,
            1 => Some(r.id()?),
            other => return Err(CodecError::InvalidTag { what: "parent", value: other }),
        };
        let node_type = r.name(ctx)?;
        let mut mixin_types = BTreeSet::new();
        for _ in 0..r.u32()? {
            mixin_types.insert(r.name(ctx)?);
        }
        let referenceable = r.flag("referenceable")?;
        let mod_count = r.u16()?;

        let mut properties = BTreeMap::new();
        for _ in 0..r.u32()? {
            let name = r.name(ctx)?;
            let kind_code = r.u8()?;
            let kind = PropertyType::from_code(kind_code)
                .ok_or(CodecError::InvalidTag { what: "property type", value: kind_code })?;
            let multi_valued = r.flag("multi-valued")?;
            let prop_mod_count = r.u16()?;
            let count = r.u32()?;
            let mut values = Vec::with_capacity(count.min(1024) as usize);
            for _ in 0..count {
                values.push(r.value(ctx)?);
            }
            properties.insert(
                name.clone(),
                PropertyEntry { name, kind, multi_valued, values, mod_count: prop_mod_count },
            );
        }

        let mut child_nodes = Vec::new();
        for _ in 0..r.u32()? {
            let name = r.name(ctx)?;
            let id = r.id()?;
            child_nodes.push(ChildNodeEntry { name, id });
        }

        let mut shared_set = BTreeSet::new();
        for _ in 0..r.u32()? {
            shared_set.insert(r.id()?);
        }
        r.finish()?;

        Ok(NodeBundle {
            id,
            parent_id,
            node_type,
            mixin_types,
            properties,
            child_nodes,
            referenceable,
            shared_set,
            mod_count,
        })
    }

    fn encode_references(&self, refs: &NodeReferences, ctx: &CodecContext<'_>) -> Result<Vec<u8>, CodecError> {
        let mut w = Writer::new(REFERENCES_MAGIC);
        w.count(refs.references.len())?;
        for property in &refs.references {
            w.id(&property.parent);
            w.name(&property.name, ctx)?;
        }
        Ok(w.finish())
    }

    fn decode_references(
        &self,
        data: &[u8],
        target: NodeId,
        ctx: &CodecContext<'_>,
    ) -> Result<NodeReferences, CodecError> {
        let mut r = Reader::open(data, REFERENCES_MAGIC)?;
        let mut refs = NodeReferences::new(target);
        for _ in 0..r.u32()? {
            let parent = r.id()?;
            let name = r.name(ctx)?;
            refs.add(PropertyId::new(parent, name));
        }
        r.finish()?;
        Ok(refs)
    }
}

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn new(magic: [u8; 2]) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&magic);
        buf.push(FORMAT_VERSION);
        Self { buf }
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn count(&mut self, n: usize) -> Result<(), CodecError> {
        let n = u32::try_from(n).map_err(|_| CodecError::Oversized("collection"))?;
        self.u32(n);
        Ok(())
    }

    fn id(&mut self, id: &NodeId) {
        self.buf.extend_from_slice(id.raw_bytes());
    }

    fn bytes(&mut self, data: &[u8]) -> Result<(), CodecError> {
        let len = u32::try_from(data.len()).map_err(|_| CodecError::Oversized("value"))?;
        self.u32(len);
        self.buf.extend_from_slice(data);
        Ok(())
    }

    fn string(&mut self, s: &str) -> Result<(), CodecError> {
        self.bytes(s.as_bytes())
    }

    fn name(&mut self, name: &Name, ctx: &CodecContext<'_>) -> Result<(), CodecError> {
        let ns = ctx.namespaces.string_to_code(&name.namespace)?;
        let local = ctx.names.string_to_code(&name.local)?;
        self.u32(ns);
        self.u32(local);
        Ok(())
    }

    fn value(&mut self, value: &PropertyValue, ctx: &CodecContext<'_>) -> Result<(), CodecError> {
        self.u8(value.property_type() as u8);
        match value {
            PropertyValue::String(s)
            | PropertyValue::Date(s)
            | PropertyValue::Path(s)
            | PropertyValue::Uri(s)
            | PropertyValue::Decimal(s) => self.string(s)?,
            PropertyValue::Binary(BinaryValue::Inline(bytes)) => {
                self.u8(BINARY_INLINE);
                self.bytes(bytes)?;
            }
            PropertyValue::Binary(BinaryValue::Stored { blob_id, size }) => {
                self.u8(BINARY_STORED);
                self.u64(*size);
                self.string(blob_id)?;
            }
            PropertyValue::Long(v) => self.u64(*v as u64),
            PropertyValue::Double(v) => self.u64(v.to_bits()),
            PropertyValue::Boolean(v) => self.u8(*v as u8),
            PropertyValue::Name(name) => self.name(name, ctx)?,
            PropertyValue::Reference(id) | PropertyValue::WeakReference(id) => self.id(id),
        }
        Ok(())
    }

    fn finish(mut self) -> Vec<u8> {
        let crc = crc32c::crc32c(&self.buf);
        self.buf.extend_from_slice(&crc.to_le_bytes());
        self.buf
    }
}

struct Reader<'a> {
    /// Image without its checksum trailer
    body: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Check framing and checksum, leaving the cursor after the version.
    fn open(data: &'a [u8], magic: [u8; 2]) -> Result<Self, CodecError> {
        if data.len() < FRAME_OVERHEAD {
            return Err(CodecError::Truncated { offset: 0, needed: FRAME_OVERHEAD, available: data.len() });
        }
        let found = [data[0], data[1]];
        if found != magic {
            return Err(CodecError::BadMagic { found });
        }
        if data[2] != FORMAT_VERSION {
            return Err(CodecError::UnsupportedVersion(data[2]));
        }
        let split = data.len() - 4;
        let (body, trailer) = data.split_at(split);
        let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = crc32c::crc32c(body);
        if expected != actual {
            return Err(CodecError::ChecksumMismatch { expected, actual });
        }
        Ok(Self { body, pos: 3 })
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let available = self.body.len() - self.pos;
        if n > available {
            return Err(CodecError::Truncated { offset: self.pos, needed: n, available });
        }
        let slice = &self.body[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn flag(&mut self, what: &'static str) -> Result<bool, CodecError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(CodecError::InvalidTag { what, value }),
        }
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(buf))
    }

    fn id(&mut self) -> Result<NodeId, CodecError> {
        let mut buf = [0u8; NODE_ID_LEN];
        buf.copy_from_slice(self.take(NODE_ID_LEN)?);
        Ok(NodeId::from_bytes(buf))
    }

    fn bytes(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn string(&mut self) -> Result<String, CodecError> {
        let start = self.pos + 4;
        let raw = self.bytes()?;
        std::str::from_utf8(raw)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8(start))
    }

    fn name(&mut self, ctx: &CodecContext<'_>) -> Result<Name, CodecError> {
        let ns_code = self.u32()?;
        let local_code = self.u32()?;
        let namespace = ctx
            .namespaces
            .code_to_string(ns_code)?
            .ok_or(CodecError::UnknownCode { table: "namespace", code: ns_code })?;
        let local = ctx
            .names
            .code_to_string(local_code)?
            .ok_or(CodecError::UnknownCode { table: "name", code: local_code })?;
        Ok(Name { namespace, local })
    }

    fn value(&mut self, ctx: &CodecContext<'_>) -> Result<PropertyValue, CodecError> {
        let code = self.u8()?;
        let kind = PropertyType::from_code(code).ok_or(CodecError::InvalidTag { what: "value type", value: code })?;
        Ok(match kind {
            PropertyType::String => PropertyValue::String(self.string()?),
            PropertyType::Date => PropertyValue::Date(self.string()?),
            PropertyType::Path => PropertyValue::Path(self.string()?),
            PropertyType::Uri => PropertyValue::Uri(self.string()?),
            PropertyType::Decimal => PropertyValue::Decimal(self.string()?),
            PropertyType::Binary => match self.u8()? {
                BINARY_INLINE => PropertyValue::Binary(BinaryValue::Inline(self.bytes()?.to_vec())),
                BINARY_STORED => {
                    let size = self.u64()?;
                    let blob_id = self.string()?;
                    PropertyValue::Binary(BinaryValue::Stored { blob_id, size })
                }
                value => return Err(CodecError::InvalidTag { what: "binary", value }),
            },
            PropertyType::Long => PropertyValue::Long(self.u64()? as i64),
            PropertyType::Double => PropertyValue::Double(f64::from_bits(self.u64()?)),
            PropertyType::Boolean => PropertyValue::Boolean(self.flag("boolean")?),
            PropertyType::Name => PropertyValue::Name(self.name(ctx)?),
            PropertyType::Reference => PropertyValue::Reference(self.id()?),
            PropertyType::WeakReference => PropertyValue::WeakReference(self.id()?),
        })
    }

    fn finish(self) -> Result<(), CodecError> {
        let rest = self.body.len() - self.pos;
        if rest != 0 {
            return Err(CodecError::TrailingBytes(rest));
        }
        Ok(())
    }
}
