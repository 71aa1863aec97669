//! Declarative header schemas and field storage.
//!
//! Every protocol describes its header once, as an ordered list of
//! `(name, format, default)` triples plus a byte order.  The schema is
//! compiled into a per-instance field table: one slot per field,
//! holding the current value, an activation bit and the current wire
//! width.  A generic unpacker and packer walk that table, so protocol
//! modules never touch wire offsets outside of their dissector.

use byteorder::{BigEndian, ByteOrder as _, LittleEndian};

use crate::{Error, Result};
use crate::triggerlist::TriggerList;

/// Byte order applied to all scalar fields of a schema.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ByteOrder {
    /// Network byte order.
    Big,
    /// Little-endian, used by a few link-level headers.
    Little,
}

/// Wire format of a single header field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldFormat {
    /// Unsigned 8-bit scalar.
    U8,
    /// Unsigned 16-bit scalar.
    U16,
    /// Unsigned 32-bit scalar.
    U32,
    /// Unsigned 64-bit scalar.
    U64,
    /// Fixed-width byte string of the given length.
    Bytes(usize),
    /// Byte string whose width follows its current value.
    ///
    /// Dynamic fields must be given a value by the dissector; their
    /// width cannot be guessed from the buffer alone.
    Dynamic,
    /// Variable-length structured field backed by a [`TriggerList`].
    List,
}

impl FieldFormat {
    fn fixed_width(self) -> Option<usize> {
        match self {
            FieldFormat::U8 => Some(1),
            FieldFormat::U16 => Some(2),
            FieldFormat::U32 => Some(4),
            FieldFormat::U64 => Some(8),
            FieldFormat::Bytes(n) => Some(n),
            FieldFormat::Dynamic | FieldFormat::List => None,
        }
    }
}

/// Default value of a header field.
///
/// A simple field declared with [`FieldDefault::Absent`] starts out
/// deactivated and contributes no bytes until a value is written to
/// it.  Trigger-list fields always use `Absent`; they start empty.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FieldDefault {
    /// No default; the field starts deactivated (simple fields) or
    /// empty (trigger lists).
    Absent,
    /// Scalar default.
    U(u64),
    /// Byte-string default.
    Bytes(&'static [u8]),
}

/// One field of a header schema.
#[derive(Clone, Copy, Debug)]
pub struct FieldDef {
    /// Field name, unique within the schema.
    pub name: &'static str,
    /// Wire format.
    pub format: FieldFormat,
    /// Default value.
    pub default: FieldDefault,
}

/// Custom serializer for a trigger-list field.
///
/// When a list stores bytes or `(discriminator, value)` pairs whose
/// wire form is not a plain concatenation of the element values, the
/// schema supplies one of these.
pub type ListPackFn = fn(&mut [crate::triggerlist::Element]) -> Result<Vec<u8>>;

/// Declarative header layout of one protocol.
///
/// Built once per protocol, at module load time, and immutable
/// afterwards.  Misdeclared schemas (duplicate names, a scalar default
/// on a byte field, an empty field list outside of a pure container)
/// are a hard error at construction time.
#[derive(Clone, Debug)]
pub struct Schema {
    byte_order: ByteOrder,
    fields: &'static [FieldDef],
    list_pack: &'static [(usize, ListPackFn)],
}

impl Schema {
    /// Creates a schema, validating the field declarations.
    pub fn new(byte_order: ByteOrder, fields: &'static [FieldDef]) -> Result<Schema> {
        Self::with_list_pack(byte_order, fields, &[])
    }

    /// Like [`Schema::new`], with custom pack functions for the
    /// trigger-list fields at the given indices.
    pub fn with_list_pack(
        byte_order: ByteOrder,
        fields: &'static [FieldDef],
        list_pack: &'static [(usize, ListPackFn)],
    ) -> Result<Schema> {
        if fields.is_empty() {
            return Err(Error::InvalidArgument(
                "schema without fields; use Schema::container".into()).into());
        }
        for (i, def) in fields.iter().enumerate() {
            if fields[..i].iter().any(|d| d.name == def.name) {
                return Err(Error::InvalidArgument(
                    format!("duplicate field name: {}", def.name)).into());
            }
            let ok = match (def.format, def.default) {
                (FieldFormat::U8 | FieldFormat::U16
                 | FieldFormat::U32 | FieldFormat::U64,
                 FieldDefault::U(_) | FieldDefault::Absent) => true,
                (FieldFormat::Bytes(_) | FieldFormat::Dynamic,
                 FieldDefault::Bytes(_) | FieldDefault::Absent) => true,
                (FieldFormat::List, FieldDefault::Absent) => true,
                _ => false,
            };
            if !ok {
                return Err(Error::InvalidArgument(
                    format!("field {} mixes format {:?} with default {:?}",
                            def.name, def.format, def.default)).into());
            }
            if let (FieldFormat::Bytes(n), FieldDefault::Bytes(b)) = (def.format, def.default) {
                if b.len() != n {
                    return Err(Error::InvalidArgument(
                        format!("field {} default has {} bytes, format takes {}",
                                def.name, b.len(), n)).into());
                }
            }
        }
        for (i, _) in list_pack {
            if !matches!(fields.get(*i).map(|d| d.format), Some(FieldFormat::List)) {
                return Err(Error::InvalidArgument(
                    format!("pack function on non-list field index {}", i)).into());
            }
        }
        Ok(Schema { byte_order, fields, list_pack })
    }

    /// Creates the schema of a protocol that is purely a container:
    /// no header fields, only a body.
    pub fn container(byte_order: ByteOrder) -> Schema {
        Schema { byte_order, fields: &[], list_pack: &[] }
    }

    /// The schema's byte order.
    pub fn byte_order(&self) -> ByteOrder {
        self.byte_order
    }

    /// The field declarations, in wire order.
    pub fn fields(&self) -> &'static [FieldDef] {
        self.fields
    }

    fn list_pack_for(&self, idx: usize) -> Option<ListPackFn> {
        self.list_pack.iter()
            .find(|(i, _)| *i == idx)
            .map(|(_, f)| *f)
    }
}

/// Current value of a simple header field.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum Value {
    /// 8-bit scalar.
    U8(u8),
    /// 16-bit scalar.
    U16(u16),
    /// 32-bit scalar.
    U32(u32),
    /// 64-bit scalar.
    U64(u64),
    /// Byte string.
    Bytes(Vec<u8>),
}

impl Value {
    /// The value as a `u8`.  Panics if the field has another format.
    pub fn as_u8(&self) -> u8 {
        match self {
            Value::U8(v) => *v,
            _ => panic!("field is not a u8"),
        }
    }

    /// The value as a `u16`.  Panics if the field has another format.
    pub fn as_u16(&self) -> u16 {
        match self {
            Value::U16(v) => *v,
            _ => panic!("field is not a u16"),
        }
    }

    /// The value as a `u32`.  Panics if the field has another format.
    pub fn as_u32(&self) -> u32 {
        match self {
            Value::U32(v) => *v,
            _ => panic!("field is not a u32"),
        }
    }

    /// The value as a `u64`.  Panics if the field has another format.
    pub fn as_u64(&self) -> u64 {
        match self {
            Value::U64(v) => *v,
            _ => panic!("field is not a u64"),
        }
    }

    /// The value as bytes.  Panics if the field is a scalar.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Value::Bytes(v) => v,
            _ => panic!("field is not a byte string"),
        }
    }

    /// Converts the value into its byte string.  Panics on scalars.
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Value::Bytes(v) => v,
            _ => panic!("field is not a byte string"),
        }
    }

    fn byte_len(&self) -> usize {
        match self {
            Value::U8(_) => 1,
            Value::U16(_) => 2,
            Value::U32(_) => 4,
            Value::U64(_) => 8,
            Value::Bytes(v) => v.len(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::Bytes(v) => {
                write!(f, "0x")?;
                for b in v {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}

/// Storage of one field.
#[derive(Clone, Debug)]
pub(crate) enum Slot {
    Simple(Value),
    List(TriggerList),
}

#[derive(Clone, Debug)]
pub(crate) struct FieldState {
    pub(crate) slot: Slot,
    pub(crate) active: bool,
    pub(crate) width: usize,
}

/// Per-instance header state: field slots, the serialized-header
/// cache and the current header length.
#[derive(Clone, Debug)]
pub(crate) struct Header {
    pub(crate) schema: &'static Schema,
    pub(crate) fields: Vec<FieldState>,
    /// Last serialized header bytes; authoritative while the owning
    /// packet's `header_changed` flag is clear.
    pub(crate) cache: Option<Vec<u8>>,
    /// Header length implied by the current formats and activations.
    pub(crate) len: usize,
}

impl Header {
    pub(crate) fn new(schema: &'static Schema) -> Header {
        let mut fields = Vec::with_capacity(schema.fields.len());
        for (idx, def) in schema.fields.iter().enumerate() {
            let state = match def.format {
                FieldFormat::List => FieldState {
                    slot: Slot::List(TriggerList::new(schema.list_pack_for(idx))),
                    active: true,
                    width: 0,
                },
                format => {
                    let (value, active) = default_value(format, def.default);
                    let width = value.byte_len();
                    FieldState { slot: Slot::Simple(value), active, width }
                }
            };
            fields.push(state);
        }
        let mut hdr = Header { schema, fields, cache: None, len: 0 };
        hdr.recompute_format();
        hdr
    }

    /// Recomputes per-field widths and the total header length from
    /// the current values and activations.
    pub(crate) fn recompute_format(&mut self) {
        let mut total = 0;
        for (state, def) in self.fields.iter_mut().zip(self.schema.fields) {
            if !state.active {
                continue;
            }
            state.width = match def.format {
                FieldFormat::Dynamic => match &state.slot {
                    Slot::Simple(v) => v.byte_len(),
                    Slot::List(_) => 0,
                },
                FieldFormat::List => match &mut state.slot {
                    Slot::List(l) => l.byte_len(),
                    Slot::Simple(_) => 0,
                },
                format => format.fixed_width().unwrap_or(0),
            };
            total += state.width;
        }
        self.len = total;
    }

    /// Decodes all active simple fields from the header cache.
    ///
    /// Widths must be current; callers recompute the format first when
    /// it changed.  Trigger-list fields keep the source bytes handed
    /// to them during dissection and are skipped here.
    pub(crate) fn unpack(&mut self) {
        let cache = match &self.cache {
            Some(c) => c.clone(),
            None => return,
        };
        let order = self.schema.byte_order;
        let mut off = 0;
        for (state, def) in self.fields.iter_mut().zip(self.schema.fields) {
            if !state.active {
                continue;
            }
            let w = state.width;
            if off + w > cache.len() {
                return;
            }
            let raw = &cache[off..off + w];
            match def.format {
                FieldFormat::U8 => state.slot = Slot::Simple(Value::U8(raw[0])),
                FieldFormat::U16 => state.slot = Slot::Simple(Value::U16(read_u16(raw, order))),
                FieldFormat::U32 => state.slot = Slot::Simple(Value::U32(read_u32(raw, order))),
                FieldFormat::U64 => state.slot = Slot::Simple(Value::U64(read_u64(raw, order))),
                FieldFormat::Bytes(_) | FieldFormat::Dynamic =>
                    state.slot = Slot::Simple(Value::Bytes(raw.to_vec())),
                FieldFormat::List => {}
            }
            off += w;
        }
    }

    /// Serializes the active fields, in schema order, into a fresh
    /// byte string.  Does not touch the cache.
    pub(crate) fn pack(&mut self) -> Result<Vec<u8>> {
        let order = self.schema.byte_order;
        let mut out = Vec::with_capacity(self.len);
        for (state, def) in self.fields.iter_mut().zip(self.schema.fields) {
            if !state.active {
                continue;
            }
            match &mut state.slot {
                Slot::Simple(value) => {
                    if let FieldFormat::Bytes(n) = def.format {
                        let got = value.byte_len();
                        if got != n {
                            return Err(Error::PackFailed(
                                def.name,
                                format!("{} bytes do not fit a {}-byte field", got, n)).into());
                        }
                    }
                    write_value(&mut out, value, order);
                }
                Slot::List(list) => {
                    let bytes = list.bin()?;
                    out.extend_from_slice(&bytes);
                }
            }
        }
        Ok(out)
    }
}

fn default_value(format: FieldFormat, default: FieldDefault) -> (Value, bool) {
    match (format, default) {
        (FieldFormat::U8, FieldDefault::U(v)) => (Value::U8(v as u8), true),
        (FieldFormat::U16, FieldDefault::U(v)) => (Value::U16(v as u16), true),
        (FieldFormat::U32, FieldDefault::U(v)) => (Value::U32(v as u32), true),
        (FieldFormat::U64, FieldDefault::U(v)) => (Value::U64(v), true),
        (FieldFormat::Bytes(_) | FieldFormat::Dynamic, FieldDefault::Bytes(b)) =>
            (Value::Bytes(b.to_vec()), true),
        (FieldFormat::U8, FieldDefault::Absent) => (Value::U8(0), false),
        (FieldFormat::U16, FieldDefault::Absent) => (Value::U16(0), false),
        (FieldFormat::U32, FieldDefault::Absent) => (Value::U32(0), false),
        (FieldFormat::U64, FieldDefault::Absent) => (Value::U64(0), false),
        (FieldFormat::Bytes(n), FieldDefault::Absent) => (Value::Bytes(vec![0; n]), false),
        (FieldFormat::Dynamic, FieldDefault::Absent) => (Value::Bytes(Vec::new()), false),
        // Schema::new rejects the remaining combinations.
        (FieldFormat::List, _) | (_, FieldDefault::U(_)) | (_, FieldDefault::Bytes(_)) =>
            (Value::Bytes(Vec::new()), false),
    }
}

fn read_u16(buf: &[u8], order: ByteOrder) -> u16 {
    match order {
        ByteOrder::Big => BigEndian::read_u16(buf),
        ByteOrder::Little => LittleEndian::read_u16(buf),
    }
}

fn read_u32(buf: &[u8], order: ByteOrder) -> u32 {
    match order {
        ByteOrder::Big => BigEndian::read_u32(buf),
        ByteOrder::Little => LittleEndian::read_u32(buf),
    }
}

fn read_u64(buf: &[u8], order: ByteOrder) -> u64 {
    match order {
        ByteOrder::Big => BigEndian::read_u64(buf),
        ByteOrder::Little => LittleEndian::read_u64(buf),
    }
}

fn write_value(out: &mut Vec<u8>, value: &Value, order: ByteOrder) {
    let mut scratch = [0u8; 8];
    match (value, order) {
        (Value::U8(v), _) => out.push(*v),
        (Value::U16(v), ByteOrder::Big) => {
            BigEndian::write_u16(&mut scratch[..2], *v);
            out.extend_from_slice(&scratch[..2]);
        }
        (Value::U16(v), ByteOrder::Little) => {
            LittleEndian::write_u16(&mut scratch[..2], *v);
            out.extend_from_slice(&scratch[..2]);
        }
        (Value::U32(v), ByteOrder::Big) => {
            BigEndian::write_u32(&mut scratch[..4], *v);
            out.extend_from_slice(&scratch[..4]);
        }
        (Value::U32(v), ByteOrder::Little) => {
            LittleEndian::write_u32(&mut scratch[..4], *v);
            out.extend_from_slice(&scratch[..4]);
        }
        (Value::U64(v), ByteOrder::Big) => {
            BigEndian::write_u64(&mut scratch, *v);
            out.extend_from_slice(&scratch);
        }
        (Value::U64(v), ByteOrder::Little) => {
            LittleEndian::write_u64(&mut scratch, *v);
            out.extend_from_slice(&scratch);
        }
        (Value::Bytes(v), _) => out.extend_from_slice(v),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    static GOOD: &[FieldDef] = &[
        FieldDef { name: "a", format: FieldFormat::U8, default: FieldDefault::U(1) },
        FieldDef { name: "b", format: FieldFormat::U16, default: FieldDefault::U(0x0203) },
        FieldDef { name: "c", format: FieldFormat::Bytes(2), default: FieldDefault::Bytes(&[4, 5]) },
        FieldDef { name: "opt", format: FieldFormat::U8, default: FieldDefault::Absent },
    ];

    #[test]
    fn defaults_pack_in_schema_order() {
        let schema = Box::leak(Box::new(Schema::new(ByteOrder::Big, GOOD).unwrap()));
        let mut hdr = Header::new(schema);
        assert_eq!(hdr.len, 5);
        assert_eq!(hdr.pack().unwrap(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn little_endian_scalars() {
        static FIELDS: &[FieldDef] = &[
            FieldDef { name: "x", format: FieldFormat::U16, default: FieldDefault::U(8) },
        ];
        let schema = Box::leak(Box::new(Schema::new(ByteOrder::Little, FIELDS).unwrap()));
        let mut hdr = Header::new(schema);
        assert_eq!(hdr.pack().unwrap(), vec![8, 0]);
        hdr.cache = Some(vec![0x34, 0x12]);
        hdr.unpack();
        match &hdr.fields[0].slot {
            Slot::Simple(Value::U16(v)) => assert_eq!(*v, 0x1234),
            other => panic!("unexpected slot: {:?}", other),
        }
    }

    #[test]
    fn inactive_fields_contribute_no_bytes() {
        let schema = Box::leak(Box::new(Schema::new(ByteOrder::Big, GOOD).unwrap()));
        let mut hdr = Header::new(schema);
        hdr.fields[3].active = true;
        hdr.fields[3].slot = Slot::Simple(Value::U8(9));
        hdr.recompute_format();
        assert_eq!(hdr.len, 6);
        assert_eq!(hdr.pack().unwrap(), vec![1, 2, 3, 4, 5, 9]);
    }

    #[test]
    fn duplicate_names_rejected() {
        static DUP: &[FieldDef] = &[
            FieldDef { name: "a", format: FieldFormat::U8, default: FieldDefault::U(0) },
            FieldDef { name: "a", format: FieldFormat::U8, default: FieldDefault::U(0) },
        ];
        assert!(Schema::new(ByteOrder::Big, DUP).is_err());
    }

    #[test]
    fn mismatched_default_rejected() {
        static BAD: &[FieldDef] = &[
            FieldDef { name: "a", format: FieldFormat::U8, default: FieldDefault::Bytes(&[1]) },
        ];
        assert!(Schema::new(ByteOrder::Big, BAD).is_err());
    }

    #[test]
    fn wrong_width_bytes_fail_to_pack() {
        let schema = Box::leak(Box::new(Schema::new(ByteOrder::Big, GOOD).unwrap()));
        let mut hdr = Header::new(schema);
        hdr.fields[2].slot = Slot::Simple(Value::Bytes(vec![1, 2, 3]));
        assert!(hdr.pack().is_err());
    }
}
