//! Packet layers and the machinery shared by every protocol module.
//!
//! A [`Packet`] is one protocol layer: a header described by its
//! schema, a body, and bookkeeping for lazy parsing and change
//! tracking.  Bodies form the layer stack.  A body is either raw
//! bytes, a not-yet-parsed upper layer (the class to construct plus
//! its bytes), or an attached upper [`Packet`].  Ownership runs
//! strictly downward: the packet you hold is the lowest layer and
//! owns everything above it.
//!
//! Dissection is cheap by design.  Constructing a layer from bytes
//! runs only the protocol's dissector, which computes the header
//! length, arms trigger-list fields with their slices, and records the
//! upper layer's class and bytes for later.  Header fields are decoded
//! on first access, upper layers on first navigation.  Mutations set
//! shared change flags; [`Packet::bin`] re-packs what changed and
//! gives each protocol a hook to recompute derived fields first.

use std::rc::Rc;

use std::cell::Cell;
use std::fmt;

use tracing::warn;

use crate::{Direction, Error, Result};
use crate::field::{Header, Schema, Slot, Value};
use crate::registry;
use crate::triggerlist::DissectFn;

pub mod dns;
pub mod ethernet;
pub mod ipv4;
pub mod radiotap;
pub mod raw;
pub mod udp;

use self::dns::{Dns, DnsAnswer, DnsQuery};
use self::ethernet::Ethernet;
use self::ipv4::Ipv4;
use self::radiotap::Radiotap;
use self::raw::Raw;
use self::udp::Udp;
use crate::parse::Parse;

/// Change flags of one layer, shared with its trigger lists.
///
/// Trigger lists hold a weak handle to these flags and set them on
/// structural mutations; everything else goes through [`Common`].
#[derive(Debug, Default)]
pub(crate) struct ChangeFlags {
    header_changed: Cell<bool>,
    body_changed: Cell<bool>,
    header_format_changed: Cell<bool>,
}

impl ChangeFlags {
    pub(crate) fn header_changed(&self) -> bool {
        self.header_changed.get()
    }

    pub(crate) fn set_header_changed(&self, v: bool) {
        self.header_changed.set(v);
    }

    pub(crate) fn body_changed(&self) -> bool {
        self.body_changed.get()
    }

    pub(crate) fn set_body_changed(&self, v: bool) {
        self.body_changed.set(v);
    }

    pub(crate) fn header_format_changed(&self) -> bool {
        self.header_format_changed.get()
    }

    pub(crate) fn set_header_format_changed(&self, v: bool) {
        self.header_format_changed.set(v);
    }

    /// Clears the header and body dirty flags, leaving the format
    /// flag alone (caches stay invalid until the next re-format).
    pub(crate) fn reset_changed(&self) {
        self.header_changed.set(false);
        self.body_changed.set(false);
    }

    fn snapshot(&self) -> ChangeFlags {
        ChangeFlags {
            header_changed: self.header_changed.clone(),
            body_changed: self.body_changed.clone(),
            header_format_changed: self.header_format_changed.clone(),
        }
    }
}

/// Unpack state of a layer's simple header fields.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Unpacked {
    /// The dissector has not finished yet.
    PreDissect,
    /// Header bytes are cached but fields not yet decoded.
    NotYetUnpacked,
    /// Field slots are authoritative.
    Unpacked,
}

/// The body of a layer.  Exactly one representation at a time.
#[derive(Clone, Debug)]
pub(crate) enum Body {
    /// Raw bytes (possibly empty).
    Raw(Vec<u8>),
    /// An upper layer that has not been constructed yet.
    Lazy(ClassId, Vec<u8>),
    /// The constructed upper layer.
    Attached(Box<Packet>),
}

/// Pseudo-header context passed from a lower layer to its upper
/// layer's auto-field hook during serialization.
pub(crate) struct PseudoCtx {
    pub(crate) src: Vec<u8>,
    pub(crate) dst: Vec<u8>,
    /// Whether the pseudo-header source itself was just updated.
    pub(crate) lower_changed: bool,
}

/// Engine state embedded in every protocol struct.
#[derive(Debug)]
pub(crate) struct Common {
    pub(crate) header: Header,
    pub(crate) unpacked: Unpacked,
    pub(crate) body: Body,
    pub(crate) flags: Rc<ChangeFlags>,
    pub(crate) dissect_error: Option<Error>,
}

impl Clone for Common {
    fn clone(&self) -> Common {
        let mut c = Common {
            header: self.header.clone(),
            unpacked: self.unpacked,
            body: self.body.clone(),
            flags: Rc::new(self.flags.snapshot()),
            dissect_error: self.dissect_error.clone(),
        };
        c.bind_notifiers();
        c
    }
}

impl Common {
    pub(crate) fn new(schema: &'static Schema) -> Common {
        let mut common = Common {
            header: Header::new(schema),
            unpacked: Unpacked::Unpacked,
            body: Body::Raw(Vec::new()),
            flags: Rc::new(ChangeFlags::default()),
            dissect_error: None,
        };
        common.bind_notifiers();
        common
    }

    fn bind_notifiers(&mut self) {
        for state in &mut self.header.fields {
            if let Slot::List(list) = &mut state.slot {
                list.set_notifier(&self.flags);
            }
        }
    }

    /// Runs a protocol dissector over `buf` and installs the results.
    ///
    /// Dissection errors never propagate: they are logged, recorded in
    /// `dissect_error`, and the packet keeps its defaults plus the
    /// whole input as best-effort bytes.
    pub(crate) fn run_dissect(
        &mut self,
        buf: &[u8],
        dissect: impl FnOnce(&mut Common, &[u8]) -> Result<usize>,
    ) {
        self.unpacked = Unpacked::PreDissect;
        let result = dissect(self, buf).and_then(|n| self.finish_dissect(n, buf));
        if let Err(e) = result {
            warn!(error = %e, "could not dissect packet, keeping best-effort bytes");
            self.dissect_error = Some(match e.downcast::<Error>() {
                Ok(err) => err,
                Err(other) => Error::MalformedPacket(other.to_string()),
            });
            self.header.cache = None;
            self.header.recompute_format();
            self.body = Body::Raw(buf.to_vec());
            self.unpacked = Unpacked::Unpacked;
            self.flags.reset_changed();
            self.flags.set_header_format_changed(false);
        }
    }

    fn finish_dissect(&mut self, header_len: usize, buf: &[u8]) -> Result<()> {
        if header_len > buf.len() {
            return Err(Error::MalformedPacket(format!(
                "header length {} exceeds buffer of {} bytes",
                header_len, buf.len())).into());
        }
        self.header.recompute_format();
        if self.header.len != header_len {
            return Err(Error::MalformedPacket(format!(
                "dissected header length {} does not match the field layout ({} bytes)",
                header_len, self.header.len)).into());
        }
        self.header.cache = Some(buf[..header_len].to_vec());
        if !self.flags.body_changed() {
            self.body = Body::Raw(buf[header_len..].to_vec());
        }
        self.flags.reset_changed();
        self.flags.set_header_format_changed(false);
        self.unpacked = Unpacked::NotYetUnpacked;
        Ok(())
    }

    /// Decodes the cached header bytes into the field slots, once.
    pub(crate) fn ensure_unpacked(&mut self) {
        if self.unpacked != Unpacked::NotYetUnpacked {
            return;
        }
        self.unpacked = Unpacked::Unpacked;
        if self.flags.header_format_changed() {
            self.header.recompute_format();
            self.flags.set_header_format_changed(false);
        }
        self.header.unpack();
    }

    /// Current value of a simple field.
    pub(crate) fn get(&mut self, idx: usize) -> Value {
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        }
        match &self.header.fields[idx].slot {
            Slot::Simple(v) => v.clone(),
            Slot::List(_) =>
                panic!("field {} is a trigger list", self.header.schema.fields()[idx].name),
        }
    }

    /// Current value of an optional simple field, or `None` while it
    /// is deactivated.
    pub(crate) fn get_opt(&mut self, idx: usize) -> Option<Value> {
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        }
        if !self.header.fields[idx].active {
            return None;
        }
        Some(self.get(idx))
    }

    /// Writes a simple field.  `None` deactivates an optional field;
    /// a value re-activates it.  Dynamic fields adopt the value's
    /// width.
    pub(crate) fn set(&mut self, idx: usize, value: Option<Value>) {
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        }
        let dynamic = matches!(
            self.header.schema.fields()[idx].format,
            crate::field::FieldFormat::Dynamic);
        let state = &mut self.header.fields[idx];
        match value {
            None => {
                if state.active {
                    state.active = false;
                    self.flags.set_header_format_changed(true);
                }
            }
            Some(v) => {
                if !state.active {
                    state.active = true;
                    self.flags.set_header_format_changed(true);
                }
                if dynamic {
                    let width = match &v {
                        Value::Bytes(b) => b.len(),
                        _ => state.width,
                    };
                    if width != state.width {
                        state.width = width;
                        self.flags.set_header_format_changed(true);
                    }
                }
                state.slot = Slot::Simple(v);
            }
        }
        self.flags.set_header_changed(true);
    }

    /// The trigger list stored in field `idx`.
    pub(crate) fn list_mut(&mut self, idx: usize) -> &mut crate::triggerlist::TriggerList {
        // Mutations through the list re-pack against the field slots,
        // so the cached header must be decoded first.
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        }
        match &mut self.header.fields[idx].slot {
            Slot::List(list) => list,
            Slot::Simple(_) =>
                panic!("field {} is not a trigger list", self.header.schema.fields()[idx].name),
        }
    }

    /// Arms the trigger list in field `idx` with its source bytes and
    /// dissect callback.  Called by dissectors.
    pub(crate) fn init_triggerlist(&mut self, idx: usize, bytes: &[u8], callback: DissectFn) {
        match &mut self.header.fields[idx].slot {
            Slot::List(list) => list.reinit(bytes.to_vec(), Some(callback)),
            Slot::Simple(_) =>
                panic!("field {} is not a trigger list", self.header.schema.fields()[idx].name),
        }
        self.flags.set_header_format_changed(true);
    }

    /// Records the upper layer discovered by a dissector.
    ///
    /// A registry hit stores the class and bytes for lazy
    /// construction; a miss keeps the bytes as raw body.  Empty
    /// buffers mean "no upper layer".
    pub(crate) fn init_handler(&mut self, own: ClassId, discriminator: u64, buf: &[u8]) {
        if buf.is_empty() {
            return;
        }
        match registry::lookup(own, discriminator) {
            Some(upper) => self.body = Body::Lazy(upper, buf.to_vec()),
            None => {
                registry::note_unknown(own, discriminator);
                self.body = Body::Raw(buf.to_vec());
            }
        }
        self.flags.set_body_changed(true);
    }

    /// Replaces the body with raw bytes, dropping any upper layer.
    pub(crate) fn set_body_bytes(&mut self, bytes: Vec<u8>) {
        self.body = Body::Raw(bytes);
        self.flags.set_body_changed(true);
    }

    /// Serializes the header, updating the cache and clearing the
    /// header dirty flag.
    pub(crate) fn pack_header(&mut self) -> Result<Vec<u8>> {
        if !self.flags.header_changed() {
            if let Some(cache) = &self.header.cache {
                return Ok(cache.clone());
            }
        }
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        } else if self.flags.header_format_changed() {
            self.header.recompute_format();
            self.flags.set_header_format_changed(false);
        }
        let bytes = self.header.pack()?;
        self.header.cache = Some(bytes.clone());
        self.flags.set_header_changed(false);
        Ok(bytes)
    }

    /// Serializes the header without touching caches or flags.  Used
    /// by checksum hooks that need the current bytes mid-update.
    pub(crate) fn peek_header(&mut self) -> Result<Vec<u8>> {
        if !self.flags.header_changed() {
            if let Some(cache) = &self.header.cache {
                return Ok(cache.clone());
            }
        }
        if self.unpacked == Unpacked::NotYetUnpacked {
            self.ensure_unpacked();
        } else if self.flags.header_format_changed() {
            self.header.recompute_format();
        }
        self.header.pack()
    }

    /// Current header length in bytes.
    pub(crate) fn header_len(&mut self) -> usize {
        if self.flags.header_format_changed() {
            self.header.recompute_format();
        }
        self.header.len
    }

    /// Total length of this layer and everything above it, without
    /// serializing.
    pub(crate) fn total_len(&mut self) -> usize {
        let header = self.header_len();
        let body = match &mut self.body {
            Body::Raw(bytes) => bytes.len(),
            Body::Lazy(_, bytes) => bytes.len(),
            Body::Attached(upper) => upper.total_len(),
        };
        header + body
    }

    /// True if this layer or any attached upper layer changed since
    /// the last serialization.  Lazy and raw bodies end the walk.
    pub(crate) fn changed(&self) -> bool {
        if self.flags.header_changed() || self.flags.body_changed() {
            return true;
        }
        match &self.body {
            Body::Attached(upper) => upper.common().changed(),
            Body::Raw(_) | Body::Lazy(..) => false,
        }
    }

    fn materialize_lists(&mut self) {
        self.ensure_unpacked();
        for state in &mut self.header.fields {
            if let Slot::List(list) = &mut state.slot {
                let _ = list.len();
            }
        }
    }

    fn field_summaries(&mut self) -> Vec<String> {
        self.ensure_unpacked();
        let mut parts = Vec::new();
        let defs = self.header.schema.fields();
        for (state, def) in self.header.fields.iter_mut().zip(defs) {
            let active = state.active;
            let part = match &mut state.slot {
                Slot::Simple(v) if active => format!("{}={}", def.name, v),
                Slot::Simple(_) => format!("{}=-", def.name),
                Slot::List(list) => format!("{}=[{}]", def.name, list.len()),
            };
            parts.push(part);
        }
        parts
    }
}

/// Identifies a protocol class.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[allow(missing_docs)]
pub enum ClassId {
    Raw,
    Ethernet,
    Radiotap,
    Ipv4,
    Udp,
    Dns,
    DnsQuery,
    DnsAnswer,
}

impl ClassId {
    /// Class name, as used in summaries and logs.
    pub fn name(self) -> &'static str {
        match self {
            ClassId::Raw => "Raw",
            ClassId::Ethernet => "Ethernet",
            ClassId::Radiotap => "Radiotap",
            ClassId::Ipv4 => "Ipv4",
            ClassId::Udp => "Udp",
            ClassId::Dns => "Dns",
            ClassId::DnsQuery => "DnsQuery",
            ClassId::DnsAnswer => "DnsAnswer",
        }
    }

    fn construct(self, buf: &[u8]) -> Result<Packet> {
        Ok(match self {
            ClassId::Raw => Raw::from_bytes(buf)?.into(),
            ClassId::Ethernet => Ethernet::from_bytes(buf)?.into(),
            ClassId::Radiotap => Radiotap::from_bytes(buf)?.into(),
            ClassId::Ipv4 => Ipv4::from_bytes(buf)?.into(),
            ClassId::Udp => Udp::from_bytes(buf)?.into(),
            ClassId::Dns => Dns::from_bytes(buf)?.into(),
            ClassId::DnsQuery => DnsQuery::from_bytes(buf)?.into(),
            ClassId::DnsAnswer => DnsAnswer::from_bytes(buf)?.into(),
        })
    }
}

impl fmt::Display for ClassId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A typed protocol layer that can be stored in a [`Packet`].
pub trait Layer: Sized + Into<Packet> {
    /// Class identifier of this protocol.
    const CLASS: ClassId;

    #[doc(hidden)]
    fn from_packet(p: &Packet) -> Option<&Self>;

    #[doc(hidden)]
    fn from_packet_mut(p: &mut Packet) -> Option<&mut Self>;
}

macro_rules! impl_layer {
    ($variant:ident, $ty:ty) => {
        impl crate::packet::Layer for $ty {
            const CLASS: crate::packet::ClassId = crate::packet::ClassId::$variant;

            fn from_packet(p: &crate::packet::Packet) -> Option<&Self> {
                match p {
                    crate::packet::Packet::$variant(x) => Some(x),
                    _ => None,
                }
            }

            fn from_packet_mut(p: &mut crate::packet::Packet) -> Option<&mut Self> {
                match p {
                    crate::packet::Packet::$variant(x) => Some(x),
                    _ => None,
                }
            }
        }

        impl From<$ty> for crate::packet::Packet {
            fn from(p: $ty) -> crate::packet::Packet {
                crate::packet::Packet::$variant(p)
            }
        }

        impl<T: Into<crate::packet::Packet>> std::ops::Add<T> for $ty {
            type Output = crate::packet::Packet;

            fn add(self, rhs: T) -> crate::packet::Packet {
                crate::packet::Packet::from(self) + rhs.into()
            }
        }
    };
}
pub(crate) use impl_layer;

/// One protocol layer, possibly with further layers attached above.
#[derive(Clone)]
#[allow(missing_docs)]
pub enum Packet {
    Raw(Raw),
    Ethernet(Ethernet),
    Radiotap(Radiotap),
    Ipv4(Ipv4),
    Udp(Udp),
    Dns(Dns),
    DnsQuery(DnsQuery),
    DnsAnswer(DnsAnswer),
}

impl Packet {
    /// Class of this layer.
    pub fn class_id(&self) -> ClassId {
        match self {
            Packet::Raw(_) => ClassId::Raw,
            Packet::Ethernet(_) => ClassId::Ethernet,
            Packet::Radiotap(_) => ClassId::Radiotap,
            Packet::Ipv4(_) => ClassId::Ipv4,
            Packet::Udp(_) => ClassId::Udp,
            Packet::Dns(_) => ClassId::Dns,
            Packet::DnsQuery(_) => ClassId::DnsQuery,
            Packet::DnsAnswer(_) => ClassId::DnsAnswer,
        }
    }

    pub(crate) fn common(&self) -> &Common {
        match self {
            Packet::Raw(p) => &p.common,
            Packet::Ethernet(p) => &p.common,
            Packet::Radiotap(p) => &p.common,
            Packet::Ipv4(p) => &p.common,
            Packet::Udp(p) => &p.common,
            Packet::Dns(p) => &p.common,
            Packet::DnsQuery(p) => &p.common,
            Packet::DnsAnswer(p) => &p.common,
        }
    }

    pub(crate) fn common_mut(&mut self) -> &mut Common {
        match self {
            Packet::Raw(p) => &mut p.common,
            Packet::Ethernet(p) => &mut p.common,
            Packet::Radiotap(p) => &mut p.common,
            Packet::Ipv4(p) => &mut p.common,
            Packet::Udp(p) => &mut p.common,
            Packet::Dns(p) => &mut p.common,
            Packet::DnsQuery(p) => &mut p.common,
            Packet::DnsAnswer(p) => &mut p.common,
        }
    }

    /// The error recorded when dissection of this layer failed, if
    /// any.  The packet stays usable with best-effort bytes.
    pub fn dissect_error(&self) -> Option<&Error> {
        self.common().dissect_error.as_ref()
    }

    /// Serializes this layer and everything above it.
    ///
    /// With `update_auto_fields` set, derived fields (length fields,
    /// checksums) are recomputed first wherever this or an upper layer
    /// changed.  Clears the per-layer dirty flags on the way.
    pub fn bin(&mut self, update_auto_fields: bool) -> Result<Vec<u8>> {
        self.bin_ctx(update_auto_fields, None)
    }

    pub(crate) fn bin_ctx(
        &mut self,
        update_auto_fields: bool,
        lower: Option<&PseudoCtx>,
    ) -> Result<Vec<u8>> {
        if update_auto_fields {
            self.run_auto_fields(lower)?;
        }
        let ctx = self.pseudo_ctx();
        let body = match &mut self.common_mut().body {
            Body::Raw(bytes) => bytes.clone(),
            Body::Lazy(_, bytes) => bytes.clone(),
            Body::Attached(upper) => upper.bin_ctx(update_auto_fields, ctx.as_ref())?,
        };
        let mut out = self.common_mut().pack_header()?;
        out.extend_from_slice(&body);
        if let Some(trailer) = self.trailer_bytes() {
            out.extend_from_slice(&trailer);
        }
        self.common().flags.reset_changed();
        Ok(out)
    }

    fn run_auto_fields(&mut self, lower: Option<&PseudoCtx>) -> Result<()> {
        match self {
            Packet::Radiotap(p) => p.update_auto_fields(),
            Packet::Ipv4(p) => p.update_auto_fields(),
            Packet::Udp(p) => p.update_auto_fields(lower),
            Packet::Dns(p) => p.update_auto_fields(),
            _ => Ok(()),
        }
    }

    fn pseudo_ctx(&mut self) -> Option<PseudoCtx> {
        match self {
            Packet::Ipv4(ip) => Some(PseudoCtx {
                src: ip.src(),
                dst: ip.dst(),
                lower_changed: ip.common.flags.header_changed(),
            }),
            _ => None,
        }
    }

    fn trailer_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Packet::Radiotap(p) => p.fcs().map(|f| f.to_vec()),
            _ => None,
        }
    }

    /// This layer's header bytes, packing on demand.
    pub fn header_bytes(&mut self) -> Result<Vec<u8>> {
        self.common_mut().pack_header()
    }

    /// This layer's body bytes: raw bytes, the remembered bytes of a
    /// lazy upper layer, or the attached upper layers re-packed
    /// without recomputing derived fields.
    pub fn body_bytes(&mut self) -> Result<Vec<u8>> {
        match &mut self.common_mut().body {
            Body::Raw(bytes) => Ok(bytes.clone()),
            Body::Lazy(_, bytes) => Ok(bytes.clone()),
            Body::Attached(upper) => {
                let mut out = upper.common_mut().peek_header()?;
                out.extend_from_slice(&upper.body_bytes()?);
                if let Some(trailer) = upper.trailer_bytes() {
                    out.extend_from_slice(&trailer);
                }
                Ok(out)
            }
        }
    }

    /// Replaces the body with raw bytes, dropping any upper layer.
    pub fn set_body_bytes(&mut self, bytes: Vec<u8>) {
        self.common_mut().set_body_bytes(bytes);
    }

    /// The attached upper layer, if it has been constructed already.
    /// Does not force lazy construction; see
    /// [`Packet::upper_layer_mut`].
    pub fn upper_layer(&self) -> Option<&Packet> {
        match &self.common().body {
            Body::Attached(upper) => Some(upper),
            Body::Raw(_) | Body::Lazy(..) => None,
        }
    }

    /// The layer directly below `upper` in this stack.
    ///
    /// Ownership runs strictly downward, so a layer does not store a
    /// pointer to its lower neighbour; the link is resolved against
    /// the outer layer instead and the result borrows it.  Returns
    /// `None` when `upper` is this packet itself (nothing is below
    /// the lowest layer) or not part of this stack.  Only already
    /// constructed layers are visited; call [`Packet::dissect_full`]
    /// first to materialize lazy ones.
    pub fn lower_layer<'a>(&'a self, upper: &Packet) -> Option<&'a Packet> {
        let mut current = self;
        loop {
            let next = current.upper_layer()?;
            if std::ptr::eq(next, upper) {
                return Some(current);
            }
            current = next;
        }
    }

    /// The upper layer, constructing it first if it is still lazy.
    pub fn upper_layer_mut(&mut self) -> Option<&mut Packet> {
        self.materialize_upper();
        match &mut self.common_mut().body {
            Body::Attached(upper) => Some(upper),
            Body::Raw(_) | Body::Lazy(..) => None,
        }
    }

    /// Attaches `upper` as this layer's new upper layer, replacing
    /// raw bytes, lazy data or a previously attached layer.
    pub fn set_upper_layer(&mut self, upper: impl Into<Packet>) {
        let common = self.common_mut();
        common.body = Body::Attached(Box::new(upper.into()));
        common.flags.set_body_changed(true);
    }

    fn materialize_upper(&mut self) {
        let (class, bytes) = match &self.common().body {
            Body::Lazy(class, bytes) => (*class, bytes.clone()),
            Body::Raw(_) | Body::Attached(_) => return,
        };
        match class.construct(&bytes) {
            Ok(upper) => {
                let parse_error = upper.dissect_error().map(|e| e.to_string());
                match parse_error {
                    None => {
                        // A lazy construction is not a change; the
                        // bytes on the wire are still exactly the
                        // stored ones.
                        self.common_mut().body = Body::Attached(Box::new(upper));
                    }
                    Some(e) => {
                        warn!(class = %class, error = %e,
                              "could not parse upper layer, keeping raw bytes");
                        self.common_mut().body = Body::Raw(bytes);
                    }
                }
            }
            Err(e) => {
                warn!(class = %class, error = %e,
                      "could not construct upper layer, keeping raw bytes");
                self.common_mut().body = Body::Raw(bytes);
            }
        }
    }

    /// The topmost layer of this stack, constructing lazy layers on
    /// the way.
    pub fn highest_layer_mut(&mut self) -> &mut Packet {
        if self.upper_layer_mut().is_none() {
            return self;
        }
        match &mut self.common_mut().body {
            Body::Attached(upper) => upper.highest_layer_mut(),
            Body::Raw(_) | Body::Lazy(..) => unreachable!("upper layer vanished"),
        }
    }

    /// Searches this layer and everything above it for a layer of
    /// type `T`, constructing lazy layers on the way.
    pub fn layer<T: Layer>(&mut self) -> Option<&mut T> {
        if self.class_id() == T::CLASS {
            return T::from_packet_mut(self);
        }
        self.upper_layer_mut()?.layer::<T>()
    }

    /// Like [`Packet::layer`], searching by class id.
    pub fn layer_by_id(&mut self, class: ClassId) -> Option<&mut Packet> {
        if self.class_id() == class {
            return Some(self);
        }
        self.upper_layer_mut()?.layer_by_id(class)
    }

    /// Iterates over the already constructed layers above this one.
    /// Call [`Packet::dissect_full`] first to materialize lazy
    /// layers.
    pub fn upper_layers(&self) -> UpperLayers<'_> {
        UpperLayers { next: self.upper_layer() }
    }

    /// Forces a full recursive parse: all header fields, all trigger
    /// lists, all upper layers.
    pub fn dissect_full(&mut self) -> &mut Packet {
        self.common_mut().materialize_lists();
        if let Some(upper) = self.upper_layer_mut() {
            upper.dissect_full();
        }
        self
    }

    /// Total length in bytes of this layer and everything above it,
    /// without serializing.
    pub fn total_len(&mut self) -> usize {
        let len = self.common_mut().total_len();
        len + self.trailer_bytes().map(|t| t.len()).unwrap_or(0)
    }

    /// Current header length in bytes.
    pub fn header_len(&mut self) -> usize {
        self.common_mut().header_len()
    }

    /// Swaps source and destination addresses of this layer, where
    /// the protocol has them.
    pub fn reverse_address(&mut self) {
        match self {
            Packet::Ethernet(p) => p.reverse_address(),
            Packet::Ipv4(p) => p.reverse_address(),
            Packet::Udp(p) => p.reverse_address(),
            _ => {}
        }
    }

    /// Applies [`Packet::reverse_address`] to this layer and every
    /// layer above it.
    pub fn reverse_all_address(&mut self) {
        self.reverse_address();
        if let Some(upper) = self.upper_layer_mut() {
            upper.reverse_all_address();
        }
    }

    /// Relates this layer to `other`.
    ///
    /// Layers without a notion of direction report
    /// [`Direction::NOT_IMPLEMENTED`].
    pub fn direction(&mut self, other: &mut Packet) -> Direction {
        match (self, other) {
            (Packet::Ethernet(a), Packet::Ethernet(b)) => a.direction(b),
            (Packet::Ipv4(a), Packet::Ipv4(b)) => a.direction(b),
            (Packet::Udp(a), Packet::Udp(b)) => a.direction(b),
            _ => Direction::NOT_IMPLEMENTED,
        }
    }

    /// ANDs [`Packet::direction`] over all layer pairs, walking both
    /// stacks upward until one of them ends.
    pub fn direction_all(&mut self, other: &mut Packet) -> Direction {
        let dir = self.direction(other);
        match (self.upper_layer_mut(), other.upper_layer_mut()) {
            (Some(a), Some(b)) => dir & a.direction_all(b),
            _ => dir,
        }
    }

    /// True if `want` is contained in [`Packet::direction_all`].
    pub fn is_direction(&mut self, other: &mut Packet, want: Direction) -> bool {
        self.direction_all(other).contains(want)
    }

    /// Hex dump of this packet, `width` bytes per line.  A debugging
    /// aid; serializes with auto-field updates unless `only_header`.
    pub fn hexdump(&mut self, width: usize, only_header: bool) -> Result<String> {
        let buf = if only_header {
            self.common_mut().pack_header()?
        } else {
            self.bin(true)?
        };
        Ok(crate::fmt::hexdump(&buf, width))
    }

    /// One-line summary of this layer: field values plus the body
    /// kind.  Forces header decoding but no upper-layer construction.
    pub fn summarize(&mut self) -> String {
        let name = self.class_id().name();
        let mut parts = self.common_mut().field_summaries();
        parts.push(match &self.common().body {
            Body::Raw(bytes) => format!("bytes={}", bytes.len()),
            Body::Lazy(class, bytes) => format!("handler={}({} bytes, lazy)", class, bytes.len()),
            Body::Attached(upper) => format!("handler={}", upper.class_id().name()),
        });
        format!("{}({})", name, parts.join(", "))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Packet")
            .field("class", &self.class_id())
            .field("common", self.common())
            .finish()
    }
}

impl<T: Into<Packet>> std::ops::Add<T> for Packet {
    type Output = Packet;

    fn add(mut self, rhs: T) -> Packet {
        self.highest_layer_mut().set_upper_layer(rhs.into());
        self
    }
}

/// Iterator over the attached layers above a packet.
pub struct UpperLayers<'a> {
    next: Option<&'a Packet>,
}

impl<'a> Iterator for UpperLayers<'a> {
    type Item = &'a Packet;

    fn next(&mut self) -> Option<&'a Packet> {
        let current = self.next.take()?;
        self.next = current.upper_layer();
        Some(current)
    }
}
