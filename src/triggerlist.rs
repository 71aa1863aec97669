//! Mutation-aware containers for variable-length structured header
//! fields.
//!
//! A [`TriggerList`] represents one header field whose wire form is a
//! sequence of smaller units: radiotap presence-flagged fields, IP
//! option TLVs, DNS resource records.  The list is lazy twice over.
//! It is created from the raw slice covering the field plus a dissect
//! callback, and only materialized into elements on first access; and
//! it keeps the serialized form cached until a mutation invalidates
//! it, so untouched lists re-emit their source bytes bit for bit.
//!
//! Every structural mutation notifies the owning packet through a
//! weak handle to its change flags, marking the header (and its
//! format) dirty.  The list never holds a strong reference to its
//! owner, so detaching it cannot leak stale notifications.

use std::rc::{Rc, Weak};

use tracing::warn;

use crate::Result;
use crate::field::ListPackFn;
use crate::packet::{ChangeFlags, Packet};

/// Callback turning a field's source bytes into its initial elements.
pub type DissectFn = Rc<dyn Fn(&[u8]) -> Result<Vec<Element>>>;

/// One unit of a trigger list.
#[derive(Clone, Debug)]
pub enum Element {
    /// Plain bytes.
    Bytes(Vec<u8>),
    /// A discriminator with its raw value, for TLV-style units.
    Field(u32, Vec<u8>),
    /// A nested packet, serialized with its own machinery.
    Packet(Packet),
}

impl Element {
    /// Serialized length of this element.
    pub fn byte_len(&mut self) -> usize {
        match self {
            Element::Bytes(b) => b.len(),
            Element::Field(_, b) => b.len(),
            Element::Packet(p) => p.total_len(),
        }
    }

    fn bin_into(&mut self, out: &mut Vec<u8>) -> Result<()> {
        match self {
            Element::Bytes(b) => out.extend_from_slice(b),
            Element::Field(_, b) => out.extend_from_slice(b),
            Element::Packet(p) => out.extend_from_slice(&p.bin(true)?),
        }
        Ok(())
    }
}

/// Weak handle to the owning packet's change flags.
#[derive(Clone, Debug, Default)]
pub(crate) struct Notifier(Weak<ChangeFlags>);

impl Notifier {
    pub(crate) fn bind(&mut self, flags: &Rc<ChangeFlags>) {
        self.0 = Rc::downgrade(flags);
    }

    fn notify(&self) {
        if let Some(flags) = self.0.upgrade() {
            flags.set_header_changed(true);
            flags.set_header_format_changed(true);
        }
    }
}

#[derive(Clone)]
enum ListState {
    /// Source bytes waiting for their first access.
    Unparsed {
        bytes: Vec<u8>,
        callback: Option<DissectFn>,
    },
    /// Materialized elements plus the cached serialized form.
    Parsed {
        items: Vec<Element>,
        cache: Option<Vec<u8>>,
    },
}

/// Lazy, mutation-aware ordered sequence backing a structured header
/// field.
#[derive(Clone)]
pub struct TriggerList {
    state: ListState,
    pack: Option<ListPackFn>,
    notifier: Notifier,
}

impl TriggerList {
    pub(crate) fn new(pack: Option<ListPackFn>) -> TriggerList {
        TriggerList {
            state: ListState::Unparsed { bytes: Vec::new(), callback: None },
            pack,
            notifier: Notifier::default(),
        }
    }

    /// Re-arms the list with fresh source bytes and a dissect
    /// callback.  Used by dissectors; does not count as a mutation.
    pub(crate) fn reinit(&mut self, bytes: Vec<u8>, callback: Option<DissectFn>) {
        self.state = ListState::Unparsed { bytes, callback };
    }

    pub(crate) fn set_notifier(&mut self, flags: &Rc<ChangeFlags>) {
        self.notifier.bind(flags);
    }

    fn materialize(&mut self) {
        let (bytes, callback) = match &mut self.state {
            ListState::Parsed { .. } => return,
            ListState::Unparsed { bytes, callback } =>
                (std::mem::take(bytes), callback.take()),
        };
        let items = match &callback {
            None => Vec::new(),
            Some(cb) => match cb(&bytes) {
                Ok(items) => items,
                Err(e) => {
                    warn!(error = %e, "could not dissect list field, keeping raw bytes");
                    Vec::new()
                }
            },
        };
        // Keep the source bytes as the serialized form so an untouched
        // list round-trips exactly.
        self.state = ListState::Parsed { items, cache: Some(bytes) };
    }

    fn touched(&mut self) {
        if let ListState::Parsed { cache, .. } = &mut self.state {
            *cache = None;
        }
        self.notifier.notify();
    }

    /// Number of elements.
    pub fn len(&mut self) -> usize {
        self.materialize();
        match &self.state {
            ListState::Parsed { items, .. } => items.len(),
            ListState::Unparsed { .. } => 0,
        }
    }

    /// True if the list has no elements.
    pub fn is_empty(&mut self) -> bool {
        self.len() == 0
    }

    /// The element at `idx`, if any.
    pub fn get(&mut self, idx: usize) -> Option<&Element> {
        self.materialize();
        match &self.state {
            ListState::Parsed { items, .. } => items.get(idx),
            ListState::Unparsed { .. } => None,
        }
    }

    /// Mutable access to the element at `idx`.
    ///
    /// Dropping the returned guard counts as a mutation: the cached
    /// serialized form is invalidated and the owner notified.
    pub fn get_mut(&mut self, idx: usize) -> Option<ElementMut<'_>> {
        self.materialize();
        let notifier = &self.notifier;
        match &mut self.state {
            ListState::Parsed { items, cache } => {
                let element = items.get_mut(idx)?;
                Some(ElementMut { element, cache, notifier })
            }
            ListState::Unparsed { .. } => None,
        }
    }

    /// Iterates over the elements.
    pub fn iter(&mut self) -> std::slice::Iter<'_, Element> {
        self.materialize();
        match &self.state {
            ListState::Parsed { items, .. } => items.iter(),
            ListState::Unparsed { .. } => unreachable!("list not materialized"),
        }
    }

    /// Appends an element.
    pub fn push(&mut self, element: Element) {
        self.materialize();
        if let ListState::Parsed { items, .. } = &mut self.state {
            items.push(element);
        }
        self.touched();
    }

    /// Inserts an element at `idx`.
    pub fn insert(&mut self, idx: usize, element: Element) {
        self.materialize();
        if let ListState::Parsed { items, .. } = &mut self.state {
            items.insert(idx, element);
        }
        self.touched();
    }

    /// Removes and returns the element at `idx`.
    pub fn remove(&mut self, idx: usize) -> Option<Element> {
        self.materialize();
        let removed = match &mut self.state {
            ListState::Parsed { items, .. } if idx < items.len() =>
                Some(items.remove(idx)),
            _ => None,
        };
        if removed.is_some() {
            self.touched();
        }
        removed
    }

    /// Replaces the whole content with the given elements.
    pub fn set(&mut self, elements: Vec<Element>) {
        self.materialize();
        if let ListState::Parsed { items, .. } = &mut self.state {
            *items = elements;
        }
        self.touched();
    }

    /// Appends all elements from the iterator.
    pub fn extend(&mut self, elements: impl IntoIterator<Item = Element>) {
        self.materialize();
        if let ListState::Parsed { items, .. } = &mut self.state {
            items.extend(elements);
        }
        self.touched();
    }

    /// Removes all elements.
    pub fn clear(&mut self) {
        self.materialize();
        if let ListState::Parsed { items, .. } = &mut self.state {
            items.clear();
        }
        self.touched();
    }

    /// Index of the first element at or after `offset` matching the
    /// predicate.
    pub fn find_pos(
        &mut self,
        pred: impl Fn(&Element) -> bool,
        offset: usize,
    ) -> Option<usize> {
        self.materialize();
        match &self.state {
            ListState::Parsed { items, .. } => items.iter()
                .enumerate()
                .skip(offset)
                .find(|(_, el)| pred(el))
                .map(|(i, _)| i),
            ListState::Unparsed { .. } => None,
        }
    }

    /// Like [`TriggerList::find_pos`], returning the element itself.
    pub fn find_value(
        &mut self,
        pred: impl Fn(&Element) -> bool,
        offset: usize,
    ) -> Option<&Element> {
        let pos = self.find_pos(pred, offset)?;
        self.get(pos)
    }

    /// Serialized form of the list.
    ///
    /// An unmaterialized list returns its source bytes untouched; a
    /// materialized one concatenates its elements (or applies the
    /// schema's custom pack function) and caches the result.
    pub fn bin(&mut self) -> Result<Vec<u8>> {
        match &mut self.state {
            ListState::Unparsed { bytes, .. } => Ok(bytes.clone()),
            ListState::Parsed { items, cache } => {
                if let Some(cached) = cache {
                    return Ok(cached.clone());
                }
                let bytes = match self.pack {
                    Some(pack) => pack(items)?,
                    None => {
                        let mut out = Vec::new();
                        for el in items.iter_mut() {
                            el.bin_into(&mut out)?;
                        }
                        out
                    }
                };
                *cache = Some(bytes.clone());
                Ok(bytes)
            }
        }
    }

    /// Serialized length without consulting the cache validity.
    pub fn byte_len(&mut self) -> usize {
        match &mut self.state {
            ListState::Unparsed { bytes, .. } => bytes.len(),
            ListState::Parsed { items, cache } => match cache {
                Some(c) => c.len(),
                None => {
                    if let Some(pack) = self.pack {
                        pack(items).map(|b| b.len()).unwrap_or(0)
                    } else {
                        items.iter_mut().map(|el| el.byte_len()).sum()
                    }
                }
            },
        }
    }
}

impl std::fmt::Debug for TriggerList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.state {
            ListState::Unparsed { bytes, .. } =>
                f.debug_struct("TriggerList")
                    .field("unparsed_len", &bytes.len())
                    .finish(),
            ListState::Parsed { items, cache } =>
                f.debug_struct("TriggerList")
                    .field("items", items)
                    .field("cached", &cache.is_some())
                    .finish(),
        }
    }
}

/// Mutable element handle; dropping it marks the list changed.
pub struct ElementMut<'a> {
    element: &'a mut Element,
    cache: &'a mut Option<Vec<u8>>,
    notifier: &'a Notifier,
}

impl std::ops::Deref for ElementMut<'_> {
    type Target = Element;
    fn deref(&self) -> &Element {
        self.element
    }
}

impl std::ops::DerefMut for ElementMut<'_> {
    fn deref_mut(&mut self) -> &mut Element {
        self.element
    }
}

impl Drop for ElementMut<'_> {
    fn drop(&mut self) {
        self.cache.take();
        self.notifier.notify();
    }
}
