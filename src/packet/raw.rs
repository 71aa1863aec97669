//! Opaque payload bytes as a layer.
//!
//! `Raw` has no header fields at all; it is purely a container for
//! the bytes riding on top of the last parsed protocol.  It exists so
//! that payloads compose with the `+` operator like any other layer.

use once_cell::sync::Lazy;

use crate::Result;
use crate::field::{ByteOrder, Schema};
use crate::packet::{impl_layer, Common, Packet};
use crate::parse::Parse;

static SCHEMA: Lazy<Schema> = Lazy::new(|| Schema::container(ByteOrder::Big));

/// A payload pseudo-layer.
#[derive(Clone)]
pub struct Raw {
    pub(crate) common: Common,
}

impl Default for Raw {
    fn default() -> Raw {
        Raw { common: Common::new(&SCHEMA) }
    }
}

impl Raw {
    /// Creates a payload layer over the given bytes.
    pub fn new(payload: impl Into<Vec<u8>>) -> Raw {
        let mut raw = Raw::default();
        raw.common.set_body_bytes(payload.into());
        raw
    }

    /// The payload bytes.
    pub fn payload(&mut self) -> Vec<u8> {
        match &self.common.body {
            crate::packet::Body::Raw(bytes) => bytes.clone(),
            _ => Vec::new(),
        }
    }

    /// Replaces the payload bytes.
    pub fn set_payload(&mut self, payload: impl Into<Vec<u8>>) {
        self.common.set_body_bytes(payload.into());
    }
}

impl Parse for Raw {
    fn from_bytes(buf: &[u8]) -> Result<Raw> {
        let mut pkt = Raw::default();
        pkt.common.run_dissect(buf, |_, _| Ok(0));
        Ok(pkt)
    }
}

impl From<Vec<u8>> for Raw {
    fn from(payload: Vec<u8>) -> Raw {
        Raw::new(payload)
    }
}

impl From<&[u8]> for Raw {
    fn from(payload: &[u8]) -> Raw {
        Raw::new(payload)
    }
}

impl From<Vec<u8>> for Packet {
    fn from(payload: Vec<u8>) -> Packet {
        Raw::new(payload).into()
    }
}

impl_layer!(Raw, Raw);
