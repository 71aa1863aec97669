//! Network packet construction and dissection.
//!
//! This crate turns raw byte buffers into navigable stacks of typed
//! protocol layers and turns typed field assignments back into
//! correctly framed byte buffers.  It is aimed at packet crafting,
//! traffic inspection and protocol fuzzing, where per-packet parsing
//! cost and mutation round-trips matter.
//!
//! Every layer is described by a declarative header [`Schema`]: an
//! ordered list of named fields with a wire format and a default.
//! Parsing is lazy on several levels.  Constructing a layer from bytes
//! only runs the protocol's dissector, which determines the header
//! length and remembers where the upper layer starts; header fields
//! are decoded on first access, variable-length structured fields
//! ([`TriggerList`]) on first access to the list, and upper layers on
//! first navigation.  Mutations set per-layer change flags, and
//! serialization re-packs only what changed, recomputing derived
//! fields such as checksums and length fields on the way.
//!
//! ```
//! use lamina::{Ipv4, Udp, Parse, Packet};
//! use lamina::packet::ipv4::IP_PROTO_UDP;
//!
//! # fn main() -> lamina::Result<()> {
//! // Craft a packet stack and serialize it.
//! let mut ip = Ipv4::new([10, 0, 0, 1], [10, 0, 0, 2]);
//! ip.set_p(IP_PROTO_UDP);
//! let mut pkt = ip + Udp::new(1234, 53) + b"ping".to_vec();
//! let wire = pkt.bin(true)?;
//!
//! // Parse it back and navigate.
//! let mut parsed = Packet::from(Ipv4::from_bytes(&wire)?);
//! let udp = parsed.layer::<Udp>().expect("udp layer");
//! assert_eq!(udp.dport(), 53);
//! # Ok(())
//! # }
//! ```
//!
//! Capturing and injecting live traffic is out of scope; byte buffers
//! are expected to come from (and go to) an external collaborator.
//!
//! Packet stacks are confined to a single thread.  The process-wide
//! tables (schemas and the upper-layer dispatch registry) are built
//! once, before the first packet is constructed, and are read-only
//! afterwards.

#![warn(missing_docs)]

pub mod checksum;
mod field;
pub mod fmt;
pub mod packet;
mod parse;
mod registry;
mod serialize;
pub mod triggerlist;

pub use crate::field::{ByteOrder, FieldDef, FieldDefault, FieldFormat, Schema, Value};
pub use crate::packet::{ClassId, Layer, Packet};
pub use crate::packet::dns::{Dns, DnsAnswer, DnsQuery};
pub use crate::packet::ethernet::Ethernet;
pub use crate::packet::ipv4::Ipv4;
pub use crate::packet::radiotap::Radiotap;
pub use crate::packet::raw::Raw;
pub use crate::packet::udp::Udp;
pub use crate::parse::Parse;
pub use crate::serialize::Serialize;
pub use crate::triggerlist::{Element, TriggerList};

/// A `Result` whose error is [`anyhow::Error`].
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Errors returned by this crate.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Invalid argument.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Invalid operation.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// A malformed packet.
    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    /// A header field held a value that does not fit its wire format.
    #[error("Could not pack header field {0}: {1}")]
    PackFailed(&'static str, String),
}

/// Relative direction of two packets.
///
/// Directions form a small bitfield so that a layer may report more
/// than one at a time (a packet compared to itself is both `SAME` and,
/// when its addresses coincide, `REV`).  [`Packet::direction_all`]
/// combines the per-layer results with bitwise AND, which makes
/// [`Direction::NOT_IMPLEMENTED`] the neutral element.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Direction(u8);

impl Direction {
    /// Both packets flow the same way.
    pub const SAME: Direction = Direction(0x01);
    /// The packets flow in opposite directions.
    pub const REV: Direction = Direction(0x02);
    /// The layer could not relate the two packets.
    pub const UNKNOWN: Direction = Direction(0x04);
    /// The layer does not implement direction checks.
    pub const NOT_IMPLEMENTED: Direction = Direction(0xff);

    /// Returns true if all bits of `other` are set in `self`.
    pub fn contains(self, other: Direction) -> bool {
        self.0 & other.0 == other.0
    }

    /// Raw bit representation.
    pub fn bits(self) -> u8 {
        self.0
    }
}

impl std::ops::BitAnd for Direction {
    type Output = Direction;
    fn bitand(self, rhs: Direction) -> Direction {
        Direction(self.0 & rhs.0)
    }
}

impl std::ops::BitOr for Direction {
    type Output = Direction;
    fn bitor(self, rhs: Direction) -> Direction {
        Direction(self.0 | rhs.0)
    }
}
