//! User Datagram Protocol.
//!
//! RFC 768.  The length field and the checksum are derived fields.
//! The checksum covers a pseudo-header built from the lower layer's
//! addresses, so it is only recomputed while this layer sits on top
//! of a pseudo-header source; a stand-alone UDP header keeps whatever
//! checksum it has.

use byteorder::{BigEndian, ByteOrder as _};
use once_cell::sync::Lazy;

use crate::{checksum, Direction, Error, Result};
use crate::field::{ByteOrder, FieldDef, FieldDefault, FieldFormat, Schema, Value};
use crate::packet::{impl_layer, Body, ClassId, Common, PseudoCtx};
use crate::packet::ipv4::IP_PROTO_UDP;
use crate::parse::Parse;
use crate::registry;

/// Ports dispatched to the DNS parser.
pub const UDP_PORT_DNS: &[u64] = &[53, 5353];

const SPORT: usize = 0;
const DPORT: usize = 1;
const ULEN: usize = 2;
const SUM: usize = 3;

static FIELDS: &[FieldDef] = &[
    FieldDef { name: "sport", format: FieldFormat::U16, default: FieldDefault::U(0xdead) },
    FieldDef { name: "dport", format: FieldFormat::U16, default: FieldDefault::U(0) },
    FieldDef { name: "ulen", format: FieldFormat::U16, default: FieldDefault::U(8) },
    FieldDef { name: "sum", format: FieldFormat::U16, default: FieldDefault::U(0) },
];

static SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Big, FIELDS).expect("udp schema")
});

/// A UDP header.
#[derive(Clone)]
pub struct Udp {
    pub(crate) common: Common,
}

impl Default for Udp {
    fn default() -> Udp {
        Udp { common: Common::new(&SCHEMA) }
    }
}

impl Udp {
    /// Creates a header with the given source and destination port.
    pub fn new(sport: u16, dport: u16) -> Udp {
        let mut udp = Udp::default();
        udp.set_sport(sport);
        udp.set_dport(dport);
        udp
    }

    /// Source port.
    pub fn sport(&mut self) -> u16 {
        self.common.get(SPORT).as_u16()
    }

    /// Sets the source port.
    pub fn set_sport(&mut self, sport: u16) {
        self.common.set(SPORT, Some(Value::U16(sport)));
    }

    /// Destination port.
    pub fn dport(&mut self) -> u16 {
        self.common.get(DPORT).as_u16()
    }

    /// Sets the destination port.
    pub fn set_dport(&mut self, dport: u16) {
        self.common.set(DPORT, Some(Value::U16(dport)));
    }

    /// Length of the datagram, header included.
    pub fn ulen(&mut self) -> u16 {
        self.common.get(ULEN).as_u16()
    }

    /// Sets the length field.
    pub fn set_ulen(&mut self, ulen: u16) {
        self.common.set(ULEN, Some(Value::U16(ulen)));
    }

    /// Checksum over pseudo-header, header and payload.
    pub fn sum(&mut self) -> u16 {
        self.common.get(SUM).as_u16()
    }

    /// Sets the checksum.
    pub fn set_sum(&mut self, sum: u16) {
        self.common.set(SUM, Some(Value::U16(sum)));
    }

    fn dissect(c: &mut Common, buf: &[u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(Error::MalformedPacket(format!(
                "udp header of {} bytes", buf.len())).into());
        }
        let sport = u64::from(BigEndian::read_u16(&buf[0..2]));
        let dport = u64::from(BigEndian::read_u16(&buf[2..4]));
        // The source port is preferred when both resolve.
        let discriminator = [sport, dport].into_iter()
            .find(|d| registry::lookup(ClassId::Udp, *d).is_some());
        if let Some(d) = discriminator {
            c.init_handler(ClassId::Udp, d, &buf[8..]);
        }
        Ok(8)
    }

    /// Refreshes the length field and, given a pseudo-header source
    /// below, the checksum.
    ///
    /// The checksum is recomputed when this layer or one above it
    /// changed, or when the pseudo-header source itself was just
    /// updated.  A zero result is transmitted as `0xffff`.
    pub(crate) fn update_auto_fields(&mut self, lower: Option<&PseudoCtx>) -> Result<()> {
        let changed = self.common.changed();
        if changed {
            let total = self.common.total_len();
            self.set_ulen(total as u16);
        }
        match lower {
            Some(ctx) if ctx.lower_changed || changed => self.calc_sum(ctx),
            _ => Ok(()),
        }
    }

    fn calc_sum(&mut self, ctx: &PseudoCtx) -> Result<()> {
        self.set_sum(0);
        let header = self.common.peek_header()?;
        let body = match &mut self.common.body {
            Body::Raw(bytes) => bytes.clone(),
            Body::Lazy(_, bytes) => bytes.clone(),
            // Serialize the payload with its own derived fields
            // refreshed, so the checksum covers the final bytes.
            Body::Attached(upper) => upper.bin_ctx(true, None)?,
        };
        let len = (header.len() + body.len()) as u16;
        let mut data = if ctx.src.len() == 4 {
            checksum::pseudo_header_v4(&ctx.src, &ctx.dst, IP_PROTO_UDP, len)
        } else {
            checksum::pseudo_header_v6(&ctx.src, &ctx.dst, IP_PROTO_UDP, len)
        };
        data.extend_from_slice(&header);
        data.extend_from_slice(&body);
        let mut sum = checksum::in_cksum(&data);
        if sum == 0 {
            sum = 0xffff;
        }
        self.set_sum(sum);
        Ok(())
    }

    pub(crate) fn reverse_address(&mut self) {
        let sport = self.sport();
        let dport = self.dport();
        self.set_sport(dport);
        self.set_dport(sport);
    }

    pub(crate) fn direction(&mut self, other: &mut Udp) -> Direction {
        let (sport, dport) = (self.sport(), self.dport());
        let (osport, odport) = (other.sport(), other.dport());
        let mut dir = Direction::UNKNOWN;
        if sport == osport && dport == odport {
            dir = Direction::SAME;
        }
        if sport == odport && dport == osport {
            dir = if dir == Direction::SAME { dir | Direction::REV } else { Direction::REV };
        }
        dir
    }
}

impl Parse for Udp {
    fn from_bytes(buf: &[u8]) -> Result<Udp> {
        let mut pkt = Udp::default();
        pkt.common.run_dissect(buf, Udp::dissect);
        Ok(pkt)
    }
}

impl_layer!(Udp, Udp);
