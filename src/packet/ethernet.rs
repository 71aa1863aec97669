//! Ethernet II frames.
//!
//! Destination and source MAC, an optional 802.1Q tag, and the
//! ether-type that selects the upper layer.

use byteorder::{BigEndian, ByteOrder as _};
use once_cell::sync::Lazy;

use crate::{Direction, Error, Result};
use crate::field::{ByteOrder, FieldDef, FieldDefault, FieldFormat, Schema, Value};
use crate::fmt::{mac_from_str, mac_to_str};
use crate::packet::{impl_layer, ClassId, Common};
use crate::parse::Parse;

/// Ether-type of IPv4.
pub const ETH_TYPE_IP: u16 = 0x0800;
/// Ether-type of ARP.
pub const ETH_TYPE_ARP: u16 = 0x0806;
/// Tag protocol identifier of 802.1Q.
pub const ETH_TYPE_VLAN: u16 = 0x8100;
/// Ether-type of IPv6.
pub const ETH_TYPE_IP6: u16 = 0x86dd;

const DST: usize = 0;
const SRC: usize = 1;
const VLAN: usize = 2;
const ETYPE: usize = 3;

static FIELDS: &[FieldDef] = &[
    FieldDef { name: "dst", format: FieldFormat::Bytes(6), default: FieldDefault::Bytes(&[0; 6]) },
    FieldDef { name: "src", format: FieldFormat::Bytes(6), default: FieldDefault::Bytes(&[0; 6]) },
    FieldDef { name: "vlan", format: FieldFormat::Bytes(4), default: FieldDefault::Absent },
    FieldDef { name: "etype", format: FieldFormat::U16, default: FieldDefault::U(ETH_TYPE_IP as u64) },
];

static SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Big, FIELDS).expect("ethernet schema")
});

/// An Ethernet II frame header.
#[derive(Clone)]
pub struct Ethernet {
    pub(crate) common: Common,
}

impl Default for Ethernet {
    fn default() -> Ethernet {
        Ethernet { common: Common::new(&SCHEMA) }
    }
}

impl Ethernet {
    /// Creates a frame with the given destination and source MAC.
    pub fn new(dst: [u8; 6], src: [u8; 6]) -> Ethernet {
        let mut eth = Ethernet::default();
        eth.set_dst(&dst);
        eth.set_src(&src);
        eth
    }

    /// Destination MAC address.
    pub fn dst(&mut self) -> Vec<u8> {
        self.common.get(DST).into_bytes()
    }

    /// Sets the destination MAC address.
    pub fn set_dst(&mut self, dst: &[u8]) {
        self.common.set(DST, Some(Value::Bytes(dst.to_vec())));
    }

    /// Destination MAC in `AA:BB:CC:DD:EE:FF` form.
    pub fn dst_s(&mut self) -> String {
        mac_to_str(&self.dst())
    }

    /// Sets the destination MAC from `AA:BB:CC:DD:EE:FF` form.
    pub fn set_dst_s(&mut self, dst: &str) -> Result<()> {
        self.set_dst(&mac_from_str(dst)?);
        Ok(())
    }

    /// Source MAC address.
    pub fn src(&mut self) -> Vec<u8> {
        self.common.get(SRC).into_bytes()
    }

    /// Sets the source MAC address.
    pub fn set_src(&mut self, src: &[u8]) {
        self.common.set(SRC, Some(Value::Bytes(src.to_vec())));
    }

    /// Source MAC in `AA:BB:CC:DD:EE:FF` form.
    pub fn src_s(&mut self) -> String {
        mac_to_str(&self.src())
    }

    /// Sets the source MAC from `AA:BB:CC:DD:EE:FF` form.
    pub fn set_src_s(&mut self, src: &str) -> Result<()> {
        self.set_src(&mac_from_str(src)?);
        Ok(())
    }

    /// The 802.1Q tag (TPID plus TCI), or `None` when untagged.
    pub fn vlan(&mut self) -> Option<Vec<u8>> {
        self.common.get_opt(VLAN).map(Value::into_bytes)
    }

    /// Sets or removes the 802.1Q tag.
    pub fn set_vlan(&mut self, vlan: Option<&[u8]>) {
        self.common.set(VLAN, vlan.map(|v| Value::Bytes(v.to_vec())));
    }

    /// Ether-type of the payload.
    pub fn etype(&mut self) -> u16 {
        self.common.get(ETYPE).as_u16()
    }

    /// Sets the ether-type of the payload.
    pub fn set_etype(&mut self, etype: u16) {
        self.common.set(ETYPE, Some(Value::U16(etype)));
    }

    fn dissect(c: &mut Common, buf: &[u8]) -> Result<usize> {
        if buf.len() < 14 {
            return Err(Error::MalformedPacket(format!(
                "ethernet frame of {} bytes", buf.len())).into());
        }
        let mut hlen = 14;
        if BigEndian::read_u16(&buf[12..14]) == ETH_TYPE_VLAN {
            if buf.len() < 18 {
                return Err(Error::MalformedPacket("truncated 802.1Q tag".into()).into());
            }
            c.set(VLAN, Some(Value::Bytes(buf[12..16].to_vec())));
            hlen = 18;
        }
        let etype = BigEndian::read_u16(&buf[hlen - 2..hlen]);
        c.init_handler(ClassId::Ethernet, etype as u64, &buf[hlen..]);
        Ok(hlen)
    }

    pub(crate) fn reverse_address(&mut self) {
        let dst = self.dst();
        let src = self.src();
        self.set_dst(&src);
        self.set_src(&dst);
    }

    pub(crate) fn direction(&mut self, other: &mut Ethernet) -> Direction {
        let (dst, src) = (self.dst(), self.src());
        let (odst, osrc) = (other.dst(), other.src());
        let mut dir = Direction::UNKNOWN;
        if dst == odst && src == osrc {
            dir = Direction::SAME;
        }
        if dst == osrc && src == odst {
            dir = if dir == Direction::SAME { dir | Direction::REV } else { Direction::REV };
        }
        dir
    }
}

impl Parse for Ethernet {
    fn from_bytes(buf: &[u8]) -> Result<Ethernet> {
        let mut pkt = Ethernet::default();
        pkt.common.run_dissect(buf, Ethernet::dissect);
        Ok(pkt)
    }
}

impl_layer!(Ethernet, Ethernet);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn frame() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        buf.extend_from_slice(&[0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb]);
        buf.extend_from_slice(&[0x08, 0x06]);
        buf.extend_from_slice(b"arp-ish payload");
        buf
    }

    #[test]
    fn roundtrip() {
        let buf = frame();
        let mut pkt = Packet::from(Ethernet::from_bytes(&buf).unwrap());
        assert!(pkt.dissect_error().is_none());
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn string_accessors() {
        let buf = frame();
        let mut eth = Ethernet::from_bytes(&buf).unwrap();
        assert_eq!(eth.dst_s(), "00:11:22:33:44:55");
        assert_eq!(eth.src_s(), "66:77:88:99:AA:BB");
        eth.set_src_s("01:02:03:04:05:06").unwrap();
        assert_eq!(eth.src(), vec![1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn vlan_tag_activates_on_dissect() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0; 12]);
        buf.extend_from_slice(&[0x81, 0x00, 0x20, 0x01]);
        buf.extend_from_slice(&[0x08, 0x00]);
        buf.extend_from_slice(b"ip!");
        let mut eth = Ethernet::from_bytes(&buf).unwrap();
        assert_eq!(eth.vlan(), Some(vec![0x81, 0x00, 0x20, 0x01]));
        assert_eq!(eth.etype(), ETH_TYPE_IP);
        let mut pkt = Packet::from(eth);
        assert_eq!(pkt.header_len(), 18);
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn vlan_activation_roundtrip() {
        let mut eth = Ethernet::new([1; 6], [2; 6]);
        let mut pkt = Packet::from(eth.clone());
        let plain = pkt.bin(false).unwrap();

        eth.set_vlan(Some(&[0x81, 0x00, 0x00, 0x64]));
        let mut tagged = Packet::from(eth.clone());
        assert_eq!(tagged.header_len(), 18);

        eth.set_vlan(None);
        let mut stripped = Packet::from(eth);
        assert_eq!(stripped.bin(false).unwrap(), plain);
    }

    #[test]
    fn direction_by_mac_pair() {
        let mut a = Ethernet::new([1; 6], [2; 6]);
        let mut b = Ethernet::new([2; 6], [1; 6]);
        let mut c = Ethernet::new([1; 6], [2; 6]);
        assert_eq!(a.direction(&mut b), Direction::REV);
        assert_eq!(a.direction(&mut c), Direction::SAME);
        a.reverse_address();
        assert_eq!(a.direction(&mut b), Direction::SAME);
    }

    #[test]
    fn truncated_frame_records_error() {
        let pkt = Packet::from(Ethernet::from_bytes(&[0; 5]).unwrap());
        assert!(pkt.dissect_error().is_some());
    }
}
