//! Radiotap capture headers.
//!
//! The radiotap header prefixes 802.11 frames captured in monitor
//! mode: an 8-byte fixed prefix followed by a variable block of
//! fields announced by the `present` bitmap.  Fields appear in
//! canonical bit order, each with its own width and alignment;
//! alignment is measured from the start of the variable block and any
//! padding bytes travel inside the element value, so packing is plain
//! concatenation.
//!
//! When the FLAGS field announces a frame check sequence, the last
//! four bytes of the capture are exposed as `fcs` and excluded from
//! the body.

use std::rc::Rc;

use byteorder::{ByteOrder as _, LittleEndian};
use once_cell::sync::Lazy;

use crate::{Error, Result};
use crate::field::{ByteOrder, FieldDef, FieldDefault, FieldFormat, Schema, Value};
use crate::packet::{impl_layer, ClassId, Common};
use crate::parse::Parse;
use crate::triggerlist::{Element, TriggerList};

/// Discriminator of the 802.11 payload.
pub const RTAP_TYPE_80211: u64 = 0;

/// TSF timer presence bit.
pub const TSFT_MASK: u32 = 1 << 0;
/// FLAGS presence bit.
pub const FLAGS_MASK: u32 = 1 << 1;
/// RATE presence bit.
pub const RATE_MASK: u32 = 1 << 2;
/// Channel presence bit (frequency plus channel flags).
pub const CHANNEL_MASK: u32 = 1 << 3;
/// FHSS presence bit (hop set plus pattern).
pub const FHSS_MASK: u32 = 1 << 4;
/// Antenna signal presence bit, in dBm.
pub const DBM_ANTSIGNAL_MASK: u32 = 1 << 5;
/// Antenna noise presence bit, in dBm.
pub const DBM_ANTNOISE_MASK: u32 = 1 << 6;
/// Lock quality presence bit.
pub const LOCK_QUALITY_MASK: u32 = 1 << 7;
/// TX attenuation presence bit.
pub const TX_ATTENUATION_MASK: u32 = 1 << 8;
/// TX attenuation presence bit, in dB.
pub const DB_TX_ATTENUATION_MASK: u32 = 1 << 9;
/// TX power presence bit, in dBm.
pub const DBM_TX_POWER_MASK: u32 = 1 << 10;
/// Antenna index presence bit.
pub const ANTENNA_MASK: u32 = 1 << 11;
/// Antenna signal presence bit, in dB.
pub const DB_ANTSIGNAL_MASK: u32 = 1 << 12;
/// Antenna noise presence bit, in dB.
pub const DB_ANTNOISE_MASK: u32 = 1 << 13;
/// RX flags presence bit.
pub const RX_FLAGS_MASK: u32 = 1 << 14;
/// MCS information presence bit.
pub const MCS_MASK: u32 = 1 << 19;
/// A-MPDU status presence bit.
pub const AMPDU_MASK: u32 = 1 << 20;
/// VHT information presence bit.
pub const VHT_MASK: u32 = 1 << 21;

/// FCS-at-end bit inside the FLAGS field value.
pub const FLAGS_FCS: u8 = 0x10;

/// Canonical field order with `(presence bit, width, alignment)`.
static RADIO_FIELDS: &[(u32, usize, usize)] = &[
    (TSFT_MASK, 8, 8),
    (FLAGS_MASK, 1, 1),
    (RATE_MASK, 1, 1),
    (CHANNEL_MASK, 4, 2),
    (FHSS_MASK, 2, 1),
    (DBM_ANTSIGNAL_MASK, 1, 1),
    (DBM_ANTNOISE_MASK, 1, 1),
    (LOCK_QUALITY_MASK, 2, 2),
    (TX_ATTENUATION_MASK, 2, 2),
    (DB_TX_ATTENUATION_MASK, 2, 2),
    (DBM_TX_POWER_MASK, 1, 1),
    (ANTENNA_MASK, 1, 1),
    (DB_ANTSIGNAL_MASK, 1, 1),
    (DB_ANTNOISE_MASK, 1, 1),
    (RX_FLAGS_MASK, 2, 2),
    (MCS_MASK, 3, 1),
    (AMPDU_MASK, 8, 4),
    (VHT_MASK, 12, 2),
];

/// Presence bits with a known width.  Anything else (extended
/// channel, namespace switches, the EXT bit) has no fixed size here
/// and is rejected rather than parsed uncertainly.
const KNOWN_FIELDS: u32 = TSFT_MASK | FLAGS_MASK | RATE_MASK | CHANNEL_MASK
    | FHSS_MASK | DBM_ANTSIGNAL_MASK | DBM_ANTNOISE_MASK | LOCK_QUALITY_MASK
    | TX_ATTENUATION_MASK | DB_TX_ATTENUATION_MASK | DBM_TX_POWER_MASK
    | ANTENNA_MASK | DB_ANTSIGNAL_MASK | DB_ANTNOISE_MASK | RX_FLAGS_MASK
    | MCS_MASK | AMPDU_MASK | VHT_MASK;

const VERSION: usize = 0;
const PAD: usize = 1;
const LEN: usize = 2;
const PRESENT: usize = 3;
const FIELDS_IDX: usize = 4;

static FIELDS: &[FieldDef] = &[
    FieldDef { name: "version", format: FieldFormat::U8, default: FieldDefault::U(0) },
    FieldDef { name: "pad", format: FieldFormat::U8, default: FieldDefault::U(0) },
    FieldDef { name: "len", format: FieldFormat::U16, default: FieldDefault::U(8) },
    FieldDef { name: "present", format: FieldFormat::U32, default: FieldDefault::U(0) },
    FieldDef { name: "fields", format: FieldFormat::List, default: FieldDefault::Absent },
];

static SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Little, FIELDS).expect("radiotap schema")
});

/// A radiotap header.
#[derive(Clone)]
pub struct Radiotap {
    pub(crate) common: Common,
    fcs: Option<Vec<u8>>,
}

impl Default for Radiotap {
    fn default() -> Radiotap {
        Radiotap { common: Common::new(&SCHEMA), fcs: None }
    }
}

impl Radiotap {
    /// Header version.
    pub fn version(&mut self) -> u8 {
        self.common.get(VERSION).as_u8()
    }

    /// Sets the header version.
    pub fn set_version(&mut self, version: u8) {
        self.common.set(VERSION, Some(Value::U8(version)));
    }

    /// Padding byte.
    pub fn pad(&mut self) -> u8 {
        self.common.get(PAD).as_u8()
    }

    /// Sets the padding byte.
    pub fn set_pad(&mut self, pad: u8) {
        self.common.set(PAD, Some(Value::U8(pad)));
    }

    /// Header length, fixed prefix plus variable block.
    pub fn len(&mut self) -> u16 {
        self.common.get(LEN).as_u16()
    }

    /// Sets the header length field.
    pub fn set_len(&mut self, len: u16) {
        self.common.set(LEN, Some(Value::U16(len)));
    }

    /// Presence bitmap of the variable block.
    pub fn present(&mut self) -> u32 {
        self.common.get(PRESENT).as_u32()
    }

    /// Sets the presence bitmap.
    pub fn set_present(&mut self, present: u32) {
        self.common.set(PRESENT, Some(Value::U32(present)));
    }

    /// The variable block as a list of `Element::Field(bit, bytes)`
    /// entries in canonical order, padding included in the bytes.
    pub fn fields_mut(&mut self) -> &mut TriggerList {
        self.common.list_mut(FIELDS_IDX)
    }

    /// Value of the field announced by `mask`, if present.
    pub fn field_value(&mut self, mask: u32) -> Option<Vec<u8>> {
        let element = self.fields_mut()
            .find_value(move |el| matches!(el, Element::Field(m, _) if *m == mask), 0)?;
        match element {
            Element::Field(_, bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// The trailing frame check sequence, when the FLAGS field
    /// announced one during dissection.
    pub fn fcs(&self) -> Option<&[u8]> {
        self.fcs.as_deref()
    }

    /// Sets or removes the trailing frame check sequence.
    pub fn set_fcs(&mut self, fcs: Option<Vec<u8>>) {
        self.fcs = fcs;
    }

    fn dissect(c: &mut Common, fcs: &mut Option<Vec<u8>>, buf: &[u8]) -> Result<usize> {
        if buf.len() < 8 {
            return Err(Error::MalformedPacket(format!(
                "radiotap header of {} bytes", buf.len())).into());
        }
        let present = LittleEndian::read_u32(&buf[4..8]);
        if present & !KNOWN_FIELDS != 0 {
            return Err(Error::MalformedPacket(format!(
                "radiotap presence bits {:#010x} without a known width",
                present & !KNOWN_FIELDS)).into());
        }
        let hdr_len = usize::from(LittleEndian::read_u16(&buf[2..4]));
        if hdr_len < 8 || hdr_len > buf.len() {
            return Err(Error::MalformedPacket(format!(
                "radiotap header length {}", hdr_len)).into());
        }

        let mut pos_end = buf.len();
        if present & FLAGS_MASK != 0 {
            if let Some(off) = field_offset(present, FLAGS_MASK) {
                let at = 8 + off;
                if at < hdr_len && buf[at] & FLAGS_FCS != 0 && pos_end >= hdr_len + 4 {
                    *fcs = Some(buf[pos_end - 4..].to_vec());
                    pos_end -= 4;
                }
            }
        }

        c.init_triggerlist(FIELDS_IDX, &buf[8..hdr_len],
                           Rc::new(move |b: &[u8]| parse_fields(present, b)));
        c.init_handler(ClassId::Radiotap, RTAP_TYPE_80211, &buf[hdr_len..pos_end]);
        Ok(hdr_len)
    }

    /// Keeps the length field in sync with the header layout.
    pub(crate) fn update_auto_fields(&mut self) -> Result<()> {
        if !self.common.changed() {
            return Ok(());
        }
        let len = self.common.header_len() as u16;
        self.set_len(len);
        Ok(())
    }
}

/// Offset of the field announced by `target` from the start of the
/// variable block, padding skipped.
fn field_offset(present: u32, target: u32) -> Option<usize> {
    let mut off = 0;
    for (mask, width, align) in RADIO_FIELDS {
        if present & mask == 0 {
            continue;
        }
        let pad = (align - off % align) % align;
        if *mask == target {
            return Some(off + pad);
        }
        off += pad + width;
    }
    None
}

fn parse_fields(present: u32, buf: &[u8]) -> Result<Vec<Element>> {
    let mut fields = Vec::new();
    let mut off = 0;
    for (mask, width, align) in RADIO_FIELDS {
        if present & mask == 0 {
            continue;
        }
        let pad = (align - off % align) % align;
        let total = pad + width;
        if off + total > buf.len() {
            return Err(Error::MalformedPacket(format!(
                "radiotap field {:#010x} truncated", mask)).into());
        }
        fields.push(Element::Field(*mask, buf[off..off + total].to_vec()));
        off += total;
    }
    if off < buf.len() {
        // Trailing bytes the presence bitmap does not account for.
        fields.push(Element::Bytes(buf[off..].to_vec()));
    }
    Ok(fields)
}

impl Parse for Radiotap {
    fn from_bytes(buf: &[u8]) -> Result<Radiotap> {
        let mut pkt = Radiotap::default();
        let mut fcs = None;
        pkt.common.run_dissect(buf, |c, b| Radiotap::dissect(c, &mut fcs, b));
        pkt.fcs = fcs;
        Ok(pkt)
    }
}

impl_layer!(Radiotap, Radiotap);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    fn prefix(len: u16, present: u32) -> Vec<u8> {
        let mut buf = vec![0, 0];
        buf.extend_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&present.to_le_bytes());
        buf
    }

    #[test]
    fn tsft_flags_rate_layout() {
        let mut buf = prefix(18, TSFT_MASK | FLAGS_MASK | RATE_MASK);
        buf.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        buf.extend_from_slice(&[0x00, 0x02]);
        buf.extend_from_slice(b"frame");
        let mut rt = Radiotap::from_bytes(&buf).unwrap();
        assert!(rt.common.dissect_error.is_none());
        assert_eq!(rt.field_value(TSFT_MASK).unwrap(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(rt.field_value(FLAGS_MASK).unwrap(), vec![0x00]);
        assert_eq!(rt.field_value(RATE_MASK).unwrap(), vec![0x02]);
        assert!(rt.field_value(CHANNEL_MASK).is_none());
        let mut pkt = Packet::from(rt);
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn alignment_padding_stays_in_the_value() {
        // FLAGS (1 byte) then CHANNEL (align 2): one pad byte before
        // the channel data, carried inside the channel element.
        let mut buf = prefix(8 + 1 + 1 + 4, FLAGS_MASK | CHANNEL_MASK);
        buf.push(0x00);
        buf.push(0xaa);
        buf.extend_from_slice(&[0x6c, 0x09, 0xc0, 0x00]);
        let mut rt = Radiotap::from_bytes(&buf).unwrap();
        assert_eq!(rt.field_value(CHANNEL_MASK).unwrap(),
                   vec![0xaa, 0x6c, 0x09, 0xc0, 0x00]);
        let mut pkt = Packet::from(rt);
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn fcs_detection_and_roundtrip() {
        let mut buf = prefix(9, FLAGS_MASK);
        buf.push(FLAGS_FCS);
        buf.extend_from_slice(b"body");
        buf.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let mut rt = Radiotap::from_bytes(&buf).unwrap();
        assert_eq!(rt.fcs(), Some(&[0xde, 0xad, 0xbe, 0xef][..]));
        let mut pkt = Packet::from(rt);
        assert_eq!(pkt.body_bytes().unwrap(), b"body");
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn fcs_after_tsft_uses_the_right_offset() {
        let mut buf = prefix(8 + 8 + 1, TSFT_MASK | FLAGS_MASK);
        buf.extend_from_slice(&[0; 8]);
        buf.push(FLAGS_FCS);
        buf.extend_from_slice(b"x");
        buf.extend_from_slice(&[1, 2, 3, 4]);
        let rt = Radiotap::from_bytes(&buf).unwrap();
        assert_eq!(rt.fcs(), Some(&[1, 2, 3, 4][..]));
    }

    #[test]
    fn unknown_presence_bits_are_rejected() {
        let buf = prefix(8, 1 << 18);
        let rt = Radiotap::from_bytes(&buf).unwrap();
        assert!(rt.common.dissect_error.is_some());
        let ext = prefix(8, 1 << 31);
        assert!(Radiotap::from_bytes(&ext).unwrap().common.dissect_error.is_some());
    }

    #[test]
    fn constructed_header_updates_length() {
        let mut rt = Radiotap::default();
        rt.set_present(TSFT_MASK | FLAGS_MASK | RATE_MASK);
        rt.fields_mut().extend([
            Element::Field(TSFT_MASK, vec![1, 2, 3, 4, 5, 6, 7, 8]),
            Element::Field(FLAGS_MASK, vec![0x10]),
            Element::Field(RATE_MASK, vec![0x02]),
        ]);
        let mut pkt = Packet::from(rt);
        let out = pkt.bin(true).unwrap();
        assert_eq!(&out[8..], &[1, 2, 3, 4, 5, 6, 7, 8, 0x10, 0x02]);
        // The length field tracks the header layout.
        assert_eq!(u16::from_le_bytes([out[2], out[3]]), 18);
    }
}
