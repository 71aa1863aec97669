//! Domain Name System messages.
//!
//! RFC 1035.  A DNS message is all header: the 12 fixed bytes are
//! followed by four record sections (questions, answers, authority,
//! additional), each a trigger list of nested packets.  Names are
//! length-prefixed labels ended by a null byte or a two-byte
//! compression pointer; pointers are kept verbatim so messages
//! round-trip without a compression dictionary.

use std::rc::Rc;

use byteorder::{BigEndian, ByteOrder as _};
use once_cell::sync::Lazy;

use crate::{Error, Result};
use crate::field::{ByteOrder, FieldDef, FieldDefault, FieldFormat, Schema, Value};
use crate::fmt::{dns_name_decode, dns_name_encode};
use crate::packet::{impl_layer, Common};
use crate::parse::Parse;
use crate::triggerlist::{Element, TriggerList};

/// Query type A, an IPv4 host address.
pub const DNS_TYPE_A: u16 = 1;
/// Query type PTR.
pub const DNS_TYPE_PTR: u16 = 12;
/// Query type AAAA, an IPv6 host address.
pub const DNS_TYPE_AAAA: u16 = 28;
/// Query class IN.
pub const DNS_CLASS_IN: u16 = 1;

const ID: usize = 0;
const FLAGS: usize = 1;
const QD_COUNT: usize = 2;
const AN_COUNT: usize = 3;
const NS_COUNT: usize = 4;
const AR_COUNT: usize = 5;
const QUERIES: usize = 6;
const ANSWERS: usize = 7;
const AUTHS: usize = 8;
const ADDRRS: usize = 9;

static FIELDS: &[FieldDef] = &[
    FieldDef { name: "id", format: FieldFormat::U16, default: FieldDefault::U(0x1234) },
    FieldDef { name: "flags", format: FieldFormat::U16, default: FieldDefault::U(0x0100) },
    FieldDef { name: "qd_count", format: FieldFormat::U16, default: FieldDefault::U(0) },
    FieldDef { name: "an_count", format: FieldFormat::U16, default: FieldDefault::U(0) },
    FieldDef { name: "ns_count", format: FieldFormat::U16, default: FieldDefault::U(0) },
    FieldDef { name: "ar_count", format: FieldFormat::U16, default: FieldDefault::U(0) },
    FieldDef { name: "queries", format: FieldFormat::List, default: FieldDefault::Absent },
    FieldDef { name: "answers", format: FieldFormat::List, default: FieldDefault::Absent },
    FieldDef { name: "auths", format: FieldFormat::List, default: FieldDefault::Absent },
    FieldDef { name: "addrrs", format: FieldFormat::List, default: FieldDefault::Absent },
];

static SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Big, FIELDS).expect("dns schema")
});

/// Length of a name in wire form starting at `start`, terminator or
/// compression pointer included.
fn name_len(buf: &[u8], start: usize) -> Result<usize> {
    let mut off = start;
    loop {
        let b = *buf.get(off).ok_or_else(|| {
            Error::MalformedPacket("dns name runs past the buffer".into())
        })?;
        if b == 0 {
            return Ok(off + 1 - start);
        }
        if b & 0xc0 == 0xc0 {
            if off + 2 > buf.len() {
                return Err(Error::MalformedPacket("dns pointer runs past the buffer".into()).into());
            }
            return Ok(off + 2 - start);
        }
        off += 1 + usize::from(b);
    }
}

/// Byte length of one question starting at `off`.
fn question_len(buf: &[u8], off: usize) -> Result<usize> {
    let name = name_len(buf, off)?;
    if off + name + 4 > buf.len() {
        return Err(Error::MalformedPacket("truncated dns question".into()).into());
    }
    Ok(name + 4)
}

/// Byte length of one resource record starting at `off`.
fn record_len(buf: &[u8], off: usize) -> Result<usize> {
    let name = name_len(buf, off)?;
    if off + name + 10 > buf.len() {
        return Err(Error::MalformedPacket("truncated dns record".into()).into());
    }
    let dlen = usize::from(BigEndian::read_u16(&buf[off + name + 8..off + name + 10]));
    if off + name + 10 + dlen > buf.len() {
        return Err(Error::MalformedPacket("dns record data runs past the buffer".into()).into());
    }
    Ok(name + 10 + dlen)
}

fn parse_queries(buf: &[u8]) -> Result<Vec<Element>> {
    let mut elements = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let len = question_len(buf, off)?;
        let query = DnsQuery::from_bytes(&buf[off..off + len])?;
        if let Some(e) = &query.common.dissect_error {
            return Err(e.clone().into());
        }
        elements.push(Element::Packet(query.into()));
        off += len;
    }
    Ok(elements)
}

fn parse_records(buf: &[u8]) -> Result<Vec<Element>> {
    let mut elements = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let len = record_len(buf, off)?;
        let record = DnsAnswer::from_bytes(&buf[off..off + len])?;
        if let Some(e) = &record.common.dissect_error {
            return Err(e.clone().into());
        }
        elements.push(Element::Packet(record.into()));
        off += len;
    }
    Ok(elements)
}

/// A DNS message.
#[derive(Clone)]
pub struct Dns {
    pub(crate) common: Common,
}

impl Default for Dns {
    fn default() -> Dns {
        Dns { common: Common::new(&SCHEMA) }
    }
}

impl Dns {
    /// Transaction id.
    pub fn id(&mut self) -> u16 {
        self.common.get(ID).as_u16()
    }

    /// Sets the transaction id.
    pub fn set_id(&mut self, id: u16) {
        self.common.set(ID, Some(Value::U16(id)));
    }

    /// Header flags.
    pub fn flags(&mut self) -> u16 {
        self.common.get(FLAGS).as_u16()
    }

    /// Sets the header flags.
    pub fn set_flags(&mut self, flags: u16) {
        self.common.set(FLAGS, Some(Value::U16(flags)));
    }

    /// Question count as stated by the header.
    pub fn qd_count(&mut self) -> u16 {
        self.common.get(QD_COUNT).as_u16()
    }

    /// Answer count as stated by the header.
    pub fn an_count(&mut self) -> u16 {
        self.common.get(AN_COUNT).as_u16()
    }

    /// Authority record count as stated by the header.
    pub fn ns_count(&mut self) -> u16 {
        self.common.get(NS_COUNT).as_u16()
    }

    /// Additional record count as stated by the header.
    pub fn ar_count(&mut self) -> u16 {
        self.common.get(AR_COUNT).as_u16()
    }

    /// The question section.
    pub fn queries_mut(&mut self) -> &mut TriggerList {
        self.common.list_mut(QUERIES)
    }

    /// The answer section.
    pub fn answers_mut(&mut self) -> &mut TriggerList {
        self.common.list_mut(ANSWERS)
    }

    /// The authority section.
    pub fn auths_mut(&mut self) -> &mut TriggerList {
        self.common.list_mut(AUTHS)
    }

    /// The additional section.
    pub fn addrrs_mut(&mut self) -> &mut TriggerList {
        self.common.list_mut(ADDRRS)
    }

    fn dissect(c: &mut Common, buf: &[u8]) -> Result<usize> {
        if buf.len() < 12 {
            return Err(Error::MalformedPacket(format!(
                "dns message of {} bytes", buf.len())).into());
        }
        let qd = BigEndian::read_u16(&buf[4..6]);
        let an = BigEndian::read_u16(&buf[6..8]);
        let ns = BigEndian::read_u16(&buf[8..10]);
        let ar = BigEndian::read_u16(&buf[10..12]);

        let mut off = 12;
        let queries_start = off;
        for _ in 0..qd {
            off += question_len(buf, off)?;
        }
        let answers_start = off;
        for _ in 0..an {
            off += record_len(buf, off)?;
        }
        let auths_start = off;
        for _ in 0..ns {
            off += record_len(buf, off)?;
        }
        let addrrs_start = off;
        for _ in 0..ar {
            off += record_len(buf, off)?;
        }

        c.init_triggerlist(QUERIES, &buf[queries_start..answers_start], Rc::new(parse_queries));
        c.init_triggerlist(ANSWERS, &buf[answers_start..auths_start], Rc::new(parse_records));
        c.init_triggerlist(AUTHS, &buf[auths_start..addrrs_start], Rc::new(parse_records));
        c.init_triggerlist(ADDRRS, &buf[addrrs_start..off], Rc::new(parse_records));
        // Trailing bytes, if any, stay as body.
        Ok(off)
    }

    /// Keeps the four count fields in sync with their sections.
    pub(crate) fn update_auto_fields(&mut self) -> Result<()> {
        if !self.common.changed() {
            return Ok(());
        }
        let qd = self.queries_mut().len() as u16;
        let an = self.answers_mut().len() as u16;
        let ns = self.auths_mut().len() as u16;
        let ar = self.addrrs_mut().len() as u16;
        self.common.set(QD_COUNT, Some(Value::U16(qd)));
        self.common.set(AN_COUNT, Some(Value::U16(an)));
        self.common.set(NS_COUNT, Some(Value::U16(ns)));
        self.common.set(AR_COUNT, Some(Value::U16(ar)));
        Ok(())
    }
}

impl Parse for Dns {
    fn from_bytes(buf: &[u8]) -> Result<Dns> {
        let mut pkt = Dns::default();
        pkt.common.run_dissect(buf, Dns::dissect);
        Ok(pkt)
    }
}

impl_layer!(Dns, Dns);

/// One entry of a DNS question section.
#[derive(Clone)]
pub struct DnsQuery {
    pub(crate) common: Common,
}

const Q_NAME: usize = 0;
const Q_TYPE: usize = 1;
const Q_CLASS: usize = 2;

static QUERY_FIELDS: &[FieldDef] = &[
    FieldDef { name: "name", format: FieldFormat::Dynamic, default: FieldDefault::Bytes(&[0]) },
    FieldDef { name: "qtype", format: FieldFormat::U16, default: FieldDefault::U(DNS_TYPE_A as u64) },
    FieldDef { name: "qclass", format: FieldFormat::U16, default: FieldDefault::U(DNS_CLASS_IN as u64) },
];

static QUERY_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Big, QUERY_FIELDS).expect("dns query schema")
});

impl Default for DnsQuery {
    fn default() -> DnsQuery {
        DnsQuery { common: Common::new(&QUERY_SCHEMA) }
    }
}

impl DnsQuery {
    /// Creates an `IN A` question for the given name.
    pub fn new(name: &str) -> DnsQuery {
        let mut q = DnsQuery::default();
        q.set_name_s(name);
        q
    }

    /// Queried name in wire form.
    pub fn name(&mut self) -> Vec<u8> {
        self.common.get(Q_NAME).into_bytes()
    }

    /// Sets the queried name in wire form.
    pub fn set_name(&mut self, name: &[u8]) {
        self.common.set(Q_NAME, Some(Value::Bytes(name.to_vec())));
    }

    /// Queried name in dotted form.
    pub fn name_s(&mut self) -> String {
        dns_name_decode(&self.name())
    }

    /// Sets the queried name from dotted form.
    pub fn set_name_s(&mut self, name: &str) {
        self.set_name(&dns_name_encode(name));
    }

    /// Query type.
    pub fn qtype(&mut self) -> u16 {
        self.common.get(Q_TYPE).as_u16()
    }

    /// Sets the query type.
    pub fn set_qtype(&mut self, qtype: u16) {
        self.common.set(Q_TYPE, Some(Value::U16(qtype)));
    }

    /// Query class.
    pub fn qclass(&mut self) -> u16 {
        self.common.get(Q_CLASS).as_u16()
    }

    /// Sets the query class.
    pub fn set_qclass(&mut self, qclass: u16) {
        self.common.set(Q_CLASS, Some(Value::U16(qclass)));
    }

    fn dissect(c: &mut Common, buf: &[u8]) -> Result<usize> {
        let name = name_len(buf, 0)?;
        if name + 4 > buf.len() {
            return Err(Error::MalformedPacket("truncated dns question".into()).into());
        }
        c.set(Q_NAME, Some(Value::Bytes(buf[..name].to_vec())));
        Ok(name + 4)
    }
}

impl Parse for DnsQuery {
    fn from_bytes(buf: &[u8]) -> Result<DnsQuery> {
        let mut pkt = DnsQuery::default();
        pkt.common.run_dissect(buf, DnsQuery::dissect);
        Ok(pkt)
    }
}

impl_layer!(DnsQuery, DnsQuery);

/// One DNS resource record, as found in the answer, authority and
/// additional sections.
#[derive(Clone)]
pub struct DnsAnswer {
    pub(crate) common: Common,
}

const A_NAME: usize = 0;
const A_TYPE: usize = 1;
const A_CLASS: usize = 2;
const A_TTL: usize = 3;
const A_DLEN: usize = 4;
const A_DATA: usize = 5;

static ANSWER_FIELDS: &[FieldDef] = &[
    FieldDef { name: "name", format: FieldFormat::Dynamic, default: FieldDefault::Bytes(&[0xc0, 0x0c]) },
    FieldDef { name: "atype", format: FieldFormat::U16, default: FieldDefault::U(DNS_TYPE_A as u64) },
    FieldDef { name: "aclass", format: FieldFormat::U16, default: FieldDefault::U(DNS_CLASS_IN as u64) },
    FieldDef { name: "ttl", format: FieldFormat::U32, default: FieldDefault::U(43200) },
    FieldDef { name: "dlen", format: FieldFormat::U16, default: FieldDefault::U(4) },
    FieldDef { name: "data", format: FieldFormat::Dynamic, default: FieldDefault::Bytes(&[0, 0, 0, 0]) },
];

static ANSWER_SCHEMA: Lazy<Schema> = Lazy::new(|| {
    Schema::new(ByteOrder::Big, ANSWER_FIELDS).expect("dns answer schema")
});

impl Default for DnsAnswer {
    fn default() -> DnsAnswer {
        DnsAnswer { common: Common::new(&ANSWER_SCHEMA) }
    }
}

impl DnsAnswer {
    /// Record name in wire form.
    pub fn name(&mut self) -> Vec<u8> {
        self.common.get(A_NAME).into_bytes()
    }

    /// Sets the record name in wire form.
    pub fn set_name(&mut self, name: &[u8]) {
        self.common.set(A_NAME, Some(Value::Bytes(name.to_vec())));
    }

    /// Record name in dotted form.
    pub fn name_s(&mut self) -> String {
        dns_name_decode(&self.name())
    }

    /// Sets the record name from dotted form.
    pub fn set_name_s(&mut self, name: &str) {
        self.set_name(&dns_name_encode(name));
    }

    /// Record type.
    pub fn atype(&mut self) -> u16 {
        self.common.get(A_TYPE).as_u16()
    }

    /// Sets the record type.
    pub fn set_atype(&mut self, atype: u16) {
        self.common.set(A_TYPE, Some(Value::U16(atype)));
    }

    /// Record class.
    pub fn aclass(&mut self) -> u16 {
        self.common.get(A_CLASS).as_u16()
    }

    /// Sets the record class.
    pub fn set_aclass(&mut self, aclass: u16) {
        self.common.set(A_CLASS, Some(Value::U16(aclass)));
    }

    /// Time to live in seconds.
    pub fn ttl(&mut self) -> u32 {
        self.common.get(A_TTL).as_u32()
    }

    /// Sets the time to live.
    pub fn set_ttl(&mut self, ttl: u32) {
        self.common.set(A_TTL, Some(Value::U32(ttl)));
    }

    /// Record data length as stated on the wire.
    pub fn dlen(&mut self) -> u16 {
        self.common.get(A_DLEN).as_u16()
    }

    /// Record data.
    pub fn data(&mut self) -> Vec<u8> {
        self.common.get(A_DATA).into_bytes()
    }

    /// Sets the record data, keeping the stated length in sync.
    pub fn set_data(&mut self, data: &[u8]) {
        self.common.set(A_DLEN, Some(Value::U16(data.len() as u16)));
        self.common.set(A_DATA, Some(Value::Bytes(data.to_vec())));
    }

    fn dissect(c: &mut Common, buf: &[u8]) -> Result<usize> {
        let name = name_len(buf, 0)?;
        if name + 10 > buf.len() {
            return Err(Error::MalformedPacket("truncated dns record".into()).into());
        }
        let dlen = usize::from(BigEndian::read_u16(&buf[name + 8..name + 10]));
        if name + 10 + dlen > buf.len() {
            return Err(Error::MalformedPacket("dns record data runs past the buffer".into()).into());
        }
        c.set(A_NAME, Some(Value::Bytes(buf[..name].to_vec())));
        c.set(A_DATA, Some(Value::Bytes(buf[name + 10..name + 10 + dlen].to_vec())));
        Ok(name + 10 + dlen)
    }
}

impl Parse for DnsAnswer {
    fn from_bytes(buf: &[u8]) -> Result<DnsAnswer> {
        let mut pkt = DnsAnswer::default();
        pkt.common.run_dissect(buf, DnsAnswer::dissect);
        Ok(pkt)
    }
}

impl_layer!(DnsAnswer, DnsAnswer);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;

    /// One A question for www.example.com plus one answer record
    /// using a compression pointer.
    fn query_response() -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&[0x13, 0x37]);
        buf.extend_from_slice(&[0x81, 0x80]);
        buf.extend_from_slice(&[0, 1, 0, 1, 0, 0, 0, 0]);
        buf.extend_from_slice(b"\x03www\x07example\x03com\x00");
        buf.extend_from_slice(&[0, 1, 0, 1]);
        buf.extend_from_slice(&[0xc0, 0x0c]);
        buf.extend_from_slice(&[0, 1, 0, 1]);
        buf.extend_from_slice(&[0, 0, 0, 60]);
        buf.extend_from_slice(&[0, 4]);
        buf.extend_from_slice(&[93, 184, 216, 34]);
        buf
    }

    #[test]
    fn roundtrip() {
        let buf = query_response();
        let mut pkt = Packet::from(Dns::from_bytes(&buf).unwrap());
        assert!(pkt.dissect_error().is_none());
        assert_eq!(pkt.bin(false).unwrap(), buf);
    }

    #[test]
    fn sections_parse_into_records() {
        let buf = query_response();
        let mut dns = Dns::from_bytes(&buf).unwrap();
        assert_eq!(dns.qd_count(), 1);
        assert_eq!(dns.an_count(), 1);
        assert_eq!(dns.queries_mut().len(), 1);
        assert_eq!(dns.answers_mut().len(), 1);

        let mut query = match dns.queries_mut().remove(0) {
            Some(Element::Packet(Packet::DnsQuery(q))) => q,
            other => panic!("unexpected element: {:?}", other.is_some()),
        };
        assert_eq!(query.name_s(), "www.example.com.");
        assert_eq!(query.qtype(), DNS_TYPE_A);
        assert_eq!(query.qclass(), DNS_CLASS_IN);

        let mut answer = dns.answers_mut().get_mut(0).unwrap();
        if let Element::Packet(Packet::DnsAnswer(a)) = &mut *answer {
            assert_eq!(a.name(), vec![0xc0, 0x0c]);
            assert_eq!(a.ttl(), 60);
            assert_eq!(a.data(), vec![93, 184, 216, 34]);
        } else {
            panic!("answer section does not hold a record");
        }
    }

    #[test]
    fn added_query_updates_counts() {
        let mut dns = Dns::default();
        dns.queries_mut().push(Element::Packet(DnsQuery::new("www.example.com").into()));
        let mut pkt = Packet::from(dns);
        let out = pkt.bin(true).unwrap();
        assert_eq!(u16::from_be_bytes([out[4], out[5]]), 1);
        let mut parsed = Dns::from_bytes(&out).unwrap();
        assert_eq!(parsed.qd_count(), 1);
        assert_eq!(parsed.queries_mut().len(), 1);
    }

    #[test]
    fn nested_record_mutation_marks_the_message_dirty() {
        let buf = query_response();
        let mut pkt = Packet::from(Dns::from_bytes(&buf).unwrap());
        let before = pkt.bin(false).unwrap();
        {
            let dns = pkt.layer::<Dns>().unwrap();
            let mut el = dns.queries_mut().get_mut(0).unwrap();
            if let Element::Packet(Packet::DnsQuery(q)) = &mut *el {
                q.set_name_s("www.example.org");
            }
        }
        let after = pkt.bin(false).unwrap();
        assert_ne!(before, after);
        let mut parsed = Dns::from_bytes(&after).unwrap();
        let mut el = parsed.queries_mut().get_mut(0).unwrap();
        if let Element::Packet(Packet::DnsQuery(q)) = &mut *el {
            assert_eq!(q.name_s(), "www.example.org.");
        } else {
            panic!("query section does not hold a question");
        }
    }

    #[test]
    fn malformed_message_keeps_raw_bytes() {
        // The header announces one question but the section is cut
        // short.  The packet degrades to defaults plus the input as
        // raw body and stays serializable.
        let buf = [0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 3];
        let mut pkt = Packet::from(Dns::from_bytes(&buf).unwrap());
        assert!(pkt.dissect_error().is_some());
        assert_eq!(pkt.body_bytes().unwrap(), buf.to_vec());
        assert!(pkt.bin(false).is_ok());
    }
}
