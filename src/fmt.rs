//! Textual codecs for well-known field types, plus hex dumping.
//!
//! MAC addresses, dotted-quad IPv4 addresses and DNS names each get a
//! pair of pure conversion functions.  Protocol modules wrap these
//! into `..._s` accessors next to the raw byte accessors.

use crate::{Error, Result};

/// Formats a 6-byte MAC address as `AA:BB:CC:DD:EE:FF`.
pub fn mac_to_str(mac: &[u8]) -> String {
    mac.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses `AA:BB:CC:DD:EE:FF` into its 6 bytes.
pub fn mac_from_str(s: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::InvalidArgument(format!("not a MAC address: {}", s)).into());
    }
    let mut out = Vec::with_capacity(6);
    for part in parts {
        let b = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidArgument(format!("not a MAC address: {}", s)))?;
        out.push(b);
    }
    Ok(out)
}

/// Formats a 4-byte IPv4 address as `127.0.0.1`.
pub fn ip4_to_str(ip: &[u8]) -> String {
    ip.iter()
        .map(|b| b.to_string())
        .collect::<Vec<_>>()
        .join(".")
}

/// Parses `127.0.0.1` into its 4 bytes.
pub fn ip4_from_str(s: &str) -> Result<Vec<u8>> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return Err(Error::InvalidArgument(format!("not an IPv4 address: {}", s)).into());
    }
    let mut out = Vec::with_capacity(4);
    for part in parts {
        let b: u8 = part.parse()
            .map_err(|_| Error::InvalidArgument(format!("not an IPv4 address: {}", s)))?;
        out.push(b);
    }
    Ok(out)
}

/// Decodes a DNS name from its wire form.
///
/// `b"\x03www\x07example\x03com\x00"` becomes `"www.example.com."`.
/// A compression pointer ends the name; the referenced labels are not
/// followed, since the rest of the message is out of reach here.
pub fn dns_name_decode(name: &[u8]) -> String {
    let mut labels = Vec::new();
    let mut off = 0;
    while off < name.len() {
        let len = name[off] as usize;
        if len == 0 || name[off] & 0xc0 == 0xc0 {
            break;
        }
        let end = usize::min(off + 1 + len, name.len());
        labels.push(String::from_utf8_lossy(&name[off + 1..end]).into_owned());
        off = end;
    }
    labels.join(".") + "."
}

/// Encodes a DNS name into its wire form.
///
/// `"www.example.com"` becomes `b"\x03www\x07example\x03com\x00"`.
/// Empty labels are skipped, so a trailing dot is allowed.
pub fn dns_name_encode(name: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(name.len() + 2);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out
}

/// Formats `buf` as a hex dump, `width` bytes per line, with an ASCII
/// column.  Non-printable bytes show as dots.
pub(crate) fn hexdump(buf: &[u8], width: usize) -> String {
    let width = width.max(1);
    let mut lines = Vec::new();
    for (i, chunk) in buf.chunks(width).enumerate() {
        let hexa = chunk.iter()
            .map(|b| format!("{:02x}", b))
            .collect::<Vec<_>>()
            .join(" ");
        let ascii: String = chunk.iter()
            .map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' })
            .collect();
        lines.push(format!("  {:04}:      {:<hex_width$} {}",
                           i * width, hexa, ascii, hex_width = width * 3));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::quickcheck;

    #[test]
    fn mac_codec() {
        assert_eq!(mac_to_str(&[0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]),
                   "AA:BB:CC:00:11:22");
        assert_eq!(mac_from_str("AA:BB:CC:00:11:22").unwrap(),
                   vec![0xaa, 0xbb, 0xcc, 0x00, 0x11, 0x22]);
        assert!(mac_from_str("AA:BB").is_err());
        assert!(mac_from_str("AA:BB:CC:00:11:ZZ").is_err());
    }

    #[test]
    fn ip4_codec() {
        assert_eq!(ip4_to_str(&[127, 0, 0, 1]), "127.0.0.1");
        assert_eq!(ip4_from_str("10.0.0.2").unwrap(), vec![10, 0, 0, 2]);
        assert!(ip4_from_str("10.0.0").is_err());
        assert!(ip4_from_str("10.0.0.256").is_err());
    }

    #[test]
    fn dns_name_codec() {
        assert_eq!(dns_name_encode("www.example.com"),
                   b"\x03www\x07example\x03com\x00".to_vec());
        assert_eq!(dns_name_decode(b"\x03www\x07example\x03com\x00"),
                   "www.example.com.");
        // Trailing dots do not produce empty labels.
        assert_eq!(dns_name_encode("www.example.com."),
                   dns_name_encode("www.example.com"));
        // The root name.
        assert_eq!(dns_name_encode(""), vec![0]);
        assert_eq!(dns_name_decode(&[0]), ".");
        // Compression pointers end the name.
        assert_eq!(dns_name_decode(&[0xc0, 0x0c]), ".");
    }

    quickcheck! {
        fn mac_roundtrip(a: u8, b: u8, c: u8, d: u8, e: u8, f: u8) -> bool {
            let mac = vec![a, b, c, d, e, f];
            mac_from_str(&mac_to_str(&mac)).unwrap() == mac
        }

        fn ip4_roundtrip(a: u8, b: u8, c: u8, d: u8) -> bool {
            let ip = vec![a, b, c, d];
            ip4_from_str(&ip4_to_str(&ip)).unwrap() == ip
        }

        fn dns_name_roundtrip(labels: Vec<u8>) -> bool {
            // Map arbitrary input onto label lengths over a small
            // alphabet; empty input is the root name.
            let name = labels.iter()
                .map(|&n| "x".repeat(usize::from(n % 8) + 1))
                .collect::<Vec<_>>()
                .join(".");
            let encoded = dns_name_encode(&name);
            let mut expect = name;
            expect.push('.');
            if expect == "." {
                return dns_name_decode(&encoded) == ".";
            }
            dns_name_decode(&encoded) == expect
        }
    }
}
