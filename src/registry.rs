//! Upper-layer dispatch.
//!
//! One process-wide table maps `(protocol class, discriminator)` to
//! the class of the next upper layer: ether-types for Ethernet, IP
//! protocol numbers for IPv4, well-known ports for UDP.  The table is
//! built once, on first use, and read-only afterwards; loading the
//! same protocol twice is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::info;

use crate::packet::ClassId;
use crate::packet::ethernet::ETH_TYPE_IP;
use crate::packet::ipv4::IP_PROTO_UDP;
use crate::packet::udp::UDP_PORT_DNS;

static HANDLERS: Lazy<HashMap<ClassId, HashMap<u64, ClassId>>> = Lazy::new(|| {
    let mut table = HashMap::new();
    load_handler(&mut table, ClassId::Ethernet, &[
        (&[ETH_TYPE_IP as u64], ClassId::Ipv4),
    ]);
    load_handler(&mut table, ClassId::Ipv4, &[
        (&[IP_PROTO_UDP as u64], ClassId::Udp),
    ]);
    load_handler(&mut table, ClassId::Udp, &[
        (UDP_PORT_DNS, ClassId::Dns),
    ]);
    table
});

/// Registers the dispatch entries of one protocol.  A second
/// registration for the same protocol is ignored.
fn load_handler(
    table: &mut HashMap<ClassId, HashMap<u64, ClassId>>,
    class: ClassId,
    entries: &[(&[u64], ClassId)],
) {
    if table.contains_key(&class) {
        return;
    }
    let mut map = HashMap::new();
    for (discriminators, upper) in entries {
        for d in *discriminators {
            map.insert(*d, *upper);
        }
    }
    table.insert(class, map);
}

/// Looks up the upper-layer class for a discriminator value seen in a
/// `class` header.
pub(crate) fn lookup(class: ClassId, discriminator: u64) -> Option<ClassId> {
    HANDLERS.get(&class)?.get(&discriminator).copied()
}

static UNKNOWN_SEEN: Lazy<Mutex<HashSet<(ClassId, u64)>>> =
    Lazy::new(|| Mutex::new(HashSet::new()));

/// Emits one informational log line per unknown `(class,
/// discriminator)` pair.  Unknown discriminators are not errors; the
/// body simply stays raw.
pub(crate) fn note_unknown(class: ClassId, discriminator: u64) {
    let mut seen = match UNKNOWN_SEEN.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if seen.insert((class, discriminator)) {
        info!(class = %class, discriminator,
              "no upper-layer handler registered, keeping raw body");
    }
}
