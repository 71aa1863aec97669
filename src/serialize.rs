//! Serializing packets to writers and byte vectors.

use std::io::Write;

use crate::Result;
use crate::packet::Packet;

/// Serializes a packet stack.
///
/// Serialization takes `&mut self`: it refreshes header caches and,
/// with the default auto-field behavior of [`Packet::bin`],
/// recomputes derived fields such as checksums and lengths.
pub trait Serialize {
    /// Writes the serialized packet to `out`.
    fn serialize(&mut self, out: &mut dyn Write) -> Result<()>;

    /// Serializes the packet into a fresh byte vector.
    fn to_vec(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        self.serialize(&mut out)?;
        Ok(out)
    }
}

impl Serialize for Packet {
    fn serialize(&mut self, out: &mut dyn Write) -> Result<()> {
        let bytes = self.bin(true)?;
        out.write_all(&bytes)?;
        Ok(())
    }
}
