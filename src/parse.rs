//! Parsing packets from bytes and readers.

use std::io::Read;

use crate::Result;

/// Constructs a protocol layer by dissecting bytes.
///
/// Dissection is synchronous and never fails outright: malformed
/// input is recorded in the layer's `dissect_error` and the packet
/// stays usable with best-effort bytes.
pub trait Parse: Sized {
    /// Dissects `buf` into a layer, taking ownership of the bytes it
    /// needs.
    fn from_bytes(buf: &[u8]) -> Result<Self>;

    /// Reads `reader` to the end and dissects the result.
    fn from_reader<R: Read>(mut reader: R) -> Result<Self> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Self::from_bytes(&buf)
    }
}
