use anyhow::anyhow;
use bytes::Buf;

/// Decoding helpers for the binary wire format on top of [bytes::Buf].
///
/// All strings on the datagram encoding are null-terminated, so the one
/// nontrivial helper here pulls bytes up to (and consumes) the terminator.
pub trait BufExt: Buf {
    /// Reads a null-terminated string, consuming the terminator. A field that
    /// runs past the end of the buffer without a terminator is a malformed
    /// frame, not a partial result.
    fn try_get_cstr(&mut self) -> anyhow::Result<String> {
        let mut raw = Vec::new();
        loop {
            if !self.has_remaining() {
                return Err(anyhow!("unterminated string field in binary frame"));
            }
            match self.get_u8() {
                0 => break,
                b => raw.push(b),
            }
        }
        Ok(String::from_utf8(raw)?)
    }
}

impl<T: Buf> BufExt for T {}
