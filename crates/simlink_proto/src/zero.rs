//! Zero-run coding of datagram payloads.
//!
//! A run of zero bytes in the payload is collapsed into a `0x00` marker byte
//! followed by a single run-length byte (1-255); runs longer than 255 emit
//! repeated pairs. The transform only ever applies to the payload region of
//! a datagram, the header and any ACK trailer stay raw, and is signalled by
//! the zero-coded flag bit.

use bytes::Bytes;

/// Error when expanding a zero-coded payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ZeroDecodeError {
    /// A `0x00` marker was the last byte, leaving no room for its run length.
    #[error("zero marker at end of payload with no run length")]
    TruncatedRun,
    /// A run length byte of zero is not producible by the encoder.
    #[error("zero-length run")]
    EmptyRun,
}

/// Compresses `src`, returning `None` if the result would exceed `limit`
/// bytes.
///
/// Callers use `None` as the signal to clear the zero-coded flag and send
/// the payload raw instead.
#[must_use]
pub fn encode(src: &[u8], limit: usize) -> Option<Bytes> {
    let mut out = Vec::with_capacity(src.len().min(limit));
    let mut iter = src.iter().copied().peekable();
    while let Some(byte) = iter.next() {
        if byte != 0 {
            if out.len() + 1 > limit {
                return None;
            }
            out.push(byte);
            continue;
        }
        let mut run: usize = 1;
        while run < 255 && iter.peek() == Some(&0) {
            iter.next();
            run += 1;
        }
        if out.len() + 2 > limit {
            return None;
        }
        out.push(0);
        out.push(run as u8);
    }
    Some(Bytes::from(out))
}

/// Expands a zero-coded payload.
///
/// # Errors
///
/// Errors if the payload ends in the middle of a run pair, or names an
/// impossible run length.
pub fn decode(src: &[u8]) -> Result<Bytes, ZeroDecodeError> {
    let mut out = Vec::with_capacity(src.len());
    let mut iter = src.iter().copied();
    while let Some(byte) = iter.next() {
        if byte != 0 {
            out.push(byte);
            continue;
        }
        let run = iter.next().ok_or(ZeroDecodeError::TruncatedRun)?;
        if run == 0 {
            return Err(ZeroDecodeError::EmptyRun);
        }
        out.resize(out.len() + usize::from(run), 0);
    }
    Ok(Bytes::from(out))
}
