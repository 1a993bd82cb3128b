//! Length-prefixed framing over any `Read`/`Write` stream.

use std::io::{self, Read, Write};

use tracing::trace;

use crate::constants::MAX_CONTROL_FRAME;
use crate::evidence::{EvidenceError, EvidenceSource, read_full_at};

use super::{ControlMessage, TransportError};

pub const CONTROL_LEN_SIZE: usize = 4;
pub const BULK_LEN_SIZE: usize = 8;

pub fn send_control<W: Write + ?Sized>(
    writer: &mut W,
    msg: &ControlMessage,
) -> Result<(), TransportError> {
    let payload = serde_json::to_vec(msg)
        .map_err(|e| TransportError::Protocol(format!("encode {}: {e}", msg.kind())))?;
    let len = u32::try_from(payload.len())
        .ok()
        .filter(|len| *len <= MAX_CONTROL_FRAME)
        .ok_or_else(|| {
            TransportError::Protocol(format!(
                "{} message of {} bytes exceeds control frame limit",
                msg.kind(),
                payload.len()
            ))
        })?;

    let mut frame = Vec::with_capacity(CONTROL_LEN_SIZE + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame)?;
    writer.flush()?;
    trace!(kind = msg.kind(), len, "sent control frame");
    Ok(())
}

/// Read one control message.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any byte
/// of a new frame.
pub fn recv_control<R: Read + ?Sized>(
    reader: &mut R,
) -> Result<Option<ControlMessage>, TransportError> {
    let mut header = [0u8; CONTROL_LEN_SIZE];
    let got = read_until_full(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < CONTROL_LEN_SIZE {
        return Err(TransportError::Connection(format!(
            "peer closed after {got} of {CONTROL_LEN_SIZE} control header bytes"
        )));
    }

    let len = u32::from_be_bytes(header);
    if len == 0 || len > MAX_CONTROL_FRAME {
        return Err(TransportError::Protocol(format!(
            "malformed control frame length {len}"
        )));
    }

    let mut payload = vec![0u8; len as usize];
    let got = read_until_full(reader, &mut payload)?;
    if got < payload.len() {
        return Err(TransportError::Protocol(format!(
            "truncated control payload: {got} of {len} bytes"
        )));
    }

    let msg: ControlMessage = serde_json::from_slice(&payload)
        .map_err(|e| TransportError::Protocol(format!("undecodable control message: {e}")))?;
    trace!(kind = msg.kind(), len, "received control frame");
    Ok(Some(msg))
}

/// Stream `[start, end)` of `source` as one bulk frame, `block_size` bytes at a time.
pub fn send_bulk<W: Write + ?Sized>(
    writer: &mut W,
    source: &dyn EvidenceSource,
    start: u64,
    end: u64,
    block_size: usize,
) -> Result<u64, TransportError> {
    if start > end || end > source.len() {
        return Err(EvidenceError::OutOfRange {
            start,
            end,
            len: source.len(),
        }
        .into());
    }

    let total = end - start;
    writer.write_all(&total.to_be_bytes())?;

    let block = block_len(block_size, total);
    let mut buf = vec![0u8; block];
    let mut offset = start;
    while offset < end {
        let want = (end - offset).min(block as u64) as usize;
        let n = read_full_at(source, offset, &mut buf[..want])?;
        if n == 0 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("source ended at {offset} before {end}"),
            )));
        }
        writer.write_all(&buf[..n])?;
        offset += n as u64;
    }
    writer.flush()?;
    trace!(start, end, total, "sent bulk frame");
    Ok(total)
}

/// Receive one bulk frame into `sink`, returning the number of payload bytes.
pub fn recv_bulk<R: Read + ?Sized, W: Write + ?Sized>(
    reader: &mut R,
    sink: &mut W,
    block_size: usize,
) -> Result<u64, TransportError> {
    let mut header = [0u8; BULK_LEN_SIZE];
    let got = read_until_full(reader, &mut header)?;
    if got < BULK_LEN_SIZE {
        return Err(TransportError::Connection(format!(
            "peer closed after {got} of {BULK_LEN_SIZE} bulk header bytes"
        )));
    }

    let total = u64::from_be_bytes(header);
    let mut buf = vec![0u8; block_len(block_size, total)];
    let mut received = 0u64;
    while received < total {
        let want = (total - received).min(buf.len() as u64) as usize;
        let n = match reader.read(&mut buf[..want]) {
            Ok(0) => {
                return Err(TransportError::IncompleteTransfer {
                    expected: total,
                    received,
                });
            }
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::ConnectionReset
                        | io::ErrorKind::ConnectionAborted
                        | io::ErrorKind::UnexpectedEof
                ) =>
            {
                return Err(TransportError::IncompleteTransfer {
                    expected: total,
                    received,
                });
            }
            Err(err) => return Err(err.into()),
        };
        sink.write_all(&buf[..n]).map_err(TransportError::Io)?;
        received += n as u64;
    }
    sink.flush().map_err(TransportError::Io)?;
    trace!(total, "received bulk frame");
    Ok(total)
}

fn block_len(block_size: usize, total: u64) -> usize {
    let total = usize::try_from(total).unwrap_or(usize::MAX);
    block_size.max(1).min(total)
}

/// Read until `buf` is full or the stream ends; returns the bytes read.
fn read_until_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}
