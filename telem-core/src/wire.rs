//! Framing: `record_size` (4 bytes LE, counts itself) + optional config tag + header block + body.

use tracing::debug;

use crate::protocol::{
    max_record_size, HeaderSchema, CFG_PREFIX_LENGTH, CFG_PREFIX_MAGIC, PATH_MAX, RECORD_SIZE_LEN,
};
use crate::record::{parse_headers, DecodedRecord};

/// Encode one frame the way clients send it.
///
/// `header_block` is the raw newline-separated header text; the body is followed by a
/// single NUL terminator on the wire.
pub fn encode_frame(
    cfg_path: Option<&str>,
    header_block: &str,
    body: &[u8],
) -> Result<Vec<u8>, FrameEncodeError> {
    if body.contains(&0) {
        return Err(FrameEncodeError::BodyContainsNul);
    }
    let mut payload = Vec::new();
    if let Some(path) = cfg_path {
        if path.as_bytes().contains(&0) {
            return Err(FrameEncodeError::ConfigPathContainsNul);
        }
        if path.len() > PATH_MAX {
            return Err(FrameEncodeError::ConfigPathTooLong(path.len()));
        }
        payload.extend_from_slice(&CFG_PREFIX_MAGIC);
        payload.extend_from_slice(path.as_bytes());
        payload.push(0);
    }
    let header_len = u32::try_from(header_block.len())
        .map_err(|_| FrameEncodeError::TooLarge(header_block.len()))?;
    payload.extend_from_slice(&header_len.to_le_bytes());
    payload.extend_from_slice(header_block.as_bytes());
    payload.extend_from_slice(body);
    payload.push(0);

    let record_size = RECORD_SIZE_LEN + payload.len();
    let limit = max_record_size(header_block.lines().count());
    if record_size > limit {
        return Err(FrameEncodeError::TooLarge(record_size));
    }
    let mut out = Vec::with_capacity(record_size);
    out.extend_from_slice(&(record_size as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Join `name: value` pairs into a header block.
pub fn format_header_block<'a, I>(headers: I) -> String
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    headers
        .into_iter()
        .map(|(name, value)| format!("{name}: {value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Error encoding a record into a frame.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameEncodeError {
    #[error("frame of {0} bytes exceeds the maximum record size")]
    TooLarge(usize),
    #[error("config path of {0} bytes is too long")]
    ConfigPathTooLong(usize),
    #[error("config path contains a NUL byte")]
    ConfigPathContainsNul,
    #[error("body contains a NUL byte")]
    BodyContainsNul,
}

/// Checked cursor over a received record. Never reads past the end.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Look at the next `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        self.buf.get(self.pos..end)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let out = self.peek(n).ok_or(DecodeError::Truncated {
            offset: self.pos,
            wanted: n,
            available: self.remaining(),
        })?;
        self.pos += n;
        Ok(out)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Consume bytes up to and including the next NUL; returns them without the NUL.
    pub fn take_until_nul(&mut self) -> Result<&'a [u8], DecodeError> {
        let rest = &self.buf[self.pos..];
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(DecodeError::Unterminated { offset: self.pos })?;
        self.pos += nul + 1;
        Ok(&rest[..nul])
    }

    /// Consume everything left.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Slice up to (not including) the first NUL, or the whole slice.
pub(crate) fn until_nul(bytes: &[u8]) -> &[u8] {
    match bytes.iter().position(|&b| b == 0) {
        Some(n) => &bytes[..n],
        None => bytes,
    }
}

/// Decode a received record (the frame minus its `record_size` prefix).
///
/// The body starts right after the header block: `cfg_size + 4 + header_size`. The same
/// offset gives the body length, so the reported size and the slice always agree.
pub fn decode_record(buf: &[u8], schema: &HeaderSchema) -> Result<DecodedRecord, DecodeError> {
    let mut r = ByteReader::new(buf);

    let cfg_path = if r.peek(CFG_PREFIX_LENGTH) == Some(&CFG_PREFIX_MAGIC[..]) {
        r.take(CFG_PREFIX_LENGTH)?;
        let raw = r.take_until_nul()?;
        let path = std::str::from_utf8(raw).map_err(|_| DecodeError::ConfigPathEncoding)?;
        Some(path.to_string())
    } else {
        None
    };
    let cfg_size = r.position();

    let header_size = r.read_u32_le()? as usize;
    let block = r.take(header_size)?;
    let body_offset = r.position();
    let body_region = r.rest();
    debug!(
        total = buf.len(),
        cfg_size, header_size, body_offset,
        message_size = body_region.len(),
        "decoding record"
    );
    if body_region.is_empty() {
        return Err(DecodeError::MissingBody);
    }

    let headers = parse_headers(block, schema)?;
    Ok(DecodedRecord {
        cfg_path,
        headers,
        body: until_nul(body_region).to_vec(),
    })
}

/// Error decoding a record. The record is dropped.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("record truncated at offset {offset}: wanted {wanted} bytes, {available} left")]
    Truncated {
        offset: usize,
        wanted: usize,
        available: usize,
    },
    #[error("unterminated string at offset {offset}")]
    Unterminated { offset: usize },
    #[error("config path is not valid UTF-8")]
    ConfigPathEncoding,
    #[error("header block is not valid UTF-8")]
    HeaderEncoding,
    #[error("missing header {name:?} at position {position}")]
    MissingHeader { name: String, position: usize },
    #[error("expected header {expected:?} at position {position}, found {found:?}")]
    UnexpectedHeader {
        expected: String,
        position: usize,
        found: String,
    },
    #[error("record has no body")]
    MissingBody,
}
