//! The ERF record format carried in stream holes.
//!
//! Every record starts with a fixed 16-byte header followed by a variable
//! payload:
//!
//! | field       | bytes | order |
//! |-------------|-------|-------|
//! | `timestamp` | 8     | little-endian fixed-point |
//! | `rtype`     | 1     | high bit flags an extension header |
//! | `flags`     | 1     | |
//! | `rlen`      | 2     | big-endian, total record length incl. header |
//! | `lctr`      | 2     | big-endian loss counter |
//! | `wlen`      | 2     | big-endian wire length |
//!
//! The header is the framing of the whole stream protocol: a corrupt type
//! byte or a length shorter than the header means the cursor discipline
//! has been violated somewhere and the capture session cannot be trusted
//! any further.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Fixed header length in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Valid range of the type byte after masking off the extension bit.
pub const TYPE_MIN: u8 = 1;
pub const TYPE_MAX: u8 = 28;

/// Extension-header marker in the type byte.
pub const TYPE_EXT_HEADER: u8 = 0x80;

/// The record types this engine produces or is commonly fed.
pub const TYPE_HDLC_POS: u8 = 1;
pub const TYPE_ETH: u8 = 2;
pub const TYPE_ATM: u8 = 3;
pub const TYPE_AAL5: u8 = 4;
pub const TYPE_MC_HDLC: u8 = 5;
pub const TYPE_MC_RAW: u8 = 6;
pub const TYPE_MC_ATM: u8 = 7;
pub const TYPE_COLOR_HDLC_POS: u8 = 10;
pub const TYPE_COLOR_ETH: u8 = 11;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RecordError {
    #[error("truncated record: need {need} bytes, have {have}")]
    Truncated { need: usize, have: usize },
    #[error("record type {0:#04x} outside the valid range")]
    BadType(u8),
    #[error("record length {0} shorter than the header")]
    BadLength(u16),
}

/// Decoded record header. Plain values only; the payload stays in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub timestamp: u64,
    pub rtype: u8,
    pub flags: u8,
    pub rlen: u16,
    pub lctr: u16,
    pub wlen: u16,
}

impl RecordHeader {
    /// Parses a header from the front of `data` without validating the
    /// type or length fields.
    pub fn parse(data: &[u8]) -> Result<Self, RecordError> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(RecordError::Truncated {
                need: RECORD_HEADER_SIZE,
                have: data.len(),
            });
        }
        let mut buf = data;
        Ok(Self {
            timestamp: buf.get_u64_le(),
            rtype: buf.get_u8(),
            flags: buf.get_u8(),
            rlen: buf.get_u16(),
            lctr: buf.get_u16(),
            wlen: buf.get_u16(),
        })
    }

    /// Parses and validates framing: type byte in range, length able to
    /// hold at least the header itself.
    pub fn parse_checked(data: &[u8]) -> Result<Self, RecordError> {
        let header = Self::parse(data)?;
        if !header.type_valid() {
            return Err(RecordError::BadType(header.rtype));
        }
        if (header.rlen as usize) < RECORD_HEADER_SIZE {
            return Err(RecordError::BadLength(header.rlen));
        }
        Ok(header)
    }

    /// Whether the type byte (extension bit masked) lies in the valid
    /// range.
    pub fn type_valid(&self) -> bool {
        let t = self.rtype & !TYPE_EXT_HEADER;
        (TYPE_MIN..=TYPE_MAX).contains(&t)
    }

    pub fn has_extension_header(&self) -> bool {
        self.rtype & TYPE_EXT_HEADER != 0
    }

    /// Payload length implied by `rlen`.
    pub fn payload_len(&self) -> usize {
        (self.rlen as usize).saturating_sub(RECORD_HEADER_SIZE)
    }

    /// Serializes the header into `buf`.
    pub fn put(&self, buf: &mut impl BufMut) {
        buf.put_u64_le(self.timestamp);
        buf.put_u8(self.rtype);
        buf.put_u8(self.flags);
        buf.put_u16(self.rlen);
        buf.put_u16(self.lctr);
        buf.put_u16(self.wlen);
    }
}

/// A zero-copy view of one record inside a stream window.
#[derive(Debug)]
pub struct Record<'a> {
    header: RecordHeader,
    bytes: &'a [u8],
}

impl<'a> Record<'a> {
    /// Frames a record at the front of `data`. `data` must hold the whole
    /// record; the slice is narrowed to `rlen` bytes.
    pub fn parse(data: &'a [u8]) -> Result<Self, RecordError> {
        let header = RecordHeader::parse_checked(data)?;
        let rlen = header.rlen as usize;
        if data.len() < rlen {
            return Err(RecordError::Truncated {
                need: rlen,
                have: data.len(),
            });
        }
        Ok(Self {
            header,
            bytes: &data[..rlen],
        })
    }

    pub fn header(&self) -> &RecordHeader {
        &self.header
    }

    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[RECORD_HEADER_SIZE..]
    }

    /// The whole record, header included, as captured.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Builds a complete record for the transmit path.
pub fn build_record(rtype: u8, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let rlen = RECORD_HEADER_SIZE + payload.len();
    debug_assert!(rlen <= u16::MAX as usize, "record exceeds the length field");
    let header = RecordHeader {
        timestamp,
        rtype,
        flags: 0,
        rlen: rlen as u16,
        lctr: 0,
        wlen: payload.len() as u16,
    };
    let mut out = Vec::with_capacity(rlen);
    header.put(&mut out);
    out.extend_from_slice(payload);
    out
}
