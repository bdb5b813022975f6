//! Binary wire codec for the key-value protocol.
//!
//! Every frame is a fixed 24-byte big-endian header followed by a body made of
//! `extras || key || value`. Decoding is incremental: callers feed whatever bytes
//! the socket produced and pull complete frames out as they become available.
//!
//! ```text
//!  0       1       2       3       4       5       6       7
//! +-------+-------+---------------+-------+-------+---------------+
//! | magic |opcode |  key length   |extlen | dtype | status/vbucket|
//! +-------+-------+---------------+-------+-------+---------------+
//! |        total body length      |        opaque (correlation)   |
//! +-------------------------------+-------------------------------+
//! |                              cas                              |
//! +---------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

pub const HEADER_LEN: usize = 24;

/// Largest body the decoder accepts before declaring the stream corrupt.
pub const DEFAULT_MAX_BODY: u32 = 32 * 1024 * 1024;

/// Longest key the 16-bit key length field can describe.
pub const MAX_KEY_LEN: usize = u16::MAX as usize;

/// Longest body the 32-bit body length field can describe.
pub const MAX_BODY_LEN: usize = u32::MAX as usize;

/// Longest value that still fits a body next to `key_len` bytes of key and the
/// largest possible extras.
pub const fn max_value_len(key_len: usize) -> usize {
    MAX_BODY_LEN.saturating_sub(u8::MAX as usize + key_len)
}

pub const MAGIC_REQUEST: u8 = 0x80;
pub const MAGIC_RESPONSE: u8 = 0x81;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("invalid magic byte 0x{0:02x}")]
    BadMagic(u8),
    #[error("extras ({extras}) + key ({key}) exceed body length {body}")]
    LengthMismatch { extras: u8, key: u16, body: u32 },
    #[error("frame body of {len} bytes exceeds limit of {max}")]
    BodyTooLarge { len: u32, max: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Noop = 0x0a,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Touch = 0x1c,
    GetReplica = 0x83,
    ObserveSeqno = 0x91,
    UnlockKey = 0x95,
    GetClusterConfig = 0xb5,
    SubdocGet = 0xc5,
    SubdocExists = 0xc6,
    SubdocDictAdd = 0xc7,
    SubdocDictUpsert = 0xc8,
    SubdocDelete = 0xc9,
    SubdocReplace = 0xca,
    SubdocArrayPushLast = 0xcb,
    SubdocArrayPushFirst = 0xcc,
    SubdocArrayInsert = 0xcd,
    SubdocArrayAddUnique = 0xce,
    SubdocCounter = 0xcf,
    SubdocMultiLookup = 0xd0,
    SubdocMultiMutation = 0xd1,
}

impl Opcode {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let op = match value {
            0x00 => Self::Get,
            0x01 => Self::Set,
            0x02 => Self::Add,
            0x03 => Self::Replace,
            0x04 => Self::Delete,
            0x05 => Self::Increment,
            0x06 => Self::Decrement,
            0x0a => Self::Noop,
            0x0e => Self::Append,
            0x0f => Self::Prepend,
            0x10 => Self::Stat,
            0x1c => Self::Touch,
            0x83 => Self::GetReplica,
            0x91 => Self::ObserveSeqno,
            0x95 => Self::UnlockKey,
            0xb5 => Self::GetClusterConfig,
            0xc5 => Self::SubdocGet,
            0xc6 => Self::SubdocExists,
            0xc7 => Self::SubdocDictAdd,
            0xc8 => Self::SubdocDictUpsert,
            0xc9 => Self::SubdocDelete,
            0xca => Self::SubdocReplace,
            0xcb => Self::SubdocArrayPushLast,
            0xcc => Self::SubdocArrayPushFirst,
            0xcd => Self::SubdocArrayInsert,
            0xce => Self::SubdocArrayAddUnique,
            0xcf => Self::SubdocCounter,
            0xd0 => Self::SubdocMultiLookup,
            0xd1 => Self::SubdocMultiMutation,
            _ => return None,
        };
        Some(op)
    }
}

/// Response status carried in bytes 6..8 of a response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Success,
    KeyNotFound,
    KeyExists,
    TooBig,
    Invalid,
    NotStored,
    DeltaBadValue,
    NotMyPartition,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    Internal,
    Busy,
    TemporaryFailure,
    SubdocPathNotFound,
    SubdocPathMismatch,
    SubdocPathInvalid,
    SubdocValueCannotInsert,
    SubdocDocNotJson,
    SubdocNumRange,
    SubdocPathExists,
    SubdocMultiPathFailure,
    Other(u16),
}

impl Status {
    pub fn from_u16(value: u16) -> Self {
        match value {
            0x00 => Self::Success,
            0x01 => Self::KeyNotFound,
            0x02 => Self::KeyExists,
            0x03 => Self::TooBig,
            0x04 => Self::Invalid,
            0x05 => Self::NotStored,
            0x06 => Self::DeltaBadValue,
            0x07 => Self::NotMyPartition,
            0x20 => Self::AuthError,
            0x21 => Self::AuthContinue,
            0x81 => Self::UnknownCommand,
            0x82 => Self::OutOfMemory,
            0x83 => Self::NotSupported,
            0x84 => Self::Internal,
            0x85 => Self::Busy,
            0x86 => Self::TemporaryFailure,
            0xc0 => Self::SubdocPathNotFound,
            0xc1 => Self::SubdocPathMismatch,
            0xc2 => Self::SubdocPathInvalid,
            0xc5 => Self::SubdocValueCannotInsert,
            0xc6 => Self::SubdocDocNotJson,
            0xc7 => Self::SubdocNumRange,
            0xc9 => Self::SubdocPathExists,
            0xcc => Self::SubdocMultiPathFailure,
            other => Self::Other(other),
        }
    }

    pub fn as_u16(self) -> u16 {
        match self {
            Self::Success => 0x00,
            Self::KeyNotFound => 0x01,
            Self::KeyExists => 0x02,
            Self::TooBig => 0x03,
            Self::Invalid => 0x04,
            Self::NotStored => 0x05,
            Self::DeltaBadValue => 0x06,
            Self::NotMyPartition => 0x07,
            Self::AuthError => 0x20,
            Self::AuthContinue => 0x21,
            Self::UnknownCommand => 0x81,
            Self::OutOfMemory => 0x82,
            Self::NotSupported => 0x83,
            Self::Internal => 0x84,
            Self::Busy => 0x85,
            Self::TemporaryFailure => 0x86,
            Self::SubdocPathNotFound => 0xc0,
            Self::SubdocPathMismatch => 0xc1,
            Self::SubdocPathInvalid => 0xc2,
            Self::SubdocValueCannotInsert => 0xc5,
            Self::SubdocDocNotJson => 0xc6,
            Self::SubdocNumRange => 0xc7,
            Self::SubdocPathExists => 0xc9,
            Self::SubdocMultiPathFailure => 0xcc,
            Self::Other(other) => other,
        }
    }
}

/// Decoded form of the fixed header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_len: u16,
    pub extras_len: u8,
    pub datatype: u8,
    /// Partition index on requests, status on responses.
    pub vbucket_or_status: u16,
    pub body_len: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    /// Parses and validates the first [`HEADER_LEN`] bytes of `buf`.
    ///
    /// The caller guarantees `buf.len() >= HEADER_LEN`.
    pub fn parse(mut buf: &[u8]) -> Result<Self, CodecError> {
        debug_assert!(buf.len() >= HEADER_LEN);
        let header = Header {
            magic: buf.get_u8(),
            opcode: buf.get_u8(),
            key_len: buf.get_u16(),
            extras_len: buf.get_u8(),
            datatype: buf.get_u8(),
            vbucket_or_status: buf.get_u16(),
            body_len: buf.get_u32(),
            opaque: buf.get_u32(),
            cas: buf.get_u64(),
        };
        header.validate()?;
        Ok(header)
    }

    fn validate(&self) -> Result<(), CodecError> {
        if self.magic != MAGIC_REQUEST && self.magic != MAGIC_RESPONSE {
            return Err(CodecError::BadMagic(self.magic));
        }
        if u32::from(self.extras_len) + u32::from(self.key_len) > self.body_len {
            return Err(CodecError::LengthMismatch {
                extras: self.extras_len,
                key: self.key_len,
                body: self.body_len,
            });
        }
        Ok(())
    }

    pub fn write(&self, out: &mut BytesMut) {
        out.put_u8(self.magic);
        out.put_u8(self.opcode);
        out.put_u16(self.key_len);
        out.put_u8(self.extras_len);
        out.put_u8(self.datatype);
        out.put_u16(self.vbucket_or_status);
        out.put_u32(self.body_len);
        out.put_u32(self.opaque);
        out.put_u64(self.cas);
    }

    pub fn is_response(&self) -> bool {
        self.magic == MAGIC_RESPONSE
    }

    pub fn status(&self) -> Status {
        Status::from_u16(self.vbucket_or_status)
    }

    pub fn partition(&self) -> u16 {
        self.vbucket_or_status
    }

    pub fn value_len(&self) -> usize {
        self.body_len as usize - self.extras_len as usize - self.key_len as usize
    }

    pub fn frame_len(&self) -> usize {
        HEADER_LEN + self.body_len as usize
    }
}

/// A complete frame: header plus its three body sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: Header,
    pub extras: Bytes,
    pub key: Bytes,
    pub value: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode, partition: u16, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        Self::build(MAGIC_REQUEST, opcode.as_u8(), partition, extras, key, value)
    }

    pub fn response(opcode: u8, status: Status, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        Self::build(MAGIC_RESPONSE, opcode, status.as_u16(), extras, key, value)
    }

    fn build(magic: u8, opcode: u8, word: u16, extras: Bytes, key: Bytes, value: Bytes) -> Self {
        debug_assert!(key.len() <= MAX_KEY_LEN);
        debug_assert!(extras.len() + key.len() + value.len() <= MAX_BODY_LEN);
        let header = Header {
            magic,
            opcode,
            key_len: key.len() as u16,
            extras_len: extras.len() as u8,
            datatype: 0,
            vbucket_or_status: word,
            body_len: (extras.len() + key.len() + value.len()) as u32,
            opaque: 0,
            cas: 0,
        };
        Self {
            header,
            extras,
            key,
            value,
        }
    }

    pub fn with_opaque(mut self, opaque: u32) -> Self {
        self.header.opaque = opaque;
        self
    }

    pub fn with_cas(mut self, cas: u64) -> Self {
        self.header.cas = cas;
        self
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_u8(self.header.opcode)
    }

    pub fn status(&self) -> Status {
        self.header.status()
    }

    pub fn opaque(&self) -> u32 {
        self.header.opaque
    }

    pub fn cas(&self) -> u64 {
        self.header.cas
    }

    pub fn encoded_len(&self) -> usize {
        self.header.frame_len()
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        out.reserve(self.encoded_len());
        self.header.write(out);
        out.put_slice(&self.extras);
        out.put_slice(&self.key);
        out.put_slice(&self.value);
    }

    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut out);
        out.freeze()
    }
}

/// Result of a stateless [`decode`] attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// `needed` more bytes must arrive before a frame can be parsed.
    Incomplete { needed: usize },
    Complete { frame: Frame, consumed: usize },
}

/// Decodes at most one frame from the front of `buf` without retaining state.
pub fn decode(buf: &[u8]) -> Result<Decoded, CodecError> {
    if buf.len() < HEADER_LEN {
        return Ok(Decoded::Incomplete {
            needed: HEADER_LEN - buf.len(),
        });
    }
    let header = Header::parse(buf)?;
    let total = header.frame_len();
    if buf.len() < total {
        return Ok(Decoded::Incomplete {
            needed: total - buf.len(),
        });
    }
    let frame = split_frame(header, Bytes::copy_from_slice(&buf[HEADER_LEN..total]));
    Ok(Decoded::Complete {
        frame,
        consumed: total,
    })
}

fn split_frame(header: Header, mut body: Bytes) -> Frame {
    let extras = body.split_to(header.extras_len as usize);
    let key = body.split_to(header.key_len as usize);
    Frame {
        header,
        extras,
        key,
        value: body,
    }
}

/// Accumulating decoder for one connection's inbound byte stream.
#[derive(Debug)]
pub struct Decoder {
    buf: BytesMut,
    max_body: u32,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(max_body: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(8 * 1024),
            max_body,
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Bytes still missing before the next frame is complete (0 if one is ready).
    pub fn needed(&self) -> usize {
        if self.buf.len() < HEADER_LEN {
            return HEADER_LEN - self.buf.len();
        }
        match Header::parse(&self.buf) {
            Ok(header) => header.frame_len().saturating_sub(self.buf.len()),
            Err(_) => 0,
        }
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::parse(&self.buf)?;
        if header.body_len > self.max_body {
            return Err(CodecError::BodyTooLarge {
                len: header.body_len,
                max: self.max_body,
            });
        }
        if self.buf.len() < header.frame_len() {
            return Ok(None);
        }
        let mut raw = self.buf.split_to(header.frame_len()).freeze();
        raw.advance(HEADER_LEN);
        Ok(Some(split_frame(header, raw)))
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
