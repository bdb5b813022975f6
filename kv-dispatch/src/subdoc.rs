//! Sub-document operations: reads and writes addressed to a path inside a
//! JSON document instead of the whole value.
//!
//! A request with a single path uses that operation's own opcode, with the
//! path length and flags in the extras and `path || value` as the body. More
//! than one path is packed into a multi-lookup or multi-mutation body, one
//! spec after the other:
//!
//! ```text
//! lookup spec:    opcode u8 | flags u8 | path len u16 | path
//! mutation spec:  opcode u8 | flags u8 | path len u16 | value len u32 | path | value
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{ErrorKind, SchedError};
use crate::protocol::{Opcode, Status, MAX_KEY_LEN};

/// Create missing intermediate objects and arrays along the path.
pub const FLAG_MKDIR_P: u8 = 0x01;

const LOOKUP_SPEC_HEADER: usize = 4;
const MUTATION_SPEC_HEADER: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubdocOp {
    Get,
    Exists,
    Replace,
    DictAdd,
    DictUpsert,
    ArrayPushLast,
    ArrayPushFirst,
    ArrayInsert,
    ArrayAddUnique,
    Remove,
    Counter,
}

impl SubdocOp {
    pub fn opcode(self) -> Opcode {
        match self {
            Self::Get => Opcode::SubdocGet,
            Self::Exists => Opcode::SubdocExists,
            Self::Replace => Opcode::SubdocReplace,
            Self::DictAdd => Opcode::SubdocDictAdd,
            Self::DictUpsert => Opcode::SubdocDictUpsert,
            Self::ArrayPushLast => Opcode::SubdocArrayPushLast,
            Self::ArrayPushFirst => Opcode::SubdocArrayPushFirst,
            Self::ArrayInsert => Opcode::SubdocArrayInsert,
            Self::ArrayAddUnique => Opcode::SubdocArrayAddUnique,
            Self::Remove => Opcode::SubdocDelete,
            Self::Counter => Opcode::SubdocCounter,
        }
    }

    pub fn is_lookup(self) -> bool {
        matches!(self, Self::Get | Self::Exists)
    }

    /// Whether an empty path, meaning the document root, is meaningful.
    pub fn empty_path_allowed(self) -> bool {
        !matches!(
            self,
            Self::Get
                | Self::DictAdd
                | Self::DictUpsert
                | Self::Remove
                | Self::ArrayInsert
                | Self::Replace
                | Self::Counter
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocSpec {
    pub op: SubdocOp,
    pub path: Bytes,
    pub value: Bytes,
    pub create_parents: bool,
}

impl SubdocSpec {
    pub fn new(op: SubdocOp, path: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            op,
            path: path.into(),
            value: value.into(),
            create_parents: false,
        }
    }

    pub fn get(path: impl Into<Bytes>) -> Self {
        Self::new(SubdocOp::Get, path, Bytes::new())
    }

    pub fn exists(path: impl Into<Bytes>) -> Self {
        Self::new(SubdocOp::Exists, path, Bytes::new())
    }

    pub fn remove(path: impl Into<Bytes>) -> Self {
        Self::new(SubdocOp::Remove, path, Bytes::new())
    }

    /// The delta travels as a decimal string.
    pub fn counter(path: impl Into<Bytes>, delta: i64) -> Self {
        Self::new(SubdocOp::Counter, path, delta.to_string())
    }

    pub fn create_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }

    fn flags(&self) -> u8 {
        if self.create_parents {
            FLAG_MKDIR_P
        } else {
            0
        }
    }
}

/// Checks that `specs` form a valid lookup (`lookup == true`) or mutation.
pub fn validate(specs: &[SubdocSpec], lookup: bool) -> Result<(), SchedError> {
    if specs.is_empty() {
        return Err(SchedError::NoSubdocSpecs);
    }
    for spec in specs {
        if spec.op.is_lookup() != lookup {
            return Err(SchedError::MixedSubdocSpecs { op: spec.op });
        }
        if spec.path.is_empty() && !spec.op.empty_path_allowed() {
            return Err(SchedError::EmptyPath { op: spec.op });
        }
        if spec.path.len() > MAX_KEY_LEN {
            return Err(SchedError::PathTooLong {
                len: spec.path.len(),
                max: MAX_KEY_LEN,
            });
        }
    }
    Ok(())
}

/// Opcode for the whole request.
pub fn opcode(specs: &[SubdocSpec], lookup: bool) -> Opcode {
    match specs {
        [single] => single.op.opcode(),
        _ if lookup => Opcode::SubdocMultiLookup,
        _ => Opcode::SubdocMultiMutation,
    }
}

/// Length of the body that follows the key.
pub fn value_len(specs: &[SubdocSpec], lookup: bool) -> usize {
    match specs {
        [single] => single.path.len() + single.value.len(),
        _ => specs
            .iter()
            .map(|spec| {
                if lookup {
                    LOOKUP_SPEC_HEADER + spec.path.len()
                } else {
                    MUTATION_SPEC_HEADER + spec.path.len() + spec.value.len()
                }
            })
            .sum(),
    }
}

/// Extras and body for `specs`. `expiry` is only sent when non-zero.
pub fn encode(specs: &[SubdocSpec], lookup: bool, expiry: u32) -> (Bytes, Bytes) {
    let mut extras = BytesMut::new();
    let mut body = BytesMut::with_capacity(value_len(specs, lookup));
    if let [single] = specs {
        extras.put_u16(single.path.len() as u16);
        extras.put_u8(single.flags());
        if expiry != 0 {
            extras.put_u32(expiry);
        }
        body.put_slice(&single.path);
        body.put_slice(&single.value);
        return (extras.freeze(), body.freeze());
    }
    if !lookup && expiry != 0 {
        extras.put_u32(expiry);
    }
    for spec in specs {
        body.put_u8(spec.op.opcode().as_u8());
        body.put_u8(spec.flags());
        body.put_u16(spec.path.len() as u16);
        if !lookup {
            body.put_u32(spec.value.len() as u32);
        }
        body.put_slice(&spec.path);
        if !lookup {
            body.put_slice(&spec.value);
        }
    }
    (extras.freeze(), body.freeze())
}

/// Outcome for one path of a sub-document request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubdocResult {
    /// Position of the spec in the request.
    pub index: usize,
    pub status: Status,
    pub value: Bytes,
}

/// Splits a response body into per-path results.
///
/// Multi-lookup bodies carry one `status u16 | len u32 | value` entry per
/// spec. Multi-mutation bodies only list the specs that produced a value,
/// each as `index u8 | status u16 | len u32 | value`.
pub fn parse_results(
    specs: &[SubdocSpec],
    lookup: bool,
    mut body: &[u8],
) -> Result<Vec<SubdocResult>, ErrorKind> {
    if specs.len() == 1 {
        return Ok(vec![SubdocResult {
            index: 0,
            status: Status::Success,
            value: Bytes::copy_from_slice(body),
        }]);
    }
    let mut results = Vec::new();
    while body.has_remaining() {
        let index = if lookup {
            results.len()
        } else {
            usize::from(body.get_u8())
        };
        if body.remaining() < 6 || index >= specs.len() {
            return Err(ErrorKind::Protocol);
        }
        let status = Status::from_u16(body.get_u16());
        let len = body.get_u32() as usize;
        if body.remaining() < len {
            return Err(ErrorKind::Protocol);
        }
        let value = Bytes::copy_from_slice(&body[..len]);
        body.advance(len);
        results.push(SubdocResult {
            index,
            status,
            value,
        });
    }
    if lookup && results.len() != specs.len() {
        return Err(ErrorKind::Protocol);
    }
    Ok(results)
}
