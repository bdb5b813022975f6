//! Typed commands and the responses decoded for them.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::callbacks::CallbackKind;
use crate::durability::EndureReport;
use crate::error::ErrorKind;
use crate::protocol::{Frame, Opcode, Status};
use crate::subdoc::{self, SubdocResult, SubdocSpec};

/// Expiry sent with a counter that must not be created when missing.
const COUNTER_NO_CREATE: u32 = 0xffff_ffff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Upsert,
    Insert,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            Self::Upsert => Opcode::Set,
            Self::Insert => Opcode::Add,
            Self::Replace => Opcode::Replace,
            Self::Append => Opcode::Append,
            Self::Prepend => Opcode::Prepend,
        }
    }

    fn carries_flags(self) -> bool {
        !matches!(self, Self::Append | Self::Prepend)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Get {
        key: Bytes,
    },
    GetReplica {
        key: Bytes,
        index: usize,
    },
    Store {
        key: Bytes,
        value: Bytes,
        mode: StoreMode,
        flags: u32,
        expiry: u32,
        cas: u64,
    },
    Remove {
        key: Bytes,
        cas: u64,
    },
    Touch {
        key: Bytes,
        expiry: u32,
    },
    Counter {
        key: Bytes,
        delta: i64,
        initial: Option<u64>,
        expiry: u32,
    },
    Unlock {
        key: Bytes,
        cas: u64,
    },
    /// Broadcast to every node; answered with a stream of stats per node.
    Stats {
        group: Option<String>,
    },
    ObserveSeqno {
        server: usize,
        partition: u16,
        uuid: u64,
    },
    Noop {
        server: usize,
    },
    /// Reads one or more paths inside a document.
    LookupIn {
        key: Bytes,
        specs: Vec<SubdocSpec>,
    },
    /// Changes one or more paths inside a document, atomically.
    MutateIn {
        key: Bytes,
        specs: Vec<SubdocSpec>,
        cas: u64,
        expiry: u32,
    },
}

impl Command {
    pub fn key(&self) -> Option<&Bytes> {
        match self {
            Self::Get { key }
            | Self::GetReplica { key, .. }
            | Self::Store { key, .. }
            | Self::Remove { key, .. }
            | Self::Touch { key, .. }
            | Self::Counter { key, .. }
            | Self::Unlock { key, .. }
            | Self::LookupIn { key, .. }
            | Self::MutateIn { key, .. } => Some(key),
            Self::Stats { .. } | Self::ObserveSeqno { .. } | Self::Noop { .. } => None,
        }
    }

    pub fn value_len(&self) -> usize {
        match self {
            Self::Store { value, .. } => value.len(),
            Self::LookupIn { specs, .. } => subdoc::value_len(specs, true),
            Self::MutateIn { specs, .. } => subdoc::value_len(specs, false),
            _ => 0,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        match self {
            Self::Get { .. } => CallbackKind::Get,
            Self::GetReplica { .. } => CallbackKind::GetReplica,
            Self::Store { .. } => CallbackKind::Store,
            Self::Remove { .. } => CallbackKind::Remove,
            Self::Touch { .. } => CallbackKind::Touch,
            Self::Counter { .. } => CallbackKind::Counter,
            Self::Unlock { .. } => CallbackKind::Unlock,
            Self::Stats { .. } => CallbackKind::Stats,
            Self::ObserveSeqno { .. } => CallbackKind::ObserveSeqno,
            Self::Noop { .. } => CallbackKind::Noop,
            Self::LookupIn { .. } | Self::MutateIn { .. } => CallbackKind::Subdoc,
        }
    }

    pub fn opcode(&self) -> Opcode {
        match self {
            Self::Get { .. } => Opcode::Get,
            Self::GetReplica { .. } => Opcode::GetReplica,
            Self::Store { mode, .. } => mode.opcode(),
            Self::Remove { .. } => Opcode::Delete,
            Self::Touch { .. } => Opcode::Touch,
            Self::Counter { delta, .. } if *delta < 0 => Opcode::Decrement,
            Self::Counter { .. } => Opcode::Increment,
            Self::Unlock { .. } => Opcode::UnlockKey,
            Self::Stats { .. } => Opcode::Stat,
            Self::ObserveSeqno { .. } => Opcode::ObserveSeqno,
            Self::Noop { .. } => Opcode::Noop,
            Self::LookupIn { specs, .. } => subdoc::opcode(specs, true),
            Self::MutateIn { specs, .. } => subdoc::opcode(specs, false),
        }
    }

    /// Commands whose repeated execution cannot change the outcome.
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self,
            Self::Get { .. }
                | Self::GetReplica { .. }
                | Self::Touch { .. }
                | Self::Stats { .. }
                | Self::ObserveSeqno { .. }
                | Self::Noop { .. }
                | Self::LookupIn { .. }
        )
    }

    /// A status that still carries per-path results worth decoding.
    pub fn answers_per_path(&self, status: Status) -> bool {
        matches!(self, Self::LookupIn { specs, .. } if specs.len() > 1)
            && status == Status::SubdocMultiPathFailure
    }

    /// Serializes the command for `partition`. The opaque is filled in later
    /// by the pipeline that sends it.
    pub fn to_frame(&self, partition: u16) -> Frame {
        let key = self.key().cloned().unwrap_or_default();
        let mut extras = BytesMut::new();
        let mut value = Bytes::new();
        let mut cas = 0;
        match self {
            Self::Get { .. } | Self::GetReplica { .. } | Self::Noop { .. } => {}
            Self::Store {
                value: body,
                mode,
                flags,
                expiry,
                cas: expected,
                ..
            } => {
                if mode.carries_flags() {
                    extras.put_u32(*flags);
                    extras.put_u32(*expiry);
                }
                value = body.clone();
                cas = *expected;
            }
            Self::Remove { cas: expected, .. } | Self::Unlock { cas: expected, .. } => {
                cas = *expected;
            }
            Self::Touch { expiry, .. } => extras.put_u32(*expiry),
            Self::Counter {
                delta,
                initial,
                expiry,
                ..
            } => {
                extras.put_u64(delta.unsigned_abs());
                extras.put_u64(initial.unwrap_or(0));
                extras.put_u32(if initial.is_some() {
                    *expiry
                } else {
                    COUNTER_NO_CREATE
                });
            }
            Self::Stats { group } => {
                let group = group.clone().unwrap_or_default();
                return Frame::request(
                    Opcode::Stat,
                    0,
                    Bytes::new(),
                    Bytes::from(group.into_bytes()),
                    Bytes::new(),
                );
            }
            Self::ObserveSeqno { uuid, .. } => {
                let mut body = BytesMut::with_capacity(8);
                body.put_u64(*uuid);
                value = body.freeze();
            }
            Self::LookupIn { specs, .. } => {
                let (sub_extras, body) = subdoc::encode(specs, true, 0);
                extras.put_slice(&sub_extras);
                value = body;
            }
            Self::MutateIn {
                specs,
                cas: expected,
                expiry,
                ..
            } => {
                let (sub_extras, body) = subdoc::encode(specs, false, *expiry);
                extras.put_slice(&sub_extras);
                value = body;
                cas = *expected;
            }
        }
        Frame::request(self.opcode(), partition, extras.freeze(), key, value).with_cas(cas)
    }

    /// Decodes the body of a successful response to this command.
    pub fn parse_response(
        &self,
        partition: u16,
        server: &str,
        frame: &Frame,
    ) -> Result<Response, ErrorKind> {
        let cas = frame.cas();
        let response = match self {
            Self::Get { .. } | Self::GetReplica { .. } => {
                let flags = match frame.extras.len() {
                    0 => 0,
                    4 => (&frame.extras[..]).get_u32(),
                    _ => return Err(ErrorKind::Protocol),
                };
                Response::Get {
                    value: frame.value.clone(),
                    flags,
                    cas,
                }
            }
            Self::Store { .. } => Response::Store {
                cas,
                token: MutationToken::from_extras(partition, &frame.extras),
            },
            Self::Remove { .. } => Response::Remove {
                cas,
                token: MutationToken::from_extras(partition, &frame.extras),
            },
            Self::Touch { .. } => Response::Touch { cas },
            Self::Counter { .. } => {
                if frame.value.len() != 8 {
                    return Err(ErrorKind::Protocol);
                }
                Response::Counter {
                    value: (&frame.value[..]).get_u64(),
                    cas,
                    token: MutationToken::from_extras(partition, &frame.extras),
                }
            }
            Self::Unlock { .. } => Response::Unlock,
            Self::Stats { .. } if frame.key.is_empty() => Response::StatsDone {
                server: server.to_string(),
            },
            Self::Stats { .. } => Response::Stat {
                server: server.to_string(),
                key: String::from_utf8_lossy(&frame.key).into_owned(),
                value: String::from_utf8_lossy(&frame.value).into_owned(),
            },
            Self::ObserveSeqno { server: index, .. } => {
                Response::ObserveSeqno(SeqnoStatus::parse(*index, &frame.value)?)
            }
            Self::Noop { .. } => Response::Noop,
            Self::LookupIn { specs, .. } => Response::Subdoc {
                cas,
                results: subdoc::parse_results(specs, true, &frame.value)?,
                token: None,
            },
            Self::MutateIn { specs, .. } => Response::Subdoc {
                cas,
                results: subdoc::parse_results(specs, false, &frame.value)?,
                token: MutationToken::from_extras(partition, &frame.extras),
            },
        };
        Ok(response)
    }
}

/// A command plus the caller's retry preference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    /// Allows transport-level retries for a command that is not naturally idempotent.
    pub retry_safe: bool,
}

impl Request {
    pub fn new(command: Command) -> Self {
        Self {
            command,
            retry_safe: false,
        }
    }

    pub fn get(key: impl Into<Bytes>) -> Self {
        Self::new(Command::Get { key: key.into() })
    }

    pub fn get_replica(key: impl Into<Bytes>, index: usize) -> Self {
        Self::new(Command::GetReplica {
            key: key.into(),
            index,
        })
    }

    pub fn store(key: impl Into<Bytes>, value: impl Into<Bytes>, mode: StoreMode) -> Self {
        Self::new(Command::Store {
            key: key.into(),
            value: value.into(),
            mode,
            flags: 0,
            expiry: 0,
            cas: 0,
        })
    }

    pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self::store(key, value, StoreMode::Upsert)
    }

    pub fn remove(key: impl Into<Bytes>) -> Self {
        Self::new(Command::Remove {
            key: key.into(),
            cas: 0,
        })
    }

    pub fn touch(key: impl Into<Bytes>, expiry: u32) -> Self {
        Self::new(Command::Touch {
            key: key.into(),
            expiry,
        })
    }

    pub fn counter(key: impl Into<Bytes>, delta: i64, initial: Option<u64>) -> Self {
        Self::new(Command::Counter {
            key: key.into(),
            delta,
            initial,
            expiry: 0,
        })
    }

    pub fn unlock(key: impl Into<Bytes>, cas: u64) -> Self {
        Self::new(Command::Unlock {
            key: key.into(),
            cas,
        })
    }

    pub fn stats(group: Option<String>) -> Self {
        Self::new(Command::Stats { group })
    }

    pub fn noop(server: usize) -> Self {
        Self::new(Command::Noop { server })
    }

    pub fn lookup_in(key: impl Into<Bytes>, specs: Vec<SubdocSpec>) -> Self {
        Self::new(Command::LookupIn {
            key: key.into(),
            specs,
        })
    }

    pub fn mutate_in(key: impl Into<Bytes>, specs: Vec<SubdocSpec>) -> Self {
        Self::new(Command::MutateIn {
            key: key.into(),
            specs,
            cas: 0,
            expiry: 0,
        })
    }

    pub fn retry_safe(mut self) -> Self {
        self.retry_safe = true;
        self
    }

    pub fn is_idempotent(&self) -> bool {
        self.retry_safe || self.command.is_idempotent()
    }
}

/// Identifies one mutation on one partition history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MutationToken {
    pub partition: u16,
    pub uuid: u64,
    pub seqno: u64,
}

impl MutationToken {
    fn from_extras(partition: u16, extras: &[u8]) -> Option<Self> {
        if extras.len() != 16 {
            return None;
        }
        let mut buf = extras;
        Some(Self {
            partition,
            uuid: buf.get_u64(),
            seqno: buf.get_u64(),
        })
    }

    pub fn to_extras(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(16);
        out.put_u64(self.uuid);
        out.put_u64(self.seqno);
        out.freeze()
    }
}

/// Partition sequence state reported by one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqnoStatus {
    pub server: usize,
    pub partition: u16,
    pub uuid: u64,
    pub persisted_seqno: u64,
    pub current_seqno: u64,
    /// `(old_uuid, last_seqno)` when the partition failed over since `uuid`.
    pub failover: Option<(u64, u64)>,
}

impl SeqnoStatus {
    const BASE_LEN: usize = 27;
    const FAILOVER_LEN: usize = 43;

    fn parse(server: usize, mut body: &[u8]) -> Result<Self, ErrorKind> {
        if body.len() < Self::BASE_LEN {
            return Err(ErrorKind::Protocol);
        }
        let format = body.get_u8();
        let partition = body.get_u16();
        let uuid = body.get_u64();
        let persisted_seqno = body.get_u64();
        let current_seqno = body.get_u64();
        let failover = match format {
            0 => None,
            1 if body.len() >= Self::FAILOVER_LEN - Self::BASE_LEN => {
                Some((body.get_u64(), body.get_u64()))
            }
            _ => return Err(ErrorKind::Protocol),
        };
        Ok(Self {
            server,
            partition,
            uuid,
            persisted_seqno,
            current_seqno,
            failover,
        })
    }

    /// Encodes the response body as a node would send it.
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(Self::FAILOVER_LEN);
        out.put_u8(u8::from(self.failover.is_some()));
        out.put_u16(self.partition);
        out.put_u64(self.uuid);
        out.put_u64(self.persisted_seqno);
        out.put_u64(self.current_seqno);
        if let Some((old_uuid, old_seqno)) = self.failover {
            out.put_u64(old_uuid);
            out.put_u64(old_seqno);
        }
        out.freeze()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Get {
        value: Bytes,
        flags: u32,
        cas: u64,
    },
    Store {
        cas: u64,
        token: Option<MutationToken>,
    },
    Remove {
        cas: u64,
        token: Option<MutationToken>,
    },
    Touch {
        cas: u64,
    },
    Counter {
        value: u64,
        cas: u64,
        token: Option<MutationToken>,
    },
    Unlock,
    /// One statistic from one node; never final.
    Stat {
        server: String,
        key: String,
        value: String,
    },
    StatsDone {
        server: String,
    },
    ObserveSeqno(SeqnoStatus),
    Noop,
    Endure(EndureReport),
    Subdoc {
        cas: u64,
        results: Vec<SubdocResult>,
        token: Option<MutationToken>,
    },
}

impl Response {
    pub fn token(&self) -> Option<MutationToken> {
        match self {
            Self::Store { token, .. }
            | Self::Remove { token, .. }
            | Self::Counter { token, .. }
            | Self::Subdoc { token, .. } => *token,
            _ => None,
        }
    }

    pub fn cas(&self) -> Option<u64> {
        match self {
            Self::Get { cas, .. }
            | Self::Store { cas, .. }
            | Self::Remove { cas, .. }
            | Self::Touch { cas }
            | Self::Counter { cas, .. }
            | Self::Subdoc { cas, .. } => Some(*cas),
            _ => None,
        }
    }
}
