//! A scheduled command instance and the bookkeeping that follows it across
//! pipelines, retries and remaps.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Instant;

use bytes::Bytes;

use crate::callbacks::{CallbackKind, Cookie, Handler};
use crate::command::Request;
use crate::correlation::Tracked;
use crate::error::ErrorKind;

/// How the node for a packet is chosen each time it is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Master,
    Replica(usize),
    /// A specific node index, for per-node commands.
    Server(usize),
}

/// Where the completion of a packet goes.
#[derive(Clone)]
pub enum Sink {
    /// The dispatcher's callback table.
    Table,
    /// An internal consumer, such as a durability poll.
    Private(Handler),
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Table => f.write_str("Table"),
            Self::Private(_) => f.write_str("Private"),
        }
    }
}

/// Shared state of a command broadcast to several nodes. The final callback
/// fires when the last member finishes.
#[derive(Debug)]
pub struct StreamGroup {
    remaining: Cell<usize>,
    first_error: Cell<Option<ErrorKind>>,
    max_retries: Cell<u32>,
    last_server: RefCell<String>,
}

impl StreamGroup {
    pub fn new(members: usize) -> Rc<Self> {
        Rc::new(Self {
            remaining: Cell::new(members),
            first_error: Cell::new(None),
            max_retries: Cell::new(0),
            last_server: RefCell::new(String::new()),
        })
    }

    /// Marks one member finished. Returns the group outcome once all are.
    pub fn finish_member(
        &self,
        server: &str,
        error: Option<ErrorKind>,
        retries: u32,
    ) -> Option<GroupOutcome> {
        if self.first_error.get().is_none() {
            self.first_error.set(error);
        }
        self.max_retries.set(self.max_retries.get().max(retries));
        *self.last_server.borrow_mut() = server.to_string();
        let remaining = self.remaining.get().saturating_sub(1);
        self.remaining.set(remaining);
        (remaining == 0).then(|| GroupOutcome {
            error: self.first_error.get(),
            retries: self.max_retries.get(),
            server: self.last_server.borrow().clone(),
        })
    }

    pub fn remaining(&self) -> usize {
        self.remaining.get()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupOutcome {
    pub error: Option<ErrorKind>,
    pub retries: u32,
    pub server: String,
}

#[derive(Debug)]
pub struct Packet {
    /// Correlation id on the pipeline currently holding the packet; 0 while unrouted.
    pub opaque: u32,
    pub request: Request,
    pub partition: u16,
    pub target: Target,
    /// Node index in the topology generation the packet was routed under.
    pub node: usize,
    pub generation: u64,
    /// Set once at submission and kept across retries.
    pub submitted_at: Instant,
    pub deadline: Instant,
    pub retries: u32,
    /// First error that sent the packet back for another attempt.
    pub last_error: Option<ErrorKind>,
    /// Whether the current attempt's bytes were handed to the transport.
    pub flushed: bool,
    pub cookie: Cookie,
    pub sink: Sink,
    pub stream: Option<Rc<StreamGroup>>,
    encoded: Option<Bytes>,
}

impl Packet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        request: Request,
        partition: u16,
        target: Target,
        node: usize,
        generation: u64,
        submitted_at: Instant,
        deadline: Instant,
        cookie: Cookie,
        sink: Sink,
    ) -> Self {
        Self {
            opaque: 0,
            request,
            partition,
            target,
            node,
            generation,
            submitted_at,
            deadline,
            retries: 0,
            last_error: None,
            flushed: false,
            cookie,
            sink,
            stream: None,
            encoded: None,
        }
    }

    pub fn kind(&self) -> CallbackKind {
        self.request.command.kind()
    }

    pub fn key(&self) -> Option<&Bytes> {
        self.request.command.key()
    }

    /// Encodes the packet under correlation id `opaque`.
    pub fn assign(&mut self, opaque: u32) {
        self.opaque = opaque;
        self.flushed = false;
        self.encoded = Some(
            self.request
                .command
                .to_frame(self.partition)
                .with_opaque(opaque)
                .encode(),
        );
    }

    pub fn encoded(&self) -> Option<&Bytes> {
        self.encoded.as_ref()
    }

    /// Clears everything tied to the pipeline the packet last sat on so it can
    /// be routed again.
    pub fn renew(&mut self) {
        self.opaque = 0;
        self.flushed = false;
        self.encoded = None;
    }

    /// Notes a retry triggered by `kind`, keeping the first cause.
    pub fn record_retry(&mut self, kind: ErrorKind) {
        self.last_error.get_or_insert(kind);
        self.retries += 1;
    }

    /// Error to report when the packet runs out of time.
    pub fn timeout_error(&self) -> ErrorKind {
        self.last_error.unwrap_or(ErrorKind::Timeout)
    }
}

impl Tracked for Packet {
    fn deadline(&self) -> Instant {
        self.deadline
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn assign_encodes_with_correlation_id() {
        let now = Instant::now();
        let mut packet = Packet::new(
            Request::get("k"),
            3,
            Target::Master,
            0,
            1,
            now,
            now + Duration::from_secs(1),
            Cookie(1),
            Sink::Table,
        );
        packet.assign(77);
        let bytes = packet.encoded().expect("encoded").clone();
        assert_eq!(&bytes[12..16], &77u32.to_be_bytes());
        assert_eq!(&bytes[6..8], &3u16.to_be_bytes());

        packet.renew();
        assert!(packet.encoded().is_none());
        assert_eq!(packet.opaque, 0);
    }

    #[test]
    fn first_retry_cause_is_kept() {
        let now = Instant::now();
        let mut packet = Packet::new(
            Request::get("k"),
            0,
            Target::Master,
            0,
            1,
            now,
            now,
            Cookie(0),
            Sink::Table,
        );
        assert_eq!(packet.timeout_error(), ErrorKind::Timeout);
        packet.record_retry(ErrorKind::NotMyPartition);
        packet.record_retry(ErrorKind::Network);
        assert_eq!(packet.retries, 2);
        assert_eq!(packet.timeout_error(), ErrorKind::NotMyPartition);
    }

    #[test]
    fn stream_group_reports_once_all_members_finish() {
        let group = StreamGroup::new(2);
        assert_eq!(group.finish_member("a", None, 0), None);
        let outcome = group
            .finish_member("b", Some(ErrorKind::Network), 2)
            .expect("group complete");
        assert_eq!(outcome.error, Some(ErrorKind::Network));
        assert_eq!(outcome.retries, 2);
        assert_eq!(group.remaining(), 0);
    }
}
