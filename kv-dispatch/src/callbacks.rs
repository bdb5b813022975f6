//! Completion delivery.
//!
//! Every command kind has a slot in the [`CallbackTable`]. Slots left empty
//! fall back to the table's default handler; the fallback is resolved when a
//! handler is installed, never at delivery time.

use std::fmt;
use std::rc::Rc;

use bytes::Bytes;

use crate::command::Response;
use crate::dispatch::Dispatcher;
use crate::error::OpError;

const KIND_COUNT: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Get,
    GetReplica,
    Store,
    Remove,
    Touch,
    Counter,
    Unlock,
    Stats,
    ObserveSeqno,
    Noop,
    Endure,
    Subdoc,
}

impl CallbackKind {
    pub const ALL: [CallbackKind; KIND_COUNT] = [
        Self::Get,
        Self::GetReplica,
        Self::Store,
        Self::Remove,
        Self::Touch,
        Self::Counter,
        Self::Unlock,
        Self::Stats,
        Self::ObserveSeqno,
        Self::Noop,
        Self::Endure,
        Self::Subdoc,
    ];

    fn slot(self) -> usize {
        self as usize
    }
}

/// Opaque caller value echoed back with every completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Cookie(pub u64);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub cookie: Cookie,
    pub kind: CallbackKind,
    pub key: Option<Bytes>,
    pub result: Result<Response, OpError>,
    pub retries: u32,
    /// False only for intermediate entries of a streaming command.
    pub is_final: bool,
}

/// Callbacks receive the dispatcher so they can schedule follow-up work or
/// request a breakout from `wait`.
pub type Handler = Rc<dyn Fn(&mut Dispatcher, Completion)>;

pub struct CallbackTable {
    default: Handler,
    installed: [Option<Handler>; KIND_COUNT],
    resolved: [Handler; KIND_COUNT],
}

impl CallbackTable {
    pub fn new(default: Handler) -> Self {
        Self {
            resolved: std::array::from_fn(|_| Rc::clone(&default)),
            installed: std::array::from_fn(|_| None),
            default,
        }
    }

    /// Installs `handler` for `kind`, returning whatever was installed before.
    pub fn install(&mut self, kind: CallbackKind, handler: Handler) -> Option<Handler> {
        self.resolved[kind.slot()] = Rc::clone(&handler);
        self.installed[kind.slot()].replace(handler)
    }

    pub fn uninstall(&mut self, kind: CallbackKind) -> Option<Handler> {
        self.resolved[kind.slot()] = Rc::clone(&self.default);
        self.installed[kind.slot()].take()
    }

    /// Replaces the fallback and re-resolves every empty slot.
    pub fn set_default(&mut self, handler: Handler) {
        self.default = handler;
        for kind in CallbackKind::ALL {
            if self.installed[kind.slot()].is_none() {
                self.resolved[kind.slot()] = Rc::clone(&self.default);
            }
        }
    }

    pub fn get(&self, kind: CallbackKind) -> Handler {
        Rc::clone(&self.resolved[kind.slot()])
    }
}

impl Default for CallbackTable {
    fn default() -> Self {
        Self::new(Rc::new(|_: &mut Dispatcher, completion: Completion| {
            tracing::trace!(kind = ?completion.kind, cookie = completion.cookie.0, "completion without handler");
        }))
    }
}

impl fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let installed: Vec<_> = CallbackKind::ALL
            .iter()
            .filter(|kind| self.installed[kind.slot()].is_some())
            .collect();
        f.debug_struct("CallbackTable")
            .field("installed", &installed)
            .finish()
    }
}
