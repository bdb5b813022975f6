//! Durability polling built on observe-seqno.
//!
//! An endure request takes the mutation tokens returned by earlier writes and
//! polls every node holding a copy of each partition until enough of them
//! report the sequence number as replicated and persisted. Polls go through
//! the normal submission path, so they are routed, retried and timed out like
//! any other command.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::callbacks::{CallbackKind, Completion, Cookie};
use crate::command::{Command, MutationToken, Request, Response, SeqnoStatus};
use crate::dispatch::Dispatcher;
use crate::error::{ErrorKind, OpError, SchedError};
use crate::io::TimerId;
use crate::packet::Sink;
use crate::topology::Distribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DurabilityOptions {
    /// Copies that must be on disk, the master included.
    pub persist_to: usize,
    /// Replicas that must hold the mutation in memory.
    pub replicate_to: usize,
    /// Overrides `Settings::durability_interval`.
    pub interval: Option<Duration>,
    /// Overrides `Settings::durability_timeout`.
    pub timeout: Option<Duration>,
}

impl DurabilityOptions {
    pub fn new(persist_to: usize, replicate_to: usize) -> Self {
        Self {
            persist_to,
            replicate_to,
            ..Self::default()
        }
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Outcome for one token, delivered with [`CallbackKind::Endure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndureReport {
    pub token: MutationToken,
    /// Nodes that reported the mutation persisted.
    pub persisted: usize,
    /// Replicas that reported the mutation in memory.
    pub replicated: usize,
}

#[derive(Debug)]
struct Entry {
    key: Bytes,
    token: MutationToken,
    persisted: BTreeSet<usize>,
    replicated: BTreeSet<usize>,
    last_error: Option<ErrorKind>,
    lost: bool,
    done: bool,
}

impl Entry {
    fn report(&self) -> EndureReport {
        EndureReport {
            token: self.token,
            persisted: self.persisted.len(),
            replicated: self.replicated.len(),
        }
    }

    fn satisfied(&self, options: &DurabilityOptions) -> bool {
        self.persisted.len() >= options.persist_to && self.replicated.len() >= options.replicate_to
    }
}

#[derive(Debug)]
struct DurabilitySet {
    cookie: Cookie,
    options: DurabilityOptions,
    interval: Duration,
    deadline: Instant,
    entries: Vec<Entry>,
    /// Poll responses still outstanding in the current round.
    waiting: usize,
    /// The round timer is armed and no poll is in flight.
    idle: bool,
}

impl DurabilitySet {
    fn remaining(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.done).count()
    }
}

/// All endure requests of one dispatcher.
#[derive(Debug, Default)]
pub struct DurabilityTable {
    sets: HashMap<u64, DurabilitySet>,
    next_id: u64,
}

impl DurabilityTable {
    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Forgets every request, returning their ids.
    pub fn drain(&mut self) -> Vec<u64> {
        self.sets.drain().map(|(id, _)| id).collect()
    }
}

impl Dispatcher {
    /// Waits for `items` to reach the durability described by `options`.
    ///
    /// Each item is the key a mutation was made on plus the token it returned.
    /// One [`CallbackKind::Endure`] completion is delivered per item. Returns
    /// the id of the request.
    pub fn endure(
        &mut self,
        items: Vec<(Bytes, MutationToken)>,
        options: DurabilityOptions,
        cookie: Cookie,
    ) -> Result<u64, SchedError> {
        if self.is_destroyed() {
            return Err(SchedError::ShuttingDown);
        }
        if items.is_empty() {
            return Err(SchedError::NoMutationTokens);
        }
        let topo = self.topology.clone().ok_or(SchedError::NoTopology)?;
        if topo.distribution() == Distribution::Ketama {
            return Err(SchedError::NotSupported);
        }
        let replicas = topo.num_replicas();
        if options.persist_to > replicas + 1 || options.replicate_to > replicas {
            return Err(SchedError::DurabilityTooDemanding { replicas });
        }
        if let Some((_, token)) = items
            .iter()
            .find(|(_, token)| usize::from(token.partition) >= topo.num_partitions())
        {
            return Err(SchedError::NoOwner {
                partition: token.partition,
            });
        }

        let now = self.io.now();
        let interval = options.interval.unwrap_or(self.settings.durability_interval);
        let timeout = options.timeout.unwrap_or(self.settings.durability_timeout);
        let entries = items
            .into_iter()
            .map(|(key, token)| Entry {
                key,
                token,
                persisted: BTreeSet::new(),
                replicated: BTreeSet::new(),
                last_error: None,
                lost: false,
                done: false,
            })
            .collect::<Vec<_>>();

        self.durability.next_id += 1;
        let id = self.durability.next_id;
        debug!(
            set = id,
            items = entries.len(),
            persist_to = options.persist_to,
            replicate_to = options.replicate_to,
            "endure requested"
        );
        self.durability.sets.insert(
            id,
            DurabilitySet {
                cookie,
                options,
                interval,
                deadline: now + timeout,
                entries,
                waiting: 0,
                idle: true,
            },
        );
        self.io.arm_timer(TimerId::Durability(id), now);
        Ok(id)
    }

    pub(crate) fn durability_timer(&mut self, id: u64) {
        let now = self.io.now();
        let Some(set) = self.durability.sets.get_mut(&id) else {
            return;
        };
        if now >= set.deadline {
            self.finish_remaining(id, ErrorKind::Timeout);
            return;
        }
        if set.idle {
            self.poll_round(id);
        }
    }

    /// Sends one observe-seqno per node holding a copy of every unfinished item.
    fn poll_round(&mut self, id: u64) {
        let Some(topo) = self.topology.clone() else {
            return;
        };
        let Some(set) = self.durability.sets.get_mut(&id) else {
            return;
        };
        set.idle = false;
        let targets: Vec<(usize, MutationToken, Vec<(usize, bool)>)> = set
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| !entry.done)
            .map(|(index, entry)| {
                let servers = topo
                    .owners(entry.token.partition)
                    .iter()
                    .enumerate()
                    .filter_map(|(position, owner)| owner.map(|node| (node, position == 0)))
                    .collect();
                (index, entry.token, servers)
            })
            .collect();

        let mut sent = 0;
        let opened = self.sched_enter().is_ok();
        for (entry, token, servers) in targets {
            for (server, is_master) in servers {
                let handler = Rc::new(move |d: &mut Dispatcher, completion: Completion| {
                    d.on_seqno(id, entry, is_master, completion);
                });
                let request = Request::new(Command::ObserveSeqno {
                    server,
                    partition: token.partition,
                    uuid: token.uuid,
                });
                match self.submit_with(request, Cookie(id), Sink::Private(handler)) {
                    Ok(_) => sent += 1,
                    Err(err) => warn!(set = id, server, error = %err, "observe-seqno not scheduled"),
                }
            }
        }
        if opened {
            if let Err(err) = self.sched_leave() {
                warn!(set = id, error = %err, "durability poll not queued");
            }
        }

        if let Some(set) = self.durability.sets.get_mut(&id) {
            set.waiting += sent;
            let deadline = set.deadline;
            self.io.arm_timer(TimerId::Durability(id), deadline);
        }
        if sent == 0 {
            self.end_round(id);
        }
    }

    fn on_seqno(&mut self, id: u64, index: usize, is_master: bool, completion: Completion) {
        let Some(set) = self.durability.sets.get_mut(&id) else {
            return;
        };
        set.waiting = set.waiting.saturating_sub(1);
        if let Some(entry) = set.entries.get_mut(index) {
            match completion.result {
                Ok(Response::ObserveSeqno(status)) => apply_seqno(entry, &status, is_master),
                Ok(_) => entry.last_error = Some(ErrorKind::Protocol),
                Err(OpError { kind, .. }) => entry.last_error = Some(kind),
            }
        }
        if set.waiting == 0 {
            self.end_round(id);
        }
    }

    /// Delivers finished items and schedules the next round.
    fn end_round(&mut self, id: u64) {
        let now = self.io.now();
        let Some(set) = self.durability.sets.get_mut(&id) else {
            return;
        };
        let cookie = set.cookie;
        let options = set.options;
        let mut finished = Vec::new();
        for entry in set.entries.iter_mut().filter(|entry| !entry.done) {
            if entry.lost {
                entry.done = true;
                finished.push((entry.key.clone(), Err(ErrorKind::MutationLost)));
            } else if entry.satisfied(&options) {
                entry.done = true;
                finished.push((entry.key.clone(), Ok(entry.report())));
            }
        }
        let remaining = set.remaining();
        let next = (now + set.interval).min(set.deadline);
        set.idle = true;

        for (key, result) in finished {
            self.deliver_endure(cookie, key, result);
        }
        if remaining == 0 {
            debug!(set = id, "endure complete");
            self.durability.sets.remove(&id);
            self.io.cancel_timer(TimerId::Durability(id));
        } else if self.durability.sets.contains_key(&id) {
            self.io.arm_timer(TimerId::Durability(id), next);
        }
    }

    fn finish_remaining(&mut self, id: u64, default: ErrorKind) {
        let Some(set) = self.durability.sets.remove(&id) else {
            return;
        };
        debug!(set = id, remaining = set.remaining(), "endure timed out");
        for entry in set.entries.into_iter().filter(|entry| !entry.done) {
            let kind = if entry.lost {
                ErrorKind::MutationLost
            } else {
                entry.last_error.unwrap_or(default)
            };
            self.deliver_endure(set.cookie, entry.key, Err(kind));
        }
    }

    fn deliver_endure(&mut self, cookie: Cookie, key: Bytes, result: Result<EndureReport, ErrorKind>) {
        let completion = Completion {
            cookie,
            kind: CallbackKind::Endure,
            key: Some(key),
            result: result
                .map(Response::Endure)
                .map_err(|kind| OpError { kind, retries: 0 }),
            retries: 0,
            is_final: true,
        };
        self.invoke(&Sink::Table, completion);
    }
}

fn apply_seqno(entry: &mut Entry, status: &SeqnoStatus, is_master: bool) {
    let (in_memory, on_disk) = match status.failover {
        Some((_, last_seqno)) => {
            if last_seqno < entry.token.seqno {
                entry.lost = true;
                return;
            }
            (last_seqno, last_seqno)
        }
        None => (status.current_seqno, status.persisted_seqno),
    };
    if in_memory < entry.token.seqno {
        return;
    }
    if !is_master {
        entry.replicated.insert(status.server);
    }
    if on_disk >= entry.token.seqno {
        entry.persisted.insert(status.server);
    }
}
