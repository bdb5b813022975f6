//! Retry decisions and the queue that holds packets until they may run again.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::error::ErrorKind;
use crate::packet::Packet;
use crate::settings::Settings;
use crate::topology::Distribution;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
}

impl RetryPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_retries: settings.max_retries,
            backoff_base: settings.retry_backoff_base,
            backoff_max: settings.retry_backoff_max,
        }
    }

    /// Decides whether `packet`, having failed with `error`, gets another attempt.
    ///
    /// Commands that are not idempotent are only retried when the node
    /// answered that it did not execute them: a partition it does not own, or
    /// a temporary failure. Anything that may have reached the node and been
    /// applied is reported instead.
    pub fn should_retry(
        &self,
        error: ErrorKind,
        packet: &Packet,
        distribution: Distribution,
        now: Instant,
    ) -> bool {
        if distribution == Distribution::Ketama {
            return false;
        }
        if packet.retries >= self.max_retries || now >= packet.deadline {
            return false;
        }
        if error.is_application() {
            return false;
        }
        let idempotent = packet.request.is_idempotent();
        match error {
            ErrorKind::NotMyPartition | ErrorKind::NoOwner => true,
            ErrorKind::TemporaryFailure | ErrorKind::Busy => true,
            ErrorKind::Timeout => idempotent && !packet.flushed,
            kind if kind.is_transport() => idempotent,
            _ => false,
        }
    }

    /// `min(base * 2^retries, max)`.
    pub fn backoff(&self, retries: u32) -> Duration {
        let factor = 1u32.checked_shl(retries.min(31)).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .unwrap_or(self.backoff_max)
            .min(self.backoff_max)
    }

    /// When a packet with `retries` prior attempts may run again, never past its deadline.
    pub fn not_before(&self, packet: &Packet, now: Instant) -> Instant {
        (now + self.backoff(packet.retries.saturating_sub(1))).min(packet.deadline)
    }
}

#[derive(Debug)]
pub struct RetryEntry {
    pub packet: Packet,
    pub not_before: Instant,
    pub error: ErrorKind,
}

/// Packets waiting out a backoff, ordered by release time.
#[derive(Debug, Default)]
pub struct RetryQueue {
    entries: BTreeMap<(Instant, u64), RetryEntry>,
    seq: u64,
    armed: Option<Instant>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, packet: Packet, not_before: Instant, error: ErrorKind) {
        self.seq += 1;
        self.entries.insert(
            (not_before, self.seq),
            RetryEntry {
                packet,
                not_before,
                error,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn next_release(&self) -> Option<Instant> {
        self.entries.keys().next().map(|(at, _)| *at)
    }

    /// Removes every entry whose release time has come.
    pub fn take_due(&mut self, now: Instant) -> Vec<RetryEntry> {
        let mut due = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    }

    pub fn drain(&mut self) -> Vec<RetryEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    /// Records what the retry timer is armed for. Returns the new deadline if
    /// it differs from the armed one.
    pub fn update_armed(&mut self) -> Option<Option<Instant>> {
        let next = self.next_release();
        if next == self.armed {
            return None;
        }
        self.armed = next;
        Some(next)
    }

    pub fn timer_fired(&mut self) {
        self.armed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::Cookie;
    use crate::command::Request;
    use crate::packet::{Sink, Target};

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            backoff_base: Duration::from_millis(10),
            backoff_max: Duration::from_millis(50),
        }
    }

    fn packet(request: Request, flushed: bool) -> Packet {
        let now = Instant::now();
        let mut packet = Packet::new(
            request,
            0,
            Target::Master,
            0,
            1,
            now,
            now + Duration::from_secs(2),
            Cookie(0),
            Sink::Table,
        );
        packet.flushed = flushed;
        packet
    }

    #[test]
    fn reads_retry_on_transport_errors_writes_do_not() {
        let now = Instant::now();
        let get = packet(Request::get("k"), true);
        let set = packet(Request::upsert("k", "v"), true);
        let p = policy();

        assert!(p.should_retry(ErrorKind::Network, &get, Distribution::Partitioned, now));
        assert!(!p.should_retry(ErrorKind::Network, &set, Distribution::Partitioned, now));
        assert!(p.should_retry(ErrorKind::NotMyPartition, &set, Distribution::Partitioned, now));
        assert!(p.should_retry(ErrorKind::TemporaryFailure, &set, Distribution::Partitioned, now));
        assert!(!p.should_retry(ErrorKind::KeyNotFound, &get, Distribution::Partitioned, now));
        assert!(!p.should_retry(ErrorKind::ServerOutOfMemory, &get, Distribution::Partitioned, now));

        let safe = packet(Request::upsert("k", "v").retry_safe(), true);
        assert!(p.should_retry(ErrorKind::Network, &safe, Distribution::Partitioned, now));
    }

    #[test]
    fn budget_deadline_and_ketama_stop_retries() {
        let p = policy();
        let mut get = packet(Request::get("k"), false);
        let now = Instant::now();
        assert!(!p.should_retry(ErrorKind::NotMyPartition, &get, Distribution::Ketama, now));
        assert!(!p.should_retry(ErrorKind::NotMyPartition, &get, Distribution::Partitioned, get.deadline));
        get.retries = 3;
        assert!(!p.should_retry(ErrorKind::NotMyPartition, &get, Distribution::Partitioned, now));
    }

    #[test]
    fn backoff_doubles_up_to_cap() {
        let p = policy();
        assert_eq!(p.backoff(0), Duration::from_millis(10));
        assert_eq!(p.backoff(1), Duration::from_millis(20));
        assert_eq!(p.backoff(2), Duration::from_millis(40));
        assert_eq!(p.backoff(3), Duration::from_millis(50));
        assert_eq!(p.backoff(40), Duration::from_millis(50));
    }

    #[test]
    fn not_before_never_passes_deadline() {
        let p = RetryPolicy {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(10),
            ..policy()
        };
        let get = packet(Request::get("k"), false);
        assert_eq!(p.not_before(&get, get.submitted_at), get.deadline);
    }

    #[test]
    fn queue_releases_in_time_order() {
        let base = Instant::now();
        let mut queue = RetryQueue::new();
        queue.push(packet(Request::get("b"), false), base + Duration::from_millis(20), ErrorKind::Busy);
        queue.push(packet(Request::get("a"), false), base + Duration::from_millis(10), ErrorKind::Busy);
        queue.push(packet(Request::get("c"), false), base + Duration::from_millis(30), ErrorKind::Busy);

        assert_eq!(queue.update_armed(), Some(Some(base + Duration::from_millis(10))));
        assert_eq!(queue.update_armed(), None);

        let due = queue.take_due(base + Duration::from_millis(20));
        let keys: Vec<_> = due
            .iter()
            .filter_map(|entry| entry.packet.key().cloned())
            .collect();
        assert_eq!(keys, vec!["a", "b"]);
        assert_eq!(queue.len(), 1);
    }
}
