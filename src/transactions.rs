use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tokio::time::Instant;

use crate::messages::Message;
use crate::transaction::{Transaction, TransactionId};
use crate::transport::TransportContext;

#[derive(Debug, PartialEq, Eq)]
pub enum Admission {
    /// The transaction went in flight, transmit it now.
    Transmit(TransactionId),
    /// Another transaction is in flight for this remote; queued behind it.
    Queued,
}

#[derive(Default)]
struct RemoteQueue {
    in_flight: Option<Transaction>,
    /// Set between remove_and_lock and unlock_or_remove_and_next; while held,
    /// nothing is promoted for this remote.
    locked: bool,
    queue: VecDeque<Transaction>,
}

impl RemoteQueue {
    fn idle(&self) -> bool {
        self.in_flight.is_none() && !self.locked && self.queue.is_empty()
    }

    fn in_flight_id(&self) -> Option<TransactionId> {
        self.in_flight.as_ref().map(|t| t.id())
    }
}

/// Per-remote transaction queues with at most one confirmable exchange in
/// flight per remote. Promotion of the next queued transaction is gated by
/// an explicit lock so response-handler work finishes first.
pub struct TransactionManager {
    remotes: HashMap<SocketAddr, RemoteQueue>,
    queue_limit: Option<usize>,
    total: usize,
}

impl TransactionManager {
    pub fn new(queue_limit: Option<usize>) -> Self {
        Self {
            remotes: HashMap::new(),
            queue_limit,
            total: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    /// Admit a transaction. Returns the rejected transaction when the
    /// per-remote queue cap is hit and `force` is not set; the caller fails
    /// it without sending.
    pub fn enqueue(&mut self, trans: Transaction, force: bool) -> Result<Admission, Transaction> {
        let queue = self.remotes.entry(trans.message.remote).or_default();
        if queue.in_flight.is_none() && !queue.locked && queue.queue.is_empty() {
            let id = trans.id();
            queue.in_flight = Some(trans);
            self.total += 1;
            return Ok(Admission::Transmit(id));
        }
        if let Some(limit) = self.queue_limit {
            if !force && queue.queue.len() >= limit {
                log::debug!(
                    "queue for {} full ({} pending), rejecting mid:{:#06x}",
                    trans.message.remote,
                    queue.queue.len(),
                    trans.message.mid
                );
                return Err(trans);
            }
        }
        // Higher priority ahead, FIFO within a priority.
        let position = queue
            .queue
            .iter()
            .position(|t| t.priority < trans.priority)
            .unwrap_or(queue.queue.len());
        queue.queue.insert(position, trans);
        self.total += 1;
        Ok(Admission::Queued)
    }

    /// Record the (first) transmission and return what goes on the wire.
    pub fn mark_sent(&mut self, id: TransactionId, now: Instant) -> Option<(Message, TransportContext)> {
        let queue = self.remotes.get_mut(&id.remote)?;
        let trans = queue.in_flight.as_mut().filter(|t| t.id() == id)?;
        trans.mark_sent(now);
        Some((trans.message.clone(), trans.context.clone()))
    }

    /// Atomically take the in-flight transaction matching `id`, keeping its
    /// remote locked so no queued transaction is promoted until
    /// `unlock_or_remove_and_next` runs.
    pub fn remove_and_lock(&mut self, id: TransactionId) -> Option<Transaction> {
        let queue = self.remotes.get_mut(&id.remote)?;
        if queue.in_flight_id() != Some(id) {
            return None;
        }
        queue.locked = true;
        self.total -= 1;
        queue.in_flight.take()
    }

    /// Match a separate response against the in-flight request by token and
    /// remote (the peer chose not to piggyback). Leaves the remote locked
    /// like `remove_and_lock`.
    pub fn remove_for_separate_response(&mut self, response: &Message) -> Option<Transaction> {
        if response.token.is_empty() {
            return None;
        }
        let queue = self.remotes.get_mut(&response.remote)?;
        let matches = queue
            .in_flight
            .as_ref()
            .is_some_and(|t| t.expects_separate_response() && t.message.token == response.token);
        if !matches {
            return None;
        }
        queue.locked = true;
        self.total -= 1;
        queue.in_flight.take()
    }

    /// Release the dispatch lock for `id` (removing it should it still be in
    /// flight) and promote the next queued transaction for that remote.
    pub fn unlock_or_remove_and_next(&mut self, id: TransactionId) -> Option<TransactionId> {
        let queue = self.remotes.get_mut(&id.remote)?;
        queue.locked = false;
        if queue.in_flight_id() == Some(id) {
            queue.in_flight = None;
            self.total -= 1;
        }
        let mut next = None;
        if queue.in_flight.is_none() {
            if let Some(trans) = queue.queue.pop_front() {
                next = Some(trans.id());
                queue.in_flight = Some(trans);
            }
        }
        if queue.idle() {
            self.remotes.remove(&id.remote);
        }
        next
    }

    /// In-flight transactions whose retransmission deadline has passed.
    pub fn timed_out(&self, now: Instant) -> Vec<TransactionId> {
        self.remotes
            .values()
            .filter_map(|q| q.in_flight.as_ref())
            .filter(|t| t.overdue(now))
            .map(|t| t.id())
            .collect()
    }

    pub fn is_exhausted(&self, id: TransactionId) -> bool {
        self.remotes
            .get(&id.remote)
            .and_then(|q| q.in_flight.as_ref())
            .filter(|t| t.id() == id)
            .is_some_and(|t| t.exhausted())
    }

    /// Count one retransmission and return what goes on the wire again.
    pub fn retransmit(&mut self, id: TransactionId) -> Option<(Message, TransportContext)> {
        let queue = self.remotes.get_mut(&id.remote)?;
        let trans = queue.in_flight.as_mut().filter(|t| t.id() == id)?;
        trans.retransmitted();
        log::trace!(
            "retransmit mid:{:#06x} to {} attempt:{}",
            id.mid,
            id.remote,
            trans.attempt()
        );
        Some((trans.message.clone(), trans.context.clone()))
    }

    pub fn has_in_flight(&self, remote: SocketAddr) -> bool {
        self.remotes
            .get(&remote)
            .is_some_and(|q| q.in_flight.is_some())
    }

    /// Take everything, in-flight and queued, for terminal failure.
    pub fn drain(&mut self) -> Vec<Transaction> {
        let mut out = Vec::new();
        for (_, mut queue) in self.remotes.drain() {
            if let Some(trans) = queue.in_flight.take() {
                out.push(trans);
            }
            out.extend(queue.queue.drain(..));
        }
        self.total = 0;
        out
    }
}
