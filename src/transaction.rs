use std::fmt;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::config::TransmissionParams;
use crate::error::CoapError;
use crate::messages::Message;
use crate::transport::TransportContext;

/// Completion callback of one confirmable exchange. Receives the matched
/// ACK/RST/separate response, or the error that ended the transaction.
pub type Completion = Box<dyn FnOnce(Result<Message, CoapError>) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId {
    pub remote: SocketAddr,
    pub mid: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// One outstanding confirmable exchange. After `k` transmissions the next
/// deadline sits at `start + base_timeout * 2^k`; a missed deadline with the
/// retransmit budget spent fails the transaction.
pub struct Transaction {
    pub message: Message,
    pub context: TransportContext,
    pub priority: Priority,
    attempt: u8,
    base_timeout: Duration,
    max_retransmit: u8,
    started: Option<Instant>,
    completion: Option<Completion>,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("message", &self.message)
            .field("context", &self.context)
            .field("priority", &self.priority)
            .field("attempt", &self.attempt)
            .field("base_timeout", &self.base_timeout)
            .field("max_retransmit", &self.max_retransmit)
            .field("started", &self.started)
            .field("completion", &self.completion.is_some())
            .finish()
    }
}

impl Transaction {
    pub fn new(
        message: Message,
        context: TransportContext,
        priority: Priority,
        params: &TransmissionParams,
        completion: Completion,
    ) -> Self {
        Self {
            message,
            context,
            priority,
            attempt: 0,
            base_timeout: params.initial_timeout(),
            max_retransmit: params.max_retransmit,
            started: None,
            completion: Some(completion),
        }
    }

    pub fn id(&self) -> TransactionId {
        TransactionId {
            remote: self.message.remote,
            mid: self.message.mid,
        }
    }

    /// Arm the schedule on first transmission. Later calls keep the original
    /// start so the deadlines stay anchored to it.
    pub fn mark_sent(&mut self, now: Instant) {
        if self.started.is_none() {
            self.started = Some(now);
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.started
            .map(|start| start + self.base_timeout * (1u32 << self.attempt))
    }

    pub fn overdue(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|deadline| now >= deadline)
    }

    pub fn exhausted(&self) -> bool {
        self.attempt >= self.max_retransmit
    }

    /// Count one retransmission, shifting the deadline outward.
    pub fn retransmitted(&mut self) {
        self.attempt += 1;
    }

    pub fn attempt(&self) -> u8 {
        self.attempt
    }

    /// A confirmable request may be answered by an empty ACK followed by a
    /// separate response; notifications and pings complete on the ACK itself.
    pub fn expects_separate_response(&self) -> bool {
        self.message.code.is_request()
    }

    pub fn complete(mut self, result: Result<Message, CoapError>) {
        if let Some(completion) = self.completion.take() {
            completion(result);
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // A transaction dropped without protocol completion must not strand
        // its caller.
        if let Some(completion) = self.completion.take() {
            completion(Err(CoapError::Shutdown));
        }
    }
}
