use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::messages::Message;

/// What to do with an incoming request after consulting the cache.
#[derive(Debug, PartialEq, Eq)]
pub enum Disposition {
    /// First sighting, hand the request to the dispatcher.
    Process,
    /// Duplicate while the original is still being served, drop silently.
    Suppress,
    /// Duplicate of an already answered request, re-send the cached response.
    Replay(Message),
}

struct Entry {
    inserted: Instant,
    response: Option<Message>,
}

/// Time and size bounded cache of recently received message ids per remote.
/// Eviction is FIFO by insertion order, both for the capacity cap and the
/// TTL sweep.
pub struct DuplicateDetector {
    entries: HashMap<(SocketAddr, u16), Entry>,
    order: VecDeque<(SocketAddr, u16)>,
    capacity: usize,
    ttl: Duration,
}

impl DuplicateDetector {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
            ttl,
        }
    }

    pub fn observe(&mut self, remote: SocketAddr, mid: u16, now: Instant) -> Disposition {
        let key = (remote, mid);
        if let Some(entry) = self.entries.get(&key) {
            return match &entry.response {
                Some(response) => Disposition::Replay(response.clone()),
                None => Disposition::Suppress,
            };
        }
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            Entry {
                inserted: now,
                response: None,
            },
        );
        self.order.push_back(key);
        Disposition::Process
    }

    /// Overwrite the pending sentinel with the response actually sent, error
    /// responses and resets included.
    pub fn record_response(&mut self, remote: SocketAddr, mid: u16, response: Message) {
        if let Some(entry) = self.entries.get_mut(&(remote, mid)) {
            entry.response = Some(response);
        }
    }

    /// Drop entries older than the TTL. Driven by the endpoint tick.
    pub fn sweep(&mut self, now: Instant) {
        while let Some(key) = self.order.front() {
            match self.entries.get(key) {
                Some(entry) if now.duration_since(entry.inserted) >= self.ttl => {
                    self.entries.remove(key);
                    self.order.pop_front();
                }
                Some(_) => break,
                None => {
                    self.order.pop_front();
                }
            }
        }
    }

    fn evict_oldest(&mut self) {
        while let Some(key) = self.order.pop_front() {
            if self.entries.remove(&key).is_some() {
                log::trace!("duplicate cache full, evicting mid:{:#06x}", key.1);
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Method, Status};

    fn remote(n: u8) -> SocketAddr {
        format!("10.0.0.{}:5683", n).parse().unwrap()
    }

    fn response(mid: u16) -> Message {
        let mut req = Message::request(remote(1), Method::Get, "/x");
        req.mid = mid;
        req.response(Status::Content)
    }

    #[test]
    fn miss_then_suppress_then_replay() {
        let mut detector = DuplicateDetector::new(16, Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(detector.observe(remote(1), 7, now), Disposition::Process);
        assert_eq!(detector.observe(remote(1), 7, now), Disposition::Suppress);
        detector.record_response(remote(1), 7, response(7));
        match detector.observe(remote(1), 7, now) {
            Disposition::Replay(r) => assert_eq!(r.mid, 7),
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn distinct_remotes_do_not_collide() {
        let mut detector = DuplicateDetector::new(16, Duration::from_secs(30));
        let now = Instant::now();
        assert_eq!(detector.observe(remote(1), 7, now), Disposition::Process);
        assert_eq!(detector.observe(remote(2), 7, now), Disposition::Process);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut detector = DuplicateDetector::new(2, Duration::from_secs(30));
        let now = Instant::now();
        detector.observe(remote(1), 1, now);
        detector.observe(remote(1), 2, now);
        detector.observe(remote(1), 3, now);
        assert_eq!(detector.len(), 2);
        // mid 1 was oldest and is gone, so it processes as new again
        assert_eq!(detector.observe(remote(1), 1, now), Disposition::Process);
    }

    #[test]
    fn sweep_honours_ttl() {
        let ttl = Duration::from_secs(30);
        let mut detector = DuplicateDetector::new(16, ttl);
        let start = Instant::now();
        detector.observe(remote(1), 1, start);
        detector.observe(remote(1), 2, start + Duration::from_secs(10));
        detector.sweep(start + Duration::from_secs(31));
        assert_eq!(detector.len(), 1);
        assert_eq!(
            detector.observe(remote(1), 1, start + Duration::from_secs(31)),
            Disposition::Process
        );
        detector.sweep(start + Duration::from_secs(45));
        // mid 2 expired, mid 1 was refreshed at t=31
        assert_eq!(detector.len(), 1);
    }
}
