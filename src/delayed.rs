use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::time::{Duration, Instant};

use crate::messages::Message;
use crate::transaction::Transaction;

struct Delayed {
    trans: Transaction,
    deadline: Instant,
}

/// Requests whose peer answered with an empty ACK and will respond in a
/// separate message, correlated by token and remote. Also used to correlate
/// responses to non-confirmable requests.
pub struct DelayedTransactionManager {
    map: HashMap<(SocketAddr, Vec<u8>), Delayed>,
    timeout: Duration,
}

impl DelayedTransactionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            map: HashMap::new(),
            timeout,
        }
    }

    pub fn insert(&mut self, trans: Transaction, now: Instant) {
        let key = (trans.message.remote, trans.message.token.clone());
        log::trace!(
            "awaiting separate response from {} token:{}",
            key.0,
            hex::encode(&key.1)
        );
        if let Some(replaced) = self.map.insert(
            key,
            Delayed {
                trans,
                deadline: now + self.timeout,
            },
        ) {
            log::debug!(
                "token {} reused while a delayed transaction was pending",
                hex::encode(&replaced.trans.message.token)
            );
            replaced.trans.complete(Err(crate::error::CoapError::Timeout));
        }
    }

    pub fn remove_match(&mut self, response: &Message) -> Option<Transaction> {
        if response.token.is_empty() {
            return None;
        }
        self.map
            .remove(&(response.remote, response.token.clone()))
            .map(|d| d.trans)
    }

    /// Transactions whose separate-response window elapsed, removed.
    pub fn expired(&mut self, now: Instant) -> Vec<Transaction> {
        let keys: Vec<_> = self
            .map
            .iter()
            .filter(|(_, d)| now >= d.deadline)
            .map(|(k, _)| k.clone())
            .collect();
        keys.into_iter()
            .filter_map(|k| self.map.remove(&k))
            .map(|d| d.trans)
            .collect()
    }

    pub fn drain(&mut self) -> Vec<Transaction> {
        self.map.drain().map(|(_, d)| d.trans).collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransmissionParams;
    use crate::messages::{Method, Status};
    use crate::transaction::Priority;
    use crate::transport::TransportContext;

    fn remote(n: u8) -> SocketAddr {
        format!("10.0.0.{}:5683", n).parse().unwrap()
    }

    fn transaction(remote_n: u8, token: Vec<u8>) -> Transaction {
        let message = Message::request(remote(remote_n), Method::Get, "/slow").with_token(token);
        Transaction::new(
            message,
            TransportContext::default(),
            Priority::Normal,
            &TransmissionParams::default(),
            Box::new(|_| {}),
        )
    }

    #[test]
    fn separate_response_matches_by_token_and_remote() {
        let mut delayed = DelayedTransactionManager::new(Duration::from_secs(120));
        let now = Instant::now();
        delayed.insert(transaction(1, vec![0x02]), now);

        let mut wrong_remote = Message::request(remote(2), Method::Get, "/slow")
            .response(Status::Content);
        wrong_remote.token = vec![0x02];
        assert!(delayed.remove_match(&wrong_remote).is_none());

        let mut response = Message::request(remote(1), Method::Get, "/slow")
            .response(Status::Content);
        response.token = vec![0x02];
        let found = delayed.remove_match(&response).unwrap();
        assert_eq!(found.message.token, vec![0x02]);
        assert!(delayed.is_empty());
    }

    #[test]
    fn empty_token_never_matches() {
        let mut delayed = DelayedTransactionManager::new(Duration::from_secs(120));
        delayed.insert(transaction(1, vec![0x02]), Instant::now());
        let response = Message::request(remote(1), Method::Get, "/slow")
            .response(Status::Content);
        assert!(delayed.remove_match(&response).is_none());
    }

    #[test]
    fn expiry_removes_and_returns() {
        let mut delayed = DelayedTransactionManager::new(Duration::from_secs(120));
        let start = Instant::now();
        delayed.insert(transaction(1, vec![1]), start);
        delayed.insert(transaction(1, vec![2]), start + Duration::from_secs(60));
        assert!(delayed.expired(start + Duration::from_secs(119)).is_empty());
        let expired = delayed.expired(start + Duration::from_secs(120));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].message.token, vec![1]);
        assert_eq!(delayed.len(), 1);
    }
}
