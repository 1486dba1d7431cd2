//! Outstanding request tracking, retransmission backoff and the
//! response cache deduplicating retransmitted peer requests

use std::collections::HashMap;
use std::time::Duration;

use ikewire::defs::params::ExchangeType;
use rand::Rng;

/// First retransmission delay
pub const RETRANSMIT_BASE: Duration = Duration::from_secs(2);
/// Backoff multiplier per attempt
pub const RETRANSMIT_FACTOR: u32 = 2;
/// Ceiling for a single retransmission delay
pub const RETRANSMIT_CAP: Duration = Duration::from_secs(64);
/// Attempts before the SA is closed with reason "no response"
pub const RETRANSMIT_TRIES: u32 = 6;

/// One request we sent and still await the response for
#[derive(Debug, Clone)]
pub struct PendingRequest {
    /// Message id of the request
    pub message_id: u32,
    /// The complete datagrams, resent verbatim; a fragmented request
    /// retransmits every fragment
    pub datagrams: Vec<Vec<u8>>,
    /// Exchange type, for logging and resumption dispatch
    pub exchange: ExchangeType,
    /// Transmissions so far, the initial send included
    pub attempts: u32,
}

impl PendingRequest {
    /// Exponential backoff with jitter for the next retransmission
    pub fn next_delay(&self) -> Duration {
        let exp = RETRANSMIT_FACTOR.saturating_pow(self.attempts.saturating_sub(1));
        let base = RETRANSMIT_BASE.saturating_mul(exp).min(RETRANSMIT_CAP);
        // up to a quarter of jitter keeps synchronized peers apart
        let jitter = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4);
        base + Duration::from_millis(jitter)
    }

    /// Whether the bounded attempt count is used up
    pub fn exhausted(&self) -> bool {
        self.attempts >= RETRANSMIT_TRIES
    }
}

/// The ordered queue of outstanding requests of one SA
///
/// Entries leave the queue when their response arrives or when a delete
/// cancels the whole SA. Per entry exactly one retransmission timer is
/// armed by the engine, keyed by the message id.
#[derive(Debug, Default)]
pub struct RetransmitQueue {
    pending: Vec<PendingRequest>,
}

impl RetransmitQueue {
    /// Track a freshly sent request
    pub fn push(&mut self, request: PendingRequest) {
        self.pending.push(request);
    }

    /// Number of requests in flight
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no request is outstanding
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// The response for `message_id` arrived; forget the request
    pub fn acknowledge(&mut self, message_id: u32) -> Option<PendingRequest> {
        let position = self
            .pending
            .iter()
            .position(|r| r.message_id == message_id)?;
        Some(self.pending.remove(position))
    }

    /// Access a pending request for retransmission bookkeeping
    pub fn get_mut(&mut self, message_id: u32) -> Option<&mut PendingRequest> {
        self.pending.iter_mut().find(|r| r.message_id == message_id)
    }

    /// Drop every pending request, for SA teardown
    pub fn clear(&mut self) -> usize {
        let flushed = self.pending.len();
        self.pending.clear();
        flushed
    }
}

/// Cached responses keyed by message id
///
/// A duplicate request from the peer is answered from this cache instead
/// of re-executing the exchange. Entries below the peer's send window
/// are pruned. A fragmented response is cached as its datagram list.
#[derive(Debug, Default)]
pub struct ResponseCache {
    responses: HashMap<u32, Vec<Vec<u8>>>,
}

impl ResponseCache {
    /// Remember the response sent for `message_id`
    pub fn insert(&mut self, message_id: u32, datagrams: Vec<Vec<u8>>) {
        self.responses.insert(message_id, datagrams);
    }

    /// The cached response for a duplicate request, if any
    pub fn get(&self, message_id: u32) -> Option<&Vec<Vec<u8>>> {
        self.responses.get(&message_id)
    }

    /// Drop entries no retransmission can reference anymore
    pub fn prune_below(&mut self, lowest_live_id: u32) {
        self.responses.retain(|id, _| *id >= lowest_live_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(message_id: u32, attempts: u32) -> PendingRequest {
        PendingRequest {
            message_id,
            datagrams: vec![vec![0; 8]],
            exchange: ExchangeType::Informational,
            attempts,
        }
    }

    #[test]
    fn backoff_grows_and_caps() {
        let mut previous = Duration::ZERO;
        for attempts in 1..=4 {
            let delay = request(0, attempts).next_delay();
            assert!(delay >= previous);
            previous = RETRANSMIT_BASE * RETRANSMIT_FACTOR.pow(attempts - 1);
        }
        // far beyond the cap the delay stays bounded (cap plus jitter)
        let delay = request(0, 20).next_delay();
        assert!(delay <= RETRANSMIT_CAP + RETRANSMIT_CAP / 4);
    }

    #[test]
    fn exhaustion_after_bounded_tries() {
        assert!(!request(0, RETRANSMIT_TRIES - 1).exhausted());
        assert!(request(0, RETRANSMIT_TRIES).exhausted());
    }

    #[test]
    fn acknowledge_removes_the_right_entry() {
        let mut queue = RetransmitQueue::default();
        queue.push(request(4, 1));
        queue.push(request(5, 1));
        assert!(queue.acknowledge(4).is_some());
        assert!(queue.acknowledge(4).is_none());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
    }

    #[test]
    fn response_cache_prunes_old_ids() {
        let mut cache = ResponseCache::default();
        cache.insert(1, vec![vec![1]]);
        cache.insert(2, vec![vec![2]]);
        cache.insert(9, vec![vec![9]]);
        cache.prune_below(3);
        assert!(cache.get(1).is_none());
        assert!(cache.get(2).is_none());
        assert_eq!(cache.get(9), Some(&vec![vec![9]]));
    }
}
