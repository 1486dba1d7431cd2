//! Message fragmentation and reassembly per RFC 7383
//!
//! The sender splits the inner plaintext before encryption so every
//! fragment is sealed on its own. The receiver collects decrypted
//! fragment bodies in a per-SA table that caps the number of
//! concurrently reassembled messages and the total buffered bytes;
//! partial messages time out.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

/// Concurrently reassembling messages per SA
pub const MAX_FRAGMENTED_MESSAGES: usize = 4;
/// Total plaintext bytes buffered per SA
pub const MAX_FRAGMENT_BYTES: usize = 64 * 1024;
/// A partial message older than this is discarded
pub const FRAGMENT_TIMEOUT: Duration = Duration::from_secs(10);
/// Fragments per message accepted before the sender is deemed hostile
pub const MAX_FRAGMENTS: u16 = 64;

/// Split plaintext into fragment bodies of at most `max_len` octets
///
/// Returns an empty vector when the plaintext already fits (the caller
/// should then send a plain SK payload instead).
pub fn split(plaintext: &[u8], max_len: usize) -> Vec<Vec<u8>> {
    if plaintext.len() <= max_len || max_len == 0 {
        return vec![];
    }
    plaintext
        .chunks(max_len)
        .map(<[u8]>::to_vec)
        .collect()
}

#[derive(Debug)]
struct Partial {
    total: u16,
    next_payload: u8,
    pieces: HashMap<u16, Vec<u8>>,
    bytes: usize,
    started: Instant,
}

/// Per-SA reassembly state
#[derive(Debug, Default)]
pub struct ReassemblyTable {
    messages: HashMap<u32, Partial>,
}

impl ReassemblyTable {
    /// Account a decrypted fragment; returns the reassembled plaintext
    /// and its inner first payload type once every piece arrived
    pub fn insert(
        &mut self,
        now: Instant,
        message_id: u32,
        fragment_number: u16,
        total_fragments: u16,
        next_payload: u8,
        piece: Vec<u8>,
    ) -> Option<(u8, Vec<u8>)> {
        self.expire(now);

        if fragment_number == 0
            || total_fragments == 0
            || fragment_number > total_fragments
            || total_fragments > MAX_FRAGMENTS
        {
            debug!(message_id, fragment_number, total_fragments, "bogus fragment numbering");
            return None;
        }

        let in_flight = self.messages.len();
        let partial = match self.messages.entry(message_id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let partial = entry.into_mut();
                // a total mismatch invalidates the whole collection
                if partial.total != total_fragments {
                    debug!(message_id, "fragment total changed mid-message, discarding");
                    partial.pieces.clear();
                    partial.bytes = 0;
                    partial.total = total_fragments;
                }
                partial
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                if in_flight >= MAX_FRAGMENTED_MESSAGES {
                    debug!(message_id, "too many fragmented messages in flight");
                    return None;
                }
                entry.insert(Partial {
                    total: total_fragments,
                    next_payload: 0,
                    pieces: HashMap::new(),
                    bytes: 0,
                    started: now,
                })
            }
        };

        if fragment_number == 1 {
            partial.next_payload = next_payload;
        }
        let new_bytes = partial.bytes + piece.len();
        let buffered: usize = self
            .messages
            .values()
            .map(|p| p.bytes)
            .sum::<usize>()
            .saturating_sub(self.messages.get(&message_id).map(|p| p.bytes).unwrap_or(0))
            + new_bytes;
        if buffered > MAX_FRAGMENT_BYTES {
            debug!(message_id, "fragment byte cap exceeded, discarding message");
            self.messages.remove(&message_id);
            return None;
        }

        let partial = self.messages.get_mut(&message_id)?;
        partial.bytes = new_bytes - partial.pieces.get(&fragment_number).map(Vec::len).unwrap_or(0);
        partial.pieces.insert(fragment_number, piece);

        if partial.pieces.len() == usize::from(partial.total) {
            let partial = self.messages.remove(&message_id)?;
            let mut plaintext = Vec::with_capacity(partial.bytes);
            for number in 1..=partial.total {
                plaintext.extend_from_slice(partial.pieces.get(&number)?);
            }
            return Some((partial.next_payload, plaintext));
        }
        None
    }

    /// Forget the reassembly state of an answered message id
    pub fn remove(&mut self, message_id: u32) {
        self.messages.remove(&message_id);
    }

    /// Drop partial messages past the timeout
    pub fn expire(&mut self, now: Instant) {
        self.messages
            .retain(|_, partial| now.duration_since(partial.started) < FRAGMENT_TIMEOUT);
    }

    /// Number of messages being reassembled
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether nothing is being reassembled
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_respects_threshold() {
        assert!(split(&[0; 100], 100).is_empty());
        let pieces = split(&[1; 250], 100);
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].len(), 100);
        assert_eq!(pieces[2].len(), 50);
    }

    #[test]
    fn reassembly_out_of_order() {
        let mut table = ReassemblyTable::default();
        let now = Instant::now();
        assert!(table.insert(now, 5, 2, 3, 0, b"BBB".to_vec()).is_none());
        assert!(table.insert(now, 5, 3, 3, 0, b"CC".to_vec()).is_none());
        let (next, plain) = table.insert(now, 5, 1, 3, 0x23, b"AAAA".to_vec()).unwrap();
        assert_eq!(next, 0x23);
        assert_eq!(plain, b"AAAABBBCC");
        assert!(table.is_empty());
    }

    #[test]
    fn duplicate_fragment_is_idempotent() {
        let mut table = ReassemblyTable::default();
        let now = Instant::now();
        assert!(table.insert(now, 1, 1, 2, 0x24, b"xx".to_vec()).is_none());
        assert!(table.insert(now, 1, 1, 2, 0x24, b"xx".to_vec()).is_none());
        let (_, plain) = table.insert(now, 1, 2, 2, 0, b"yy".to_vec()).unwrap();
        assert_eq!(plain, b"xxyy");
    }

    #[test]
    fn concurrent_message_cap() {
        let mut table = ReassemblyTable::default();
        let now = Instant::now();
        for id in 0..MAX_FRAGMENTED_MESSAGES as u32 {
            assert!(table.insert(now, id, 1, 2, 0, vec![0; 8]).is_none());
        }
        // the table is full, a fifth message is dropped on the floor
        assert!(table
            .insert(now, 99, 1, 2, 0, vec![0; 8])
            .is_none());
        assert_eq!(table.len(), MAX_FRAGMENTED_MESSAGES);
        // but completing a known message still works
        assert!(table.insert(now, 0, 2, 2, 0, vec![1; 8]).is_some());
    }

    #[test]
    fn byte_cap_discards_message() {
        let mut table = ReassemblyTable::default();
        let now = Instant::now();
        assert!(table
            .insert(now, 1, 1, 2, 0, vec![0; MAX_FRAGMENT_BYTES - 1])
            .is_none());
        // the second piece blows the cap; the whole message is discarded
        assert!(table.insert(now, 1, 2, 2, 0, vec![0; 4096]).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn stale_partials_expire() {
        let mut table = ReassemblyTable::default();
        let start = Instant::now();
        assert!(table.insert(start, 7, 1, 2, 0, b"old".to_vec()).is_none());
        let later = start + FRAGMENT_TIMEOUT + Duration::from_secs(1);
        table.expire(later);
        assert!(table.is_empty());
    }

    #[test]
    fn bogus_numbering_is_ignored() {
        let mut table = ReassemblyTable::default();
        let now = Instant::now();
        assert!(table.insert(now, 1, 0, 2, 0, vec![]).is_none());
        assert!(table.insert(now, 1, 3, 2, 0, vec![]).is_none());
        assert!(table.insert(now, 1, 1, MAX_FRAGMENTS + 1, 0, vec![]).is_none());
        assert!(table.is_empty());
    }
}
