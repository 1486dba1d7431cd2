//! The engine's timer wheel
//!
//! Timers are owned by the engine, keyed by the SA they belong to and a
//! kind, so a state transition can cancel exactly the timers its state
//! armed. Re-arming an existing key replaces the old deadline.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

/// What a timer firing means
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Retransmit the outstanding request with this message id
    Retransmit(u32),
    /// Send a DPD probe on the idle SA
    Dpd,
    /// The DPD probe went unanswered
    /// (the retransmit path handles this; kept for the keepalive case)
    Keepalive,
    /// Soft lifetime: rekey the IKE SA
    RekeyIke,
    /// Soft lifetime: rekey the child with this local SPI
    RekeyChild(u32),
    /// Hard lifetime of the child with this local SPI
    ExpireChild(u32),
    /// Hard lifetime of the IKE SA itself
    ExpireIke,
    /// Grace period of the Closing state ran out
    CloseGrace,
    /// Sweep the fragment reassembly table
    FragSweep,
    /// Rotate the cookie secret
    CookieRotate,
}

/// A timer key: owning SA (its local SPI) plus kind; SPI zero is used
/// for global timers such as the cookie rotation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    /// Local SPI of the owning SA, zero for daemon-global timers
    pub sa: u64,
    /// What to do when it fires
    pub kind: TimerKind,
}

/// Deadline-ordered timer store
#[derive(Debug, Default)]
pub struct TimerWheel {
    deadlines: BTreeMap<(Instant, u64), TimerKey>,
    index: HashMap<TimerKey, (Instant, u64)>,
    sequence: u64,
}

impl TimerWheel {
    /// Arm (or re-arm) a timer
    pub fn arm(&mut self, now: Instant, after: Duration, key: TimerKey) {
        self.cancel(&key);
        let at = now + after;
        self.sequence += 1;
        self.deadlines.insert((at, self.sequence), key);
        self.index.insert(key, (at, self.sequence));
    }

    /// Cancel a timer; canceling an unarmed key is a no-op
    pub fn cancel(&mut self, key: &TimerKey) {
        if let Some(slot) = self.index.remove(key) {
            self.deadlines.remove(&slot);
        }
    }

    /// Cancel every timer owned by an SA
    pub fn cancel_sa(&mut self, sa: u64) {
        let keys: Vec<TimerKey> = self
            .index
            .keys()
            .filter(|k| k.sa == sa)
            .copied()
            .collect();
        for key in keys {
            self.cancel(&key);
        }
    }

    /// Whether this exact key is armed
    pub fn is_armed(&self, key: &TimerKey) -> bool {
        self.index.contains_key(key)
    }

    /// Number of armed timers an SA owns
    pub fn armed_for(&self, sa: u64) -> usize {
        self.index.keys().filter(|k| k.sa == sa).count()
    }

    /// The earliest armed deadline
    pub fn next_deadline(&self) -> Option<Instant> {
        self.deadlines.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return every timer due at `now`
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerKey> {
        let mut due = vec![];
        loop {
            let Some((&slot, &key)) = self.deadlines.iter().next() else {
                break;
            };
            if slot.0 > now {
                break;
            }
            self.deadlines.remove(&slot);
            self.index.remove(&key);
            due.push(key);
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECOND: Duration = Duration::from_secs(1);

    #[test]
    fn fires_in_deadline_order() {
        let mut wheel = TimerWheel::default();
        let now = Instant::now();
        wheel.arm(now, 3 * SECOND, TimerKey { sa: 1, kind: TimerKind::Dpd });
        wheel.arm(now, SECOND, TimerKey { sa: 1, kind: TimerKind::Retransmit(0) });
        wheel.arm(now, 2 * SECOND, TimerKey { sa: 2, kind: TimerKind::RekeyIke });

        assert_eq!(wheel.next_deadline(), Some(now + SECOND));
        let due = wheel.pop_due(now + 2 * SECOND);
        assert_eq!(
            due,
            vec![
                TimerKey { sa: 1, kind: TimerKind::Retransmit(0) },
                TimerKey { sa: 2, kind: TimerKind::RekeyIke },
            ]
        );
        assert_eq!(wheel.pop_due(now + 2 * SECOND), vec![]);
    }

    #[test]
    fn rearm_replaces_deadline() {
        let mut wheel = TimerWheel::default();
        let now = Instant::now();
        let key = TimerKey { sa: 1, kind: TimerKind::Dpd };
        wheel.arm(now, SECOND, key);
        wheel.arm(now, 10 * SECOND, key);
        assert!(wheel.pop_due(now + 2 * SECOND).is_empty());
        assert!(wheel.is_armed(&key));
    }

    #[test]
    fn cancel_sa_drops_only_its_timers() {
        let mut wheel = TimerWheel::default();
        let now = Instant::now();
        wheel.arm(now, SECOND, TimerKey { sa: 1, kind: TimerKind::Dpd });
        wheel.arm(now, SECOND, TimerKey { sa: 1, kind: TimerKind::Retransmit(5) });
        wheel.arm(now, SECOND, TimerKey { sa: 2, kind: TimerKind::Dpd });
        wheel.cancel_sa(1);
        assert_eq!(wheel.armed_for(1), 0);
        assert_eq!(wheel.armed_for(2), 1);
    }
}
