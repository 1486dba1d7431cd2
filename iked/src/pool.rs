//! Address pools handing inner virtual addresses to peers
//!
//! Allocation walks the pool prefix in order. With stickiness enabled a
//! reconnecting identity receives the address it held before, as long
//! as nobody else claimed it in between.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::policy::AddrPrefix;
use crate::sa::IkeId;

/// One policy's pool of inner addresses
#[derive(Debug)]
pub struct AddressPool {
    prefix: AddrPrefix,
    sticky: bool,
    /// active leases by address
    leases: HashMap<IpAddr, IkeId>,
    /// last address each identity held, kept across releases for
    /// stickiness
    history: HashMap<IkeId, IpAddr>,
}

impl AddressPool {
    /// Create a pool covering `prefix`
    pub fn new(prefix: AddrPrefix, sticky: bool) -> Self {
        Self {
            prefix,
            sticky,
            leases: HashMap::new(),
            history: HashMap::new(),
        }
    }

    /// Lease an address for `id`
    pub fn allocate(&mut self, id: &IkeId) -> Option<IpAddr> {
        // an identity never holds two addresses at once
        if let Some((addr, _)) = self.leases.iter().find(|(_, holder)| *holder == id) {
            return Some(*addr);
        }
        if self.sticky {
            if let Some(previous) = self.history.get(id) {
                if !self.leases.contains_key(previous) {
                    let addr = *previous;
                    self.leases.insert(addr, id.clone());
                    return Some(addr);
                }
            }
        }
        let addr = self.first_free()?;
        self.leases.insert(addr, id.clone());
        self.history.insert(id.clone(), addr);
        Some(addr)
    }

    /// Return the lease of `id`, keeping its history for stickiness
    pub fn release(&mut self, id: &IkeId) {
        self.leases.retain(|_, holder| holder != id);
    }

    /// Number of active leases
    pub fn in_use(&self) -> usize {
        self.leases.len()
    }

    fn first_free(&self) -> Option<IpAddr> {
        // prefer never-handed-out addresses so sticky reservations of
        // disconnected peers survive until the pool really runs dry
        self.candidates()
            .find(|addr| {
                !self.leases.contains_key(addr) && !(self.sticky && self.remembered(addr))
            })
            .or_else(|| {
                self.candidates()
                    .find(|addr| !self.leases.contains_key(addr))
            })
    }

    fn remembered(&self, addr: &IpAddr) -> bool {
        self.history.values().any(|held| held == addr)
    }

    /// Usable addresses of the prefix, network and broadcast excluded
    fn candidates(&self) -> Box<dyn Iterator<Item = IpAddr> + '_> {
        let (start, end) = self.prefix.range();
        match (start, end) {
            (IpAddr::V4(start), IpAddr::V4(end)) => {
                let (start, end) = (u32::from(start), u32::from(end));
                Box::new(((start + 1)..end).map(|raw| IpAddr::V4(raw.into())))
            }
            (IpAddr::V6(start), IpAddr::V6(end)) => {
                let (start, end) = (u128::from(start), u128::from(end));
                Box::new(((start + 1)..end).map(|raw| IpAddr::V6(raw.into())))
            }
            _ => Box::new(std::iter::empty()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(sticky: bool) -> AddressPool {
        AddressPool::new(
            AddrPrefix {
                addr: "10.9.0.0".parse().unwrap(),
                prefix_len: 29,
            },
            sticky,
        )
    }

    fn id(name: &str) -> IkeId {
        IkeId::Fqdn(name.into())
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn allocates_in_order_and_skips_network_addresses() {
        let mut pool = pool(false);
        assert_eq!(pool.allocate(&id("a")).unwrap().to_string(), "10.9.0.1");
        assert_eq!(pool.allocate(&id("b")).unwrap().to_string(), "10.9.0.2");
        // same identity keeps its lease
        assert_eq!(pool.allocate(&id("a")).unwrap().to_string(), "10.9.0.1");
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn exhaustion_returns_none() {
        let mut pool = pool(false);
        // /29 leaves six usable addresses
        for i in 0..6 {
            assert!(pool.allocate(&id(&format!("peer{i}"))).is_some());
        }
        assert!(pool.allocate(&id("late")).is_none());
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn sticky_reconnect_reuses_address() {
        let mut pool = pool(true);
        let first = pool.allocate(&id("laptop")).unwrap();
        pool.release(&id("laptop"));
        // someone else connects in between and gets a different address
        let other = pool.allocate(&id("other")).unwrap();
        assert_ne!(first, other);
        assert_eq!(pool.allocate(&id("laptop")).unwrap(), first);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn non_sticky_reconnect_may_move() {
        let mut pool = pool(false);
        let first = pool.allocate(&id("laptop")).unwrap();
        pool.release(&id("laptop"));
        let other = pool.allocate(&id("other")).unwrap();
        assert_eq!(first, other);
    }
}
