//! An in-memory SADB used by the tests: it records exactly what a real
//! kernel would have been told

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use crate::sa::Flow;
use crate::Result;

use super::{KernelSa, SadbBackend, SaLifetimes};

/// The recording backend
#[derive(Debug, Default)]
pub struct MockSadb {
    sas: HashMap<(u32, IpAddr), KernelSa>,
    flows: Vec<Flow>,
    /// lifetimes handed back by [SadbBackend::lifetimes], settable by
    /// tests driving the rekey logic
    pub reported: SaLifetimes,
}

impl MockSadb {
    /// Number of installed directed SAs
    pub fn sa_count(&self) -> usize {
        self.sas.len()
    }

    /// Number of installed flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Whether an SA with this SPI towards this destination exists
    pub fn has_sa(&self, spi: u32, dst: IpAddr) -> bool {
        self.sas.contains_key(&(spi, dst))
    }

    /// The installed flows, for assertions
    pub fn flows(&self) -> &[Flow] {
        &self.flows
    }

    /// The installed SAs, for assertions
    pub fn sas(&self) -> impl Iterator<Item = &KernelSa> {
        self.sas.values()
    }
}

impl SadbBackend for MockSadb {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn add(&mut self, sa: &KernelSa) -> Result<()> {
        self.sas.insert((sa.spi, sa.dst), sa.clone());
        Ok(())
    }

    fn delete(&mut self, sa: &KernelSa) -> Result<()> {
        self.sas.remove(&(sa.spi, sa.dst));
        Ok(())
    }

    fn last_used(&mut self, _sa: &KernelSa) -> Result<Option<Duration>> {
        Ok(None)
    }

    fn lifetimes(&mut self, _sa: &KernelSa) -> Result<SaLifetimes> {
        Ok(self.reported)
    }

    fn update_addresses(
        &mut self,
        sa: &KernelSa,
        src: IpAddr,
        dst: IpAddr,
        udpencap: Option<(u16, u16)>,
    ) -> Result<()> {
        // the SPI alone identifies the entry; the caller may already
        // carry the new addresses
        let Some(key) = self
            .sas
            .keys()
            .find(|(spi, _)| *spi == sa.spi)
            .copied()
        else {
            return Ok(());
        };
        if let Some(mut entry) = self.sas.remove(&key) {
            entry.src = src;
            entry.dst = dst;
            entry.udpencap = udpencap;
            self.sas.insert((entry.spi, entry.dst), entry);
        }
        Ok(())
    }

    fn flow_add(&mut self, flow: &Flow) -> Result<()> {
        if !self.flows.contains(flow) {
            self.flows.push(*flow);
        }
        Ok(())
    }

    fn flow_delete(&mut self, flow: &Flow) -> Result<()> {
        self.flows.retain(|f| f != flow);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.sas.clear();
        self.flows.clear();
        Ok(())
    }
}
