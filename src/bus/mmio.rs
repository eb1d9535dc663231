//! MMIO region table: a sorted list of non-overlapping address ranges,
//! each routed to a typed device handler. `attach`/`detach` is a hard
//! error on overlap rather than resolving priority between layered
//! regions.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bus::error::{BusError, BusResult};
use crate::device::{AccessContext, Device};

pub struct MmioRegion {
    pub begin: u64,
    pub size: u64,
    pub device: Arc<dyn Device>,
}

impl MmioRegion {
    pub fn end(&self) -> u64 {
        self.begin + self.size
    }

    pub fn min_op_size(&self) -> usize {
        self.device.min_op_size()
    }

    pub fn max_op_size(&self) -> usize {
        self.device.max_op_size()
    }
}

/// Sorted address-range -> device table. Never includes the machine's RAM
/// span; `Bus` (in `bus::mod`) checks RAM first and only consults this
/// table on a miss.
#[derive(Default)]
pub struct MmioBus {
    regions: BTreeMap<u64, MmioRegion>,
}

impl MmioBus {
    pub fn new() -> Self {
        Self { regions: BTreeMap::new() }
    }

    pub fn attach(&mut self, device: Arc<dyn Device>, begin: u64, size: u64) -> BusResult<()> {
        if size == 0 {
            return Err(BusError::Overlap { address: begin, size });
        }
        let min = device.min_op_size();
        let max = device.max_op_size();
        assert!(
            min <= max && min.is_power_of_two() && max.is_power_of_two() && max <= 8,
            "device '{}' declares an invalid op-size range [{min}, {max}]",
            device.name()
        );
        if self.overlaps(begin, size) {
            return Err(BusError::Overlap { address: begin, size });
        }
        self.regions.insert(begin, MmioRegion { begin, size, device });
        Ok(())
    }

    pub fn detach(&mut self, begin: u64) -> Option<Arc<dyn Device>> {
        self.regions.remove(&begin).map(|r| {
            r.device.remove();
            r.device
        })
    }

    pub fn overlaps(&self, begin: u64, size: u64) -> bool {
        let end = begin + size;
        if let Some((_, region)) = self.regions.range(..=begin).next_back() {
            if region.end() > begin {
                return true;
            }
        }
        self.regions.range(begin..end).next().is_some()
    }

    /// First region whose `[begin, begin+size)` fully covers the access, or
    /// `None` if unmapped/straddling.
    pub fn region_for(&self, addr: u64, size: u64) -> Option<&MmioRegion> {
        let (_, region) = self.regions.range(..=addr).next_back()?;
        let end = addr.checked_add(size)?;
        if addr >= region.begin && end <= region.end() {
            Some(region)
        } else {
            None
        }
    }

    pub fn read(&self, addr: u64, out: &mut [u8], ctx: AccessContext) -> BusResult<()> {
        let region = self
            .region_for(addr, out.len() as u64)
            .ok_or(BusError::Unmapped { address: addr, size: out.len() as u64 })?;
        let size = out.len();
        if size < region.min_op_size() || size > region.max_op_size() {
            return Err(BusError::Misaligned { address: addr, size: size as u64 });
        }
        let offset = addr - region.begin;
        let ok = region.device.read(offset, out, ctx)?;
        if !ok {
            return Err(BusError::DeviceFault { device: region.device.name().to_string() });
        }
        Ok(())
    }

    pub fn write(&self, addr: u64, data: &[u8], ctx: AccessContext) -> BusResult<()> {
        let region = self
            .region_for(addr, data.len() as u64)
            .ok_or(BusError::Unmapped { address: addr, size: data.len() as u64 })?;
        let size = data.len();
        if size < region.min_op_size() || size > region.max_op_size() {
            return Err(BusError::Misaligned { address: addr, size: size as u64 });
        }
        let offset = addr - region.begin;
        let ok = region.device.write(offset, data, ctx)?;
        if !ok {
            return Err(BusError::DeviceFault { device: region.device.name().to_string() });
        }
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &MmioRegion> {
        self.regions.values()
    }

    /// Linear probe: walk upward from `preferred_base` in page-sized steps
    /// until a free `size`-byte span is found, or `None` if the address
    /// space is exhausted.
    pub fn find_free_span(&self, preferred_base: u64, size: u64, limit: u64) -> Option<u64> {
        const STEP: u64 = 4096;
        let mut candidate = preferred_base;
        while candidate.saturating_add(size) <= limit {
            if !self.overlaps(candidate, size) {
                return Some(candidate);
            }
            candidate = candidate.checked_add(STEP)?;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceResult;

    struct Probe {
        name: String,
    }

    impl Device for Probe {
        fn name(&self) -> &str {
            &self.name
        }
        fn read(&self, _offset: u64, out: &mut [u8], _ctx: AccessContext) -> DeviceResult<bool> {
            out.fill(0xAA);
            Ok(true)
        }
        fn write(&self, _offset: u64, _data: &[u8], _ctx: AccessContext) -> DeviceResult<bool> {
            Ok(true)
        }
    }

    fn probe(name: &str) -> Arc<dyn Device> {
        Arc::new(Probe { name: name.to_string() })
    }

    #[test]
    fn attach_then_resolve() {
        let mut bus = MmioBus::new();
        bus.attach(probe("uart"), 0x1000_0000, 0x100).unwrap();
        let region = bus.region_for(0x1000_0010, 4).unwrap();
        assert_eq!(region.device.name(), "uart");
    }

    #[test]
    fn overlap_is_rejected() {
        let mut bus = MmioBus::new();
        bus.attach(probe("a"), 0x1000, 0x100).unwrap();
        assert!(bus.attach(probe("b"), 0x1050, 0x100).is_err());
    }

    #[test]
    fn straddling_access_is_unmapped() {
        let mut bus = MmioBus::new();
        bus.attach(probe("a"), 0x1000, 0x100).unwrap();
        bus.attach(probe("b"), 0x1100, 0x100).unwrap();
        let mut buf = [0u8; 8];
        assert!(bus.read(0x10FC, &mut buf, AccessContext::Cpu).is_err());
    }

    #[test]
    fn auto_zone_skips_occupied_span() {
        let mut bus = MmioBus::new();
        bus.attach(probe("a"), 0x2000, 0x1000).unwrap();
        let found = bus.find_free_span(0x2000, 0x1000, 0x10000).unwrap();
        assert_eq!(found, 0x3000);
    }
}
