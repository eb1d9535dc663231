pub mod error;
pub mod mmio;

pub use error::{BusError, BusResult};
pub use mmio::{MmioBus, MmioRegion};

use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard};

use crate::device::{AccessContext, Device, RamRegion};

/// The machine's physical address space: one RAM region plus the sorted
/// MMIO table. Reads and writes first check whether the access falls
/// entirely inside the RAM region; otherwise the sorted MMIO list is
/// searched.
///
/// `mmio` is `RwLock`-guarded rather than requiring `&mut Bus` for
/// attach/detach: every hart holds a shared `&Bus` for the lifetime of its
/// run loop, so structural mutation must go through interior mutability,
/// not exclusive borrowing.
///
/// `reservations` implements the LR/SC broadcast-invalidate strategy: any
/// successful store through this bus, from any hart, clears a matching
/// outstanding reservation regardless of who holds it. A `Vec` scan is
/// quadratic in hart count, which is the tradeoff the design explicitly
/// accepts at the 1-8 hart scale this core targets.
pub struct Bus {
    ram: Arc<RamRegion>,
    mmio: RwLock<MmioBus>,
    reservations: Mutex<Vec<(u64, u64)>>,
}

impl Bus {
    pub fn new(ram: Arc<RamRegion>) -> Self {
        Self { ram, mmio: RwLock::new(MmioBus::new()), reservations: Mutex::new(Vec::new()) }
    }

    pub fn ram(&self) -> &Arc<RamRegion> {
        &self.ram
    }

    pub fn mmio(&self) -> RwLockReadGuard<'_, MmioBus> {
        self.mmio.read().unwrap()
    }

    pub fn read(&self, addr: u64, out: &mut [u8], ctx: AccessContext) -> BusResult<()> {
        if self.ram.contains(addr, out.len() as u64) {
            self.ram.read(addr - self.ram.base(), out, ctx)?;
            return Ok(());
        }
        if straddles_ram(&self.ram, addr, out.len() as u64) {
            return Err(BusError::StraddlesRegions { address: addr, size: out.len() as u64 });
        }
        self.mmio.read().unwrap().read(addr, out, ctx)
    }

    pub fn write(&self, addr: u64, data: &[u8], ctx: AccessContext) -> BusResult<()> {
        let result = if self.ram.contains(addr, data.len() as u64) {
            self.ram.write(addr - self.ram.base(), data, ctx).map(|_| ()).map_err(BusError::from)
        } else if straddles_ram(&self.ram, addr, data.len() as u64) {
            Err(BusError::StraddlesRegions { address: addr, size: data.len() as u64 })
        } else {
            self.mmio.read().unwrap().write(addr, data, ctx)
        };
        if result.is_ok() {
            self.invalidate_reservations(addr, data.len() as u64);
        }
        result
    }

    /// Records `hartid`'s load-reserved physical address, replacing any
    /// reservation that hart already held.
    pub fn set_reservation(&self, hartid: u64, phys: u64) {
        let mut reservations = self.reservations.lock().unwrap();
        reservations.retain(|&(h, _)| h != hartid);
        reservations.push((hartid, phys));
    }

    /// Consumes `hartid`'s reservation if it still matches `phys`. Returns
    /// whether the matching SC should succeed.
    pub fn take_reservation(&self, hartid: u64, phys: u64) -> bool {
        let mut reservations = self.reservations.lock().unwrap();
        match reservations.iter().position(|&(h, a)| h == hartid && a == phys) {
            Some(pos) => {
                reservations.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn clear_reservation(&self, hartid: u64) {
        self.reservations.lock().unwrap().retain(|&(h, _)| h != hartid);
    }

    /// Invalidates any outstanding reservation, on any hart, that overlaps
    /// `[addr, addr+len)`. Called after every successful bus write and after
    /// a RAM-backed AMO's atomic RMW, since both bypass each other.
    pub fn invalidate_reservations(&self, addr: u64, len: u64) {
        let end = addr.saturating_add(len);
        self.reservations.lock().unwrap().retain(|&(_, a)| !(a >= addr && a < end));
    }

    /// A host pointer when the span lies fully in RAM, `None` otherwise —
    /// callers bounce through MMIO word-by-word.
    pub fn dma_ptr(&self, addr: u64, size: u64) -> Option<*mut u8> {
        self.ram.host_ptr(addr, size)
    }

    pub fn attach_mmio(&self, device: Arc<dyn crate::device::Device>, begin: u64, size: u64) -> BusResult<()> {
        let ram_span = self.ram.span();
        if begin < ram_span.end && begin.saturating_add(size) > ram_span.start {
            return Err(BusError::Overlap { address: begin, size });
        }
        self.mmio.write().unwrap().attach(device, begin, size)
    }

    pub fn detach_mmio(&self, begin: u64) -> Option<Arc<dyn crate::device::Device>> {
        self.mmio.write().unwrap().detach(begin)
    }

    pub fn mmio_zone_auto(&self, preferred_base: u64, size: u64, limit: u64) -> Option<u64> {
        self.mmio.read().unwrap().find_free_span(preferred_base, size, limit)
    }
}

fn straddles_ram(ram: &RamRegion, addr: u64, size: u64) -> bool {
    let span = ram.span();
    let end = addr.saturating_add(size);
    addr < span.end && end > span.start && !(addr >= span.start && end <= span.end)
}
