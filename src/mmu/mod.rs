//! Translate-or-fault entry point: TLB lookup first, page-table walk and
//! fill on miss. This is the chokepoint every load/store/fetch in
//! `isa::interp` calls through; the interpreter never touches `SoftTlb` or
//! `walker` directly.

pub mod error;
pub mod tlb;
pub mod walker;

pub use error::MmuFault;
pub use tlb::{AccessKind, SoftTlb};
pub use walker::{decode_satp_mode, SatpMode};

use crate::bus::Bus;
use crate::isa::csr::Privilege;

pub const DEFAULT_TLB_ENTRIES: usize = 256;

pub struct Mmu {
    tlb: SoftTlb,
}

impl Mmu {
    pub fn new() -> Self {
        Self { tlb: SoftTlb::new(DEFAULT_TLB_ENTRIES) }
    }

    pub fn flush_all(&mut self) {
        self.tlb.flush_all();
    }

    pub fn flush_page(&mut self, vaddr: u64) {
        self.tlb.flush_page(vaddr);
    }

    /// Resolves `vaddr` to a physical address. Fast path checks the TLB;
    /// on a miss, walks the page table and installs the result before
    /// retrying the lookup.
    pub fn translate(
        &mut self,
        bus: &Bus,
        satp: u64,
        xlen64: bool,
        vaddr: u64,
        kind: AccessKind,
        priv_: Privilege,
        sum: bool,
        mxr: bool,
    ) -> Result<u64, MmuFault> {
        if decode_satp_mode(satp, xlen64) == SatpMode::Bare {
            return Ok(vaddr);
        }
        if let Some(phys) = self.tlb.lookup(vaddr, kind) {
            return Ok(phys);
        }
        let translation = walker::walk(bus, satp, xlen64, vaddr, kind, priv_, sum, mxr)?;
        let vpn = vaddr >> tlb::PAGE_SHIFT;
        let page_vpn_mask = !((translation.page_size >> tlb::PAGE_SHIFT) - 1);
        let aligned_vpn = vpn & page_vpn_mask;
        self.tlb.fill(aligned_vpn, translation.phys_page_base, translation.readable, translation.writable, translation.executable);
        let phys = translation.phys_page_base | (vaddr & (translation.page_size - 1));
        Ok(phys)
    }
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}
