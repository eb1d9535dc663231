//! Sv32/Sv39/Sv48 page-table walker: PTE bit layout, `satp` mode encoding,
//! and superpage handling, with a single table-driven level-descent loop
//! generalized across all three Sv* formats rather than one function per
//! format.

use crate::bus::{Bus, BusError};
use crate::device::AccessContext;
use crate::isa::csr::Privilege;
use crate::mmu::error::MmuFault;
use crate::mmu::tlb::AccessKind;

pub mod pte_bits {
    pub const V: u64 = 1 << 0;
    pub const R: u64 = 1 << 1;
    pub const W: u64 = 1 << 2;
    pub const X: u64 = 1 << 3;
    pub const U: u64 = 1 << 4;
    pub const G: u64 = 1 << 5;
    pub const A: u64 = 1 << 6;
    pub const D: u64 = 1 << 7;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SatpMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
}

pub fn decode_satp_mode(satp: u64, xlen64: bool) -> SatpMode {
    if xlen64 {
        match satp >> 60 {
            8 => SatpMode::Sv39,
            9 => SatpMode::Sv48,
            _ => SatpMode::Bare,
        }
    } else if satp >> 31 == 1 {
        SatpMode::Sv32
    } else {
        SatpMode::Bare
    }
}

#[derive(Debug)]
pub struct Translation {
    pub phys_page_base: u64,
    pub page_size: u64,
    pub readable: bool,
    pub writable: bool,
    pub executable: bool,
    pub user: bool,
}

struct LevelSpec {
    vpn_widths: &'static [u32],
    ppn_widths: &'static [u32],
    pte_bytes: usize,
}

const SV32: LevelSpec = LevelSpec { vpn_widths: &[10, 10], ppn_widths: &[12, 10], pte_bytes: 4 };
const SV39: LevelSpec = LevelSpec { vpn_widths: &[9, 9, 9], ppn_widths: &[26, 9, 9], pte_bytes: 8 };
const SV48: LevelSpec = LevelSpec { vpn_widths: &[9, 9, 9, 9], ppn_widths: &[17, 9, 9, 9], pte_bytes: 8 };

/// Walks the page table rooted at `satp`'s PPN, resolving `vaddr` for the
/// given access kind and privilege. `sum`/`mxr` are the corresponding
/// `mstatus` bits: SUM permits S-mode access to `U` pages, MXR makes
/// executable pages also readable.
pub fn walk(
    bus: &Bus,
    satp: u64,
    xlen64: bool,
    vaddr: u64,
    kind: AccessKind,
    priv_: Privilege,
    sum: bool,
    mxr: bool,
) -> Result<Translation, MmuFault> {
    let mode = decode_satp_mode(satp, xlen64);
    let spec = match mode {
        SatpMode::Bare => {
            return Ok(Translation {
                phys_page_base: vaddr & !0xFFF,
                page_size: 1 << 12,
                readable: true,
                writable: true,
                executable: true,
                user: true,
            });
        }
        SatpMode::Sv32 => &SV32,
        SatpMode::Sv39 => &SV39,
        SatpMode::Sv48 => &SV48,
    };
    let ppn_mask = if xlen64 { (1u64 << 44) - 1 } else { (1u64 << 22) - 1 };
    let mut table_ppn = satp & ppn_mask;
    let levels = spec.vpn_widths.len();

    let vpn = |level: usize| -> u64 {
        let mut shift = 12u32;
        for w in spec.vpn_widths[..level].iter() {
            shift += *w;
        }
        let width = spec.vpn_widths[level];
        (vaddr >> shift) & ((1u64 << width) - 1)
    };

    for level in (0..levels).rev() {
        let pte_addr = table_ppn * 4096 + vpn(level) * spec.pte_bytes as u64;
        let raw = read_pte(bus, pte_addr, spec.pte_bytes)?;
        if raw & pte_bits::V == 0 || (raw & pte_bits::R == 0 && raw & pte_bits::W != 0) {
            return Err(MmuFault::PageFault);
        }
        let is_leaf = raw & (pte_bits::R | pte_bits::X) != 0;
        if !is_leaf {
            table_ppn = ppn_of(raw, spec);
            continue;
        }

        // Superpage validity: every PPN field below this level must be zero.
        for lower in 0..level {
            if ppn_field(raw, spec, lower) != 0 {
                return Err(MmuFault::PageFault);
            }
        }

        let readable = raw & pte_bits::R != 0 || (mxr && raw & pte_bits::X != 0);
        let writable = raw & pte_bits::W != 0;
        let executable = raw & pte_bits::X != 0;
        let user = raw & pte_bits::U != 0;

        check_permission(kind, priv_, sum, readable, writable, executable, user)?;

        if raw & pte_bits::A == 0 || (kind == AccessKind::Write && raw & pte_bits::D == 0) {
            let mut updated = raw | pte_bits::A;
            if kind == AccessKind::Write {
                updated |= pte_bits::D;
            }
            write_pte(bus, pte_addr, updated, spec.pte_bytes)?;
        }

        // `ppn_of` already carries the full frame address; the superpage
        // check above guarantees its low-order fields (below `level`) are
        // zero, so the caller only needs to OR in `vaddr`'s low
        // `page_size - 1` bits to get the final physical address.
        let phys_page_base = ppn_of(raw, spec) << 12;
        let mut shift = 12u32;
        for w in spec.vpn_widths[..level].iter() {
            shift += *w;
        }
        let page_size = 1u64 << shift;

        return Ok(Translation { phys_page_base, page_size, readable, writable, executable, user });
    }
    Err(MmuFault::PageFault)
}

fn ppn_field(pte: u64, spec: &LevelSpec, index: usize) -> u64 {
    let mut shift = 10u32;
    for w in spec.ppn_widths[..index].iter() {
        shift += *w;
    }
    (pte >> shift) & ((1u64 << spec.ppn_widths[index]) - 1)
}

fn ppn_of(pte: u64, spec: &LevelSpec) -> u64 {
    let total_width: u32 = spec.ppn_widths.iter().sum();
    (pte >> 10) & ((1u64 << total_width) - 1)
}

fn check_permission(
    kind: AccessKind,
    priv_: Privilege,
    sum: bool,
    readable: bool,
    writable: bool,
    executable: bool,
    user: bool,
) -> Result<(), MmuFault> {
    if user && priv_ == Privilege::Supervisor && !sum {
        return Err(MmuFault::PageFault);
    }
    if !user && priv_ == Privilege::User {
        return Err(MmuFault::PageFault);
    }
    let ok = match kind {
        AccessKind::Read => readable,
        AccessKind::Write => writable,
        AccessKind::Execute => executable,
    };
    if ok {
        Ok(())
    } else {
        Err(MmuFault::PageFault)
    }
}

fn read_pte(bus: &Bus, addr: u64, size: usize) -> Result<u64, MmuFault> {
    let mut buf = [0u8; 8];
    bus.read(addr, &mut buf[..size], AccessContext::Cpu).map_err(bus_err_to_fault)?;
    Ok(u64::from_le_bytes(buf))
}

fn write_pte(bus: &Bus, addr: u64, value: u64, size: usize) -> Result<(), MmuFault> {
    let bytes = value.to_le_bytes();
    bus.write(addr, &bytes[..size], AccessContext::Cpu).map_err(bus_err_to_fault)
}

fn bus_err_to_fault(err: BusError) -> MmuFault {
    match err {
        BusError::Unmapped { .. } | BusError::StraddlesRegions { .. } => MmuFault::AccessFault,
        _ => MmuFault::AccessFault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamRegion;
    use std::sync::Arc;

    fn make_bus() -> Bus {
        Bus::new(Arc::new(RamRegion::new("ram", 0x8000_0000, 16 * 1024 * 1024)))
    }

    fn write_word(bus: &Bus, addr: u64, value: u64, bytes: usize) {
        bus.write(addr, &value.to_le_bytes()[..bytes], AccessContext::Cpu).unwrap();
    }

    #[test]
    fn sv39_three_level_walk_resolves_leaf() {
        let bus = make_bus();
        let root_ppn = 0x8000_0000u64 / 4096;
        let mid_ppn = root_ppn + 1;
        let leaf_ppn = root_ppn + 2;
        let data_ppn = root_ppn + 3;

        let vaddr = 0x0000_0040_1000_2000u64;
        let vpn2 = (vaddr >> 30) & 0x1FF;
        let vpn1 = (vaddr >> 21) & 0x1FF;
        let vpn0 = (vaddr >> 12) & 0x1FF;

        write_word(&bus, root_ppn * 4096 + vpn2 * 8, (mid_ppn << 10) | pte_bits::V, 8);
        write_word(&bus, mid_ppn * 4096 + vpn1 * 8, (leaf_ppn << 10) | pte_bits::V, 8);
        write_word(
            &bus,
            leaf_ppn * 4096 + vpn0 * 8,
            (data_ppn << 10) | pte_bits::V | pte_bits::R | pte_bits::W | pte_bits::A | pte_bits::D,
            8,
        );

        let satp = (8u64 << 60) | root_ppn;
        let t = walk(&bus, satp, true, vaddr, AccessKind::Read, Privilege::Supervisor, false, false).unwrap();
        assert_eq!(t.phys_page_base, data_ppn << 12);
        assert_eq!(t.page_size, 4096);
        assert!(t.readable && t.writable);
    }

    #[test]
    fn leaf_at_middle_level_is_a_megapage() {
        let bus = make_bus();
        let root_ppn = 0x8000_0000u64 / 4096;
        let data_ppn = root_ppn + 1;
        let vaddr = 0x0000_0040_0020_3000u64;
        let vpn2 = (vaddr >> 30) & 0x1FF;
        let vpn1 = (vaddr >> 21) & 0x1FF;

        write_word(&bus, root_ppn * 4096 + vpn2 * 8, ((root_ppn + 2) << 10) | pte_bits::V, 8);
        write_word(
            &bus,
            (root_ppn + 2) * 4096 + vpn1 * 8,
            (data_ppn << 10) | pte_bits::V | pte_bits::R | pte_bits::X | pte_bits::A | pte_bits::D,
            8,
        );

        let satp = (8u64 << 60) | root_ppn;
        let t = walk(&bus, satp, true, vaddr, AccessKind::Execute, Privilege::Supervisor, false, false).unwrap();
        assert_eq!(t.page_size, 2 * 1024 * 1024);
    }

    #[test]
    fn user_page_denied_to_supervisor_without_sum() {
        let bus = make_bus();
        let root_ppn = 0x8000_0000u64 / 4096;
        let data_ppn = root_ppn + 1;
        let vaddr = 0x0000_0040_0010_1000u64;
        let vpn2 = (vaddr >> 30) & 0x1FF;
        let vpn1 = (vaddr >> 21) & 0x1FF;
        let vpn0 = (vaddr >> 12) & 0x1FF;
        write_word(&bus, root_ppn * 4096 + vpn2 * 8, ((root_ppn + 2) << 10) | pte_bits::V, 8);
        write_word(&bus, (root_ppn + 2) * 4096 + vpn1 * 8, ((root_ppn + 3) << 10) | pte_bits::V, 8);
        write_word(
            &bus,
            (root_ppn + 3) * 4096 + vpn0 * 8,
            (data_ppn << 10) | pte_bits::V | pte_bits::R | pte_bits::U | pte_bits::A,
            8,
        );
        let satp = (8u64 << 60) | root_ppn;
        let result = walk(&bus, satp, true, vaddr, AccessKind::Read, Privilege::Supervisor, false, false);
        assert_eq!(result.unwrap_err(), MmuFault::PageFault);
    }

    #[test]
    fn bare_mode_is_identity() {
        let bus = make_bus();
        let t = walk(&bus, 0, true, 0x8000_1234, AccessKind::Read, Privilege::Machine, false, false).unwrap();
        assert_eq!(t.phys_page_base, 0x8000_1000);
    }
}
