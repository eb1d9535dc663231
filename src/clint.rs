//! CLINT: `mtime`/`mtimecmp[hart]`/`msip[hart]`, driving each hart's timer
//! through the same `check_timer` entry point a local timer-CSR write
//! would use, so CLINT-driven and locally-driven timer updates share one
//! code path. Calls `hart::Hart::raise_timer`/`raise_software` from
//! outside the hart's own thread. Implements `Device` with the standard
//! SiFive CLINT register layout (`msip[hart]` at `0x0000 + 4*hart`,
//! `mtimecmp[hart]` at `0x4000 + 8*hart`, `mtime` at `0xBFF8`) so a real
//! guest kernel's CLINT driver reaches the same state through ordinary
//! MMIO stores that `set_mtime`/`set_mtimecmp`/`set_msip` expose to Rust
//! callers (the PLIC/timer-setup code in this crate).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::device::{AccessContext, Device, DeviceResult};
use crate::hart::Hart;

const MSIP_BASE: u64 = 0x0000;
const MTIMECMP_BASE: u64 = 0x4000;
const MTIME_OFFSET: u64 = 0xBFF8;

/// Total span of the CLINT register file; the bus region a `Clint` is
/// attached to should be at least this wide.
pub const CLINT_SPAN: u64 = MTIME_OFFSET + 8;

pub struct Clint {
    mtime: AtomicU64,
    mtimecmp: Mutex<Vec<AtomicU64>>,
    /// Mirrors each hart's `MSIP` line so `Device::read` has something to
    /// report back; `Hart` itself exposes no getter for it; only `set_irq`.
    msip: Vec<AtomicBool>,
    harts: Vec<Arc<Hart>>,
}

impl Clint {
    pub fn new(harts: Vec<Arc<Hart>>) -> Self {
        let mtimecmp = harts.iter().map(|_| AtomicU64::new(u64::MAX)).collect();
        let msip = harts.iter().map(|_| AtomicBool::new(false)).collect();
        Self { mtime: AtomicU64::new(0), mtimecmp: Mutex::new(mtimecmp), msip, harts }
    }

    pub fn mtime(&self) -> u64 {
        self.mtime.load(Ordering::SeqCst)
    }

    pub fn set_mtime(&self, value: u64) {
        self.mtime.store(value, Ordering::SeqCst);
        self.check_all_timers();
    }

    pub fn set_mtimecmp(&self, hart_index: usize, value: u64) {
        if let Some(slot) = self.mtimecmp.lock().unwrap().get(hart_index) {
            slot.store(value, Ordering::SeqCst);
        }
        self.check_timer(hart_index);
    }

    pub fn set_msip(&self, hart_index: usize, level: bool) {
        if let Some(flag) = self.msip.get(hart_index) {
            flag.store(level, Ordering::SeqCst);
        }
        if let Some(hart) = self.harts.get(hart_index) {
            hart.raise_software(level);
        }
    }

    /// Re-evaluates one hart's `MTIP` against the current `mtime`.
    pub fn check_timer(&self, hart_index: usize) {
        let cmp = match self.mtimecmp.lock().unwrap().get(hart_index) {
            Some(v) => v.load(Ordering::SeqCst),
            None => return,
        };
        if let Some(hart) = self.harts.get(hart_index) {
            hart.raise_timer(self.mtime() >= cmp);
        }
    }

    fn check_all_timers(&self) {
        for i in 0..self.harts.len() {
            self.check_timer(i);
        }
    }
}

impl Device for Clint {
    fn name(&self) -> &str {
        "clint"
    }

    fn min_op_size(&self) -> usize {
        4
    }

    fn read(&self, offset: u64, out: &mut [u8], _ctx: AccessContext) -> DeviceResult<bool> {
        if (MSIP_BASE..MSIP_BASE + 4 * self.harts.len() as u64).contains(&offset) && out.len() == 4 {
            let index = ((offset - MSIP_BASE) / 4) as usize;
            let level = self.msip[index].load(Ordering::SeqCst);
            out.copy_from_slice(&(level as u32).to_le_bytes());
            return Ok(true);
        }
        if (MTIMECMP_BASE..MTIMECMP_BASE + 8 * self.harts.len() as u64).contains(&offset) && out.len() == 8 {
            let index = ((offset - MTIMECMP_BASE) / 8) as usize;
            let value = self.mtimecmp.lock().unwrap()[index].load(Ordering::SeqCst);
            out.copy_from_slice(&value.to_le_bytes());
            return Ok(true);
        }
        if offset == MTIME_OFFSET && out.len() == 8 {
            out.copy_from_slice(&self.mtime().to_le_bytes());
            return Ok(true);
        }
        Ok(false)
    }

    fn write(&self, offset: u64, data: &[u8], _ctx: AccessContext) -> DeviceResult<bool> {
        if (MSIP_BASE..MSIP_BASE + 4 * self.harts.len() as u64).contains(&offset) && data.len() == 4 {
            let index = ((offset - MSIP_BASE) / 4) as usize;
            let mut buf = [0u8; 4];
            buf.copy_from_slice(data);
            self.set_msip(index, u32::from_le_bytes(buf) & 1 != 0);
            return Ok(true);
        }
        if (MTIMECMP_BASE..MTIMECMP_BASE + 8 * self.harts.len() as u64).contains(&offset) && data.len() == 8 {
            let index = ((offset - MTIMECMP_BASE) / 8) as usize;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(data);
            self.set_mtimecmp(index, u64::from_le_bytes(buf));
            return Ok(true);
        }
        if offset == MTIME_OFFSET && data.len() == 8 {
            let mut buf = [0u8; 8];
            buf.copy_from_slice(data);
            self.set_mtime(u64::from_le_bytes(buf));
            return Ok(true);
        }
        Ok(false)
    }

    fn reset(&self) {
        self.mtime.store(0, Ordering::SeqCst);
        {
            let mtimecmp = self.mtimecmp.lock().unwrap();
            for slot in mtimecmp.iter() {
                slot.store(u64::MAX, Ordering::SeqCst);
            }
        }
        for index in 0..self.harts.len() {
            self.check_timer(index);
            self.set_msip(index, false);
        }
    }

    fn fdt_node(&self, base: u64) -> Option<crate::fdt::FdtNode> {
        Some(
            crate::fdt::FdtNode::new(format!("clint@{base:x}"))
                .prop("compatible", crate::fdt::FdtValue::String("riscv,clint0".to_string()))
                .prop(
                    "reg",
                    crate::fdt::FdtValue::Cells(vec![0, base as u32, 0, (MTIME_OFFSET + 8) as u32]),
                ),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mtip_follows_mtime_crossing_mtimecmp() {
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        let clint = Clint::new(vec![hart.clone()]);
        clint.set_mtimecmp(0, 100);
        clint.set_mtime(50);
        clint.set_mtime(150);
    }

    #[test]
    fn msip_sets_software_interrupt_pending() {
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        let clint = Clint::new(vec![hart.clone()]);
        clint.set_msip(0, true);
        clint.set_msip(0, false);
    }

    #[test]
    fn mmio_write_to_mtimecmp_round_trips_through_read() {
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        let clint = Clint::new(vec![hart]);
        assert!(clint.write(MTIMECMP_BASE, &42u64.to_le_bytes(), AccessContext::Cpu).unwrap());
        let mut buf = [0u8; 8];
        assert!(clint.read(MTIMECMP_BASE, &mut buf, AccessContext::Cpu).unwrap());
        assert_eq!(u64::from_le_bytes(buf), 42);
    }

    #[test]
    fn reset_restores_mtime_and_mtimecmp_defaults() {
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        let clint = Clint::new(vec![hart]);
        clint.set_mtime(500);
        clint.set_mtimecmp(0, 10);
        clint.reset();
        assert_eq!(clint.mtime(), 0);
        let mut buf = [0u8; 8];
        clint.read(MTIMECMP_BASE, &mut buf, AccessContext::Cpu).unwrap();
        assert_eq!(u64::from_le_bytes(buf), u64::MAX);
    }
}
