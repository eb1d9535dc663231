//! `Machine`: owns RAM, the MMIO bus, every hart, and the PLIC/CLINT
//! contract objects; exposes the public embedding API. Arena-style
//! ownership: the machine owns its devices and harts by value,
//! cross-references are non-owning `Arc`/index handles rather than a
//! graph of shared mutable pointers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::bus::Bus;
use crate::clint::Clint;
use crate::config::Config;
use crate::device::{Device, RamRegion};
use crate::error::MachineError;
use crate::fdt::{Fdt, FdtNode, FdtValue};
use crate::hart::Hart;
use crate::isa::csr::Privilege;
use crate::plic::Plic;

type ResetHandler = Box<dyn Fn() + Send + Sync>;

/// Owns the machine's entire mutable topology. `attach_mmio`/`detach_mmio`/
/// `reset` serialize through `topology_lock` so two threads racing a
/// structural change can't interleave; it is distinct from `Bus`'s own
/// internal `RwLock<MmioBus>`, which only protects a single attach/detach
/// call.
pub struct Machine {
    bus: Arc<Bus>,
    harts: Vec<Arc<Hart>>,
    plic: Arc<Plic>,
    clint: Arc<Clint>,
    config: Config,
    running: AtomicBool,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    topology_lock: Mutex<()>,
    reset_handlers: Mutex<Vec<ResetHandler>>,
}

impl Machine {
    pub fn new(config: Config) -> Result<Machine, MachineError> {
        config.validate()?;
        let ram = Arc::new(RamRegion::new("ram", config.mem_base, config.mem_size));
        let bus = Arc::new(Bus::new(ram));
        let harts: Vec<Arc<Hart>> =
            (0..config.hart_count as u64).map(|id| Arc::new(Hart::new(id, config.xlen64, config.reset_vector))).collect();
        let plic = Arc::new(Plic::new(1));
        for hart in &harts {
            plic.add_context(hart.clone(), false);
            plic.add_context(hart.clone(), true);
        }
        let clint = Arc::new(Clint::new(harts.clone()));
        bus.attach_mmio(clint.clone(), config.clint_base, crate::clint::CLINT_SPAN)?;
        info!(hart_count = harts.len(), mem_base = config.mem_base, mem_size = config.mem_size, "machine created");
        Ok(Machine {
            bus,
            harts,
            plic,
            clint,
            config,
            running: AtomicBool::new(false),
            worker_threads: Mutex::new(Vec::new()),
            topology_lock: Mutex::new(()),
            reset_handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn hart_count(&self) -> usize {
        self.harts.len()
    }

    pub fn hart(&self, index: usize) -> Option<&Arc<Hart>> {
        self.harts.get(index)
    }

    pub fn plic(&self) -> &Arc<Plic> {
        &self.plic
    }

    pub fn clint(&self) -> &Arc<Clint> {
        &self.clint
    }

    /// Spawns one OS thread per hart; each hart runs on a dedicated thread
    /// for the lifetime of the machine run.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut threads = self.worker_threads.lock().unwrap();
        for hart in &self.harts {
            let hart = hart.clone();
            let bus = self.bus.clone();
            threads.push(std::thread::spawn(move || hart.run(&bus)));
        }
        info!(count = threads.len(), "hart threads started");
    }

    /// Blocks until every hart has confirmed stopped.
    pub fn pause_all(&self) {
        for hart in &self.harts {
            hart.pause();
        }
        let mut threads = self.worker_threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn attach_mmio(&self, device: Arc<dyn Device>, begin: u64, size: u64) -> Result<(), MachineError> {
        let _guard = self.topology_lock.lock().unwrap();
        self.bus.attach_mmio(device, begin, size).map_err(MachineError::from)
    }

    pub fn detach_mmio(&self, begin: u64) -> Option<Arc<dyn Device>> {
        let _guard = self.topology_lock.lock().unwrap();
        self.bus.detach_mmio(begin)
    }

    /// Linear probe from `preferred_base` for a free `size`-byte span,
    /// bounded by the top of the 64-bit address space.
    pub fn mmio_zone_auto(&self, preferred_base: u64, size: u64) -> Result<u64, MachineError> {
        let _guard = self.topology_lock.lock().unwrap();
        self.bus
            .mmio_zone_auto(preferred_base, size, u64::MAX)
            .ok_or(MachineError::NoFreeMmioSlot { preferred_base, size })
    }

    pub fn read_physical(&self, paddr: u64, out: &mut [u8]) -> bool {
        self.bus.read(paddr, out, crate::device::AccessContext::Dma).is_ok()
    }

    pub fn write_physical(&self, paddr: u64, data: &[u8]) -> bool {
        self.bus.write(paddr, data, crate::device::AccessContext::Dma).is_ok()
    }

    pub fn dma_ptr(&self, paddr: u64, size: u64) -> Option<*mut u8> {
        self.bus.dma_ptr(paddr, size)
    }

    /// Registers one of possibly several callbacks invoked, in
    /// registration order, at the start of `reset`.
    pub fn set_reset_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.reset_handlers.lock().unwrap().push(Box::new(handler));
    }

    /// Pauses all harts, runs registered reset handlers, resets the PLIC
    /// and every attached device, clears RAM, reinitializes harts to the
    /// entry PC at M-mode, then resumes if the machine was running
    /// beforehand.
    pub fn reset(&self) {
        let _guard = self.topology_lock.lock().unwrap();
        let was_running = self.running.load(Ordering::SeqCst);
        if was_running {
            self.pause_all();
        }
        for handler in self.reset_handlers.lock().unwrap().iter() {
            handler();
        }
        self.plic.reset();
        for region in self.bus.mmio().iter() {
            region.device.reset();
        }
        // Zeroing RAM here gives a deterministic, reproducible boot every
        // time rather than leaking the prior session's image forward.
        self.bus.ram().zero_fill();
        for hart in &self.harts {
            hart.reset(self.config.reset_vector);
            self.bus.clear_reservation(hart.id());
        }
        warn!("machine reset complete");
        if was_running {
            drop(_guard);
            self.start();
        }
    }

    pub fn load_image(&self, paddr: u64, image: &[u8]) -> Result<(), MachineError> {
        let ram = self.bus.ram();
        let offset = paddr.checked_sub(ram.base()).ok_or(MachineError::InvalidConfig("image load address precedes RAM base"))?;
        ram.load_image(offset, image).map_err(|e| MachineError::Host(Box::new(e)))
    }

    /// Synthesizes a DTB. Each attached device gets the chance to splice
    /// its own `soc` subnode in through `Device::fdt_node`; `/chosen`
    /// carries the configured kernel command line through `bootargs` so a
    /// guest kernel booted from this FDT (rather than a `kernel`/`boot_rom`
    /// image with its own fixed arguments) still receives it.
    pub fn build_fdt(&self) -> Vec<u8> {
        let mut soc = FdtNode::new("soc")
            .prop("#address-cells", FdtValue::U32(2))
            .prop("#size-cells", FdtValue::U32(2))
            .prop("compatible", FdtValue::String("simple-bus".to_string()))
            .child(
                FdtNode::new("plic@c000000")
                    .prop("compatible", FdtValue::String("riscv,plic0".to_string()))
                    .prop("phandle", FdtValue::U32(self.plic.phandle())),
            );
        for region in self.bus.mmio().iter() {
            if let Some(node) = region.device.fdt_node(region.begin) {
                soc = soc.child(node);
            }
        }
        let mut cpus = FdtNode::new("cpus").prop("#address-cells", FdtValue::U32(1)).prop("timebase-frequency", FdtValue::U32(10_000_000));
        for (index, hart) in self.harts.iter().enumerate() {
            let isa = if self.config.xlen64 { "rv64imac" } else { "rv32imac" };
            cpus = cpus.child(
                FdtNode::new(format!("cpu@{index}"))
                    .prop("device_type", FdtValue::String("cpu".to_string()))
                    .prop("reg", FdtValue::U32(hart.id() as u32))
                    .prop("riscv,isa", FdtValue::String(isa.to_string())),
            );
        }
        let mut root = FdtNode::new("")
            .prop("#address-cells", FdtValue::U32(2))
            .prop("#size-cells", FdtValue::U32(2))
            .prop("compatible", FdtValue::String("riscv-core,virt".to_string()))
            .child(
                FdtNode::new(format!("memory@{:x}", self.config.mem_base))
                    .prop("device_type", FdtValue::String("memory".to_string()))
                    .prop("reg", FdtValue::Cells(vec![0, self.config.mem_base as u32, 0, self.config.mem_size as u32])),
            )
            .child(cpus)
            .child(soc);
        if !self.config.cmdline.is_empty() {
            root = root.child(FdtNode::new("chosen").prop("bootargs", FdtValue::String(self.config.cmdline.clone())));
        }
        Fdt::new(root).to_blob()
    }

    pub fn privilege_of(&self, hart_index: usize) -> Option<Privilege> {
        self.harts.get(hart_index).map(|h| h.privilege())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.pause_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config() -> Config {
        Config::new(0x8000_0000, 4096, true).hart_count(1)
    }

    #[test]
    fn new_machine_starts_paused() {
        let machine = Machine::new(small_config()).unwrap();
        assert_eq!(machine.hart_count(), 1);
    }

    #[test]
    fn attach_detach_mmio_round_trips() {
        struct Noop;
        impl Device for Noop {
            fn name(&self) -> &str {
                "noop"
            }
            fn read(&self, _o: u64, out: &mut [u8], _c: crate::device::AccessContext) -> crate::device::DeviceResult<bool> {
                out.fill(0);
                Ok(true)
            }
            fn write(&self, _o: u64, _d: &[u8], _c: crate::device::AccessContext) -> crate::device::DeviceResult<bool> {
                Ok(true)
            }
        }
        let machine = Machine::new(small_config()).unwrap();
        machine.attach_mmio(Arc::new(Noop), 0x1000_0000, 0x1000).unwrap();
        assert!(machine.detach_mmio(0x1000_0000).is_some());
    }

    #[test]
    fn mmio_zone_auto_skips_ram() {
        let machine = Machine::new(small_config()).unwrap();
        let addr = machine.mmio_zone_auto(0x8000_0000, 0x1000).unwrap();
        assert!(addr >= 0x8000_1000);
    }

    #[test]
    fn reset_runs_registered_handler() {
        let machine = Machine::new(small_config()).unwrap();
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        machine.set_reset_handler(move || flag.store(true, Ordering::SeqCst));
        machine.reset();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn read_write_physical_round_trips() {
        let machine = Machine::new(small_config()).unwrap();
        assert!(machine.write_physical(0x8000_0010, &[1, 2, 3, 4]));
        let mut buf = [0u8; 4];
        assert!(machine.read_physical(0x8000_0010, &mut buf));
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn build_fdt_includes_memory_node() {
        let machine = Machine::new(small_config()).unwrap();
        let blob = machine.build_fdt();
        assert!(blob.len() > 40);
    }

    #[test]
    fn build_fdt_carries_the_configured_cmdline() {
        let config = small_config().cmdline("console=ttyS0 root=/dev/vda");
        let machine = Machine::new(config).unwrap();
        let blob = machine.build_fdt();
        let needle = b"console=ttyS0 root=/dev/vda";
        assert!(blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn build_fdt_omits_chosen_without_a_cmdline() {
        let machine = Machine::new(small_config()).unwrap();
        let blob = machine.build_fdt();
        let needle = b"chosen";
        assert!(!blob.windows(needle.len()).any(|w| w == needle));
    }

    #[test]
    fn reset_clears_pending_plic_irqs() {
        let machine = Machine::new(small_config()).unwrap();
        let irq = machine.plic().alloc_irq();
        machine.plic().set_priority(irq, 5);
        machine.plic().send_irq(irq);
        assert!(machine.plic().claim(0).is_some());
        machine.reset();
        assert!(machine.plic().claim(0).is_none());
    }

    #[test]
    fn clint_mtimecmp_is_reachable_through_mmio() {
        let config = small_config();
        let clint_base = config.clint_base;
        let machine = Machine::new(config).unwrap();
        assert!(machine.write_physical(clint_base + 0x4000, &99u64.to_le_bytes()));
        let mut buf = [0u8; 8];
        assert!(machine.read_physical(clint_base + 0x4000, &mut buf));
        assert_eq!(u64::from_le_bytes(buf), 99);
    }
}
