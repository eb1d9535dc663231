//! Per-hart runtime: wraps `isa::interp::Cpu` with the pause/resume
//! protocol, preemption, and WFI suspension used to stop the world for
//! `Machine::reset`/`attach_mmio`, throttle a hart from a watchdog thread,
//! and park an idle hart. A `Mutex`-guarded state machine plus `Condvar`
//! rather than a hard kill, since dropping a hart mid bus-transaction
//! would leave the bus in an inconsistent state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use bitflags::bitflags;

use crate::bus::Bus;
use crate::isa::csr::{Privilege, MIP_MEIP, MIP_MSIP, MIP_MTIP, MIP_SEIP, MIP_SSIP, MIP_STIP};
use crate::isa::interp::{Cpu, StepOutcome};

bitflags! {
    /// The `mip` bits a hart's own CLINT/PLIC registration is allowed to
    /// set from outside that hart's thread; every other `mip` bit (the
    /// S-mode software-settable ones) is owned exclusively by the
    /// interpreter running on the hart's own thread.
    struct ExternalMip: u64 {
        const SSIP = MIP_SSIP;
        const MSIP = MIP_MSIP;
        const STIP = MIP_STIP;
        const MTIP = MIP_MTIP;
        const SEIP = MIP_SEIP;
        const MEIP = MIP_MEIP;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Running,
    WaitingForInterrupt,
    Preempted,
    Paused,
    Stopped,
}

struct Control {
    state: RunState,
    pause_requested: bool,
    /// Set by `preempt`, consumed by the run loop at its next safe point.
    preempt_ms: Option<u64>,
}

pub struct Hart {
    id: u64,
    cpu: Mutex<Cpu>,
    control: Mutex<Control>,
    cv: Condvar,
    /// Bits OR'd in by another thread (PLIC, CLINT) between hart steps.
    /// Merged into `Cpu::csr.mip` at the top of every run-loop iteration so
    /// the interpreter itself never has to be `Sync`-aware of `mip`.
    pending_external: AtomicU64,
}

impl Hart {
    pub fn new(id: u64, xlen64: bool, reset_vector: u64) -> Self {
        Self {
            id,
            cpu: Mutex::new(Cpu::new(id, xlen64, reset_vector)),
            control: Mutex::new(Control { state: RunState::Paused, pause_requested: false, preempt_ms: None }),
            cv: Condvar::new(),
            pending_external: AtomicU64::new(0),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn reset(&self, reset_vector: u64) {
        self.cpu.lock().unwrap().reset(reset_vector);
        self.pending_external.store(0, Ordering::SeqCst);
    }

    /// Sets or clears an interrupt line. `bit` is one of the `MIP_*`
    /// constants; PLIC/CLINT call this from their own thread context.
    pub fn set_irq(&self, bit: u64, level: bool) {
        if level {
            self.pending_external.fetch_or(bit, Ordering::SeqCst);
        } else {
            self.pending_external.fetch_and(!bit, Ordering::SeqCst);
        }
        self.cv.notify_all();
    }

    pub fn raise_timer(&self, level: bool) {
        self.set_irq(MIP_MTIP, level);
    }

    pub fn raise_software(&self, level: bool) {
        self.set_irq(MIP_MSIP, level);
    }

    pub fn raise_external(&self, supervisor: bool, level: bool) {
        self.set_irq(if supervisor { MIP_SEIP } else { MIP_MEIP }, level);
    }

    /// Runs until `pause()` is requested. Safe to call from exactly one
    /// worker thread per hart; `pause`/`resume` may be called from any
    /// other thread.
    pub fn run(&self, bus: &Bus) {
        {
            let mut control = self.control.lock().unwrap();
            control.state = RunState::Running;
        }
        loop {
            if self.should_pause() {
                self.enter_paused();
                return;
            }
            if let Some(ms) = self.take_preempt_request() {
                if !self.sleep_preempted(ms) {
                    self.enter_paused();
                    return;
                }
            }
            self.merge_pending_irqs();
            let outcome = {
                let mut cpu = self.cpu.lock().unwrap();
                cpu.step(bus)
            };
            if outcome == StepOutcome::WaitForInterrupt {
                if !self.wait_for_interrupt_or_pause() {
                    self.enter_paused();
                    return;
                }
            }
        }
    }

    fn merge_pending_irqs(&self) {
        let external = self.pending_external.load(Ordering::SeqCst);
        let mut cpu = self.cpu.lock().unwrap();
        let mask = ExternalMip::all().bits();
        cpu.csr.mip = (cpu.csr.mip & !mask) | (external & mask);
    }

    fn should_pause(&self) -> bool {
        self.control.lock().unwrap().pause_requested
    }

    fn take_preempt_request(&self) -> Option<u64> {
        self.control.lock().unwrap().preempt_ms.take()
    }

    /// Sleeps on the run-loop condition variable for `duration_ms`, the
    /// same mechanism `wait_for_interrupt_or_pause` parks a WFI on, so a
    /// pause arriving mid-preemption still cuts it short. Returns `false`
    /// if the caller should stop rather than resume running.
    fn sleep_preempted(&self, duration_ms: u64) -> bool {
        {
            let mut control = self.control.lock().unwrap();
            control.state = RunState::Preempted;
        }
        let deadline = Instant::now() + Duration::from_millis(duration_ms);
        loop {
            if self.should_pause() {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                let mut control = self.control.lock().unwrap();
                control.state = RunState::Running;
                return true;
            }
            let control = self.control.lock().unwrap();
            let _ = self.cv.wait_timeout(control, deadline - now);
        }
    }

    fn enter_paused(&self) {
        let mut control = self.control.lock().unwrap();
        control.state = RunState::Paused;
        control.pause_requested = false;
        self.cv.notify_all();
    }

    /// Blocks until an interrupt becomes pending or a pause is requested.
    /// Returns `false` if the caller should stop (pause was requested).
    fn wait_for_interrupt_or_pause(&self) -> bool {
        {
            let mut control = self.control.lock().unwrap();
            control.state = RunState::WaitingForInterrupt;
        }
        loop {
            self.merge_pending_irqs();
            if self.should_pause() {
                return false;
            }
            if self.cpu.lock().unwrap().csr.wfi_wake_pending() {
                let mut control = self.control.lock().unwrap();
                control.state = RunState::Running;
                return true;
            }
            let control = self.control.lock().unwrap();
            let _ = self.cv.wait_timeout(control, Duration::from_millis(1));
        }
    }

    /// Requests the run loop stop at the next safe point and blocks until
    /// it has; pause is synchronous from the caller's perspective.
    pub fn pause(&self) {
        {
            let mut control = self.control.lock().unwrap();
            if control.state == RunState::Paused || control.state == RunState::Stopped {
                return;
            }
            control.pause_requested = true;
        }
        self.cv.notify_all();
        let control = self.control.lock().unwrap();
        let _unused = self
            .cv
            .wait_while(control, |c| c.state != RunState::Paused && c.state != RunState::Stopped)
            .unwrap();
    }

    /// Requests the hart surrender the CPU for `duration_ms` at its next
    /// safe point; unlike `pause`, this does not block the caller. A
    /// watchdog thread fires-and-forgets this to throttle a misbehaving
    /// or over-budget hart.
    pub fn preempt(&self, duration_ms: u64) {
        {
            let mut control = self.control.lock().unwrap();
            control.preempt_ms = Some(duration_ms);
        }
        self.cv.notify_all();
    }

    pub fn privilege(&self) -> Privilege {
        self.cpu.lock().unwrap().privilege
    }

    pub fn pc(&self) -> u64 {
        self.cpu.lock().unwrap().pc
    }

    pub fn read_reg(&self, idx: u8) -> u64 {
        let cpu = self.cpu.lock().unwrap();
        if idx == 0 {
            0
        } else {
            cpu.regs[idx as usize]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamRegion;
    use std::sync::Arc;

    #[test]
    fn pause_before_run_is_a_no_op_handshake() {
        let hart = Hart::new(0, true, 0x8000_0000);
        hart.pause();
        assert_eq!(hart.pc(), 0x8000_0000);
    }

    #[test]
    fn set_irq_is_visible_after_merge() {
        let hart = Hart::new(0, true, 0x8000_0000);
        hart.raise_timer(true);
        hart.merge_pending_irqs();
        assert_eq!(hart.cpu.lock().unwrap().csr.mip & MIP_MTIP, MIP_MTIP);
    }

    #[test]
    fn preempt_suspends_the_run_loop_for_roughly_the_requested_duration() {
        let bus = Bus::new(Arc::new(RamRegion::new("ram", 0x8000_0000, 4096)));
        bus.write(0x8000_0000, &0x0000_006fu32.to_le_bytes(), crate::device::AccessContext::Cpu).unwrap();
        let hart = std::sync::Arc::new(Hart::new(0, true, 0x8000_0000));
        let worker = {
            let hart = hart.clone();
            std::thread::spawn(move || hart.run(bus_leak(bus)))
        };
        hart.preempt(20);
        std::thread::sleep(Duration::from_millis(5));
        // Still preempted; the pause request below has to interrupt the sleep.
        hart.pause();
        worker.join().unwrap();
    }

    #[test]
    fn run_executes_until_paused() {
        let bus = Bus::new(Arc::new(RamRegion::new("ram", 0x8000_0000, 4096)));
        // an infinite loop: jal x0, 0
        bus.write(0x8000_0000, &0x0000_006fu32.to_le_bytes(), crate::device::AccessContext::Cpu).unwrap();
        let hart = std::sync::Arc::new(Hart::new(0, true, 0x8000_0000));
        let worker = {
            let hart = hart.clone();
            std::thread::spawn(move || hart.run(bus_leak(bus)))
        };
        std::thread::sleep(Duration::from_millis(20));
        hart.pause();
        worker.join().unwrap();
    }

    // leaks the bus for the lifetime of the test thread; acceptable in a
    // unit test, never used in production code.
    fn bus_leak(bus: Bus) -> &'static Bus {
        Box::leak(Box::new(bus))
    }
}
