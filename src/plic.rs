//! Platform-Level Interrupt Controller contract: `alloc_irq`/`send_irq`/
//! `clear_irq` plus a `phandle` for FDT linkage. Priority-vs-threshold
//! resolution is a straightforward "higher priority than the context's
//! threshold wins" comparison, same idiom `bus::mmio`'s overlap check
//! uses for its own ordering decisions.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::hart::Hart;

const MAX_IRQS: u32 = 1024;

struct Context {
    hart: Arc<Hart>,
    supervisor: bool,
    priority_threshold: AtomicU32,
    pending: Mutex<Vec<u32>>,
}

/// Platform-Level Interrupt Controller. One per machine; every hart
/// registers a context (one per hart per privilege level that takes
/// external interrupts).
pub struct Plic {
    phandle: u32,
    next_irq: AtomicU32,
    priorities: Mutex<[u32; MAX_IRQS as usize]>,
    contexts: Mutex<Vec<Context>>,
}

impl Plic {
    pub fn new(phandle: u32) -> Self {
        Self {
            phandle,
            next_irq: AtomicU32::new(1),
            priorities: Mutex::new([1; MAX_IRQS as usize]),
            contexts: Mutex::new(Vec::new()),
        }
    }

    pub fn phandle(&self) -> u32 {
        self.phandle
    }

    /// Registers a hart context; `supervisor` selects whether this
    /// context raises `SEIP` (S-mode target) or `MEIP` (M-mode target).
    pub fn add_context(&self, hart: Arc<Hart>, supervisor: bool) {
        self.contexts.lock().unwrap().push(Context {
            hart,
            supervisor,
            priority_threshold: AtomicU32::new(0),
            pending: Mutex::new(Vec::new()),
        });
    }

    pub fn set_threshold(&self, context_index: usize, threshold: u32) {
        if let Some(ctx) = self.contexts.lock().unwrap().get(context_index) {
            ctx.priority_threshold.store(threshold, Ordering::SeqCst);
        }
    }

    /// Allocates the next free IRQ number.
    pub fn alloc_irq(&self) -> u32 {
        self.next_irq.fetch_add(1, Ordering::SeqCst)
    }

    pub fn set_priority(&self, irq: u32, priority: u32) {
        if let Some(slot) = self.priorities.lock().unwrap().get_mut(irq as usize) {
            *slot = priority;
        }
    }

    /// ORs `irq` into every registered context's pending set; any context
    /// whose priority exceeds its threshold has `MEIP`/`SEIP` raised on
    /// its hart. Callable from any thread.
    pub fn send_irq(&self, irq: u32) {
        let priority = self.priorities.lock().unwrap().get(irq as usize).copied().unwrap_or(0);
        let contexts = self.contexts.lock().unwrap();
        for ctx in contexts.iter() {
            let mut pending = ctx.pending.lock().unwrap();
            if !pending.contains(&irq) {
                pending.push(irq);
            }
            if priority > ctx.priority_threshold.load(Ordering::SeqCst) {
                ctx.hart.raise_external(ctx.supervisor, true);
            }
        }
    }

    pub fn clear_irq(&self, irq: u32) {
        let contexts = self.contexts.lock().unwrap();
        for ctx in contexts.iter() {
            let mut pending = ctx.pending.lock().unwrap();
            pending.retain(|&x| x != irq);
            if pending.is_empty() {
                ctx.hart.raise_external(ctx.supervisor, false);
            }
        }
    }

    /// Highest-priority pending irq for a context still above threshold,
    /// the "claim" half of claim/complete; `clear_irq` is "complete".
    /// Clears every pending IRQ and priority threshold back to its
    /// post-construction default. Leaves registered contexts and allocated
    /// IRQ numbers alone; those are machine topology, not interrupt state.
    pub fn reset(&self) {
        *self.priorities.lock().unwrap() = [1; MAX_IRQS as usize];
        for ctx in self.contexts.lock().unwrap().iter() {
            ctx.priority_threshold.store(0, Ordering::SeqCst);
            let mut pending = ctx.pending.lock().unwrap();
            if !pending.is_empty() {
                pending.clear();
                ctx.hart.raise_external(ctx.supervisor, false);
            }
        }
    }

    pub fn claim(&self, context_index: usize) -> Option<u32> {
        let contexts = self.contexts.lock().unwrap();
        let ctx = contexts.get(context_index)?;
        let priorities = self.priorities.lock().unwrap();
        let threshold = ctx.priority_threshold.load(Ordering::SeqCst);
        ctx.pending
            .lock()
            .unwrap()
            .iter()
            .copied()
            .filter(|&irq| priorities.get(irq as usize).copied().unwrap_or(0) > threshold)
            .max_by_key(|&irq| priorities.get(irq as usize).copied().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_irq_returns_increasing_numbers() {
        let plic = Plic::new(1);
        let a = plic.alloc_irq();
        let b = plic.alloc_irq();
        assert!(b > a);
    }

    #[test]
    fn send_irq_raises_external_on_registered_context() {
        let plic = Plic::new(1);
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        plic.add_context(hart.clone(), false);
        let irq = plic.alloc_irq();
        plic.set_priority(irq, 5);
        plic.send_irq(irq);
        assert!(plic.claim(0).is_some());
        plic.clear_irq(irq);
        assert!(plic.claim(0).is_none());
    }

    #[test]
    fn reset_clears_pending_irqs_and_thresholds() {
        let plic = Plic::new(1);
        let hart = Arc::new(Hart::new(0, true, 0x8000_0000));
        plic.add_context(hart.clone(), false);
        let irq = plic.alloc_irq();
        plic.set_priority(irq, 5);
        plic.set_threshold(0, 3);
        plic.send_irq(irq);
        assert!(plic.claim(0).is_some());

        plic.reset();

        assert!(plic.claim(0).is_none(), "pending IRQs survive reset");
        plic.send_irq(irq);
        assert!(plic.claim(0).is_some(), "threshold should be back to its default of 0");
    }
}
