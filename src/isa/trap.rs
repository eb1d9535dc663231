//! Traps: exception/interrupt causes and the entry/xRET protocol.
//! Cause-code values follow the privileged architecture exactly since
//! guests decode `mcause`/`scause` directly; a single tagged `Trap` type
//! is threaded through the interpreter's `Result` rather than a bare
//! error code.

use crate::isa::csr::{Csr, Privilege};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvCallFromU,
    EnvCallFromS,
    EnvCallFromM,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
}

impl Exception {
    pub fn code(self) -> u32 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EnvCallFromU => 8,
            Exception::EnvCallFromS => 9,
            Exception::EnvCallFromM => 11,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
        }
    }

    pub fn ecall_from(priv_: Privilege) -> Exception {
        match priv_ {
            Privilege::User => Exception::EnvCallFromU,
            Privilege::Supervisor => Exception::EnvCallFromS,
            Privilege::Machine => Exception::EnvCallFromM,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trap {
    Exception(Exception, u64),
    Interrupt(u32),
}

impl Trap {
    pub fn cause_value(self, xlen64: bool) -> u64 {
        match self {
            Trap::Exception(e, _) => e.code() as u64,
            Trap::Interrupt(code) => {
                let top_bit = if xlen64 { 1u64 << 63 } else { 1u64 << 31 };
                top_bit | code as u64
            }
        }
    }

    pub fn tval(self) -> u64 {
        match self {
            Trap::Exception(_, tval) => tval,
            Trap::Interrupt(_) => 0,
        }
    }

    pub fn is_interrupt(self) -> bool {
        matches!(self, Trap::Interrupt(_))
    }

    fn code(self) -> u32 {
        match self {
            Trap::Exception(e, _) => e.code(),
            Trap::Interrupt(c) => c,
        }
    }

    fn delegated(self, csr: &Csr) -> bool {
        let mask = if self.is_interrupt() { csr.mideleg } else { csr.medeleg };
        mask & (1 << self.code()) != 0
    }
}

/// Result of `take_trap`: where execution resumes and at what privilege.
pub struct TrapEntry {
    pub new_pc: u64,
    pub new_privilege: Privilege,
}

/// Delivers `trap`: pick the target privilege via delegation, save
/// `pc`/`cause`/`tval`, stack the interrupt-enable and previous-privilege
/// bits, and compute the vector target. A single chokepoint rather than
/// inlining this at every call site.
pub fn take_trap(csr: &mut Csr, current: Privilege, pc: u64, trap: Trap) -> TrapEntry {
    let to_supervisor = current != Privilege::Machine && trap.delegated(csr);
    let cause = trap.cause_value(csr.xlen64);
    let tval = trap.tval();

    if to_supervisor {
        csr.sepc = pc;
        csr.scause = cause;
        csr.stval = tval;
        let spie = csr.mstatus_sie();
        csr.set_spp(current == Privilege::Supervisor);
        set_bit(&mut csr.mstatus, crate::isa::csr::mstatus_bits::SPIE, spie);
        set_bit(&mut csr.mstatus, crate::isa::csr::mstatus_bits::SIE, false);
        let target = csr.tvec_target(csr.stvec, trap.code(), trap.is_interrupt());
        TrapEntry { new_pc: target, new_privilege: Privilege::Supervisor }
    } else {
        csr.mepc = pc;
        csr.mcause = cause;
        csr.mtval = tval;
        let mpie = csr.mstatus_mie();
        csr.set_mpp(current);
        set_bit(&mut csr.mstatus, crate::isa::csr::mstatus_bits::MPIE, mpie);
        set_bit(&mut csr.mstatus, crate::isa::csr::mstatus_bits::MIE, false);
        let target = csr.tvec_target(csr.mtvec, trap.code(), trap.is_interrupt());
        TrapEntry { new_pc: target, new_privilege: Privilege::Machine }
    }
}

/// `MRET`/`SRET`: restore the interrupt-enable and privilege stacked by the
/// matching `take_trap`.
pub fn take_xret(csr: &mut Csr, is_mret: bool) -> TrapEntry {
    use crate::isa::csr::mstatus_bits::*;
    if is_mret {
        let mpie = csr.mstatus & MPIE != 0;
        let mpp = csr.mpp();
        set_bit(&mut csr.mstatus, MIE, mpie);
        set_bit(&mut csr.mstatus, MPIE, true);
        csr.set_mpp(Privilege::User);
        TrapEntry { new_pc: csr.mepc, new_privilege: mpp }
    } else {
        let spie = csr.mstatus & SPIE != 0;
        let spp = if csr.spp_is_supervisor() { Privilege::Supervisor } else { Privilege::User };
        set_bit(&mut csr.mstatus, SIE, spie);
        set_bit(&mut csr.mstatus, SPIE, true);
        csr.set_spp(false);
        TrapEntry { new_pc: csr.sepc, new_privilege: spp }
    }
}

fn set_bit(value: &mut u64, mask: u64, set: bool) {
    if set {
        *value |= mask;
    } else {
        *value &= !mask;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn undelegated_exception_traps_to_machine() {
        let mut csr = Csr::new(0, true);
        csr.mtvec = 0x8000_0000;
        let entry = take_trap(&mut csr, Privilege::User, 0x1000, Trap::Exception(Exception::IllegalInstruction, 0));
        assert_eq!(entry.new_privilege, Privilege::Machine);
        assert_eq!(entry.new_pc, 0x8000_0000);
        assert_eq!(csr.mepc, 0x1000);
        assert_eq!(csr.mcause, 2);
    }

    #[test]
    fn delegated_exception_traps_to_supervisor_and_back() {
        let mut csr = Csr::new(0, true);
        csr.medeleg = 1 << Exception::EnvCallFromU.code();
        csr.stvec = 0x9000_0000;
        let entry = take_trap(&mut csr, Privilege::User, 0x2000, Trap::Exception(Exception::EnvCallFromU, 0));
        assert_eq!(entry.new_privilege, Privilege::Supervisor);
        assert_eq!(csr.sepc, 0x2000);
        assert!(!csr.spp_is_supervisor());

        let back = take_xret(&mut csr, false);
        assert_eq!(back.new_pc, 0x2000);
        assert_eq!(back.new_privilege, Privilege::User);
    }

    #[test]
    fn interrupt_cause_sets_top_bit() {
        let trap = Trap::Interrupt(7);
        assert_eq!(trap.cause_value(true), (1u64 << 63) | 7);
        assert_eq!(trap.cause_value(false), (1u64 << 31) | 7);
    }
}
