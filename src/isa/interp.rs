//! Instruction dispatch, execute half: one `Cpu` per hart, `step()`
//! fetches, decodes, and executes exactly one instruction against a `Bus`,
//! catching any trap raised along the way and routing it through
//! `isa::trap::take_trap`.

use crate::bus::{Bus, BusError};
use crate::device::AccessContext;
use crate::isa::bits;
use crate::isa::csr::{Csr, FpuStatus, Privilege};
use crate::isa::decode::{self, AmoWidth, FpWidth, Instr};
use crate::isa::trap::{take_trap, take_xret, Exception, Trap};
use crate::mmu::{AccessKind, Mmu};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Continue,
    WaitForInterrupt,
}

pub struct Cpu {
    pub regs: [u64; 32],
    pub fregs: [u64; 32],
    pub pc: u64,
    pub csr: Csr,
    pub mmu: Mmu,
    pub privilege: Privilege,
    pub xlen64: bool,
}

impl Cpu {
    pub fn new(hartid: u64, xlen64: bool, reset_vector: u64) -> Self {
        Self {
            regs: [0; 32],
            fregs: [0; 32],
            pc: reset_vector,
            csr: Csr::new(hartid, xlen64),
            mmu: Mmu::new(),
            privilege: Privilege::Machine,
            xlen64,
        }
    }

    pub fn reset(&mut self, reset_vector: u64) {
        self.regs = [0; 32];
        self.fregs = [0; 32];
        self.pc = reset_vector;
        self.csr.reset();
        self.mmu.flush_all();
        self.privilege = Privilege::Machine;
    }

    fn reg(&self, idx: u8) -> u64 {
        if idx == 0 {
            0
        } else {
            self.regs[idx as usize]
        }
    }

    fn set_reg(&mut self, idx: u8, value: u64) {
        if idx != 0 {
            self.regs[idx as usize] = if self.xlen64 { value } else { value as u32 as u64 };
        }
    }

    fn xreg_width(&self) -> u32 {
        if self.xlen64 {
            64
        } else {
            32
        }
    }

    /// Runs one step: delivers a pending interrupt if any, else fetches,
    /// decodes, and executes one instruction. All traps raised during the
    /// step are caught here and delivered via `take_trap` — callers never
    /// see a `Trap` escape `step`.
    pub fn step(&mut self, bus: &Bus) -> StepOutcome {
        if let Some(cause) = self.csr.deliverable_interrupt(self.privilege) {
            self.enter_trap(Trap::Interrupt(cause));
            return StepOutcome::Continue;
        }
        match self.try_step(bus) {
            Ok(outcome) => outcome,
            Err(trap) => {
                self.enter_trap(trap);
                StepOutcome::Continue
            }
        }
    }

    fn enter_trap(&mut self, trap: Trap) {
        let entry = take_trap(&mut self.csr, self.privilege, self.pc, trap);
        self.pc = entry.new_pc;
        self.privilege = entry.new_privilege;
    }

    fn try_step(&mut self, bus: &Bus) -> Result<StepOutcome, Trap> {
        let pc = self.pc;
        let first_half = self.fetch_u16(bus, pc)?;
        let (word, next_pc) = if first_half & 0b11 == 0b11 {
            let hi = self.fetch_u16(bus, pc + 2)?;
            (((hi as u32) << 16) | first_half as u32, pc + 4)
        } else {
            let expanded = decode::expand_compressed(first_half, self.xlen64)
                .ok_or(Trap::Exception(Exception::IllegalInstruction, first_half as u64))?;
            (expanded, pc + 2)
        };
        let instr = decode::decode(word, self.xlen64)
            .ok_or(Trap::Exception(Exception::IllegalInstruction, word as u64))?;
        #[cfg(feature = "trace")]
        tracing::trace!(hartid = self.csr.hartid, pc, word, instr = ?instr, "retire");
        self.pc = next_pc;
        self.csr.minstret = self.csr.minstret.wrapping_add(1);
        self.csr.mcycle = self.csr.mcycle.wrapping_add(1);
        self.execute(bus, instr, pc)
    }

    fn fetch_u16(&mut self, bus: &Bus, vaddr: u64) -> Result<u16, Trap> {
        let phys = self.translate(bus, vaddr, AccessKind::Execute)?;
        let mut buf = [0u8; 2];
        bus.read(phys, &mut buf, AccessContext::Cpu)
            .map_err(|e| bus_err_to_trap(e, AccessKind::Execute))?;
        Ok(u16::from_le_bytes(buf))
    }

    fn translate(&mut self, bus: &Bus, vaddr: u64, kind: AccessKind) -> Result<u64, Trap> {
        self.mmu
            .translate(bus, self.csr.satp, self.xlen64, vaddr, kind, self.privilege, self.csr.sum(), self.csr.mxr())
            .map_err(|_| {
                let exception = match kind {
                    AccessKind::Execute => Exception::InstructionPageFault,
                    AccessKind::Read => Exception::LoadPageFault,
                    AccessKind::Write => Exception::StorePageFault,
                };
                Trap::Exception(exception, vaddr)
            })
    }

    fn load(&mut self, bus: &Bus, vaddr: u64, size: usize) -> Result<u64, Trap> {
        let phys = self.translate(bus, vaddr, AccessKind::Read)?;
        let mut buf = [0u8; 8];
        bus.read(phys, &mut buf[..size], AccessContext::Cpu).map_err(|e| bus_err_to_trap(e, AccessKind::Read))?;
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, bus: &Bus, vaddr: u64, size: usize, value: u64) -> Result<(), Trap> {
        let phys = self.translate(bus, vaddr, AccessKind::Write)?;
        // `Bus::write` broadcasts the reservation invalidation to every hart,
        // not just this one.
        bus.write(phys, &value.to_le_bytes()[..size], AccessContext::Cpu)
            .map_err(|e| bus_err_to_trap(e, AccessKind::Write))
    }

    fn execute(&mut self, bus: &Bus, instr: Instr, pc: u64) -> Result<StepOutcome, Trap> {
        match instr {
            Instr::Lui { rd, imm } => self.set_reg(rd, imm as u64),
            Instr::Auipc { rd, imm } => self.set_reg(rd, pc.wrapping_add(imm as u64)),
            Instr::Jal { rd, imm } => {
                self.set_reg(rd, self.pc);
                self.pc = pc.wrapping_add(imm as u64);
            }
            Instr::Jalr { rd, rs1, imm } => {
                let target = self.reg(rs1).wrapping_add(imm as u64) & !1;
                let link = self.pc;
                self.pc = target;
                self.set_reg(rd, link);
            }
            Instr::Branch { funct3, rs1, rs2, imm } => {
                let a = self.reg(rs1);
                let b = self.reg(rs2);
                let taken = match funct3 {
                    0b000 => a == b,
                    0b001 => a != b,
                    0b100 => (a as i64) < (b as i64),
                    0b101 => (a as i64) >= (b as i64),
                    0b110 => a < b,
                    0b111 => a >= b,
                    _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
                };
                if taken {
                    self.pc = pc.wrapping_add(imm as u64);
                }
            }
            Instr::Load { funct3, rd, rs1, imm } => {
                let addr = self.reg(rs1).wrapping_add(imm as u64);
                let value = match funct3 {
                    0b000 => bits::sign_extend(self.load(bus, addr, 1)?, 8),
                    0b001 => bits::sign_extend(self.load(bus, addr, 2)?, 16),
                    0b010 => bits::sign_extend(self.load(bus, addr, 4)?, 32),
                    0b011 if self.xlen64 => self.load(bus, addr, 8)?,
                    0b100 => self.load(bus, addr, 1)?,
                    0b101 => self.load(bus, addr, 2)?,
                    0b110 if self.xlen64 => self.load(bus, addr, 4)?,
                    _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
                };
                self.set_reg(rd, value);
            }
            Instr::Store { funct3, rs1, rs2, imm } => {
                let addr = self.reg(rs1).wrapping_add(imm as u64);
                let value = self.reg(rs2);
                match funct3 {
                    0b000 => self.store(bus, addr, 1, value)?,
                    0b001 => self.store(bus, addr, 2, value)?,
                    0b010 => self.store(bus, addr, 4, value)?,
                    0b011 if self.xlen64 => self.store(bus, addr, 8, value)?,
                    _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
                }
            }
            Instr::OpImm { funct3, funct7, rd, rs1, imm, shamt } => {
                self.exec_op_imm(rd, rs1, funct3, funct7, imm, shamt)?;
            }
            Instr::OpImmW { funct3, funct7, rd, rs1, imm, shamt } => {
                self.exec_op_imm_w(rd, rs1, funct3, funct7, imm, shamt)?;
            }
            Instr::Op { funct3, funct7, rd, rs1, rs2 } => self.exec_op(rd, rs1, rs2, funct3, funct7)?,
            Instr::OpW { funct3, funct7, rd, rs1, rs2 } => self.exec_op_w(rd, rs1, rs2, funct3, funct7)?,
            Instr::Fence | Instr::FenceI => {}
            Instr::Ecall => return Err(Trap::Exception(Exception::ecall_from(self.privilege), 0)),
            Instr::Ebreak => return Err(Trap::Exception(Exception::Breakpoint, pc)),
            Instr::Mret => {
                if self.privilege != Privilege::Machine {
                    return Err(Trap::Exception(Exception::IllegalInstruction, 0));
                }
                let entry = take_xret(&mut self.csr, true);
                self.pc = entry.new_pc;
                self.privilege = entry.new_privilege;
            }
            Instr::Sret => {
                if self.privilege == Privilege::User {
                    return Err(Trap::Exception(Exception::IllegalInstruction, 0));
                }
                let entry = take_xret(&mut self.csr, false);
                self.pc = entry.new_pc;
                self.privilege = entry.new_privilege;
            }
            Instr::Wfi => {
                if self.privilege == Privilege::User {
                    return Err(Trap::Exception(Exception::IllegalInstruction, 0));
                }
                if !self.csr.wfi_wake_pending() {
                    return Ok(StepOutcome::WaitForInterrupt);
                }
            }
            Instr::SfenceVma { rs1, rs2: _rs2 } => {
                if self.privilege == Privilege::User {
                    return Err(Trap::Exception(Exception::IllegalInstruction, 0));
                }
                if rs1 == 0 {
                    self.mmu.flush_all();
                } else {
                    self.mmu.flush_page(self.reg(rs1));
                }
            }
            Instr::Csr { funct3, rd, rs1, csr } => self.exec_csr(rd, rs1, funct3, csr)?,
            Instr::Amo { funct5, width, rd, rs1, rs2, .. } => self.exec_amo(bus, funct5, width, rd, rs1, rs2)?,
            Instr::FLoad { width, rd, rs1, imm } => {
                let addr = self.reg(rs1).wrapping_add(imm as u64);
                let value = match width {
                    FpWidth::Single => self.load(bus, addr, 4)? | 0xFFFF_FFFF_0000_0000, // NaN-box
                    FpWidth::Double => self.load(bus, addr, 8)?,
                };
                self.fregs[rd as usize] = value;
                self.csr.set_fs(FpuStatus::Dirty);
            }
            Instr::FStore { width, rs1, rs2, imm } => {
                let addr = self.reg(rs1).wrapping_add(imm as u64);
                let value = self.fregs[rs2 as usize];
                match width {
                    FpWidth::Single => self.store(bus, addr, 4, value)?,
                    FpWidth::Double => self.store(bus, addr, 8, value)?,
                }
            }
            Instr::FmvToInt { double, rd, rs1 } => {
                let raw = self.fregs[rs1 as usize];
                let value = if double { raw } else { bits::sign_extend(raw & 0xFFFF_FFFF, 32) };
                self.set_reg(rd, value);
            }
            Instr::FmvToFp { double, rd, rs1 } => {
                let x = self.reg(rs1);
                self.fregs[rd as usize] = if double { x } else { x | 0xFFFF_FFFF_0000_0000 };
                self.csr.set_fs(FpuStatus::Dirty);
            }
        }
        Ok(StepOutcome::Continue)
    }

    fn exec_op_imm(&mut self, rd: u8, rs1: u8, funct3: u8, funct7: u8, imm: i64, shamt: u32) -> Result<(), Trap> {
        let a = self.reg(rs1);
        let imm12 = (imm as u64) & 0xFFF;
        let width = self.xreg_width();
        let bit = shamt & (width - 1);
        // The high bit of `shamt` doubles as bit 25 of the word, which the
        // Zbs/shift funct7 patterns also treat as part of their fixed
        // top-6-bit tag on RV64 (shamt can be 0..63 there); compare on
        // `funct7 >> 1` so both shamt halves match the same tag.
        let top6 = funct7 >> 1;
        let value = match funct3 {
            0b000 => a.wrapping_add(imm as u64),
            0b010 => ((a as i64) < imm) as u64,
            0b011 => (a < imm as u64) as u64,
            0b100 => a ^ imm as u64,
            0b110 => a | imm as u64,
            0b111 => a & imm as u64,
            0b001 => match top6 {
                0b000000 => a << bit,
                0b010010 => a & !(1u64 << bit),  // BCLRI
                0b001010 => a | (1u64 << bit),   // BSETI
                0b011010 => a ^ (1u64 << bit),   // BINVI
                0b011000 => match shamt {
                    0 => {
                        if self.xlen64 { bits::clz64(a) as u64 } else { (bits::clz64(a as u32 as u64) - 32) as u64 }
                    }
                    1 => bits::ctz64(if self.xlen64 { a } else { a | (1 << 32) }) as u64,
                    2 => bits::cpop64(a) as u64,
                    0b00100 => bits::sign_extend(a & 0xFF, 8),
                    0b00101 => bits::sign_extend(a & 0xFFFF, 16),
                    _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
                },
                _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
            },
            0b101 => match top6 {
                0b000000 => (a & mask_for(width)) >> bit,
                0b010000 => {
                    let signed = bits::sign_extend(a & mask_for(width), width) as i64;
                    (signed >> bit) as u64 & mask_for(width)
                }
                0b011000 => bits::rotr64(a, shamt) & mask_for(width),
                0b010010 => (a >> bit) & 1, // BEXTI
                _ if imm12 == 0b001010000111 => bits::orc_b(a, self.xlen64),
                _ if imm12 == 0b011010011000 || imm12 == 0b011010111000 => bits::rev8(a, self.xlen64),
                _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
            },
            _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
        };
        self.set_reg(rd, value);
        Ok(())
    }

    fn exec_op_imm_w(&mut self, rd: u8, rs1: u8, funct3: u8, funct7: u8, imm: i64, shamt: u32) -> Result<(), Trap> {
        let a = self.reg(rs1) as u32;
        let value = match funct3 {
            0b000 => a.wrapping_add(imm as u32) as i32 as i64 as u64,
            0b001 if funct7 & 0b1111110 == 0b0000100 => {
                // SLLI.UW: shamt is 6 bits, bit25 (funct7 lsb) is the msb.
                let full_shamt = ((funct7 as u32 & 1) << 5) | shamt;
                ((a as u64) << full_shamt) as u64
            }
            0b001 if funct7 == 0b0110000 => match shamt {
                0 => bits::clz32(a) as u64,
                1 => bits::ctz32(a) as u64,
                2 => bits::cpop32(a) as u64,
                _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
            },
            0b001 => (a << (shamt & 31)) as i32 as i64 as u64,
            0b101 if funct7 == 0 => (a >> (shamt & 31)) as i32 as i64 as u64,
            0b101 if funct7 == 0b0100000 => ((a as i32) >> (shamt & 31)) as i64 as u64,
            _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
        };
        self.set_reg(rd, value);
        Ok(())
    }

    fn exec_op(&mut self, rd: u8, rs1: u8, rs2: u8, funct3: u8, funct7: u8) -> Result<(), Trap> {
        let a = self.reg(rs1);
        let b = self.reg(rs2);
        let width = self.xreg_width();
        let shamt = (b & (width as u64 - 1)) as u32;
        let value = match (funct3, funct7) {
            (0b000, 0b0000000) => a.wrapping_add(b),
            (0b000, 0b0100000) => a.wrapping_sub(b),
            (0b000, 0b0000001) => a.wrapping_mul(b),
            (0b001, 0b0000000) => a << shamt,
            (0b001, 0b0000001) => mulh(a as i64, b as i64),
            (0b001, 0b0110000) => bits::rotl64(a, shamt) & mask_for(width),
            (0b001, 0b0000101) => bits::clmul64(a, b),
            (0b001, 0b0100100) => a & !(1u64 << shamt), // BCLR
            (0b001, 0b0010100) => a | (1u64 << shamt),  // BSET
            (0b001, 0b0110100) => a ^ (1u64 << shamt),  // BINV
            (0b010, 0b0000000) => ((a as i64) < (b as i64)) as u64,
            (0b010, 0b0000001) => mulhsu(a as i64, b),
            (0b010, 0b0010000) => (a << 1).wrapping_add(b), // SH1ADD
            (0b010, 0b0000101) => bits::clmulr64(a, b),
            (0b011, 0b0000000) => (a < b) as u64,
            (0b011, 0b0000001) => ((a as u128).wrapping_mul(b as u128) >> 64) as u64,
            (0b011, 0b0000101) => bits::clmulh64(a, b),
            (0b100, 0b0000000) => a ^ b,
            (0b100, 0b0000001) => div(a as i64, b as i64, width) as u64,
            (0b100, 0b0100000) => !(a ^ b), // XNOR
            (0b100, 0b0010000) => (a << 2).wrapping_add(b), // SH2ADD
            (0b100, 0b0000101) => {
                if (a as i64) < (b as i64) { a } else { b } // MIN
            }
            (0b101, 0b0000000) => a >> shamt,
            (0b101, 0b0100000) => (bits::sign_extend(a & mask_for(width), width) as i64 >> shamt) as u64 & mask_for(width),
            (0b101, 0b0000001) => divu(a, b, width),
            (0b101, 0b0110000) => bits::rotr64(a, shamt) & mask_for(width),
            (0b101, 0b0100100) => (a >> shamt) & 1, // BEXT
            (0b101, 0b0000101) => {
                if a < b { a } else { b } // MINU
            }
            (0b110, 0b0000000) => a | b,
            (0b110, 0b0000001) => rem(a as i64, b as i64, width) as u64,
            (0b110, 0b0100000) => !a | b, // ORN
            (0b110, 0b0010000) => (a << 3).wrapping_add(b), // SH3ADD
            (0b110, 0b0000101) => {
                if (a as i64) > (b as i64) { a } else { b } // MAX
            }
            (0b111, 0b0000000) => a & b,
            (0b111, 0b0000001) => remu(a, b, width),
            (0b111, 0b0100000) => !a & b, // ANDN
            (0b111, 0b0000101) => {
                if a > b { a } else { b } // MAXU
            }
            (0b100, 0b0000100) if rs2 == 0 => a & 0xFFFF, // ZEXT.H (PACK rd, rs1, x0)
            (0b101, 0b0000111) => {
                if b == 0 { 0 } else { a } // CZERO.EQZ
            }
            (0b111, 0b0000111) => {
                if b != 0 { 0 } else { a } // CZERO.NEZ
            }
            _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
        };
        self.set_reg(rd, value);
        Ok(())
    }

    fn exec_op_w(&mut self, rd: u8, rs1: u8, rs2: u8, funct3: u8, funct7: u8) -> Result<(), Trap> {
        let a = self.reg(rs1) as u32;
        let b = self.reg(rs2) as u32;
        let b64 = self.reg(rs2);
        let value: u64 = match (funct3, funct7) {
            (0b000, 0b0000000) => a.wrapping_add(b) as i32 as i64 as u64,
            (0b000, 0b0100000) => a.wrapping_sub(b) as i32 as i64 as u64,
            (0b000, 0b0000001) => a.wrapping_mul(b) as i32 as i64 as u64,
            (0b000, 0b0000100) => (a as u64).wrapping_add(b64), // ADD.UW (full XLEN result, not sign-extended)
            (0b000, 0b0010000) => ((a as u64) << 1).wrapping_add(b64), // SH1ADD.UW
            (0b100, 0b0010000) => ((a as u64) << 2).wrapping_add(b64), // SH2ADD.UW
            (0b110, 0b0010000) => ((a as u64) << 3).wrapping_add(b64), // SH3ADD.UW
            (0b001, 0b0000000) => (a << (b & 31)) as i32 as i64 as u64,
            (0b001, 0b0110000) => bits::rotl32(a, b & 31) as i32 as i64 as u64,
            (0b100, 0b0000001) => div(a as i32 as i64, b as i32 as i64, 32) as u64,
            (0b101, 0b0000000) => (a >> (b & 31)) as i32 as i64 as u64,
            (0b101, 0b0100000) => ((a as i32) >> (b & 31)) as i64 as u64,
            (0b101, 0b0000001) => divu(a as u64, b as u64, 32) as u32 as i32 as i64 as u64,
            (0b101, 0b0110000) => bits::rotr32(a, b & 31) as i32 as i64 as u64,
            (0b110, 0b0000001) => rem(a as i32 as i64, b as i32 as i64, 32) as u64,
            (0b111, 0b0000001) => remu(a as u64, b as u64, 32) as u32 as i32 as i64 as u64,
            (0b100, 0b0000100) if rs2 == 0 => (a & 0xFFFF) as u64, // ZEXT.H (PACKW rd, rs1, x0)
            _ => return Err(Trap::Exception(Exception::IllegalInstruction, 0)),
        };
        self.set_reg(rd, value);
        Ok(())
    }

    fn exec_csr(&mut self, rd: u8, rs1: u8, funct3: u8, csr: u16) -> Result<(), Trap> {
        let is_immediate = funct3 & 0b100 != 0;
        let op = funct3 & 0b011;
        let write_only_zero = rs1 == 0 && op != 0b01;
        let old = if write_only_zero && op == 0 {
            0
        } else {
            self.csr.read(csr, self.privilege)?
        };
        let operand = if is_immediate { rs1 as u64 } else { self.reg(rs1) };
        let should_write = !(rs1 == 0 && op != 0b01);
        if should_write || op == 0b01 {
            let new_value = match op {
                0b01 => operand,
                0b10 => old | operand,
                0b11 => old & !operand,
                _ => operand,
            };
            self.csr.write(csr, new_value, self.privilege)?;
        }
        self.set_reg(rd, old);
        Ok(())
    }

    fn exec_amo(&mut self, bus: &Bus, funct5: u8, width: AmoWidth, rd: u8, rs1: u8, rs2: u8) -> Result<(), Trap> {
        let addr = self.reg(rs1);
        let size = match width {
            AmoWidth::Word => 4,
            AmoWidth::Double => 8,
        };
        if addr % size as u64 != 0 {
            return Err(Trap::Exception(Exception::StoreAddressMisaligned, addr));
        }
        match funct5 {
            0b00010 => {
                // LR
                let value = self.load(bus, addr, size)?;
                let signed = if size == 4 { bits::sign_extend(value, 32) } else { value };
                let phys = self.translate(bus, addr, AccessKind::Read)?;
                bus.set_reservation(self.csr.hartid, phys);
                self.set_reg(rd, signed);
                return Ok(());
            }
            0b00011 => {
                // SC
                let phys = self.translate(bus, addr, AccessKind::Write)?;
                if bus.take_reservation(self.csr.hartid, phys) {
                    bus.write(phys, &self.reg(rs2).to_le_bytes()[..size], AccessContext::Cpu)
                        .map_err(|e| bus_err_to_trap(e, AccessKind::Write))?;
                    self.set_reg(rd, 0);
                } else {
                    self.set_reg(rd, 1);
                }
                return Ok(());
            }
            _ => {}
        }
        let phys = self.translate(bus, addr, AccessKind::Write)?;
        let operand = self.reg(rs2);
        let apply = |old: u64| -> u64 {
            let old_signed = if size == 4 { bits::sign_extend(old, 32) } else { old };
            match funct5 {
                0b00001 => operand,
                0b00000 => old.wrapping_add(operand),
                0b00100 => old ^ operand,
                0b01100 => old & operand,
                0b01000 => old | operand,
                0b10000 => if (old_signed as i64) < (operand as i64) { old } else { operand },
                0b10100 => if (old_signed as i64) > (operand as i64) { old } else { operand },
                0b11000 => if old < operand { old } else { operand },
                0b11100 => if old > operand { old } else { operand },
                _ => old,
            }
        };
        if !matches!(funct5, 0b00001 | 0b00000 | 0b00100 | 0b01100 | 0b01000 | 0b10000 | 0b10100 | 0b11000 | 0b11100) {
            return Err(Trap::Exception(Exception::IllegalInstruction, 0));
        }
        let old = self.atomic_rmw(bus, phys, size, apply)?;
        let old_signed = if size == 4 { bits::sign_extend(old, 32) } else { old };
        self.set_reg(rd, old_signed);
        Ok(())
    }

    /// Performs a genuine host-atomic read-modify-write when `phys` lies in
    /// RAM; MMIO-backed targets fall back to a plain load-then-store since
    /// devices serialize themselves, not the bus.
    fn atomic_rmw(&mut self, bus: &Bus, phys: u64, size: usize, apply: impl Fn(u64) -> u64) -> Result<u64, Trap> {
        let ram = bus.ram();
        if ram.contains(phys, size as u64) {
            let result = match size {
                4 => {
                    let cell = ram.atomic_u32_at(phys);
                    let mut current = cell.load(std::sync::atomic::Ordering::SeqCst);
                    loop {
                        let proposed = apply(current as u64) as u32;
                        match cell.compare_exchange_weak(
                            current,
                            proposed,
                            std::sync::atomic::Ordering::SeqCst,
                            std::sync::atomic::Ordering::SeqCst,
                        ) {
                            Ok(old) => break old as u64,
                            Err(observed) => current = observed,
                        }
                    }
                }
                8 => {
                    let cell = ram.atomic_u64_at(phys);
                    let mut current = cell.load(std::sync::atomic::Ordering::SeqCst);
                    loop {
                        let proposed = apply(current);
                        match cell.compare_exchange_weak(
                            current,
                            proposed,
                            std::sync::atomic::Ordering::SeqCst,
                            std::sync::atomic::Ordering::SeqCst,
                        ) {
                            Ok(old) => break old,
                            Err(observed) => current = observed,
                        }
                    }
                }
                _ => unreachable!("AMO width is always 4 or 8"),
            };
            bus.invalidate_reservations(phys, size as u64);
            return Ok(result);
        }
        let mut buf = [0u8; 8];
        bus.read(phys, &mut buf[..size], AccessContext::Cpu).map_err(|e| bus_err_to_trap(e, AccessKind::Read))?;
        let old = u64::from_le_bytes(buf);
        let new = apply(old);
        bus.write(phys, &new.to_le_bytes()[..size], AccessContext::Cpu)
            .map_err(|e| bus_err_to_trap(e, AccessKind::Write))?;
        Ok(old)
    }
}

fn mask_for(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

fn mulh(a: i64, b: i64) -> u64 {
    (((a as i128) * (b as i128)) >> 64) as u64
}
fn mulhsu(a: i64, b: u64) -> u64 {
    (((a as i128) * (b as i128)) >> 64) as u64
}

fn div(a: i64, b: i64, width: u32) -> i64 {
    if b == 0 {
        -1
    } else if a == i64::MIN >> (64 - width) && b == -1 && width < 64 {
        a
    } else if a == i64::MIN && b == -1 {
        a
    } else {
        a.wrapping_div(b)
    }
}
fn divu(a: u64, b: u64, _width: u32) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        a / b
    }
}
fn rem(a: i64, b: i64, width: u32) -> i64 {
    if b == 0 {
        a
    } else if a == i64::MIN >> (64 - width) && b == -1 && width < 64 {
        0
    } else if a == i64::MIN && b == -1 {
        0
    } else {
        a.wrapping_rem(b)
    }
}
fn remu(a: u64, b: u64, _width: u32) -> u64 {
    if b == 0 {
        a
    } else {
        a % b
    }
}

fn bus_err_to_trap(err: BusError, kind: AccessKind) -> Trap {
    let exception = match kind {
        AccessKind::Execute => Exception::InstructionAccessFault,
        AccessKind::Read => Exception::LoadAccessFault,
        AccessKind::Write => Exception::StoreAccessFault,
    };
    let tval = match err {
        BusError::Unmapped { address, .. }
        | BusError::StraddlesRegions { address, .. }
        | BusError::Misaligned { address, .. }
        | BusError::Overlap { address, .. } => address,
        _ => 0,
    };
    Trap::Exception(exception, tval)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::RamRegion;
    use std::sync::Arc;

    fn make_bus() -> Bus {
        Bus::new(Arc::new(RamRegion::new("ram", 0x8000_0000, 64 * 1024)))
    }

    fn write_word(bus: &Bus, addr: u64, word: u32) {
        bus.write(addr, &word.to_le_bytes(), AccessContext::Cpu).unwrap();
    }

    #[test]
    fn addi_executes_and_advances_pc() {
        let bus = make_bus();
        // addi x1, x0, 5
        write_word(&bus, 0x8000_0000, 0x00500093);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 5);
        assert_eq!(cpu.pc, 0x8000_0004);
    }

    #[test]
    fn div_by_zero_returns_all_ones() {
        let bus = make_bus();
        // div x1, x2, x3  (x2=10, x3=0)
        write_word(&bus, 0x8000_0000, 0x023140b3);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = 10;
        cpu.regs[3] = 0;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], u64::MAX);
    }

    #[test]
    fn remw_overflow_case_is_zero() {
        let bus = make_bus();
        // remw x1, x2, x3
        write_word(&bus, 0x8000_0000, 0x023160bb);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = i32::MIN as u32 as u64;
        cpu.regs[3] = (-1i32) as u32 as u64;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0);
    }

    #[test]
    fn lr_sc_pair_succeeds_then_fails_on_second_sc() {
        let bus = make_bus();
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[1] = 0x8000_0100;
        cpu.regs[2] = 0x1234;
        // lr.w x3, (x1)
        write_word(&bus, 0x8000_0000, 0x1000a1af);
        // sc.w x4, x2, (x1)
        write_word(&bus, 0x8000_0004, 0x1820a22f);
        // sc.w x5, x2, (x1) again without a new LR
        write_word(&bus, 0x8000_0008, 0x1820a2af);
        cpu.step(&bus);
        cpu.step(&bus);
        assert_eq!(cpu.regs[4], 0, "first sc.w after lr.w must succeed");
        cpu.step(&bus);
        assert_eq!(cpu.regs[5], 1, "second sc.w without a fresh reservation must fail");
    }

    #[test]
    fn zext_h_clears_everything_above_the_low_halfword() {
        let bus = make_bus();
        // pack x1, x2, x0  (zext.h x1, x2)
        write_word(&bus, 0x8000_0000, 0x080140b3);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = 0xFFFF_FFFF_ABCD_1234;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0x1234);
    }

    #[test]
    fn zext_h_w_form_zero_extends_to_64_bits() {
        let bus = make_bus();
        // packw x1, x2, x0  (zext.h x1, x2, RV64 word form)
        write_word(&bus, 0x8000_0000, 0x080140bb);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = 0xFFFF_FFFF_ABCD_1234;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0x1234);
    }

    #[test]
    fn czero_eqz_zeroes_rd_when_the_condition_register_is_zero() {
        let bus = make_bus();
        // czero.eqz x1, x2, x3
        write_word(&bus, 0x8000_0000, 0x0e3150b3);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = 0x42;
        cpu.regs[3] = 0;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0);
        cpu.regs[3] = 7;
        cpu.pc = 0x8000_0000;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0x42);
    }

    #[test]
    fn czero_nez_zeroes_rd_when_the_condition_register_is_nonzero() {
        let bus = make_bus();
        // czero.nez x1, x2, x3
        write_word(&bus, 0x8000_0000, 0x0e3170b3);
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.regs[2] = 0x42;
        cpu.regs[3] = 7;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0);
        cpu.regs[3] = 0;
        cpu.pc = 0x8000_0000;
        cpu.step(&bus);
        assert_eq!(cpu.regs[1], 0x42);
    }

    #[test]
    fn ecall_from_u_traps_to_m_by_default() {
        let bus = make_bus();
        write_word(&bus, 0x8000_0000, 0x00000073); // ecall
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        cpu.privilege = Privilege::User;
        cpu.csr.mtvec = 0x9000_0000;
        cpu.step(&bus);
        assert_eq!(cpu.pc, 0x9000_0000);
        assert_eq!(cpu.privilege, Privilege::Machine);
        assert_eq!(cpu.csr.mcause, 8);
    }

    #[test]
    fn wfi_parks_without_pending_interrupt() {
        let bus = make_bus();
        write_word(&bus, 0x8000_0000, 0x10500073); // wfi
        let mut cpu = Cpu::new(0, true, 0x8000_0000);
        let outcome = cpu.step(&bus);
        assert_eq!(outcome, StepOutcome::WaitForInterrupt);
    }
}
