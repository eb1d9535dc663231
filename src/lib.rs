//! `riscv-core`: interpreter, MMU, hart runtime, and machine fabric for a
//! RISC-V RV32/RV64 system capable of booting a general-purpose OS. No
//! concrete MMIO devices, TAP backends, block formats, or command-line
//! loader are built in; those are the job of a consuming crate.

pub mod bus;
pub mod clint;
pub mod config;
pub mod device;
pub mod error;
pub mod fdt;
pub mod hart;
pub mod isa;
pub mod machine;
pub mod mmu;
pub mod plic;

pub use config::Config;
pub use error::MachineError;
pub use hart::Hart;
pub use machine::Machine;
