//! Defines the `Device` trait MMIO peripherals implement to register with a
//! `MmioBus`. The bus turns a `false` return (or a `DeviceError`) from
//! `read`/`write` into a `BusError::DeviceFault`, which the MMU in turn
//! raises as a load/store access-fault trap — devices never see the guest's
//! trap machinery directly.

use crate::device::endianness::Endianness;
use crate::device::error::DeviceResult;
use crate::device::ram::RamRegion;

/// Capability contract every MMIO peripheral implements.
///
/// `read`/`write` receive an offset relative to the device's own span (not
/// the bus address the region was mapped at), a request buffer, and an
/// `AccessContext` describing who is asking. Re-entrant with respect to
/// other devices; a device may assume serialized access to itself (the bus
/// does not call into the same device concurrently from two harts without
/// the device's own locking).
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Minimum and maximum access width this device accepts, in bytes.
    /// Both must be powers of two in `[1, 8]` with `min <= max`.
    fn min_op_size(&self) -> usize {
        1
    }
    fn max_op_size(&self) -> usize {
        8
    }

    /// Byte order of this device's registers. Every device in this crate's
    /// own test fixtures is `Little`; the hook exists for a future
    /// big-endian peripheral, since the guest's own memory model is fixed
    /// little-endian and can't express the distinction on its own.
    fn endianness(&self) -> Endianness {
        Endianness::Little
    }

    /// `Some` only for the one RAM-backed region in a `Machine`; lets the
    /// MMU fast-path TLB fills compute a host pointer directly instead of
    /// dispatching through `read`/`write`.
    fn as_ram(&self) -> Option<&RamRegion> {
        None
    }

    /// Read `out.len()` bytes starting at `offset`. Returns `Ok(false)` (not
    /// an `Err`) for a clean access-fault signal so callers can distinguish
    /// "this device refused the access" from "the device backend errored".
    fn read(&self, offset: u64, out: &mut [u8], ctx: AccessContext) -> DeviceResult<bool>;

    /// Write `data` starting at `offset`.
    fn write(&self, offset: u64, data: &[u8], ctx: AccessContext) -> DeviceResult<bool>;

    /// Restore the device to its post-construction state. Called by
    /// `Machine::reset` on every attached device.
    fn reset(&self) {}

    /// Called once when the device is detached from a `Machine`.
    fn remove(&self) {}

    /// Optional hook for FDT generation: inject this device's own `soc`
    /// subnode. `base` is the bus address the device is mapped at.
    fn fdt_node(&self, _base: u64) -> Option<crate::fdt::FdtNode> {
        None
    }
}

/// Identifies the originator of a bus access so devices with read-sensitive
/// side effects (clear-on-read status registers) can distinguish a debugger
/// peek from a guest-issued load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessContext {
    Cpu,
    Dma,
    Debug,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::error::DeviceError;

    struct FaultyDevice;

    impl Device for FaultyDevice {
        fn name(&self) -> &str {
            "faulty"
        }

        fn read(&self, _offset: u64, _out: &mut [u8], _ctx: AccessContext) -> DeviceResult<bool> {
            Err(DeviceError::Unsupported("read"))
        }

        fn write(&self, _offset: u64, _data: &[u8], _ctx: AccessContext) -> DeviceResult<bool> {
            Ok(false)
        }
    }

    #[test]
    fn trait_helpers_propagate_device_errors() {
        let dev = FaultyDevice;
        let mut buf = [0u8; 4];
        assert!(dev.read(0, &mut buf, AccessContext::Cpu).is_err());
        assert!(!dev.write(0, &buf, AccessContext::Cpu).unwrap());
    }
}
