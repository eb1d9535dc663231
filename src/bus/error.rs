use std::{error::Error, fmt};

use crate::device::DeviceError;

pub type BusResult<T> = Result<T, BusError>;

/// Errors raised by the physical address space (RAM + MMIO table).
///
/// A `BusError` never reaches the guest directly: the MMU layer that calls
/// into the bus converts every variant into the appropriate access-fault
/// `Trap` before it can escape the interpreter (see `isa::trap`).
#[derive(Debug)]
pub enum BusError {
    /// Neither RAM nor any MMIO region covers the requested span.
    Unmapped { address: u64, size: u64 },
    /// The access straddles two regions (RAM/MMIO boundary or two MMIO
    /// regions back to back).
    StraddlesRegions { address: u64, size: u64 },
    /// `size` fell outside `[min_op_size, max_op_size]` for the region, or
    /// a write exceeded the region's mapped bound.
    Misaligned { address: u64, size: u64 },
    /// A new mapping would overlap an existing RAM or MMIO region.
    Overlap { address: u64, size: u64 },
    /// A device's read/write handler returned `false`.
    DeviceFault { device: String },
    /// A device handler reported a typed backend error.
    Device(DeviceError),
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusError::Unmapped { address, size } => {
                write!(f, "address range 0x{address:016X}..+0x{size:X} is not mapped")
            }
            BusError::StraddlesRegions { address, size } => write!(
                f,
                "access at 0x{address:016X} of size {size} straddles two bus regions"
            ),
            BusError::Misaligned { address, size } => write!(
                f,
                "access at 0x{address:016X} of size {size} is not permitted by the covering region"
            ),
            BusError::Overlap { address, size } => write!(
                f,
                "mapping at 0x{address:016X}..+0x{size:X} overlaps an existing region"
            ),
            BusError::DeviceFault { device } => write!(f, "device '{device}' reported an access fault"),
            BusError::Device(err) => write!(f, "device error: {err}"),
        }
    }
}

impl Error for BusError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BusError::Device(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DeviceError> for BusError {
    fn from(value: DeviceError) -> Self {
        BusError::Device(value)
    }
}
