//! Top-level error taxonomy. Guest traps (`isa::trap::Trap`) and bus
//! errors (`bus::error::BusError`) already exist; this module adds the
//! machine-construction and host-resource variants, implementing
//! `Display`/`Error` by hand in the same style as `bus::error` and
//! `device::error` rather than pulling in a derive macro.

use std::fmt;

#[derive(Debug)]
pub enum MachineError {
    /// Two MMIO regions, or an MMIO region and RAM, overlap.
    OverlappingRegion { address: u64, size: u64 },
    /// A `Config` value is out of range or internally inconsistent.
    InvalidConfig(&'static str),
    /// `mmio_zone_auto` exhausted the address space searching for a slot.
    NoFreeMmioSlot { preferred_base: u64, size: u64 },
    /// Host resource acquisition failed: allocation, file open, thread spawn.
    Host(Box<dyn std::error::Error + Send + Sync>),
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineError::OverlappingRegion { address, size } => {
                write!(f, "region at {address:#x} (size {size:#x}) overlaps an existing region")
            }
            MachineError::InvalidConfig(reason) => write!(f, "invalid configuration: {reason}"),
            MachineError::NoFreeMmioSlot { preferred_base, size } => {
                write!(f, "no free mmio slot of size {size:#x} found starting near {preferred_base:#x}")
            }
            MachineError::Host(err) => write!(f, "host resource error: {err}"),
        }
    }
}

impl std::error::Error for MachineError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MachineError::Host(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<crate::bus::BusError> for MachineError {
    fn from(err: crate::bus::BusError) -> Self {
        match err {
            crate::bus::BusError::Overlap { address, size } => MachineError::OverlappingRegion { address, size },
            other => MachineError::Host(Box::new(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_region_formats_with_hex_addresses() {
        let err = MachineError::OverlappingRegion { address: 0x1000, size: 0x100 };
        assert!(err.to_string().contains("0x1000"));
    }
}
