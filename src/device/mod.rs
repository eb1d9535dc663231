pub mod device;
pub mod endianness;
pub mod error;
pub mod ram;

pub use device::{AccessContext, Device};
pub use endianness::Endianness;
pub use error::{DeviceError, DeviceResult};
pub use ram::RamRegion;
