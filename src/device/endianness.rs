//! RISC-V guest memory is little-endian throughout: loads and stores are
//! host-endian reads/writes of little-endian data. `Endianness` exists
//! only so a device author can model a genuinely big-endian peripheral;
//! the bus and MMU treat RAM and the common case as `Little` and never
//! synthesize a `Big` device themselves.

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Endianness {
    Little,
    Big,
}

impl Default for Endianness {
    fn default() -> Self {
        Endianness::Little
    }
}
