#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("address not mapped: {0:#x}")]
    Unmapped(u32),

    #[error("misaligned access: address {addr:#x}, alignment {alignment}")]
    Misaligned { addr: u32, alignment: u32 },

    #[error("region {base:#x}+{len:#x} overlaps an existing mapping")]
    RegionOverlap { base: u32, len: u32 },
}
