use crate::error::MemoryError;
use bitflags::bitflags;
use bytemuck::Pod;
use core::fmt;
use core::mem::size_of;
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};

const WORD: u32 = 4;

/// Virtual memory address
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn val(&self) -> u32 {
        self.0
    }

    pub fn is_aligned(&self, alignment: u32) -> bool {
        self.0 % alignment == 0
    }

    pub fn checked_add(&self, offset: u32) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#x})", self.0)
    }
}

impl core::ops::Add<u32> for VirtAddr {
    type Output = VirtAddr;

    fn add(self, rhs: u32) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(rhs))
    }
}

bitflags! {
    /// Access rights of a mapped user region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

/// A contiguous, word-granular mapping in a user address space.
pub struct Region {
    base: VirtAddr,
    protection: Protection,
    words: Box<[AtomicU32]>,
}

impl Region {
    fn new(base: VirtAddr, len: u32, protection: Protection) -> Self {
        let words = (0..len / WORD).map(|_| AtomicU32::new(0)).collect();
        Self {
            base,
            protection,
            words,
        }
    }

    pub fn base(&self) -> VirtAddr {
        self.base
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    /// Length in bytes.
    pub fn len(&self) -> u32 {
        self.words.len() as u32 * WORD
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    fn end(&self) -> u64 {
        self.base.val() as u64 + self.len() as u64
    }

    fn contains(&self, addr: u32, len: u64) -> bool {
        let start = addr as u64;
        start >= self.base.val() as u64 && start + len <= self.end()
    }

    fn overlaps(&self, base: u32, len: u32) -> bool {
        let start = base as u64;
        let end = start + len as u64;
        start < self.end() && (self.base.val() as u64) < end
    }

    fn word(&self, addr: u32) -> &AtomicU32 {
        &self.words[((addr - self.base.val()) / WORD) as usize]
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("base", &self.base)
            .field("len", &self.len())
            .field("protection", &self.protection)
            .finish()
    }
}

/// The user-visible memory of one process.
///
/// Every word is an [`AtomicU32`], so the kernel can operate on user lock
/// words and semaphore blocks while user contexts keep running.
#[derive(Debug, Default)]
pub struct AddressSpace {
    regions: Vec<Region>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps a zero-filled region. `base` and `len` must be word aligned.
    pub fn map(
        &mut self,
        base: VirtAddr,
        len: u32,
        protection: Protection,
    ) -> Result<(), MemoryError> {
        if !base.is_aligned(WORD) || len % WORD != 0 || len == 0 {
            return Err(MemoryError::Misaligned {
                addr: base.val(),
                alignment: WORD,
            });
        }
        if base.val() as u64 + len as u64 > u32::MAX as u64 + 1
            || self.regions.iter().any(|r| r.overlaps(base.val(), len))
        {
            return Err(MemoryError::RegionOverlap {
                base: base.val(),
                len,
            });
        }

        self.regions.push(Region::new(base, len, protection));
        self.regions.sort_by_key(|r| r.base);
        debug!("mapped {:?}+{:#x} {:?}", base, len, protection);
        Ok(())
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    fn region(&self, addr: u32, len: u64) -> Option<&Region> {
        self.regions.iter().find(|r| r.contains(addr, len))
    }

    /// Whether `[addr, addr + len)` lies inside one mapping that grants
    /// every right in `prot`.
    pub fn access_ok(&self, addr: VirtAddr, len: usize, prot: Protection) -> bool {
        let len = (len as u64).max(1);
        match self.region(addr.val(), len) {
            Some(region) => region.protection.contains(prot),
            None => false,
        }
    }

    /// The atomic cell backing the word at `addr`.
    ///
    /// Only alignment and mapping are checked; access rights are the caller's
    /// business (see [`AddressSpace::access_ok`]).
    pub fn word(&self, addr: VirtAddr) -> Result<&AtomicU32, MemoryError> {
        if !addr.is_aligned(WORD) {
            return Err(MemoryError::Misaligned {
                addr: addr.val(),
                alignment: WORD,
            });
        }
        self.region(addr.val(), WORD as u64)
            .map(|r| r.word(addr.val()))
            .ok_or(MemoryError::Unmapped(addr.val()))
    }

    pub fn read_word(&self, addr: VirtAddr) -> Result<u32, MemoryError> {
        Ok(self.word(addr)?.load(Ordering::Acquire))
    }

    pub fn write_word(&self, addr: VirtAddr, val: u32) -> Result<(), MemoryError> {
        self.word(addr)?.store(val, Ordering::Release);
        Ok(())
    }

    /// Reads a word-sized plain-old-data record (little-endian words).
    pub fn read_pod<T: Pod>(&self, addr: VirtAddr) -> Result<T, MemoryError> {
        let size = pod_size::<T>(addr)?;
        let mut bytes = Vec::with_capacity(size);
        for offset in (0..size as u32).step_by(WORD as usize) {
            let source = addr
                .checked_add(offset)
                .ok_or(MemoryError::Unmapped(addr.val()))?;
            bytes.extend_from_slice(&self.read_word(source)?.to_le_bytes());
        }
        Ok(bytemuck::pod_read_unaligned(&bytes))
    }

    /// Writes a word-sized plain-old-data record (little-endian words).
    pub fn write_pod<T: Pod>(&self, addr: VirtAddr, value: &T) -> Result<(), MemoryError> {
        pod_size::<T>(addr)?;
        for (i, chunk) in bytemuck::bytes_of(value).chunks_exact(WORD as usize).enumerate() {
            let word = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            let target = addr
                .checked_add(i as u32 * WORD)
                .ok_or(MemoryError::Unmapped(addr.val()))?;
            self.write_word(target, word)?;
        }
        Ok(())
    }
}

fn pod_size<T: Pod>(addr: VirtAddr) -> Result<usize, MemoryError> {
    let size = size_of::<T>();
    if size % WORD as usize != 0 || !addr.is_aligned(WORD) {
        return Err(MemoryError::Misaligned {
            addr: addr.val(),
            alignment: WORD,
        });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytemuck::Zeroable;
    use proptest::prelude::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
    #[repr(C)]
    struct Pair {
        first: u32,
        second: u32,
    }

    fn space() -> AddressSpace {
        let mut space = AddressSpace::new();
        space
            .map(VirtAddr::new(0x1000), 0x100, Protection::READ | Protection::WRITE)
            .unwrap();
        space
            .map(VirtAddr::new(0x4000), 0x40, Protection::READ)
            .unwrap();
        space
    }

    #[test]
    fn access_ok_checks_range_and_rights() {
        let space = space();
        let rw = Protection::READ | Protection::WRITE;

        assert!(space.access_ok(VirtAddr::new(0x1000), 4, rw));
        assert!(space.access_ok(VirtAddr::new(0x10fc), 4, rw));
        assert!(!space.access_ok(VirtAddr::new(0x10fc), 8, rw));
        assert!(!space.access_ok(VirtAddr::new(0x0ffc), 8, rw));
        assert!(space.access_ok(VirtAddr::new(0x4000), 4, Protection::READ));
        assert!(!space.access_ok(VirtAddr::new(0x4000), 4, Protection::WRITE));
        assert!(!space.access_ok(VirtAddr::new(0), 4, Protection::READ));
        assert!(!space.access_ok(VirtAddr::new(u32::MAX - 1), 8, Protection::READ));
    }

    #[test]
    fn overlapping_and_misaligned_maps_are_rejected() {
        let mut space = space();
        assert_eq!(
            space.map(VirtAddr::new(0x1080), 0x100, Protection::READ),
            Err(MemoryError::RegionOverlap {
                base: 0x1080,
                len: 0x100
            })
        );
        assert!(matches!(
            space.map(VirtAddr::new(0x2002), 0x10, Protection::READ),
            Err(MemoryError::Misaligned { .. })
        ));
        assert!(space.map(VirtAddr::new(0x1100), 0x10, Protection::READ).is_ok());
    }

    #[test]
    fn word_access_requires_alignment_and_mapping() {
        let space = space();
        space.write_word(VirtAddr::new(0x1008), 0xdead_beef).unwrap();
        assert_eq!(space.read_word(VirtAddr::new(0x1008)).unwrap(), 0xdead_beef);
        assert_eq!(
            space.read_word(VirtAddr::new(0x3000)),
            Err(MemoryError::Unmapped(0x3000))
        );
        assert!(matches!(
            space.read_word(VirtAddr::new(0x1002)),
            Err(MemoryError::Misaligned { .. })
        ));
    }

    #[test]
    fn pod_records_use_little_endian_words() {
        let space = space();
        let pair = Pair {
            first: 3,
            second: 9,
        };
        space.write_pod(VirtAddr::new(0x1010), &pair).unwrap();
        assert_eq!(space.read_word(VirtAddr::new(0x1010)).unwrap(), 3);
        assert_eq!(space.read_word(VirtAddr::new(0x1014)).unwrap(), 9);
        assert_eq!(space.read_pod::<Pair>(VirtAddr::new(0x1010)).unwrap(), pair);
    }

    proptest! {
        #[test]
        fn access_ok_never_accepts_unmapped_bytes(addr in 0u32..0x6000, len in 1usize..0x200) {
            let space = space();
            if space.access_ok(VirtAddr::new(addr), len, Protection::READ) {
                let end = addr as u64 + len as u64;
                let inside = |base: u64, size: u64| addr as u64 >= base && end <= base + size;
                prop_assert!(inside(0x1000, 0x100) || inside(0x4000, 0x40));
            }
        }
    }
}
