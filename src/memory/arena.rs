//! In-process arena backing regions with heap blocks.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::memory::{MemoryError, MemoryManager, MAXIMUM_PAYLOAD_LENGTH};
use crate::stream::Region;

/// Addresses start above zero so a zeroed descriptor never resolves.
const BASE_ADDRESS: u64 = 0x1000;

#[derive(Debug)]
struct ArenaInner {
    blocks: BTreeMap<u64, Box<[u8]>>,
    used: usize,
    next_address: u64,
}

/// Capacity-bounded arena; each `acquire` gets its own block.
///
/// Regions may point anywhere inside an acquired block, so a producer can hand
/// out slices of one allocation.
#[derive(Debug)]
pub struct HeapArena {
    capacity: usize,
    inner: Mutex<ArenaInner>,
}

impl HeapArena {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(ArenaInner {
                blocks: BTreeMap::new(),
                used: 0,
                next_address: BASE_ADDRESS,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently acquired.
    pub fn used(&self) -> usize {
        self.lock().used
    }

    /// Number of live blocks.
    pub fn block_count(&self) -> usize {
        self.lock().blocks.len()
    }

    fn lock(&self) -> MutexGuard<'_, ArenaInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ArenaInner {
    /// Locate the block containing `[address, address + length)`.
    fn locate(&self, address: u64, length: usize) -> Result<(u64, usize), MemoryError> {
        let unknown = MemoryError::UnknownRegion { address, length };
        let (base, block) = self.blocks.range(..=address).next_back().ok_or(unknown.clone())?;
        let offset = (address - base) as usize;
        if offset.checked_add(length).map_or(true, |end| end > block.len()) {
            return Err(unknown);
        }
        Ok((*base, offset))
    }
}

impl MemoryManager for HeapArena {
    fn acquire(&self, length: usize) -> Result<u64, MemoryError> {
        let mut inner = self.lock();
        let available = self.capacity - inner.used;
        if length > available {
            return Err(MemoryError::OutOfMemory {
                requested: length,
                available,
            });
        }

        let address = inner.next_address;
        // Keep a gap so interior addresses of neighbouring blocks never alias.
        inner.next_address += length.max(1) as u64;
        inner.used += length;
        inner.blocks.insert(address, vec![0u8; length].into_boxed_slice());
        Ok(address)
    }

    fn release(&self, address: u64, length: usize) {
        let mut inner = self.lock();
        match inner.blocks.remove(&address) {
            Some(block) => {
                inner.used -= block.len();
                if block.len() != length {
                    tracing::debug!(address, length, actual = block.len(), "Released block with mismatched length");
                }
            }
            None => tracing::debug!(address, length, "Release of unknown block ignored"),
        }
    }

    fn read(&self, region: &Region, dst: &mut Vec<u8>) -> Result<(), MemoryError> {
        let inner = self.lock();
        let (base, offset) = inner.locate(region.address, region.length)?;
        let block = &inner.blocks[&base];
        dst.extend_from_slice(&block[offset..offset + region.length]);
        Ok(())
    }

    fn write(&self, address: u64, src: &[u8]) -> Result<(), MemoryError> {
        let mut inner = self.lock();
        let (base, offset) = inner.locate(address, src.len())?;
        if let Some(block) = inner.blocks.get_mut(&base) {
            block[offset..offset + src.len()].copy_from_slice(src);
        }
        Ok(())
    }

    fn max_payload_size(&self, _regions: &[Region]) -> usize {
        let inner = self.lock();
        MAXIMUM_PAYLOAD_LENGTH.min(self.capacity - inner.used)
    }
}
