//! Region packing for outbound transfers.

use crate::memory::{MemoryError, MemoryManager};
use crate::stream::{Region, StreamId};

/// Copy `payload` into freshly acquired arena memory owned by `owner` and
/// return the outbound region list: the payload region first, then `source`
/// unchanged so the original owners still get their credit back.
///
/// Fails with `BudgetExceeded` when the payload is larger than the memory
/// manager allows next to `source`; nothing is acquired in that case.
pub fn pack_regions(
    memory: &dyn MemoryManager,
    owner: StreamId,
    payload: &[u8],
    source: &[Region],
) -> Result<Vec<Region>, MemoryError> {
    let mut regions = Vec::with_capacity(source.len() + 1);

    if !payload.is_empty() {
        let budget = memory.max_payload_size(source);
        if payload.len() > budget {
            return Err(MemoryError::BudgetExceeded {
                produced: payload.len(),
                budget,
            });
        }

        let address = memory.acquire(payload.len())?;
        if let Err(err) = memory.write(address, payload) {
            memory.release(address, payload.len());
            return Err(err);
        }
        regions.push(Region::new(address, payload.len(), owner));
    }

    regions.extend_from_slice(source);
    Ok(regions)
}

/// Release the acknowledged regions `owner` allocated and return the rest,
/// which belong to other streams and must be passed on.
pub fn release_owned(memory: &dyn MemoryManager, owner: StreamId, regions: Vec<Region>) -> Vec<Region> {
    let mut foreign = Vec::with_capacity(regions.len());
    for region in regions {
        if region.stream_id == owner {
            memory.release(region.address, region.length);
        } else {
            foreign.push(region);
        }
    }
    foreign
}
