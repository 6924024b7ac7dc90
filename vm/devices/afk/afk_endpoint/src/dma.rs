// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Coherent DMA memory shared with the coprocessor.

use afk_ring::CoherentMem;
use afk_ring::RingMem;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("failed to allocate {size:#x} bytes of coherent memory")]
pub struct AllocError {
    pub size: usize,
}

/// A buffer visible to both the host and the coprocessor.
///
/// Buffers are not `Clone`; each one goes back to its allocator exactly once
/// through [`DmaAllocator::free_coherent`].
#[derive(Debug)]
pub struct DmaBuffer {
    mem: CoherentMem,
    device_address: u64,
}

impl DmaBuffer {
    pub fn new(mem: CoherentMem, device_address: u64) -> Self {
        Self {
            mem,
            device_address,
        }
    }

    /// The host view of the buffer.
    pub fn mem(&self) -> &CoherentMem {
        &self.mem
    }

    /// The address the coprocessor uses for the buffer.
    pub fn device_address(&self) -> u64 {
        self.device_address
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }

    /// Copies the whole buffer out.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut data = vec![0; self.len()];
        self.mem.read_at(0, &mut data);
        data
    }
}

/// The memory collaborator of an endpoint.
pub trait DmaAllocator: Send + Sync {
    /// Allocates `size` zeroed bytes of coherent memory.
    fn allocate_coherent(&self, size: usize) -> Result<DmaBuffer, AllocError>;

    /// Returns a buffer to the allocator.
    fn free_coherent(&self, buffer: DmaBuffer);
}

const HEAP_BASE: u64 = 0x1_0000_0000;
const HEAP_ALIGN: u64 = 0x4000;

/// A [`DmaAllocator`] backed by host memory, handing out device addresses
/// from a private range. Used when the coprocessor is simulated.
#[derive(Debug)]
pub struct HeapDmaAllocator {
    state: Mutex<HeapState>,
}

#[derive(Debug)]
struct HeapState {
    next_address: u64,
    live: BTreeMap<u64, CoherentMem>,
    fail_allocations: bool,
    bad_frees: usize,
}

impl Default for HeapDmaAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl HeapDmaAllocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HeapState {
                next_address: HEAP_BASE,
                live: BTreeMap::new(),
                fail_allocations: false,
                bad_frees: 0,
            }),
        }
    }

    /// Makes every allocation fail until called again with `false`.
    pub fn set_fail_allocations(&self, fail: bool) {
        self.state.lock().fail_allocations = fail;
    }

    /// Returns the buffer containing `device_address`, and the offset of the
    /// address within it.
    pub fn lookup(&self, device_address: u64) -> Option<(CoherentMem, usize)> {
        let state = self.state.lock();
        let (&base, mem) = state.live.range(..=device_address).next_back()?;
        let offset = (device_address - base) as usize;
        (offset < mem.len() || (offset == 0 && mem.is_empty())).then(|| (mem.clone(), offset))
    }

    /// The number of buffers allocated and not yet freed.
    pub fn live_buffers(&self) -> usize {
        self.state.lock().live.len()
    }

    /// The number of frees of buffers that were not live.
    pub fn bad_frees(&self) -> usize {
        self.state.lock().bad_frees
    }
}

impl DmaAllocator for HeapDmaAllocator {
    fn allocate_coherent(&self, size: usize) -> Result<DmaBuffer, AllocError> {
        let mut state = self.state.lock();
        if state.fail_allocations {
            return Err(AllocError { size });
        }
        let device_address = state.next_address;
        let span = (size as u64).max(1).next_multiple_of(HEAP_ALIGN);
        state.next_address += span;
        let mem = CoherentMem::new(size);
        state.live.insert(device_address, mem.clone());
        tracing::trace!(device_address, size, "dma allocate");
        Ok(DmaBuffer::new(mem, device_address))
    }

    fn free_coherent(&self, buffer: DmaBuffer) {
        let mut state = self.state.lock();
        match state.live.remove(&buffer.device_address) {
            Some(mem) if mem.ptr_eq(&buffer.mem) => {
                tracing::trace!(device_address = buffer.device_address, "dma free");
            }
            _ => {
                tracing::error!(
                    device_address = buffer.device_address,
                    "free of a buffer that is not allocated"
                );
                state.bad_frees += 1;
            }
        }
    }
}
