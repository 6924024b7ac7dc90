// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Host views of memory shared with the coprocessor.

use crate::Error;
use std::fmt::Debug;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// A trait for memory backing a ring buffer.
///
/// Addresses are byte offsets from the start of the memory. Callers keep
/// accesses within `len()`; out of range accesses panic.
pub trait RingMem: Send + Sync {
    /// Returns the length of the memory in bytes.
    fn len(&self) -> usize;

    /// Returns true if the memory is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `data.len()` bytes starting at `addr`. No ordering is implied.
    fn read_at(&self, addr: usize, data: &mut [u8]);

    /// Writes `data` starting at `addr`. No ordering is implied; use
    /// [`RingMem::store_u32`] to publish.
    fn write_at(&self, addr: usize, data: &[u8]);

    /// Loads the 4-byte aligned little endian word at `addr` with acquire
    /// ordering.
    fn load_u32(&self, addr: usize) -> u32;

    /// Stores the 4-byte aligned little endian word at `addr` with release
    /// ordering, so every earlier write is visible before the new value.
    fn store_u32(&self, addr: usize, value: u32);
}

impl<T: RingMem> RingMem for &'_ T {
    fn len(&self) -> usize {
        (*self).len()
    }
    fn read_at(&self, addr: usize, data: &mut [u8]) {
        (*self).read_at(addr, data)
    }
    fn write_at(&self, addr: usize, data: &[u8]) {
        (*self).write_at(addr, data)
    }
    fn load_u32(&self, addr: usize) -> u32 {
        (*self).load_u32(addr)
    }
    fn store_u32(&self, addr: usize, value: u32) {
        (*self).store_u32(addr, value)
    }
}

/// Memory that is coherent between the host and the coprocessor.
///
/// Backed by 32-bit atomic words so that the ring pointers can be published
/// with release/acquire ordering while the payload bytes are copied with
/// relaxed accesses. Cloning yields another view of the same memory.
#[derive(Clone)]
pub struct CoherentMem {
    inner: Arc<CoherentInner>,
}

struct CoherentInner {
    words: Vec<AtomicU32>,
    len: usize,
}

impl CoherentMem {
    /// Allocates `len` zeroed bytes.
    pub fn new(len: usize) -> Self {
        let mut words = Vec::new();
        words.resize_with(len.div_ceil(4), Default::default);
        Self {
            inner: Arc::new(CoherentInner { words, len }),
        }
    }

    /// Returns true if both views refer to the same memory.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn check(&self, addr: usize, len: usize) {
        assert!(
            addr.checked_add(len).is_some_and(|end| end <= self.inner.len),
            "access {addr:#x}+{len:#x} out of range of {:#x}",
            self.inner.len
        );
    }
}

impl Debug for CoherentMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoherentMem")
            .field("len", &self.inner.len)
            .finish()
    }
}

impl RingMem for CoherentMem {
    fn len(&self) -> usize {
        self.inner.len
    }

    fn read_at(&self, mut addr: usize, mut data: &mut [u8]) {
        self.check(addr, data.len());
        while !data.is_empty() {
            let shift = addr % 4;
            let len = (4 - shift).min(data.len());
            let word = self.inner.words[addr / 4]
                .load(Ordering::Relaxed)
                .to_le_bytes();
            let (this, next) = data.split_at_mut(len);
            this.copy_from_slice(&word[shift..shift + len]);
            addr += len;
            data = next;
        }
    }

    fn write_at(&self, mut addr: usize, mut data: &[u8]) {
        self.check(addr, data.len());
        while !data.is_empty() {
            let shift = addr % 4;
            let len = (4 - shift).min(data.len());
            let (this, next) = data.split_at(len);
            let word = &self.inner.words[addr / 4];
            if len == 4 {
                word.store(u32::from_le_bytes(this.try_into().unwrap()), Ordering::Relaxed);
            } else {
                // Merge into the word so the bytes around a partial write,
                // which may belong to the other side, are preserved.
                let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |old| {
                    let mut bytes = old.to_le_bytes();
                    bytes[shift..shift + len].copy_from_slice(this);
                    Some(u32::from_le_bytes(bytes))
                });
            }
            addr += len;
            data = next;
        }
    }

    fn load_u32(&self, addr: usize) -> u32 {
        assert_eq!(addr % 4, 0, "unaligned word access at {addr:#x}");
        self.check(addr, 4);
        self.inner.words[addr / 4].load(Ordering::Acquire)
    }

    fn store_u32(&self, addr: usize, value: u32) {
        assert_eq!(addr % 4, 0, "unaligned word access at {addr:#x}");
        self.check(addr, 4);
        self.inner.words[addr / 4].store(value, Ordering::Release)
    }
}

/// A window onto part of a larger memory, such as one ring inside the
/// scratch buffer the coprocessor asked for.
#[derive(Clone, Debug)]
pub struct RingRegion<M> {
    mem: M,
    base: usize,
    len: usize,
}

impl<M: RingMem> RingRegion<M> {
    /// Returns the `len` bytes at `base` within `mem`.
    ///
    /// Fails if the window does not lie entirely within `mem`.
    pub fn new(mem: M, base: usize, len: usize) -> Result<Self, Error> {
        let limit = mem.len();
        if base >= limit {
            return Err(Error::RegionBase { base, limit });
        }
        let end = base.saturating_add(len);
        if end > limit {
            return Err(Error::RegionEnd { end, limit });
        }
        Ok(Self { mem, base, len })
    }

    /// The offset of the window within the underlying memory.
    pub fn base(&self) -> usize {
        self.base
    }
}

impl<M: RingMem> RingMem for RingRegion<M> {
    fn len(&self) -> usize {
        self.len
    }

    fn read_at(&self, addr: usize, data: &mut [u8]) {
        assert!(addr + data.len() <= self.len);
        self.mem.read_at(self.base + addr, data)
    }

    fn write_at(&self, addr: usize, data: &[u8]) {
        assert!(addr + data.len() <= self.len);
        self.mem.write_at(self.base + addr, data)
    }

    fn load_u32(&self, addr: usize) -> u32 {
        assert!(addr + 4 <= self.len);
        self.mem.load_u32(self.base + addr)
    }

    fn store_u32(&self, addr: usize, value: u32) {
        assert!(addr + 4 <= self.len);
        self.mem.store_u32(self.base + addr, value)
    }
}
