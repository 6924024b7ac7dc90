// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! This crate implements the ring buffers used by AFK endpoints to exchange
//! frames with a coprocessor.
//!
//! A ring lives in memory shared with the coprocessor. It begins with three
//! header blocks holding the body size, the read pointer and the write
//! pointer, followed by the body. Every frame in the body is prefixed with a
//! [`QueueEntry`] and starts on a [`BLOCK_SIZE`] boundary. When a frame does
//! not fit before the end of the body, the producer leaves a copy of its
//! queue entry at the write pointer as a wrap marker and places the frame at
//! offset 0, again prefixed by the queue entry.

#![forbid(unsafe_code)]

pub mod handoff;
mod mem;

pub use mem::CoherentMem;
pub use mem::RingMem;
pub use mem::RingRegion;
pub use protocol::*;

use thiserror::Error;
use zerocopy::FromZeros;
use zerocopy::IntoBytes;

mod protocol {
    use zerocopy::little_endian::U32;
    use zerocopy::FromBytes;
    use zerocopy::Immutable;
    use zerocopy::IntoBytes;
    use zerocopy::KnownLayout;
    use zerocopy::Unaligned;

    /// The log2 of the ring block size.
    pub const BLOCK_SHIFT: u32 = 6;
    /// Frames, header blocks and pointers are aligned to this size.
    pub const BLOCK_SIZE: u32 = 1 << BLOCK_SHIFT;

    /// Queue entry magic, `"IOP "`.
    pub const QE_MAGIC_IOP: u32 = 0x2050_4f49;
    /// Queue entry magic, `"AOP "`. Some coprocessors use this on their
    /// transmit ring.
    pub const QE_MAGIC_AOP: u32 = 0x2050_4f41;

    /// The transport header in front of every frame in a ring.
    #[repr(C)]
    #[derive(
        Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes, Unaligned,
    )]
    pub struct QueueEntry {
        pub magic: U32,
        /// The size of the frame following this entry.
        pub size: U32,
        pub channel: U32,
        pub typ: U32,
    }

    pub const QUEUE_ENTRY_SIZE: u32 = size_of::<QueueEntry>() as u32;

    impl QueueEntry {
        pub fn is_valid_magic(&self) -> bool {
            matches!(self.magic.get(), QE_MAGIC_IOP | QE_MAGIC_AOP)
        }
    }
}

/// An error describing a ring that cannot be used or an entry that cannot be
/// decoded.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("ring base {base:#x} is outside of the {limit:#x} byte buffer")]
    RegionBase { base: usize, limit: usize },
    #[error("ring end {end:#x} is past the end of the {limit:#x} byte buffer")]
    RegionEnd { end: usize, limit: usize },
    #[error("ring of {0:#x} bytes is too small")]
    RingTooSmall(usize),
    #[error("ring of {0:#x} bytes is too large")]
    RingTooLarge(usize),
    #[error("ring size {size:#x} does not exceed its body size {bufsz:#x}")]
    BodyTooLarge { size: u32, bufsz: u32 },
    #[error("invalid ring body size {0:#x}")]
    InvalidBodySize(u32),
    #[error("ring header size {0:#x} is not a multiple of three")]
    HeaderSize(u32),
    #[error("ring block size {0:#x} is not a multiple of 0x40")]
    BlockSize(u32),
    #[error("invalid ring pointer {0:#x}")]
    InvalidRingPointer(u32),
    #[error("invalid queue entry magic {magic:#x} at {offset:#x}")]
    InvalidMagic { offset: u32, magic: u32 },
    #[error("queue entry at {offset:#x} with size {size:#x} overruns the ring")]
    EntryOutOfBounds { offset: u32, size: u32 },
}

/// An error returned by [`IncomingRing::read`].
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("ring is empty")]
    Empty,
    #[error("ring is corrupt")]
    Corrupt(#[from] Error),
}

/// An error returned by [`OutgoingRing::place`].
#[derive(Debug, Error)]
pub enum WriteError {
    /// The frame does not fit in the free part of the ring. Holds the number
    /// of bytes the frame needs, including its queue entry.
    #[error("ring is full, {0:#x} bytes needed")]
    NoSpace(usize),
    #[error("ring is corrupt")]
    Corrupt(#[from] Error),
}

/// A trait for rings, giving access to the backing memory.
pub trait Ring {
    type Memory: RingMem;

    fn mem(&self) -> &Self::Memory;
}

/// A byte range within a ring's memory, holding the payload of one entry.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RingRange {
    addr: u32,
    size: u32,
}

impl RingRange {
    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Copies the payload out of `ring`.
    pub fn read_to_vec<T: Ring>(&self, ring: &T) -> Vec<u8> {
        let mut data = vec![0; self.len()];
        ring.mem().read_at(self.addr as usize, &mut data);
        data
    }
}

/// An entry taken off an [`IncomingRing`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IncomingEntry {
    pub channel: u32,
    pub typ: u32,
    pub magic: u32,
    pub payload: RingRange,
}

/// Where [`OutgoingRing::place`] put a frame.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    /// The body offset of the queue entry preceding the frame.
    pub offset: u32,
    /// The new write pointer, already published.
    pub wptr: u32,
    /// Whether a wrap marker was left at the old write pointer.
    pub wrapped: bool,
}

fn align_block(v: u64) -> u64 {
    let mask = BLOCK_SIZE as u64 - 1;
    (v + mask) & !mask
}

struct InnerRing<M: RingMem> {
    mem: M,
    blksz: u32,
    bufsz: u32,
}

impl<M: RingMem> InnerRing<M> {
    fn new(mem: M) -> Result<Self, Error> {
        let len = mem.len();
        let size = u32::try_from(len).map_err(|_| Error::RingTooLarge(len))?;
        if size < 4 * BLOCK_SIZE {
            return Err(Error::RingTooSmall(len));
        }

        // The coprocessor writes the body size into the first header block.
        // The remainder is split evenly between the three header blocks.
        let bufsz = mem.load_u32(0);
        if size <= bufsz {
            return Err(Error::BodyTooLarge { size, bufsz });
        }
        let hdrsz = size - bufsz;
        if hdrsz % 3 != 0 {
            return Err(Error::HeaderSize(hdrsz));
        }
        let blksz = hdrsz / 3;
        if blksz < BLOCK_SIZE || blksz % BLOCK_SIZE != 0 {
            return Err(Error::BlockSize(blksz));
        }
        if bufsz < BLOCK_SIZE || bufsz % BLOCK_SIZE != 0 {
            return Err(Error::InvalidBodySize(bufsz));
        }

        Ok(Self { mem, blksz, bufsz })
    }

    fn rptr_addr(&self) -> usize {
        self.blksz as usize
    }

    fn wptr_addr(&self) -> usize {
        2 * self.blksz as usize
    }

    fn data_addr(&self, offset: u32) -> usize {
        3 * self.blksz as usize + offset as usize
    }

    /// Validates a pointer read from the ring header. A pointer equal to the
    /// body size is the same as 0.
    fn validate(&self, p: u32) -> Result<u32, Error> {
        if p == self.bufsz {
            Ok(0)
        } else if p > self.bufsz || p % BLOCK_SIZE != 0 {
            Err(Error::InvalidRingPointer(p))
        } else {
            Ok(p)
        }
    }

    fn rptr(&self) -> Result<u32, Error> {
        self.validate(self.mem.load_u32(self.rptr_addr()))
    }

    fn wptr(&self) -> Result<u32, Error> {
        self.validate(self.mem.load_u32(self.wptr_addr()))
    }

    fn set_rptr(&self, p: u32) {
        self.mem.store_u32(self.rptr_addr(), p)
    }

    fn set_wptr(&self, p: u32) {
        self.mem.store_u32(self.wptr_addr(), p)
    }

    /// Returns true if an entry with a `size` byte frame at `offset` ends
    /// within the body.
    fn fits(&self, offset: u32, size: u32) -> bool {
        offset as u64 + QUEUE_ENTRY_SIZE as u64 + size as u64 <= self.bufsz as u64
    }

    /// Block aligns an end offset, wrapping the end of the body to 0.
    fn next_pointer(&self, end: u64) -> u32 {
        let next = align_block(end);
        if next >= self.bufsz as u64 {
            0
        } else {
            next as u32
        }
    }

    fn entry_at(&self, offset: u32) -> QueueEntry {
        let mut entry = QueueEntry::new_zeroed();
        self.mem.read_at(self.data_addr(offset), entry.as_mut_bytes());
        entry
    }

    fn write_at(&self, offset: u32, data: &[u8]) {
        self.mem.write_at(self.data_addr(offset), data)
    }
}

/// The receiving side of a ring. The coprocessor produces into it.
pub struct IncomingRing<M: RingMem> {
    inner: InnerRing<M>,
}

impl<M: RingMem> Ring for IncomingRing<M> {
    type Memory = M;

    fn mem(&self) -> &Self::Memory {
        &self.inner.mem
    }
}

impl<M: RingMem> std::fmt::Debug for IncomingRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRing")
            .field("blksz", &self.inner.blksz)
            .field("bufsz", &self.inner.bufsz)
            .finish()
    }
}

impl<M: RingMem> IncomingRing<M> {
    /// Opens a ring whose header the coprocessor has already initialized.
    pub fn new(mem: M) -> Result<Self, Error> {
        Ok(Self {
            inner: InnerRing::new(mem)?,
        })
    }

    /// The size of the ring body.
    pub fn bufsz(&self) -> u32 {
        self.inner.bufsz
    }

    /// The size of each header block.
    pub fn blksz(&self) -> u32 {
        self.inner.blksz
    }

    /// Takes the next entry off the ring.
    ///
    /// The read pointer is published before the entry is returned, so the
    /// producer may already be reusing the payload's space while the caller
    /// reads it. Callers copy the payload out immediately.
    ///
    /// A corrupt entry cannot be trusted to give the position of the next
    /// one, so on [`ReadError::Corrupt`] the read pointer skips ahead to the
    /// write pointer, dropping everything published so far. Invalid ring
    /// pointers leave the read pointer in place.
    pub fn read(&self) -> Result<IncomingEntry, ReadError> {
        let rptr = self.inner.rptr()?;
        let wptr = self.inner.wptr()?;
        tracing::trace!(rptr, wptr, "ring read");
        if rptr == wptr {
            return Err(ReadError::Empty);
        }

        let (offset, entry) = match self.entry_from(rptr) {
            Ok(v) => v,
            Err(err) => {
                self.inner.set_rptr(wptr);
                return Err(err.into());
            }
        };

        let size = entry.size.get();
        let next = self
            .inner
            .next_pointer(offset as u64 + QUEUE_ENTRY_SIZE as u64 + size as u64);
        self.inner.set_rptr(next);
        tracing::trace!(rptr = next, wptr, "ring read done");

        Ok(IncomingEntry {
            channel: entry.channel.get(),
            typ: entry.typ.get(),
            magic: entry.magic.get(),
            payload: RingRange {
                addr: (self.inner.data_addr(offset) + QUEUE_ENTRY_SIZE as usize) as u32,
                size,
            },
        })
    }

    /// Finds the entry at `rptr`, following a wrap marker to offset 0.
    fn entry_from(&self, rptr: u32) -> Result<(u32, QueueEntry), Error> {
        let mut offset = rptr;
        let mut entry = self.inner.entry_at(offset);
        check_magic(offset, &entry)?;
        if !self.inner.fits(offset, entry.size.get()) {
            // This is the wrap marker. The real entry is at the start.
            offset = 0;
            entry = self.inner.entry_at(offset);
            check_magic(offset, &entry)?;
        }
        let size = entry.size.get();
        if !self.inner.fits(offset, size) {
            return Err(Error::EntryOutOfBounds { offset, size });
        }
        Ok((offset, entry))
    }

    /// Returns an iterator that reads entries until the ring is empty.
    ///
    /// The iterator stops after yielding the first error.
    pub fn drain(&self) -> Drain<'_, M> {
        Drain {
            ring: self,
            done: false,
        }
    }
}

fn check_magic(offset: u32, entry: &QueueEntry) -> Result<(), Error> {
    if entry.is_valid_magic() {
        Ok(())
    } else {
        Err(Error::InvalidMagic {
            offset,
            magic: entry.magic.get(),
        })
    }
}

/// An iterator over the available entries of an [`IncomingRing`].
pub struct Drain<'a, M: RingMem> {
    ring: &'a IncomingRing<M>,
    done: bool,
}

impl<M: RingMem> Iterator for Drain<'_, M> {
    type Item = Result<IncomingEntry, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.ring.read() {
            Ok(entry) => Some(Ok(entry)),
            Err(ReadError::Empty) => {
                self.done = true;
                None
            }
            Err(ReadError::Corrupt(err)) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<M: RingMem> std::iter::FusedIterator for Drain<'_, M> {}

/// The sending side of a ring. The coprocessor consumes from it.
pub struct OutgoingRing<M: RingMem> {
    inner: InnerRing<M>,
    magic: u32,
}

impl<M: RingMem> Ring for OutgoingRing<M> {
    type Memory = M;

    fn mem(&self) -> &Self::Memory {
        &self.inner.mem
    }
}

impl<M: RingMem> std::fmt::Debug for OutgoingRing<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingRing")
            .field("blksz", &self.inner.blksz)
            .field("bufsz", &self.inner.bufsz)
            .field("magic", &format_args!("{:#x}", self.magic))
            .finish()
    }
}

impl<M: RingMem> OutgoingRing<M> {
    /// Opens a ring whose header the coprocessor has already initialized.
    /// Entries are stamped with [`QE_MAGIC_IOP`].
    pub fn new(mem: M) -> Result<Self, Error> {
        Ok(Self {
            inner: InnerRing::new(mem)?,
            magic: QE_MAGIC_IOP,
        })
    }

    /// Uses `magic` for the queue entries written from now on.
    pub fn with_magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    /// The size of the ring body.
    pub fn bufsz(&self) -> u32 {
        self.inner.bufsz
    }

    /// Places a frame made of the concatenation of `frame` on the ring and
    /// publishes the new write pointer.
    ///
    /// Nothing is written unless the whole frame fits. The write pointer is
    /// never advanced onto the read pointer, since a full ring would then be
    /// indistinguishable from an empty one.
    ///
    /// The caller serializes producers; the only concurrency tolerated is
    /// the coprocessor consuming.
    pub fn place(&self, channel: u32, typ: u32, frame: &[&[u8]]) -> Result<Placement, WriteError> {
        let size: usize = frame.iter().map(|part| part.len()).sum();
        let total = QUEUE_ENTRY_SIZE as usize + size;
        let Ok(size32) = u32::try_from(size) else {
            return Err(WriteError::NoSpace(total));
        };

        let rptr = self.inner.rptr()?;
        let wptr = self.inner.wptr()?;
        tracing::trace!(rptr, wptr, size, "ring place");

        let bufsz = self.inner.bufsz as u64;
        let end = wptr as u64 + total as u64;
        let (offset, wrap_marker) = if wptr < rptr {
            if align_block(end) >= rptr as u64 {
                return Err(WriteError::NoSpace(total));
            }
            (wptr, None)
        } else if end <= bufsz {
            if self.inner.next_pointer(end) == rptr {
                return Err(WriteError::NoSpace(total));
            }
            (wptr, None)
        } else {
            // Wrap: the entry is left at the write pointer as a marker and
            // the frame goes at the start, behind a second copy of the entry.
            if wptr as u64 + QUEUE_ENTRY_SIZE as u64 > bufsz
                || align_block(total as u64) >= rptr as u64
            {
                return Err(WriteError::NoSpace(total));
            }
            (0, Some(wptr))
        };

        let entry = QueueEntry {
            magic: self.magic.into(),
            size: size32.into(),
            channel: channel.into(),
            typ: typ.into(),
        };
        if let Some(marker) = wrap_marker {
            self.inner.write_at(marker, entry.as_bytes());
        }
        self.inner.write_at(offset, entry.as_bytes());
        let mut data_offset = offset + QUEUE_ENTRY_SIZE;
        for part in frame {
            self.inner.write_at(data_offset, part);
            data_offset += part.len() as u32;
        }

        let new_wptr = self.inner.next_pointer(data_offset as u64);
        self.inner.set_wptr(new_wptr);
        tracing::trace!(rptr, wptr = new_wptr, "ring place done");

        Ok(Placement {
            offset,
            wptr: new_wptr,
            wrapped: wrap_marker.is_some(),
        })
    }
}
