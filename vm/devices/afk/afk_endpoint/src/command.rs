// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tracking of commands sent to the coprocessor until their replies arrive.
//!
//! Each service has a fixed number of command slots. A command's tag is the
//! slot index in the low byte and a rolling counter in the high byte, so a
//! reply that names a reused slot with an old counter is detected.
//!
//! The request and reply buffers of a command belong to whoever is
//! responsible for freeing them: the waiting caller, or, once the caller has
//! given up, the eventual reply. Both sides switch ownership under the
//! tracker's lock.

use crate::dma::DmaAllocator;
use crate::dma::DmaBuffer;
use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

pub const MAX_PENDING_COMMANDS: usize = 16;

#[derive(Debug, Error)]
#[error("no free command slot")]
pub struct NoSlot;

#[derive(Debug, Error)]
#[error("command {tag:#06x} timed out")]
pub struct TimedOut {
    pub tag: u16,
}

/// Why a reply could not be matched to a command.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CompleteError {
    #[error("reply tag {0:#06x} names slot out of range")]
    OutOfRange(u16),
    #[error("reply tag {0:#06x} names a free slot")]
    NotPending(u16),
    #[error("reply tag {0:#06x} already handled")]
    Duplicate(u16),
    #[error("reply tag {actual:#06x} does not match pending tag {expected:#06x}")]
    TagMismatch { expected: u16, actual: u16 },
}

/// The result of a completed command.
#[derive(Debug)]
pub struct Completed {
    pub retcode: u32,
    /// The contents of the reply buffer.
    pub output: Vec<u8>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Owner {
    /// The submitter is waiting and frees the buffers.
    Waiter,
    /// The submitter gave up; the reply frees the buffers.
    Reply,
}

#[derive(Debug)]
struct Slot {
    tag: u16,
    rx: DmaBuffer,
    tx: DmaBuffer,
    done: bool,
    retcode: u32,
    owner: Owner,
}

#[derive(Debug)]
struct TrackerState {
    map: u16,
    seq: u8,
    slots: Vec<Option<Slot>>,
}

impl TrackerState {
    fn slot_mut(&mut self, index: usize) -> &mut Slot {
        self.slots[index]
            .as_mut()
            .expect("slot of a pending command is allocated")
    }

    fn release(&mut self, index: usize) -> Slot {
        self.map &= !(1 << index);
        self.slots[index]
            .take()
            .expect("released slot is allocated")
    }
}

/// The command slots of one service.
pub struct CommandTracker {
    state: Mutex<TrackerState>,
    completed: Condvar,
    dma: Arc<dyn DmaAllocator>,
}

impl std::fmt::Debug for CommandTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CommandTracker")
            .field("map", &format_args!("{:#06x}", state.map))
            .field("seq", &state.seq)
            .finish()
    }
}

impl CommandTracker {
    pub fn new(dma: Arc<dyn DmaAllocator>) -> Self {
        Self {
            state: Mutex::new(TrackerState {
                map: 0,
                seq: 0,
                slots: (0..MAX_PENDING_COMMANDS).map(|_| None).collect(),
            }),
            completed: Condvar::new(),
            dma,
        }
    }

    /// Allocates a slot and tag for a command using the reply buffer `rx` and
    /// the request buffer `tx`.
    ///
    /// If no slot is free the buffers are freed.
    pub fn submit(&self, rx: DmaBuffer, tx: DmaBuffer) -> Result<PendingCommand<'_>, NoSlot> {
        let mut state = self.state.lock();
        let index = (!state.map).trailing_zeros() as usize;
        if index >= MAX_PENDING_COMMANDS {
            drop(state);
            self.dma.free_coherent(rx);
            self.dma.free_coherent(tx);
            return Err(NoSlot);
        }
        let tag = ((state.seq as u16) << 8) | index as u16;
        state.seq = state.seq.wrapping_add(1);
        state.map |= 1 << index;
        state.slots[index] = Some(Slot {
            tag,
            rx,
            tx,
            done: false,
            retcode: 0,
            owner: Owner::Waiter,
        });
        Ok(PendingCommand {
            tracker: self,
            index,
            tag,
            finished: false,
        })
    }

    /// Records the reply to the command with `tag`.
    ///
    /// Wakes the waiter, or frees the buffers if the waiter already gave up.
    pub fn complete(&self, tag: u16, retcode: u32) -> Result<(), CompleteError> {
        let index = (tag & 0xff) as usize;
        if index >= MAX_PENDING_COMMANDS {
            return Err(CompleteError::OutOfRange(tag));
        }
        let mut state = self.state.lock();
        let Some(slot) = state.slots[index].as_mut() else {
            return Err(CompleteError::NotPending(tag));
        };
        if slot.done {
            return Err(CompleteError::Duplicate(tag));
        }
        if slot.tag != tag {
            return Err(CompleteError::TagMismatch {
                expected: slot.tag,
                actual: tag,
            });
        }
        slot.done = true;
        slot.retcode = retcode;
        match slot.owner {
            Owner::Waiter => {
                self.completed.notify_all();
            }
            Owner::Reply => {
                let slot = state.release(index);
                drop(state);
                tracing::debug!(tag, "late reply, freeing abandoned command buffers");
                self.free(slot);
            }
        }
        Ok(())
    }

    /// The number of slots in use, including abandoned ones.
    pub fn pending(&self) -> usize {
        self.state.lock().map.count_ones() as usize
    }

    fn free(&self, slot: Slot) {
        self.dma.free_coherent(slot.rx);
        self.dma.free_coherent(slot.tx);
    }
}

impl Drop for CommandTracker {
    fn drop(&mut self) {
        // Every pending command borrows the tracker, so any slot left now was
        // abandoned and its reply will never be processed.
        let state = self.state.get_mut();
        for index in 0..MAX_PENDING_COMMANDS {
            if state.map & (1 << index) != 0 {
                let slot = state.release(index);
                self.dma.free_coherent(slot.rx);
                self.dma.free_coherent(slot.tx);
            }
        }
    }
}

/// A submitted command whose reply has not been collected.
///
/// Dropping it without [`PendingCommand::wait`] hands the buffers to the
/// eventual reply.
#[must_use]
pub struct PendingCommand<'a> {
    tracker: &'a CommandTracker,
    index: usize,
    tag: u16,
    finished: bool,
}

impl PendingCommand<'_> {
    pub fn tag(&self) -> u16 {
        self.tag
    }

    /// Waits up to `timeout` for the reply.
    ///
    /// On timeout the buffers are handed to the eventual reply, which frees
    /// them.
    pub fn wait(mut self, timeout: Duration) -> Result<Completed, TimedOut> {
        let deadline = Instant::now() + timeout;
        let mut state = self.tracker.state.lock();
        loop {
            if state.slot_mut(self.index).done {
                let slot = state.release(self.index);
                drop(state);
                self.finished = true;
                let completed = Completed {
                    retcode: slot.retcode,
                    output: slot.rx.to_vec(),
                };
                self.tracker.free(slot);
                return Ok(completed);
            }
            if self
                .tracker
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                // The reply may have raced with the timeout. Checking under
                // the lock that complete() takes closes the window.
                let slot = state.slot_mut(self.index);
                if !slot.done {
                    slot.owner = Owner::Reply;
                    self.finished = true;
                    return Err(TimedOut { tag: self.tag });
                }
            }
        }
    }

    /// Releases the slot of a command that was never sent, freeing its
    /// buffers.
    pub fn discard(mut self) {
        let slot = self.tracker.state.lock().release(self.index);
        self.finished = true;
        self.tracker.free(slot);
    }
}

impl Drop for PendingCommand<'_> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let mut state = self.tracker.state.lock();
        let slot = state.slot_mut(self.index);
        if slot.done {
            let slot = state.release(self.index);
            drop(state);
            self.tracker.free(slot);
        } else {
            slot.owner = Owner::Reply;
        }
    }
}
