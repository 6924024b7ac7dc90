// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mutual exclusion between the host and the coprocessor firmware over a
//! small region of shared memory.
//!
//! Each side owns a flag byte and a magic word. A shared `turn` word breaks
//! ties: the host only yields while `turn` is nonzero, and hands the turn to
//! the firmware when it unlocks.
//!
//! The host side moves through these states:
//!
//! ```text
//!            lock()                 firmware flag clear
//!   Idle ------------> Requesting ---------------------> Held
//!    ^                  |      ^                          |
//!    |     turn != 0    |      |  turn == 0               |
//!    |                  v      |                          |
//!    |                 Yielding                           |
//!    +----------------------------------------------------+
//!                    unlock (guard dropped)
//! ```
//!
//! Every wait is bounded by a timeout. A timed out lock attempt withdraws the
//! host's request and returns to `Idle`.

use crate::RingMem;
use std::sync::atomic::fence;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// The magic both sides write once they are ready to use the lock.
pub const HANDOFF_MAGIC: u64 = 0x4b1d_0000_0000_0002;

const MAGIC_HOST: usize = 0;
const MAGIC_FIRMWARE: usize = 8;
const FLAG_HOST: usize = 16;
const FLAG_FIRMWARE: usize = 17;
const TURN: usize = 20;

/// The size of the shared lock region.
pub const HANDOFF_SIZE: usize = 24;

/// The host side state of the lock.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HandoffState {
    /// Not requested.
    Idle,
    /// The host flag is set and the host waits for the firmware flag to
    /// clear.
    Requesting,
    /// The firmware holds the turn; the host flag is cleared until the turn
    /// comes back.
    Yielding,
    /// The host owns the lock.
    Held,
}

#[derive(Debug, Error)]
pub enum HandoffError {
    #[error("handoff region of {0:#x} bytes is too small")]
    RegionTooSmall(usize),
    #[error("timed out waiting for the firmware while {state:?}")]
    Timeout { state: HandoffState },
}

/// The host side of the handoff lock.
pub struct Handoff<M> {
    mem: M,
    state: HandoffState,
}

impl<M: RingMem> Handoff<M> {
    pub fn new(mem: M) -> Result<Self, HandoffError> {
        if mem.len() < HANDOFF_SIZE {
            return Err(HandoffError::RegionTooSmall(mem.len()));
        }
        Ok(Self {
            mem,
            state: HandoffState::Idle,
        })
    }

    pub fn state(&self) -> HandoffState {
        self.state
    }

    /// Publishes the host magic, then waits for the firmware magic while
    /// holding the lock.
    pub fn init(&mut self, timeout: Duration) -> Result<(), HandoffError> {
        let deadline = Instant::now() + timeout;
        self.mem.write_at(MAGIC_HOST, &HANDOFF_MAGIC.to_le_bytes());
        fence(Ordering::SeqCst);

        let guard = self.lock(timeout)?;
        loop {
            if guard.handoff.firmware_magic() == HANDOFF_MAGIC {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!("firmware did not publish the handoff magic");
                return Err(HandoffError::Timeout {
                    state: HandoffState::Held,
                });
            }
            std::thread::yield_now();
        }
        drop(guard);
        tracing::debug!("handoff initialized");
        Ok(())
    }

    /// Acquires the lock, giving up after `timeout`.
    pub fn lock(&mut self, timeout: Duration) -> Result<HandoffGuard<'_, M>, HandoffError> {
        assert_eq!(self.state, HandoffState::Idle);
        let deadline = Instant::now() + timeout;
        self.request();
        loop {
            match self.state {
                HandoffState::Requesting => {
                    if self.flag(FLAG_FIRMWARE) == 0 {
                        fence(Ordering::Acquire);
                        self.state = HandoffState::Held;
                        break;
                    }
                    if self.turn() != 0 {
                        self.set_flag(FLAG_HOST, false);
                        self.state = HandoffState::Yielding;
                    }
                }
                HandoffState::Yielding => {
                    if self.turn() == 0 {
                        self.request();
                    }
                }
                HandoffState::Idle | HandoffState::Held => unreachable!(),
            }
            if Instant::now() >= deadline {
                let state = self.state;
                self.set_flag(FLAG_HOST, false);
                self.state = HandoffState::Idle;
                return Err(HandoffError::Timeout { state });
            }
            std::thread::yield_now();
        }
        Ok(HandoffGuard { handoff: self })
    }

    fn request(&mut self) {
        self.set_flag(FLAG_HOST, true);
        fence(Ordering::SeqCst);
        self.state = HandoffState::Requesting;
    }

    fn unlock(&mut self) {
        fence(Ordering::Release);
        self.mem.write_at(TURN, &1u32.to_le_bytes());
        self.set_flag(FLAG_HOST, false);
        fence(Ordering::SeqCst);
        self.state = HandoffState::Idle;
    }

    fn flag(&self, addr: usize) -> u8 {
        let mut v = [0];
        self.mem.read_at(addr, &mut v);
        v[0]
    }

    fn set_flag(&self, addr: usize, set: bool) {
        self.mem.write_at(addr, &[set.into()]);
    }

    fn turn(&self) -> u32 {
        self.mem.load_u32(TURN)
    }

    fn firmware_magic(&self) -> u64 {
        let mut v = [0; 8];
        self.mem.read_at(MAGIC_FIRMWARE, &mut v);
        u64::from_le_bytes(v)
    }
}

/// Proof of holding the handoff lock. Dropping it unlocks and passes the turn
/// to the firmware.
#[must_use]
pub struct HandoffGuard<'a, M: RingMem> {
    handoff: &'a mut Handoff<M>,
}

impl<M: RingMem> HandoffGuard<'_, M> {
    /// The shared memory the lock protects accesses to.
    pub fn mem(&self) -> &M {
        &self.handoff.mem
    }
}

impl<M: RingMem> Drop for HandoffGuard<'_, M> {
    fn drop(&mut self) {
        self.handoff.unlock();
    }
}
