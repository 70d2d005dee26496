//! Per-item streaming state machine.

use std::sync::atomic::{AtomicU8, Ordering};

/// Pipeline state of a single streamed item.
///
/// Every transition goes through [`AtomicState::transition`]; a failed
/// transition means another thread moved the item first, and the caller
/// abandons its attempt. That lost race is the engine's cancellation
/// mechanism, not an error.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No streaming work outstanding.
    NoRequest = 0,
    /// Queued for the reader pool.
    ReadPending = 1,
    /// Claimed by a reader thread.
    Reading = 2,
    /// Queued for the compiler pool.
    CompilePending = 3,
    /// Claimed by a compiler thread as part of a batch.
    Compiling = 4,
    /// Compiled, waiting for the update thread to merge.
    MergePending = 5,
    /// Being merged into the live scene.
    Merging = 6,
    /// Selected for disposal, waiting for a compiler thread.
    DeletePending = 7,
    /// Being disposed by a compiler thread.
    Deleting = 8,
}

impl StreamState {
    fn from_raw(raw: u8) -> StreamState {
        match raw {
            0 => StreamState::NoRequest,
            1 => StreamState::ReadPending,
            2 => StreamState::Reading,
            3 => StreamState::CompilePending,
            4 => StreamState::Compiling,
            5 => StreamState::MergePending,
            6 => StreamState::Merging,
            7 => StreamState::DeletePending,
            8 => StreamState::Deleting,
            other => unreachable!("invalid stream state {}", other),
        }
    }
}

/// Enum-typed atomic state with a single compare-and-swap helper.
#[derive(Debug)]
pub struct AtomicState(AtomicU8);

impl AtomicState {
    pub fn new(state: StreamState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> StreamState {
        StreamState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Attempt the transition `from -> to`.
    ///
    /// Returns `false` when the item was no longer in `from`; the caller
    /// must not retry.
    pub fn transition(&self, from: StreamState, to: StreamState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}
