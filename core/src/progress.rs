// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Progress publication and cooperative cancellation.
//!
//! A session owns its transport exclusively and runs on a single thread,
//! but callers still want to observe progress (and request cancellation)
//! from elsewhere -- typically a GUI's event loop or the thread that owns
//! the datalog worker. `ProgressCell` is a small mutex-protected snapshot
//! with a sequence counter so an observer can tell whether it read a
//! stale value; `CancellationToken` is a flag polled between frames and
//! between sectors, never inside one.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// One stage of a long-running operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Erasing { sector: u8 },
    Programming { sector: u8 },
    Verifying { sector: u8 },
    ComputingChecksum,
    Reading,
    Idle,
}

/// A point-in-time progress report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    pub stage: Stage,
    pub bytes_done: usize,
    pub bytes_total: usize,
}

impl ProgressSnapshot {
    pub const IDLE: ProgressSnapshot = ProgressSnapshot { stage: Stage::Idle, bytes_done: 0, bytes_total: 0 };
}

/// Shared, lock-protected progress state with a sequence counter.
///
/// The session is the sole writer; any number of readers may snapshot it.
/// The sequence counter is bumped after each publish so a reader who
/// wants to detect "nothing has happened since I last looked" can do so
/// without taking the lock twice.
pub struct ProgressCell {
    snapshot: Mutex<ProgressSnapshot>,
    sequence: AtomicU64,
}

impl Default for ProgressCell {
    fn default() -> Self {
        Self { snapshot: Mutex::new(ProgressSnapshot::IDLE), sequence: AtomicU64::new(0) }
    }
}

impl ProgressCell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn publish(&self, snapshot: ProgressSnapshot) {
        *self.snapshot.lock().unwrap() = snapshot;
        self.sequence.fetch_add(1, Ordering::Release);
    }

    /// The most recent snapshot and the sequence number it was published
    /// under.
    pub fn read(&self) -> (ProgressSnapshot, u64) {
        let seq = self.sequence.load(Ordering::Acquire);
        (*self.snapshot.lock().unwrap(), seq)
    }
}

/// A flag an in-flight operation polls between frames and between sectors.
/// Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
