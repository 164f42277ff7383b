// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Structured events emitted through the `log` facade.
//!
//! Logging is a collaborator, not a core concern: this module owns no
//! destination and no formatting. `CoreEvent` names what happened; the
//! embedding application decides where that goes (stderr, a log file
//! with ISO-8601 timestamps, a GUI console) by installing any
//! `log`-compatible subscriber. The rest of the crate never calls
//! `log::*` directly, so every event this crate can emit is enumerated
//! here in one place.

use crate::error::CoreError;
use crate::session::SessionState;

pub(crate) enum CoreEvent<'a> {
    Transition { from: SessionState, to: SessionState },
    FrameTx(&'a [u8]),
    FrameRx(&'a [u8]),
    FrameRetry { attempt: u8, budget: u8, reason: &'a str },
    ByteRetry { offset: usize, attempt: u8, budget: u8 },
    Fatal(&'a CoreError),
}

impl CoreEvent<'_> {
    fn emit(&self) {
        match self {
            CoreEvent::Transition { from, to } => log::debug!("session state: {from:?} -> {to:?}"),
            CoreEvent::FrameTx(bytes) => log::trace!("tx frame ({} bytes): {bytes:02x?}", bytes.len()),
            CoreEvent::FrameRx(bytes) => log::trace!("rx frame ({} bytes): {bytes:02x?}", bytes.len()),
            CoreEvent::FrameRetry { attempt, budget, reason } => log::warn!("frame retry {attempt}/{budget}: {reason}"),
            CoreEvent::ByteRetry { offset, attempt, budget } => log::warn!("reprogramming offset {offset:#x}, attempt {attempt}/{budget}"),
            CoreEvent::Fatal(err) => log::error!("fatal session error: {err}"),
        }
    }
}

/// A state transition of the session.
pub(crate) fn transition(from: SessionState, to: SessionState) {
    CoreEvent::Transition { from, to }.emit();
}

/// A frame about to be transmitted, logged as a hex dump at `Trace` level.
pub(crate) fn frame_tx(bytes: &[u8]) {
    CoreEvent::FrameTx(bytes).emit();
}

/// A frame that was received and passed validation, logged at `Trace`.
pub(crate) fn frame_rx(bytes: &[u8]) {
    CoreEvent::FrameRx(bytes).emit();
}

/// A frame exchange being retried.
pub(crate) fn frame_retry(attempt: u8, budget: u8, reason: &str) {
    CoreEvent::FrameRetry { attempt, budget, reason }.emit();
}

/// A byte-level reprogram being retried after a verify mismatch.
pub(crate) fn byte_retry(offset: usize, attempt: u8, budget: u8) {
    CoreEvent::ByteRetry { offset, attempt, budget }.emit();
}

/// A fatal error about to be surfaced to the caller.
pub(crate) fn fatal(err: &CoreError) {
    CoreEvent::Fatal(err).emit();
}
