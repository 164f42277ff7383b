// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The error taxonomy a session can produce, per the kinds the protocol
//! actually distinguishes rather than per Rust error-handling convenience.

use std::fmt;

use crate::image::Report;

/// Sub-kinds of [`CoreError::Flash`], mirroring the NOR layer's own
/// failure modes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FlashError {
    #[error("sector {sector} erase did not complete within its deadline")]
    EraseFailed { sector: u8 },
    #[error("byte at offset {offset:#x} mismatched after {retries_used} reprogram attempts")]
    ProgramMismatch { offset: usize, retries_used: u8 },
    #[error("on-chip checksum {actual:#06x} does not match image checksum {expected:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
}

/// Everything that can go wrong driving the flash programming pipeline.
///
/// Variants map 1:1 onto the kinds named in the protocol description, not
/// onto Rust's own I/O or serialization error types, so callers can match
/// on *what the vehicle did* rather than *which library call failed*.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    /// The byte-stream channel itself failed (port gone, device
    /// disconnected). Fatal to the session.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame failed checksum, length, or device-id validation. Absorbed
    /// by the framer's own retry budget; only escapes once that budget is
    /// exhausted.
    #[error("frame error: {0}")]
    Frame(String),

    /// No reply arrived before the configured deadline.
    #[error("timed out waiting for a reply")]
    Timeout,

    /// A reply had an unexpected mode, arrived out of sequence, or the
    /// session was asked to do something illegal in its current state.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The seed/key exchange failed.
    #[error("authentication failed")]
    Auth,

    /// A NOR-flash-level failure. `ProgramMismatch` is retried at byte
    /// granularity before becoming fatal; the others are fatal to the
    /// operation (not necessarily the session).
    #[error("flash error: {0}")]
    Flash(#[from] FlashError),

    /// An image, mode, or argument invariant was violated before any
    /// device I/O took place.
    #[error("validation error: {0}")]
    Validation(String),

    /// Cooperative cancellation was observed between frames or sectors.
    #[error("operation cancelled")]
    Cancelled,

    /// The session is not in a state that allows the requested operation
    /// (e.g. calling `upload_kernel` before `authenticate`).
    #[error("illegal in current session state: expected {expected}, was {actual}")]
    IllegalState { expected: &'static str, actual: &'static str },

    /// Another operation is already in progress on this session.
    #[error("session is busy with another operation")]
    Busy,

    /// A build-time invariant was violated (e.g. a corrupt kernel payload).
    /// Not part of the device-facing taxonomy: this indicates a broken
    /// build artifact, not a runtime/device condition.
    #[error("internal error: {0}")]
    Internal(String),

    /// The transport variant doesn't implement an optional capability
    /// (e.g. a post-kernel baud ramp).
    #[error("unsupported operation")]
    Unsupported,
}

impl CoreError {
    /// Whether this error ends the session (vs. just the current
    /// operation), per §7: flash-layer errors (including
    /// `ProgramMismatch` once its own retry budget is spent) are fatal
    /// to the operation but leave the session in `KernelResident`;
    /// a link- or protocol-level failure is fatal to the session itself.
    pub fn is_fatal_to_session(&self) -> bool {
        matches!(self, CoreError::Transport(_) | CoreError::Frame(_) | CoreError::Timeout | CoreError::Protocol(_) | CoreError::Auth | CoreError::Internal(_))
    }
}

/// A fatal error paired with the machine-readable report of how far the
/// operation got, so a subsequent run can resume or compare against a
/// bench-read image.
#[derive(Debug)]
pub struct ReportedError {
    pub error: CoreError,
    pub report: Report,
}

impl fmt::Display for ReportedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (last good sector: {:?}, offset: {:?})", self.error, self.report.last_good_sector, self.report.last_good_offset)
    }
}

impl std::error::Error for ReportedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}
