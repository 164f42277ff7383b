// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Session-wide timing and retry configuration.
//!
//! Deliberately a plain struct with a `Default` impl rather than a
//! config-file format: argument parsing and persistence are the
//! responsibility of the external collaborator that embeds this crate.

use std::time::Duration;

/// Minimum accepted flash-write chunk size, in bytes.
pub const MIN_CHUNK_SIZE: usize = 32;
/// Maximum accepted flash-write chunk size, in bytes.
pub const MAX_CHUNK_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig {
    /// Serial link speed. The protocol is defined at 8192 baud; this is
    /// configurable because real-hardware throughput ceilings are not
    /// part of this contract (see the open question in the design notes).
    pub baud_rate: u32,
    /// How long to wait for a single frame reply before it counts as a
    /// timeout.
    pub frame_timeout: Duration,
    /// How long to wait for a sector erase to report done before giving
    /// up and retrying the whole erase once.
    pub erase_timeout: Duration,
    /// How often the erase-wait loop polls chip status while waiting.
    pub erase_poll_interval: Duration,
    /// How many times the framer retries a single frame exchange on
    /// decode failure, timeout, or mode mismatch.
    pub frame_retries: u8,
    /// How many times a single byte may be reprogrammed after a verify
    /// mismatch before the sector is declared failed.
    pub byte_retries: u8,
    /// Bytes per flash-write frame. Clamped to
    /// `[MIN_CHUNK_SIZE, MAX_CHUNK_SIZE]` by [`SessionConfig::validated`].
    pub chunk_size: usize,
    /// Enables the kernel's high-speed read patch for `read_full`.
    pub high_speed_read: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            baud_rate: 8192,
            frame_timeout: Duration::from_secs(2),
            erase_timeout: Duration::from_secs(3),
            erase_poll_interval: Duration::from_millis(2),
            frame_retries: 3,
            byte_retries: 10,
            chunk_size: MIN_CHUNK_SIZE,
            high_speed_read: false,
        }
    }
}

impl SessionConfig {
    /// Clamp `chunk_size` into the legal range. Everything else is taken
    /// as given; malformed timeouts (zero) are a caller bug, not something
    /// this layer silently "fixes".
    pub fn validated(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self
    }
}
