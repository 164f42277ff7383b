// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ALDL flash read/write pipeline: framing and the half-duplex
//! `exchange`, the session handshake into a resident RAM kernel, and
//! bank-switched flash programming/verification against the Am29F010
//! model.
//!
//! The public surface is [`api::open_session`] and [`api::Session`];
//! everything else is exported for embedders that want to drive the
//! state machine or the NOR model directly (a test harness, a bench
//! reader) rather than through the thin functional wrapper.

mod api;
mod bankmap;
mod config;
mod error;
mod framer;
mod image;
mod kernel;
mod logging;
mod ops;
mod progress;
mod session;
mod transport;
mod virtual_ecu;

pub use api::{open_session, EcuInfo, Session};
pub use bankmap::{
    bank_address_to_file_offset, file_offset_to_bank_address, sector_of, sector_range, BankAddress, OperationMode, BANK_HIGH, BANK_LOW, BANK_MID,
    BOOT_SECTOR,
};
pub use config::{SessionConfig, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
pub use error::{CoreError, FlashError, ReportedError};
pub use image::{compute_bin_checksum, fix_bin_checksum, verify_bin_checksum, Image, Report, CALIBRATION_WINDOW, CHECKSUM_OFFSET};
pub use kernel::FeatureFlags;
pub use ops::{DatalogRow, ProgressSink};
pub use progress::{CancellationToken, ProgressCell, ProgressSnapshot, Stage};
pub use session::SessionState;
pub use transport::{DirectDriverTransport, LoopbackTransport, SerialTransport, Transport, VirtualEcuTransport};
pub use virtual_ecu::VirtualEcu;
