// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The thin public functional surface: `open_session`, and the handful
//! of whole-session operations a GUI, CLI, or disassembler collaborator
//! actually drives. Everything else in this crate (the state machine,
//! the framer, the bank map) is plumbing this module composes.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::bankmap::OperationMode;
use crate::config::{SessionConfig, MAX_CHUNK_SIZE};
use crate::error::{CoreError, ReportedError};
use crate::image::{Image, Report};
use crate::kernel::FeatureFlags;
use crate::ops::{self, DatalogRow};
use crate::progress::{CancellationToken, ProgressCell, ProgressSnapshot};
use crate::session::{self, SessionState};
use crate::transport::Transport;

/// Everything known about the connected controller without driving a
/// flash operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EcuInfo {
    pub state: SessionState,
    pub kernel_resident: bool,
    pub baud_rate: u32,
    pub chunk_size: usize,
}

/// A handle to one connected controller.
///
/// `read_image`/`write_image` drive the handshake (silence ->
/// authenticate -> enter_programming -> upload_kernel) the first time
/// either is called and cache the result; `datalog` must be called
/// before that happens; once the handshake has run, the underlying
/// session has left `Idle` for good and `datalog`'s own `Idle` check
/// (in [`crate::ops::datalog_stream`] via [`session::Session::datalog_frame`])
/// fails.
pub struct Session {
    inner: session::Session,
    features: FeatureFlags,
}

impl Session {
    fn new(inner: session::Session) -> Self {
        let features = FeatureFlags {
            high_speed_read: inner.config().high_speed_read,
            alternate_chunk_size: inner.config().chunk_size == MAX_CHUNK_SIZE,
        };
        Self { inner, features }
    }

    fn ensure_ready(&mut self) -> Result<(), CoreError> {
        if self.inner.state() == SessionState::KernelResident {
            return Ok(());
        }
        self.inner.silence()?;
        self.inner.authenticate()?;
        self.inner.enter_programming()?;
        self.inner.upload_kernel(self.features)
    }

    /// The session's progress snapshot, publishable from any thread.
    pub fn progress(&self) -> Arc<ProgressCell> {
        self.inner.progress()
    }

    /// Cooperative cancellation, checked between frames and sectors.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }

    pub fn info(&self) -> EcuInfo {
        EcuInfo {
            state: self.inner.state(),
            kernel_resident: self.inner.state() == SessionState::KernelResident,
            baud_rate: self.inner.config().baud_rate,
            chunk_size: self.inner.config().chunk_size,
        }
    }

    /// Reads the whole 128 KiB image, driving the handshake first if
    /// it hasn't run yet.
    pub fn read_image(&mut self, mut progress: impl FnMut(ProgressSnapshot)) -> Result<Image, CoreError> {
        self.ensure_ready()?;
        let cell = self.inner.progress();
        ops::read_full(&mut self.inner, |snapshot| {
            cell.publish(snapshot);
            progress(snapshot);
        })
    }

    /// Erases and programs `image`'s write range per `mode`, driving
    /// the handshake first if it hasn't run yet.
    pub fn write_image(&mut self, mode: OperationMode, image: &Image, mut progress: impl FnMut(ProgressSnapshot)) -> Result<Report, ReportedError> {
        if let Err(error) = self.ensure_ready() {
            return Err(ReportedError { error, report: Report::new(mode) });
        }
        let cell = self.inner.progress();
        ops::write_image(&mut self.inner, mode, image, |snapshot| {
            cell.publish(snapshot);
            progress(snapshot);
        })
    }

    /// Spawns the datalog worker on a dedicated thread and returns the
    /// token that cancels it, plus a handle the caller may `join` for
    /// the worker's eventual result. Consumes the session: the worker
    /// owns it for its lifetime, per §5.
    pub fn datalog(self, cadence: Duration, sink: impl FnMut(DatalogRow) + Send + 'static) -> (CancellationToken, JoinHandle<Result<(), CoreError>>) {
        let cancel = self.inner.cancellation_token();
        let worker_cancel = cancel.clone();
        let handle = std::thread::spawn(move || {
            let mut session = self;
            ops::datalog_stream(&mut session.inner, cadence, worker_cancel, sink)
        });
        (cancel, handle)
    }

    /// Idempotent, best-effort teardown: sends the kernel's termination
    /// byte (if resident), closes the transport, and returns the
    /// session to `Idle` internally before dropping it.
    pub fn close(mut self) {
        self.inner.cleanup();
    }
}

/// Opens `transport` and returns a session in `Idle`, ready for either
/// `datalog` or the first `read_image`/`write_image` call.
pub fn open_session(transport: Box<dyn Transport + Send>, config: SessionConfig) -> Result<Session, CoreError> {
    let inner = session::Session::open(transport, config)?;
    Ok(Session::new(inner))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::VirtualEcuTransport;
    use crate::virtual_ecu::VirtualEcu;

    #[test]
    fn read_image_drives_handshake_lazily() {
        let transport: Box<dyn Transport + Send> = Box::new(VirtualEcuTransport::new(VirtualEcu::new()));
        let mut session = open_session(transport, SessionConfig::default()).unwrap();
        assert_eq!(session.info().state, SessionState::Idle);

        let image = session.read_image(|_| {}).unwrap();
        assert_eq!(image.as_bytes().len(), nor_flash_model::FLASH_SIZE);
        assert_eq!(session.info().state, SessionState::KernelResident);
    }

    #[test]
    fn datalog_before_any_flash_op_reads_rows() {
        let transport: Box<dyn Transport + Send> = Box::new(VirtualEcuTransport::new(VirtualEcu::new()));
        let session = open_session(transport, SessionConfig::default()).unwrap();
        let (cancel, handle) = session.datalog(Duration::from_millis(1), move |row| {
            assert_eq!(row.0.len(), 57);
        });
        std::thread::sleep(Duration::from_millis(5));
        cancel.cancel();
        handle.join().unwrap().unwrap();
    }
}
