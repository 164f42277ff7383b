// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The session state machine: silence -> seed/key -> programming mode ->
//! kernel upload -> the operation loop -> cleanup.
//!
//! A `Session` owns its transport exclusively and is driven by `&mut
//! self` — Rust's borrow checker already rules out the concurrent-call
//! case §5 calls a busy error; a caller wanting shared, cross-thread
//! access wraps a `Session` in a `Mutex` and maps a failed `try_lock` to
//! [`CoreError::Busy`] itself (see `api`).

use std::collections::HashMap;
use std::time::Duration;

use crate::bankmap::{self, BankAddress};
use crate::config::SessionConfig;
use crate::error::{CoreError, FlashError};
use crate::framer::{self, Frame};
use crate::kernel::{FeatureFlags, KernelPayload};
use crate::logging;
use crate::progress::{CancellationToken, ProgressCell};
use crate::transport::Transport;

const MODE_DATALOG: u8 = 1;
const MODE_SILENCE: u8 = 8;
const MODE_SEED_KEY: u8 = 13;
const MODE_ENTER_PROGRAMMING: u8 = 5;
const MODE_UPLOAD_BLOCK: u8 = 6;
const MODE_RAM_READ: u8 = 9;
const MODE_RAM_WRITE: u8 = 10;
const MODE_FLASH: u8 = 16;

const FLASH_PROGRAM: u8 = 0x00;
const FLASH_ERASE: u8 = 0x01;
const FLASH_CHECKSUM: u8 = 0x02;
const FLASH_ERASE_STATUS: u8 = 0x03;

/// `key = (seed + 0x9349) mod 0x10000`, per the seed/key handshake.
fn derive_key(seed: u16) -> u16 {
    seed.wrapping_add(0x9349)
}

const BANK_SELECT_PORT: u16 = crate::virtual_ecu::BANK_SELECT_PORT;

/// Session lifecycle, per the state/event table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Silenced,
    Authenticated,
    Programming,
    KernelResident,
    Failed,
}

impl SessionState {
    fn label(self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Silenced => "Silenced",
            SessionState::Authenticated => "Authenticated",
            SessionState::Programming => "Programming",
            SessionState::KernelResident => "KernelResident",
            SessionState::Failed => "Failed",
        }
    }
}

/// One poll of a sector erase's busy status, as reported by the kernel's
/// mode-16 erase-status sub-opcode.
struct EraseStatus {
    busy: bool,
    /// The chip's real DQ5 bit: set once an in-flight operation has been
    /// stalled past its normal completion (a wedged part), distinct from
    /// `erase_timeout` expiring on a merely slow one.
    dq5: bool,
}

pub struct Session {
    transport: Box<dyn Transport + Send>,
    config: SessionConfig,
    state: SessionState,
    bank_shadow: Option<u8>,
    progress: std::sync::Arc<ProgressCell>,
    cancel: CancellationToken,
}

impl Session {
    /// Opens `transport` and starts the session in `Idle`.
    pub fn open(mut transport: Box<dyn Transport + Send>, config: SessionConfig) -> Result<Self, CoreError> {
        transport.open()?;
        Ok(Self {
            transport,
            config: config.validated(),
            state: SessionState::Idle,
            bank_shadow: None,
            progress: ProgressCell::new(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn progress(&self) -> std::sync::Arc<ProgressCell> {
        self.progress.clone()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn require_state(&self, expected: SessionState) -> Result<(), CoreError> {
        if self.state != expected {
            return Err(CoreError::IllegalState { expected: expected.label(), actual: self.state.label() });
        }
        Ok(())
    }

    fn transition(&mut self, to: SessionState) {
        logging::transition(self.state, to);
        self.state = to;
    }

    /// Wraps every fallible operation's result: logs a fatal error and,
    /// if it's session-fatal (§7), moves to `Failed`.
    fn guard<T>(&mut self, result: Result<T, CoreError>) -> Result<T, CoreError> {
        if let Err(ref err) = result {
            logging::fatal(err);
            if err.is_fatal_to_session() {
                self.transition(SessionState::Failed);
            }
        }
        result
    }

    fn exchange(&mut self, mode: u8, payload: Vec<u8>) -> Result<Frame, CoreError> {
        if self.cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        let request = Frame::new(mode, payload);
        framer::exchange(self.transport.as_mut(), &request, Frame::expected_reply_mode(mode), self.config.frame_retries, self.config.frame_timeout)
    }

    fn ensure_bank(&mut self, bank: u8) -> Result<(), CoreError> {
        if self.bank_shadow == Some(bank) {
            return Ok(());
        }
        self.exchange(MODE_RAM_WRITE, vec![(BANK_SELECT_PORT >> 8) as u8, BANK_SELECT_PORT as u8, bank])?;
        self.bank_shadow = Some(bank);
        Ok(())
    }

    /// Requests one mode-1 datalog row. Only legal in `Idle`, since
    /// `silence()` (mode 8) is what tells the ECU to stop sending these
    /// on its own and switch to the programming dialogue.
    pub fn datalog_frame(&mut self) -> Result<[u8; 57], CoreError> {
        let result = (|| {
            self.require_state(SessionState::Idle)?;
            let reply = self.exchange(MODE_DATALOG, vec![])?;
            reply.payload.try_into().map_err(|payload: Vec<u8>| CoreError::Protocol(format!("datalog reply was {} bytes, expected 57", payload.len())))
        })();
        self.guard(result)
    }

    /// `Idle -> Silenced`: broadcasts mode 8, suppressing the ECU's
    /// normal datalog chatter.
    pub fn silence(&mut self) -> Result<(), CoreError> {
        let result = (|| {
            self.require_state(SessionState::Idle)?;
            self.exchange(MODE_SILENCE, vec![])?;
            self.transition(SessionState::Silenced);
            Ok(())
        })();
        self.guard(result)
    }

    /// `Silenced -> Authenticated`: the two-step seed/key exchange.
    /// `key = (seed + 0x9349) mod 0x10000`.
    pub fn authenticate(&mut self) -> Result<(), CoreError> {
        let result = (|| {
            self.require_state(SessionState::Silenced)?;
            let seed_reply = self.exchange(MODE_SEED_KEY, vec![])?;
            if seed_reply.payload.len() != 2 {
                return Err(CoreError::Protocol("seed reply was not 2 bytes".into()));
            }
            let seed = u16::from_be_bytes([seed_reply.payload[0], seed_reply.payload[1]]);
            let key = derive_key(seed);
            let key_reply = self.exchange(MODE_SEED_KEY, key.to_be_bytes().to_vec())?;
            if key_reply.payload.first() != Some(&0x01) {
                return Err(CoreError::Auth);
            }
            self.transition(SessionState::Authenticated);
            Ok(())
        })();
        self.guard(result)
    }

    /// `Authenticated -> Programming`.
    pub fn enter_programming(&mut self) -> Result<(), CoreError> {
        let result = (|| {
            self.require_state(SessionState::Authenticated)?;
            self.exchange(MODE_ENTER_PROGRAMMING, vec![])?;
            self.transition(SessionState::Programming);
            Ok(())
        })();
        self.guard(result)
    }

    /// `Programming -> KernelResident`: uploads the three kernel blocks,
    /// patched for `features`, in order.
    pub fn upload_kernel(&mut self, features: FeatureFlags) -> Result<(), CoreError> {
        let result = (|| {
            self.require_state(SessionState::Programming)?;
            let kernel = KernelPayload::load(features)?;
            for i in 0..3 {
                let addr = KernelPayload::block_addr(i);
                let mut payload = addr.to_be_bytes().to_vec();
                payload.extend_from_slice(kernel.block(i));
                self.exchange(MODE_UPLOAD_BLOCK, payload)?;
            }
            self.transition(SessionState::KernelResident);
            Ok(())
        })();
        self.guard(result)
    }

    /// Erases `sector`. A sector-erase timeout (the chip never reports
    /// done within `erase_timeout`) triggers one full erase retry before
    /// the error becomes fatal to the operation (not the session).
    pub fn erase_sector(&mut self, sector: u8) -> Result<(), CoreError> {
        let result = (|| {
            self.require_state(SessionState::KernelResident)?;
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let addr = bankmap::sector_cpu_base(sector);
            self.ensure_bank(addr.bank)?;
            if self.erase_and_wait(addr)? {
                return Ok(());
            }
            if self.erase_and_wait(addr)? {
                return Ok(());
            }
            Err(CoreError::Flash(FlashError::EraseFailed { sector }))
        })();
        self.guard(result)
    }

    /// Starts the erase and polls for completion at `erase_poll_interval`
    /// cadence, bounded by `erase_timeout`. Returns `Ok(false)` — not an
    /// error — if the deadline passes with the chip still busy or wedged
    /// (DQ5), so the caller can retry the whole erase once per §4.F.
    fn erase_and_wait(&mut self, addr: BankAddress) -> Result<bool, CoreError> {
        self.send_erase(addr)?;
        let deadline = std::time::Instant::now() + self.config.erase_timeout;
        loop {
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            let status = self.send_erase_status(addr)?;
            if !status.busy {
                return Ok(true);
            }
            if status.dq5 || std::time::Instant::now() >= deadline {
                return Ok(false);
            }
            std::thread::sleep(self.config.erase_poll_interval);
        }
    }

    fn send_erase(&mut self, addr: BankAddress) -> Result<(), CoreError> {
        let payload = vec![FLASH_ERASE, (addr.cpu_addr >> 8) as u8, addr.cpu_addr as u8];
        self.exchange(MODE_FLASH, payload)?;
        Ok(())
    }

    fn send_erase_status(&mut self, addr: BankAddress) -> Result<EraseStatus, CoreError> {
        let payload = vec![FLASH_ERASE_STATUS, (addr.cpu_addr >> 8) as u8, addr.cpu_addr as u8];
        let reply = self.exchange(MODE_FLASH, payload)?;
        let busy = reply.payload.first().copied().unwrap_or(0) != 0;
        let status_byte = reply.payload.get(1).copied().unwrap_or(0);
        Ok(EraseStatus { busy, dq5: status_byte & 0x20 != 0 })
    }

    /// Programs `data` starting at `(bank, cpu_addr)`, retrying
    /// individually mismatching bytes up to the configured budget.
    /// Returns how many reprogram attempts each mismatching file offset
    /// consumed.
    pub fn program_bytes(&mut self, bank: u8, cpu_addr: u16, file_offset_base: usize, data: &[u8]) -> Result<HashMap<usize, u8>, CoreError> {
        let result = (|| {
            self.require_state(SessionState::KernelResident)?;
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.ensure_bank(bank)?;
            let mut retries = HashMap::new();
            let mut pending = self.send_program(cpu_addr, data)?;
            let mut attempt = 0u8;
            while !pending.is_empty() {
                if attempt >= self.config.byte_retries {
                    let offset = file_offset_base + pending[0] as usize;
                    return Err(CoreError::Flash(FlashError::ProgramMismatch { offset, retries_used: attempt }));
                }
                attempt += 1;
                let mut still_pending = Vec::new();
                for &rel in &pending {
                    logging::byte_retry(file_offset_base + rel as usize, attempt, self.config.byte_retries);
                    let addr = cpu_addr + rel as u16;
                    let byte = data[rel as usize];
                    let again = self.send_program(addr, std::slice::from_ref(&byte))?;
                    *retries.entry(file_offset_base + rel as usize).or_insert(0) += 1;
                    if !again.is_empty() {
                        still_pending.push(rel);
                    }
                }
                pending = still_pending;
            }
            Ok(retries)
        })();
        self.guard(result)
    }

    fn send_program(&mut self, cpu_addr: u16, data: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut payload = vec![FLASH_PROGRAM, (cpu_addr >> 8) as u8, cpu_addr as u8];
        payload.extend_from_slice(data);
        let reply = self.exchange(MODE_FLASH, payload)?;
        let count = *reply.payload.first().ok_or_else(|| CoreError::Protocol("empty program reply".into()))? as usize;
        Ok(reply.payload.get(1..1 + count).unwrap_or_default().to_vec())
    }

    /// Reads `len` bytes starting at `(bank, cpu_addr)` via the kernel's
    /// read primitive.
    pub fn read_bytes(&mut self, bank: u8, cpu_addr: u16, len: u8) -> Result<Vec<u8>, CoreError> {
        let result = (|| {
            self.require_state(SessionState::KernelResident)?;
            if self.cancel.is_cancelled() {
                return Err(CoreError::Cancelled);
            }
            self.ensure_bank(bank)?;
            let reply = self.exchange(MODE_RAM_READ, vec![(cpu_addr >> 8) as u8, cpu_addr as u8, len])?;
            Ok(reply.payload)
        })();
        self.guard(result)
    }

    /// The kernel's on-chip checksum primitive.
    pub fn compute_onchip_checksum(&mut self) -> Result<u16, CoreError> {
        let result = (|| {
            self.require_state(SessionState::KernelResident)?;
            let reply = self.exchange(MODE_FLASH, vec![FLASH_CHECKSUM])?;
            if reply.payload.len() != 2 {
                return Err(CoreError::Protocol("checksum reply was not 2 bytes".into()));
            }
            Ok(u16::from_be_bytes([reply.payload[0], reply.payload[1]]))
        })();
        self.guard(result)
    }

    /// Idempotent, best-effort: sends the kernel's termination byte,
    /// closes the transport, and returns to `Idle` regardless of the
    /// session's prior state.
    pub fn cleanup(&mut self) {
        if self.state != SessionState::Failed {
            let _ = self.transport.write(&[0xBB]);
        }
        let _ = self.transport.close();
        self.transition(SessionState::Idle);
        self.bank_shadow = None;
    }

    /// How long a single frame exchange may block, for callers
    /// composing their own deadlines around a sequence of operations.
    pub fn frame_timeout(&self) -> Duration {
        self.config.frame_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    use crate::config::SessionConfig;
    use crate::kernel::FeatureFlags;
    use crate::transport::VirtualEcuTransport;
    use crate::virtual_ecu::VirtualEcu;

    fn fresh_session() -> Session {
        let transport = Box::new(VirtualEcuTransport::new(VirtualEcu::new()));
        Session::open(transport, SessionConfig::default()).unwrap()
    }

    #[test]
    fn authenticate_before_silence_is_rejected() {
        let mut session = fresh_session();
        let err = session.authenticate().unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { expected: "Silenced", actual: "Idle" }));
    }

    #[test]
    fn upload_kernel_before_enter_programming_is_rejected() {
        let mut session = fresh_session();
        session.silence().unwrap();
        session.authenticate().unwrap();
        let err = session.upload_kernel(FeatureFlags::default()).unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { expected: "Programming", actual: "Authenticated" }));
    }

    #[test]
    fn flash_op_before_kernel_resident_is_rejected() {
        let mut session = fresh_session();
        let err = session.erase_sector(0).unwrap_err();
        assert!(matches!(err, CoreError::IllegalState { expected: "KernelResident", actual: "Idle" }));
    }

    /// Property 7: there is no path from `Idle` to `KernelResident` that
    /// skips a step — an illegal-state rejection aborts only the call,
    /// leaving the session exactly where it was so the real handshake
    /// sequence still succeeds afterward.
    #[test]
    fn illegal_state_error_does_not_disturb_the_session() {
        let mut session = fresh_session();
        session.authenticate().unwrap_err();
        assert_eq!(session.state(), SessionState::Idle);
        session.silence().unwrap();
        session.authenticate().unwrap();
        session.enter_programming().unwrap();
        session.upload_kernel(FeatureFlags::default()).unwrap();
        assert_eq!(session.state(), SessionState::KernelResident);
    }

    proptest! {
        /// Property 6: the key derivation is `(seed + 0x9349) mod 2^16`
        /// for every 16-bit seed, not just S1's fixed example.
        #[test]
        fn property_6_key_derivation_matches_formula(seed in any::<u16>()) {
            prop_assert_eq!(derive_key(seed), seed.wrapping_add(0x9349));
        }
    }
}
