// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure state-machine model of an AMD Am29F010 128 KiB NOR flash part.
//!
//! This is the canonical reference for what the physical chip does: the
//! same unlock sequences, the same AND-only program rule, and the same
//! status-polling bits a real kernel would observe. It has no notion of
//! wall-clock time or a wire protocol; callers drive it with `write`/`read`
//! and decide for themselves how long to keep polling.

use std::fmt;

/// Total flash size in bytes: `0x00000..0x20000`.
pub const FLASH_SIZE: usize = 0x20000;
/// Erase granularity.
pub const SECTOR_SIZE: usize = 0x4000;
/// Number of 16 KiB sectors in the part.
pub const SECTOR_COUNT: usize = FLASH_SIZE / SECTOR_SIZE;

const UNLOCK_ADDR_1: usize = 0x5555;
const UNLOCK_ADDR_2: usize = 0x2AAA;
const UNLOCK_BYTE_1: u8 = 0xAA;
const UNLOCK_BYTE_2: u8 = 0x55;
const PROGRAM_CMD: u8 = 0xA0;
const ERASE_CMD: u8 = 0x80;
const SECTOR_ERASE_CONFIRM: u8 = 0x30;

/// Default number of status polls a program operation stays busy for.
pub const DEFAULT_PROGRAM_BUSY_POLLS: u32 = 2;
/// Default number of status polls a sector erase stays busy for.
pub const DEFAULT_ERASE_BUSY_POLLS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipState {
    Read,
    Unlock1Seen,
    Unlock2Seen,
    ProgramSetup,
    EraseSetup1,
    EraseSetup2,
    SectorEraseConfirm,
    Programming,
    Erasing,
}

impl fmt::Display for ChipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Busy {
    Program { addr: usize, polls_left: u32 },
    Erase { sector: usize, polls_left: u32 },
}

/// Outcome of a single `write(addr, data)` call, for callers that want to
/// observe unlock-sequence progress rather than just the resulting state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Part of a recognized unlock/command sequence; no cell touched yet.
    CommandAccepted,
    /// A byte program began at `addr`. Busy until polled to completion.
    ProgramStarted { addr: usize },
    /// The program requested a 0->1 transition that the AND rule can't
    /// perform; `result` is what the cell actually holds now (physical
    /// corruption, not a refusal -- real hardware doesn't refuse either).
    ProgramMismatch { addr: usize, requested: u8, result: u8 },
    /// A sector erase began. Busy until polled to completion.
    EraseStarted { sector: usize },
    /// The write didn't match the expected next step of any sequence;
    /// the chip returned to `Read`.
    Reset,
}

/// Status byte returned by `read` while the chip is busy, decoded into its
/// three meaningful bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusBits {
    /// DQ7: true datum's bit 7 while idle; inverted while a program is in
    /// flight, true (erased) while an erase is in flight.
    pub dq7: bool,
    /// DQ6: toggles on every status read while an operation is in flight.
    pub dq6: bool,
    /// DQ5: set once a busy operation has been force-stalled past its
    /// normal completion (see [`NorFlash::stall`]), signalling an internal
    /// timeout the way the real part does when an operation hangs.
    pub dq5: bool,
}

impl StatusBits {
    fn encode(self) -> u8 {
        (self.dq7 as u8) << 7 | (self.dq6 as u8) << 6 | (self.dq5 as u8) << 5
    }
}

/// In-memory Am29F010 simulator.
pub struct NorFlash {
    cells: Vec<u8>,
    state: ChipState,
    busy: Option<Busy>,
    program_busy_polls: u32,
    erase_busy_polls: u32,
    stalled: bool,
}

impl NorFlash {
    /// A blank chip: every cell erased to `0xFF`.
    pub fn blank() -> Self {
        Self::from_bytes(vec![0xFFu8; FLASH_SIZE].try_into().unwrap())
    }

    /// Preload the chip with existing contents (e.g. to model a part that
    /// already has firmware on it, or to seed the verification oracle).
    pub fn from_bytes(cells: Box<[u8; FLASH_SIZE]>) -> Self {
        Self {
            cells: cells.to_vec(),
            state: ChipState::Read,
            busy: None,
            program_busy_polls: DEFAULT_PROGRAM_BUSY_POLLS,
            erase_busy_polls: DEFAULT_ERASE_BUSY_POLLS,
            stalled: false,
        }
    }

    /// Override the number of status polls a busy operation takes. Useful
    /// for tests that want deterministic, short busy windows.
    pub fn set_busy_polls(&mut self, program: u32, erase: u32) {
        self.program_busy_polls = program;
        self.erase_busy_polls = erase;
    }

    /// Force the in-flight operation to never finish on its own; every
    /// subsequent status read reports DQ5 (timeout) until `reset` is
    /// called. Models a part that has wedged.
    pub fn stall(&mut self) {
        self.stalled = true;
    }

    /// Drop any in-flight operation and return to `Read`, discarding the
    /// stall flag. Does not undo cell contents already committed.
    pub fn reset(&mut self) {
        self.busy = None;
        self.state = ChipState::Read;
        self.stalled = false;
    }

    pub fn state(&self) -> ChipState {
        self.state
    }

    pub fn is_busy(&self) -> bool {
        self.busy.is_some()
    }

    /// Out-of-band read of the chip's true contents, bypassing the command
    /// state machine entirely. This is what an external verification pass
    /// (a bench reader, or a test) uses; a kernel running on the controller
    /// only ever sees `read`.
    pub fn contents(&self) -> &[u8] {
        &self.cells
    }

    /// Issue a command/address/data write, as the kernel's flash-write
    /// primitive would.
    pub fn write(&mut self, addr: usize, data: u8) -> WriteOutcome {
        assert!(addr < FLASH_SIZE, "address {addr:#x} out of range");

        if self.busy.is_some() {
            self.busy = None;
            self.state = ChipState::Read;
            return WriteOutcome::Reset;
        }

        use ChipState::*;
        match self.state {
            Read => {
                if addr == UNLOCK_ADDR_1 && data == UNLOCK_BYTE_1 {
                    self.state = Unlock1Seen;
                    WriteOutcome::CommandAccepted
                } else {
                    WriteOutcome::Reset
                }
            }
            Unlock1Seen => {
                if addr == UNLOCK_ADDR_2 && data == UNLOCK_BYTE_2 {
                    self.state = Unlock2Seen;
                    WriteOutcome::CommandAccepted
                } else {
                    self.state = Read;
                    WriteOutcome::Reset
                }
            }
            Unlock2Seen => {
                if addr == UNLOCK_ADDR_1 && data == PROGRAM_CMD {
                    self.state = ProgramSetup;
                    WriteOutcome::CommandAccepted
                } else if addr == UNLOCK_ADDR_1 && data == ERASE_CMD {
                    self.state = EraseSetup1;
                    WriteOutcome::CommandAccepted
                } else {
                    self.state = Read;
                    WriteOutcome::Reset
                }
            }
            ProgramSetup => {
                let before = self.cells[addr];
                let result = before & data;
                self.cells[addr] = result;
                self.state = Programming;
                self.busy = Some(Busy::Program { addr, polls_left: self.program_busy_polls });
                if result != data {
                    WriteOutcome::ProgramMismatch { addr, requested: data, result }
                } else {
                    WriteOutcome::ProgramStarted { addr }
                }
            }
            EraseSetup1 => {
                if addr == UNLOCK_ADDR_1 && data == UNLOCK_BYTE_1 {
                    self.state = EraseSetup2;
                    WriteOutcome::CommandAccepted
                } else {
                    self.state = Read;
                    WriteOutcome::Reset
                }
            }
            EraseSetup2 => {
                if addr == UNLOCK_ADDR_2 && data == UNLOCK_BYTE_2 {
                    self.state = SectorEraseConfirm;
                    WriteOutcome::CommandAccepted
                } else {
                    self.state = Read;
                    WriteOutcome::Reset
                }
            }
            SectorEraseConfirm => {
                let sector = addr / SECTOR_SIZE;
                if data == SECTOR_ERASE_CONFIRM && addr % SECTOR_SIZE == 0 && sector < SECTOR_COUNT {
                    self.state = Erasing;
                    self.busy = Some(Busy::Erase { sector, polls_left: self.erase_busy_polls });
                    WriteOutcome::EraseStarted { sector }
                } else {
                    self.state = Read;
                    WriteOutcome::Reset
                }
            }
            Programming | Erasing => unreachable!("busy case handled above"),
        }
    }

    /// Read a byte, as the kernel's flash-read/status primitive would: the
    /// stored value in `Read` state, or a status byte while busy.
    pub fn read(&mut self, addr: usize) -> u8 {
        assert!(addr < FLASH_SIZE, "address {addr:#x} out of range");

        let Some(busy) = self.busy.as_mut() else {
            return self.cells[addr];
        };

        if self.stalled {
            return StatusBits { dq7: false, dq6: false, dq5: true }.encode();
        }

        match busy {
            Busy::Program { addr: paddr, polls_left } => {
                if *polls_left == 0 {
                    let v = self.cells[*paddr];
                    self.busy = None;
                    self.state = ChipState::Read;
                    return v;
                }
                let toggle = *polls_left % 2 == 0;
                *polls_left -= 1;
                let true_bit7 = self.cells[*paddr] & 0x80 != 0;
                StatusBits { dq7: !true_bit7, dq6: toggle, dq5: false }.encode()
            }
            Busy::Erase { sector, polls_left } => {
                if *polls_left == 0 {
                    let base = *sector * SECTOR_SIZE;
                    self.cells[base..base + SECTOR_SIZE].fill(0xFF);
                    self.busy = None;
                    self.state = ChipState::Read;
                    return self.cells[addr];
                }
                let toggle = *polls_left % 2 == 0;
                *polls_left -= 1;
                StatusBits { dq7: true, dq6: toggle, dq5: false }.encode()
            }
        }
    }
}

/// Drives the full unlock-sequence + program command for a single byte,
/// then polls `read` until the operation completes. A convenience for
/// callers that don't care about observing the intermediate busy polls
/// (the kernel's own program primitive does the same four writes).
pub fn program(chip: &mut NorFlash, addr: usize, data: u8) -> WriteOutcome {
    chip.write(UNLOCK_ADDR_1, UNLOCK_BYTE_1);
    chip.write(UNLOCK_ADDR_2, UNLOCK_BYTE_2);
    chip.write(UNLOCK_ADDR_1, PROGRAM_CMD);
    let outcome = chip.write(addr, data);
    while chip.is_busy() {
        chip.read(addr);
    }
    outcome
}

/// Issues the unlock + sector-erase-confirm sequence without waiting for
/// completion, leaving the chip `Erasing` and busy.
pub fn erase_begin(chip: &mut NorFlash, sector: usize) -> WriteOutcome {
    chip.write(UNLOCK_ADDR_1, UNLOCK_BYTE_1);
    chip.write(UNLOCK_ADDR_2, UNLOCK_BYTE_2);
    chip.write(UNLOCK_ADDR_1, ERASE_CMD);
    chip.write(UNLOCK_ADDR_1, UNLOCK_BYTE_1);
    chip.write(UNLOCK_ADDR_2, UNLOCK_BYTE_2);
    chip.write(sector * SECTOR_SIZE, SECTOR_ERASE_CONFIRM)
}

/// Erases a sector and polls to completion.
pub fn erase_sector(chip: &mut NorFlash, sector: usize) {
    erase_begin(chip, sector);
    while chip.is_busy() {
        chip.read(sector * SECTOR_SIZE);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn s3_and_rule_no_erase_needed() {
        let mut chip = NorFlash::blank();
        chip.cells[0x100] = 0xF0;
        program(&mut chip, 0x100, 0x0F);
        assert_eq!(chip.contents()[0x100], 0x00);
    }

    #[test]
    fn s3_and_rule_requires_erase_and_flags_mismatch() {
        let mut chip = NorFlash::blank();
        chip.cells[0x100] = 0x0F;
        let outcome = program(&mut chip, 0x100, 0xF0);
        assert_eq!(chip.contents()[0x100], 0x00);
        assert!(matches!(outcome, WriteOutcome::ProgramMismatch { result: 0x00, requested: 0xF0, .. }));
    }

    #[test]
    fn sector_erase_fills_selected_sector_only() {
        let mut chip = NorFlash::blank();
        chip.cells[0x4000] = 0x00;
        chip.cells[0x8000] = 0x00;
        erase_sector(&mut chip, 1);
        assert_eq!(chip.contents()[0x4000], 0xFF);
        assert_eq!(chip.contents()[0x8000], 0x00, "sector 2 must be untouched");
    }

    #[test]
    fn deviation_from_unlock_sequence_resets_to_read() {
        let mut chip = NorFlash::blank();
        assert_eq!(chip.write(0x5555, 0xAA), WriteOutcome::CommandAccepted);
        assert_eq!(chip.state(), ChipState::Unlock1Seen);
        // Wrong second write.
        assert_eq!(chip.write(0x2AAA, 0x99), WriteOutcome::Reset);
        assert_eq!(chip.state(), ChipState::Read);
    }

    #[test]
    fn stall_reports_dq5_timeout() {
        let mut chip = NorFlash::blank();
        erase_begin(&mut chip, 0);
        chip.stall();
        let status = chip.read(0);
        assert_eq!(status & 0x20, 0x20, "DQ5 must be set once stalled");
    }

    proptest! {
        #[test]
        fn and_rule_holds_for_any_byte_pair(before in any::<u8>(), data in any::<u8>()) {
            let mut chip = NorFlash::blank();
            chip.cells[0] = before;
            program(&mut chip, 0, data);
            prop_assert_eq!(chip.contents()[0], before & data);
        }

        #[test]
        fn erase_then_any_program_never_mismatches(data in any::<u8>()) {
            let mut chip = NorFlash::blank();
            chip.cells[0] = 0x00;
            erase_sector(&mut chip, 0);
            let outcome = program(&mut chip, 0, data);
            prop_assert!(matches!(outcome, WriteOutcome::ProgramStarted { .. }));
            prop_assert_eq!(chip.contents()[0], data);
        }
    }
}
