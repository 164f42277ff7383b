// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Pure functions mapping file offsets to (bank register, CPU address)
//! and enumerating which sectors each operation mode touches.
//!
//! Nothing here talks to a transport or holds state; it's the same
//! address-arithmetic-with-explicit-bounds-checks shape as a flash
//! library's page/block addressing helpers, generalized from one linear
//! address space to three banked windows.

use nor_flash_model::{SECTOR_COUNT, SECTOR_SIZE};

/// Bank register value selecting CPU window `0x0000..0x10000`.
pub const BANK_LOW: u8 = 0x48;
/// Bank register value selecting the second 32 KiB window at CPU
/// `0x8000..0x10000`.
pub const BANK_MID: u8 = 0x58;
/// Bank register value selecting the third 32 KiB window at CPU
/// `0x8000..0x10000` (the boot-sector bank).
pub const BANK_HIGH: u8 = 0x50;

/// The boot sector. Never erased outside `OperationMode::Prom`.
pub const BOOT_SECTOR: u8 = 7;

/// Bytes reserved for the controller's RAM-mapped window; never written
/// regardless of mode.
pub const RESERVED_RANGE: std::ops::Range<usize> = 0x0000..0x2000;

/// Which (bank, CPU address) a file offset maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BankAddress {
    pub bank: u8,
    pub cpu_addr: u16,
}

/// Maps a file offset into its bank register and CPU address, per the
/// table in the protocol description.
pub fn file_offset_to_bank_address(file_offset: usize) -> BankAddress {
    assert!(file_offset < nor_flash_model::FLASH_SIZE, "offset {file_offset:#x} out of range");
    match file_offset {
        0x00000..=0x0FFFF => BankAddress { bank: BANK_LOW, cpu_addr: file_offset as u16 },
        0x10000..=0x17FFF => BankAddress { bank: BANK_MID, cpu_addr: (file_offset - 0x8000) as u16 },
        0x18000..=0x1FFFF => BankAddress { bank: BANK_HIGH, cpu_addr: (file_offset - 0x10000) as u16 },
        _ => unreachable!(),
    }
}

/// The inverse of [`file_offset_to_bank_address`]: recovers the file
/// offset a given (bank, CPU address) pair refers to. Returns `None` for
/// a combination that doesn't correspond to any file offset (e.g. an
/// unknown bank value).
pub fn bank_address_to_file_offset(bank: u8, cpu_addr: u16) -> Option<usize> {
    match bank {
        BANK_LOW => Some(cpu_addr as usize),
        BANK_MID => Some(cpu_addr as usize + 0x8000),
        BANK_HIGH => Some(cpu_addr as usize + 0x10000),
        _ => None,
    }
}

/// Which sector (0-7) a file offset falls in.
pub fn sector_of(file_offset: usize) -> u8 {
    (file_offset / SECTOR_SIZE) as u8
}

/// The file-offset range a sector covers.
pub fn sector_range(sector: u8) -> std::ops::Range<usize> {
    assert!((sector as usize) < SECTOR_COUNT, "sector {sector} out of range");
    let base = sector as usize * SECTOR_SIZE;
    base..base + SECTOR_SIZE
}

/// The CPU base address a sector is erased at (what gets written to the
/// flash part's address bus for the sector-erase-confirm cycle).
pub fn sector_cpu_base(sector: u8) -> BankAddress {
    file_offset_to_bank_address(sector_range(sector).start)
}

/// The file offset where the bank window containing `file_offset` ends
/// (exclusive) — the next address a caller streaming bytes sequentially
/// must stop at and re-select a bank for.
pub fn bank_window_end(file_offset: usize) -> usize {
    match file_offset {
        0x00000..=0x0FFFF => 0x10000,
        0x10000..=0x17FFF => 0x18000,
        _ => 0x20000,
    }
}

/// Which flash operation the caller is performing, and therefore which
/// sectors get erased and which file range gets written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OperationMode {
    /// Calibration + most of the operating system; boot sector untouched.
    Bin,
    /// Calibration sector only.
    Cal,
    /// Full-recovery mode: every sector, including the boot sector.
    Prom,
}

impl OperationMode {
    /// Sectors erased, in ascending order (the order they must be erased
    /// in).
    pub fn sectors(self) -> Vec<u8> {
        match self {
            OperationMode::Bin => (0..=6).collect(),
            OperationMode::Cal => vec![1],
            OperationMode::Prom => (0..SECTOR_COUNT as u8).collect(),
        }
    }

    /// File-offset range written, before subtracting the always-reserved
    /// RAM window.
    pub fn write_range(self) -> std::ops::Range<usize> {
        match self {
            OperationMode::Bin => 0x2000..0x1C000,
            OperationMode::Cal => 0x4000..0x8000,
            OperationMode::Prom => 0x2000..0x20000,
        }
    }

    /// Whether this mode touches the boot sector.
    pub fn touches_boot_sector(self) -> bool {
        self.sectors().contains(&BOOT_SECTOR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn s4_bank_map_examples() {
        assert_eq!(file_offset_to_bank_address(0x10000), BankAddress { bank: BANK_MID, cpu_addr: 0x8000 });
        assert_eq!(file_offset_to_bank_address(0x18000), BankAddress { bank: BANK_HIGH, cpu_addr: 0x8000 });
    }

    #[test]
    fn bin_mode_spans_sectors_0_through_6() {
        assert_eq!(OperationMode::Bin.sectors(), (0..=6).collect::<Vec<_>>());
        assert!(!OperationMode::Bin.touches_boot_sector());
    }

    #[test]
    fn cal_mode_touches_only_sector_1() {
        assert_eq!(OperationMode::Cal.sectors(), vec![1]);
        assert_eq!(OperationMode::Cal.write_range(), 0x4000..0x8000);
    }

    #[test]
    fn prom_mode_touches_boot_sector() {
        assert!(OperationMode::Prom.touches_boot_sector());
        assert_eq!(OperationMode::Prom.sectors().len(), SECTOR_COUNT);
    }

    proptest! {
        /// Property 2: the inverse mapping is a bijection on each bank's
        /// range -- decoding the encoded (bank, cpu_addr) always recovers
        /// the original file offset.
        #[test]
        fn bank_map_round_trips(offset in 0usize..nor_flash_model::FLASH_SIZE) {
            let mapped = file_offset_to_bank_address(offset);
            let back = bank_address_to_file_offset(mapped.bank, mapped.cpu_addr);
            prop_assert_eq!(back, Some(offset));
        }
    }
}
