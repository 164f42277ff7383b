// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Black-box scenarios driven entirely through the public surface
//! (`open_session`/`Session::{read_image,write_image}`), against the
//! virtual ECU rather than real hardware.
//!
//! S1 (seed/key bit-exactness) and S5 (the framer's retry budget) stay
//! as unit tests next to `encode_frame`/`VirtualEcu::handle` — the thin
//! public surface this crate ships doesn't expose raw frame
//! construction, so they can't be restated here without reaching past
//! it.

use aldl_flash_core::{bank_address_to_file_offset, file_offset_to_bank_address, open_session, BankAddress, Image, OperationMode, SessionConfig, VirtualEcu, VirtualEcuTransport, BANK_HIGH, BANK_MID};

fn virtual_session() -> aldl_flash_core::Session {
    let transport: Box<dyn aldl_flash_core::Transport + Send> = Box::new(VirtualEcuTransport::new(VirtualEcu::new()));
    open_session(transport, SessionConfig::default()).expect("virtual ECU session opens cleanly")
}

/// S2: an image with `0xAA` across the calibration window, written in
/// CAL mode, touches only sector 1 and leaves the rest of the image
/// exactly as it was on a subsequent read.
#[test]
fn s2_cal_write_touches_only_sector_1() {
    let mut session = virtual_session();

    let mut image = Image::blank();
    image.set(0x4000, &vec![0xAAu8; 0x4000]);
    aldl_flash_core::fix_bin_checksum(&mut image);

    let report = session.write_image(OperationMode::Cal, &image, |_| {}).expect("CAL write succeeds");
    assert_eq!(report.sectors_attempted, vec![1]);
    assert!(report.checksum_verified);

    let read_back = session.read_image(|_| {}).expect("read-back succeeds");
    assert_eq!(read_back.as_bytes()[0x4000..0x8000], image.as_bytes()[0x4000..0x8000]);
    // Everything outside the calibration window was never erased or
    // programmed, so it's still the blank fill.
    assert!(read_back.as_bytes()[0x8000..0xA000].iter().all(|&b| b == 0xFF));
}

/// S4: the bank map's two named examples from the protocol table.
#[test]
fn s4_bank_map_examples() {
    assert_eq!(file_offset_to_bank_address(0x10000), BankAddress { bank: BANK_MID, cpu_addr: 0x8000 });
    assert_eq!(file_offset_to_bank_address(0x18000), BankAddress { bank: BANK_HIGH, cpu_addr: 0x8000 });
    assert_eq!(bank_address_to_file_offset(BANK_MID, 0x8000), Some(0x10000));
    assert_eq!(bank_address_to_file_offset(BANK_HIGH, 0x8000), Some(0x18000));
}

/// S6: a full PROM round-trip (every sector, including the boot sector)
/// comes back byte-identical over the write range.
#[test]
fn s6_prom_round_trip_is_byte_identical() {
    let mut session = virtual_session();

    let mut image = Image::blank();
    let pattern: Vec<u8> = (0..0x1E000).map(|i| (i % 251) as u8).collect();
    image.set(0x2000, &pattern);
    aldl_flash_core::fix_bin_checksum(&mut image);

    let report = session.write_image(OperationMode::Prom, &image, |_| {}).expect("PROM write succeeds");
    assert_eq!(report.sectors_attempted, (0u8..8).collect::<Vec<_>>());
    assert!(report.checksum_verified);

    let read_back = session.read_image(|_| {}).expect("read-back succeeds");
    assert_eq!(read_back.as_bytes()[0x2000..0x20000], image.as_bytes()[0x2000..0x20000]);
}

/// Property 7: reaching a flash operation requires having passed
/// through the full handshake — a session freshly handed a transport
/// cannot, say, erase a sector with nothing else called first. Verified
/// indirectly: `write_image` on a fresh session still succeeds because
/// it drives the handshake itself, and `info()` reflects each stage.
#[test]
fn fresh_session_starts_idle_and_ends_kernel_resident() {
    let mut session = virtual_session();
    assert_eq!(session.info().state, aldl_flash_core::SessionState::Idle);

    let image = session.read_image(|_| {}).expect("read_full drives the handshake");
    assert_eq!(image.as_bytes().len(), nor_flash_model::FLASH_SIZE);
    assert_eq!(session.info().state, aldl_flash_core::SessionState::KernelResident);
}
