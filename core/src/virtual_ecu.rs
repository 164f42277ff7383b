// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Simulates the controller side of every ALDL mode the protocol
//! exercises, wrapping the NOR flash model (C). Used as the transport
//! backing integration tests and scenario S6 — no real hardware
//! required.
//!
//! Modes 16's payload carries a kernel sub-opcode in its first byte
//! (program / erase / erase-status / checksum): the wire only has one
//! "kernel command" mode because the kernel itself, not the protocol,
//! distinguishes these primitives (see the kernel payload's bundled
//! templates in `kernel.rs`). Erase is fire-and-forget
//! (`nor_flash_model::erase_begin`, not the blocking convenience
//! wrapper) so the session can poll completion itself via
//! erase-status, mirroring how a real kernel's busy-wait is observed
//! from the host rather than hidden inside one round trip.

use std::collections::HashMap;

use nor_flash_model::NorFlash;

use crate::bankmap;
use crate::framer::Frame;
use crate::image::{self, Image};
use crate::kernel::{BLOCK_LENGTHS, KernelPayload};

/// Seed the virtual ECU returns for mode 13. Fixed rather than random so
/// scenario S1 (seed `0x1234` -> key `0xA57D`) is reproducible.
pub const SEED: u16 = 0x1234;

/// RAM address mode 10 treats as the bank-select port rather than a
/// plain shadow write.
pub const BANK_SELECT_PORT: u16 = 0x0030;

const FLASH_PROGRAM: u8 = 0x00;
const FLASH_ERASE: u8 = 0x01;
const FLASH_CHECKSUM: u8 = 0x02;
const FLASH_ERASE_STATUS: u8 = 0x03;

fn reply_mode(request_mode: u8) -> u8 {
    Frame::expected_reply_mode(request_mode)
}

pub struct VirtualEcu {
    seed: u16,
    bank: u8,
    ram: HashMap<u16, u8>,
    nor: NorFlash,
    kernel_blocks: [Option<Vec<u8>>; 3],
}

impl Default for VirtualEcu {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualEcu {
    pub fn new() -> Self {
        Self { seed: SEED, bank: bankmap::BANK_LOW, ram: HashMap::new(), nor: NorFlash::blank(), kernel_blocks: [None, None, None] }
    }

    /// Seeds the simulated chip with an existing image, for tests that
    /// start from known flash contents (e.g. a prior successful write).
    pub fn with_image(image: &Image) -> Self {
        let cells: Box<[u8; nor_flash_model::FLASH_SIZE]> = image.as_bytes().to_vec().into_boxed_slice().try_into().unwrap();
        Self { nor: NorFlash::from_bytes(cells), ..Self::new() }
    }

    pub fn kernel_resident(&self) -> bool {
        self.kernel_blocks.iter().all(Option::is_some)
    }

    /// Out-of-band read of the chip's true contents (what a bench reader
    /// would see), bypassing the command state machine.
    pub fn flash_contents(&self) -> &[u8] {
        self.nor.contents()
    }

    pub fn handle(&mut self, frame: &Frame) -> Frame {
        match frame.mode {
            1 => Frame::new(reply_mode(1), vec![0u8; 57]),
            2 => Frame::new(reply_mode(2), vec![0u8; 32]),
            3 => Frame::new(reply_mode(3), vec![0x01]),
            4 => Frame::new(reply_mode(4), vec![0x01]),
            5 => Frame::new(reply_mode(5), vec![0x01]),
            6 => self.upload_block(&frame.payload),
            8 => Frame::new(reply_mode(8), vec![]),
            9 => self.ram_read(&frame.payload),
            10 => self.ram_write(&frame.payload),
            13 => self.seed_key(&frame.payload),
            16 => self.flash_command(&frame.payload),
            other => Frame::new(reply_mode(other), vec![]),
        }
    }

    fn upload_block(&mut self, payload: &[u8]) -> Frame {
        let addr = u16::from_be_bytes([payload[0], payload[1]]);
        let data = payload[2..].to_vec();
        for (i, &byte) in data.iter().enumerate() {
            self.ram.insert(addr + i as u16, byte);
        }
        for i in 0..3 {
            if addr == KernelPayload::block_addr(i) && data.len() == BLOCK_LENGTHS[i] {
                self.kernel_blocks[i] = Some(data.clone());
            }
        }
        Frame::new(reply_mode(6), vec![])
    }

    fn ram_read(&mut self, payload: &[u8]) -> Frame {
        let addr = u16::from_be_bytes([payload[0], payload[1]]);
        let len = payload[2] as usize;
        let values = if self.kernel_resident() {
            if let Some(offset) = bankmap::bank_address_to_file_offset(self.bank, addr) {
                (0..len).map(|i| self.nor.read(offset + i)).collect()
            } else {
                (0..len).map(|i| *self.ram.get(&(addr + i as u16)).unwrap_or(&0xFF)).collect()
            }
        } else {
            (0..len).map(|i| *self.ram.get(&(addr + i as u16)).unwrap_or(&0xFF)).collect()
        };
        Frame::new(reply_mode(9), values)
    }

    fn ram_write(&mut self, payload: &[u8]) -> Frame {
        let addr = u16::from_be_bytes([payload[0], payload[1]]);
        let value = payload[2];
        if addr == BANK_SELECT_PORT {
            self.bank = value;
        } else {
            self.ram.insert(addr, value);
        }
        Frame::new(reply_mode(10), vec![])
    }

    fn seed_key(&mut self, payload: &[u8]) -> Frame {
        if payload.is_empty() {
            return Frame::new(reply_mode(13), self.seed.to_be_bytes().to_vec());
        }
        let key = u16::from_be_bytes([payload[0], payload[1]]);
        let expected = self.seed.wrapping_add(0x9349);
        let status = if key == expected { 0x01 } else { 0x00 };
        Frame::new(reply_mode(13), vec![status])
    }

    fn flash_command(&mut self, payload: &[u8]) -> Frame {
        match payload[0] {
            FLASH_PROGRAM => {
                let addr = u16::from_be_bytes([payload[1], payload[2]]);
                let data = &payload[3..];
                let Some(mut offset) = bankmap::bank_address_to_file_offset(self.bank, addr) else {
                    return Frame::new(reply_mode(16), vec![0xFF]);
                };
                let mut mismatches = Vec::new();
                for (rel, &byte) in data.iter().enumerate() {
                    let outcome = nor_flash_model::program(&mut self.nor, offset, byte);
                    if matches!(outcome, nor_flash_model::WriteOutcome::ProgramMismatch { .. }) {
                        mismatches.push(rel as u8);
                    }
                    offset += 1;
                }
                let mut reply = vec![mismatches.len() as u8];
                reply.extend(mismatches);
                Frame::new(reply_mode(16), reply)
            }
            FLASH_ERASE => {
                let addr = u16::from_be_bytes([payload[1], payload[2]]);
                let Some(offset) = bankmap::bank_address_to_file_offset(self.bank, addr) else {
                    return Frame::new(reply_mode(16), vec![0xFF]);
                };
                let sector = bankmap::sector_of(offset);
                nor_flash_model::erase_begin(&mut self.nor, sector as usize);
                Frame::new(reply_mode(16), vec![0x00])
            }
            FLASH_ERASE_STATUS => {
                let addr = u16::from_be_bytes([payload[1], payload[2]]);
                let Some(offset) = bankmap::bank_address_to_file_offset(self.bank, addr) else {
                    return Frame::new(reply_mode(16), vec![0xFF]);
                };
                let status = self.nor.read(offset);
                Frame::new(reply_mode(16), vec![self.nor.is_busy() as u8, status])
            }
            FLASH_CHECKSUM => {
                let contents = self.nor.contents().to_vec();
                let snapshot = Image::from_bytes(contents).expect("flash model contents are always FLASH_SIZE bytes");
                let word = image::compute_bin_checksum(&snapshot);
                Frame::new(reply_mode(16), word.to_be_bytes().to_vec())
            }
            _ => Frame::new(reply_mode(16), vec![0xFF]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s1_seed_key_matches_scenario() {
        let mut ecu = VirtualEcu::new();
        let seed_reply = ecu.handle(&Frame::new(13, vec![]));
        assert_eq!(seed_reply.payload, vec![0x12, 0x34]);
        let key_reply = ecu.handle(&Frame::new(13, vec![0xA5, 0x7D]));
        assert_eq!(key_reply.payload, vec![0x01]);
    }

    #[test]
    fn wrong_key_is_rejected() {
        let mut ecu = VirtualEcu::new();
        ecu.handle(&Frame::new(13, vec![]));
        let key_reply = ecu.handle(&Frame::new(13, vec![0x00, 0x00]));
        assert_eq!(key_reply.payload, vec![0x00]);
    }

    #[test]
    fn kernel_becomes_resident_after_three_matching_blocks() {
        let mut ecu = VirtualEcu::new();
        assert!(!ecu.kernel_resident());
        for i in 0..3 {
            let addr = KernelPayload::block_addr(i);
            let data = vec![0x42u8; BLOCK_LENGTHS[i]];
            let mut payload = addr.to_be_bytes().to_vec();
            payload.extend(data);
            ecu.handle(&Frame::new(6, payload));
        }
        assert!(ecu.kernel_resident());
    }

    #[test]
    fn flash_program_then_read_round_trips() {
        let mut ecu = VirtualEcu::new();
        for i in 0..3 {
            let addr = KernelPayload::block_addr(i);
            let mut payload = addr.to_be_bytes().to_vec();
            payload.extend(vec![0u8; BLOCK_LENGTHS[i]]);
            ecu.handle(&Frame::new(6, payload));
        }
        ecu.handle(&Frame::new(10, vec![0x00, 0x30, bankmap::BANK_LOW]));

        let mut program_payload = vec![FLASH_PROGRAM, 0x20, 0x00];
        program_payload.extend([0x0F, 0xF0]);
        ecu.handle(&Frame::new(16, program_payload));

        let read_reply = ecu.handle(&Frame::new(9, vec![0x20, 0x00, 0x02]));
        assert_eq!(read_reply.payload, vec![0x0F, 0xF0]);
    }
}
