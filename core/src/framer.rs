// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! ALDL frame encode/decode, checksum, and the retrying half-duplex
//! `exchange` that rides on top of a [`Transport`].
//!
//! This is the serialization/retry layer only; it holds no session
//! state of its own beyond the retry budget it's handed per call.

use std::time::Duration;

use crate::error::CoreError;
use crate::logging;
use crate::transport::Transport;

/// Every frame starts with this byte.
pub const DEVICE_ID: u8 = 0xF7;

/// A decoded ALDL frame: mode plus payload. The device-id, length, and
/// checksum bytes are framing detail that doesn't survive decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub mode: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(mode: u8, payload: Vec<u8>) -> Self {
        Self { mode, payload }
    }

    /// The reply mode the reference tool expects for a request of this
    /// mode: the request mode with its high bit toggled.
    pub fn expected_reply_mode(self_mode: u8) -> u8 {
        self_mode ^ 0x80
    }
}

/// Computes the checksum byte that makes the unsigned sum of `bytes`
/// plus the checksum itself equal zero mod 256.
pub fn checksum(bytes: &[u8]) -> u8 {
    0u8.wrapping_sub(bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b)))
}

/// Encodes `frame` as `[device_id, length, mode, payload…, checksum]`.
/// `length` counts every byte following it: mode, payload, and checksum.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let length = 2 + frame.payload.len();
    let mut body = Vec::with_capacity(length);
    body.push(frame.mode);
    body.extend_from_slice(&frame.payload);
    let mut out = Vec::with_capacity(2 + length);
    out.push(DEVICE_ID);
    out.push(length as u8);
    out.extend_from_slice(&body);
    let sum = checksum(&out);
    out.push(sum);
    out
}

/// Decodes a complete frame from `bytes` (exactly as encoded by
/// [`encode_frame`]: device id, length, mode, payload, checksum).
/// Validates device id, declared length, and checksum.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CoreError> {
    if bytes.len() < 4 {
        return Err(CoreError::Frame("frame shorter than the minimum 4 bytes".into()));
    }
    if bytes[0] != DEVICE_ID {
        return Err(CoreError::Frame(format!("device id {:#04x}, expected {DEVICE_ID:#04x}", bytes[0])));
    }
    let length = bytes[1] as usize;
    if bytes.len() != 2 + length {
        return Err(CoreError::Frame(format!("declared length {length} disagrees with {} bytes received", bytes.len() - 2)));
    }
    if checksum(bytes) != 0 {
        return Err(CoreError::Frame("checksum mismatch".into()));
    }
    let mode = bytes[2];
    let payload = bytes[3..bytes.len() - 1].to_vec();
    Ok(Frame { mode, payload })
}

/// Transmits `frame`, discards its own half-duplex echo, reads a reply,
/// and retries up to `retries` additional times on any decode failure,
/// timeout, or mode mismatch. Surfaces [`CoreError::Timeout`] once the
/// budget (1 initial attempt + `retries`) is exhausted, regardless of
/// whether the underlying failures were decode errors or true timeouts —
/// from the caller's perspective a frame that never arrived intact is
/// indistinguishable from one that never arrived at all.
pub fn exchange(
    transport: &mut dyn Transport,
    frame: &Frame,
    expected_reply_mode: u8,
    retries: u8,
    timeout: Duration,
) -> Result<Frame, CoreError> {
    let tx = encode_frame(frame);
    let attempts = retries + 1;

    for attempt in 0..attempts {
        let result = try_once(transport, &tx, expected_reply_mode, timeout);
        match result {
            Ok(reply) => return Ok(reply),
            Err(reason) => {
                if attempt + 1 == attempts {
                    return Err(CoreError::Timeout);
                }
                logging::frame_retry(attempt + 1, attempts, &reason);
            }
        }
    }
    unreachable!("loop always returns by the last iteration")
}

fn try_once(transport: &mut dyn Transport, tx: &[u8], expected_reply_mode: u8, timeout: Duration) -> Result<Frame, String> {
    transport.write(tx).map_err(|e| e.to_string())?;
    logging::frame_tx(tx);

    let echo = transport.read_exact(tx.len(), timeout).map_err(|e| e.to_string())?;
    if echo != tx {
        return Err("half-duplex echo did not match what was transmitted".into());
    }

    let header = transport.read_exact(2, timeout).map_err(|e| e.to_string())?;
    if header[0] != DEVICE_ID {
        return Err(format!("device id {:#04x} in reply header", header[0]));
    }
    let length = header[1] as usize;
    let rest = transport.read_exact(length, timeout).map_err(|e| e.to_string())?;

    let mut raw = header;
    raw.extend_from_slice(&rest);
    let reply = decode_frame(&raw).map_err(|e| e.to_string())?;
    logging::frame_rx(&raw);

    if reply.mode != expected_reply_mode {
        return Err(format!("reply mode {:#04x}, expected {expected_reply_mode:#04x}", reply.mode));
    }
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use proptest::prelude::*;

    #[test]
    fn encode_then_decode_round_trips() {
        let frame = Frame::new(0x85, vec![0x12, 0x34, 0x56]);
        let encoded = encode_frame(&frame);
        assert_eq!(decode_frame(&encoded).unwrap(), frame);
    }

    #[test]
    fn checksum_byte_zeroes_the_frame_sum() {
        let frame = Frame::new(0x05, vec![]);
        let encoded = encode_frame(&frame);
        let sum = encoded.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
        assert_eq!(sum, 0);
    }

    #[test]
    fn wrong_device_id_is_rejected() {
        let mut bytes = encode_frame(&Frame::new(0x01, vec![]));
        bytes[0] = 0x00;
        assert!(decode_frame(&bytes).is_err());
    }

    #[test]
    fn s5_two_corrupt_replies_then_valid_succeeds_at_retries_3() {
        let mut transport = LoopbackTransport::new();
        let request = Frame::new(0x05, vec![]);
        let tx = encode_frame(&request);
        let good_reply = encode_frame(&Frame::new(0x85, vec![0x01]));

        // Each attempt's echo is queued explicitly alongside that
        // attempt's reply, mirroring what a real half-duplex link would
        // hand back: the transmitted bytes, then whatever the ECU sent.
        transport.push_inbound(&tx);
        transport.push_inbound(&[0xDE, 0xAD]);
        transport.push_inbound(&tx);
        transport.push_inbound(&[0x00, 0x00]);
        transport.push_inbound(&tx);
        transport.push_inbound(&good_reply);

        let reply = exchange(&mut transport, &request, 0x85, 3, Duration::from_millis(10)).unwrap();
        assert_eq!(reply.payload, vec![0x01]);
    }

    #[test]
    fn s5_four_corrupt_replies_surfaces_timeout() {
        let mut transport = LoopbackTransport::new();
        let request = Frame::new(0x05, vec![]);
        let tx = encode_frame(&request);
        for _ in 0..4 {
            transport.push_inbound(&tx);
            transport.push_inbound(&[0xDE, 0xAD]);
        }
        let err = exchange(&mut transport, &request, 0x85, 3, Duration::from_millis(10)).unwrap_err();
        assert!(matches!(err, CoreError::Timeout));
    }

    proptest! {
        /// Property 1: every encoded frame sums to zero mod 256.
        #[test]
        fn property_1_every_frame_sums_to_zero(mode in any::<u8>(), payload in proptest::collection::vec(any::<u8>(), 0..32)) {
            let encoded = encode_frame(&Frame::new(mode, payload));
            let sum = encoded.iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
            prop_assert_eq!(sum, 0);
        }
    }
}
