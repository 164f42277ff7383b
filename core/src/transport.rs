// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The byte-stream channel a session drives the ALDL protocol over.
//!
//! `Transport` is deliberately thin: open/read/write/drain/close, plus an
//! optional capability a concrete variant may or may not implement. Echo
//! suppression, framing, and retries all live one layer up in
//! [`crate::framer`] — a transport just moves bytes.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

use crate::error::CoreError;
use crate::virtual_ecu::VirtualEcu;

/// A byte-stream channel to the controller, or a stand-in for one.
///
/// `Send` so a `Session` (and therefore its transport) can be handed to
/// the datalog worker thread (§5).
pub trait Transport: Send {
    fn open(&mut self) -> Result<(), CoreError>;
    /// Blocks until exactly `n` bytes are available or `deadline`
    /// elapses, whichever comes first.
    fn read_exact(&mut self, n: usize, deadline: Duration) -> Result<Vec<u8>, CoreError>;
    /// Returns whatever is immediately available without blocking.
    fn read_available(&mut self) -> Vec<u8>;
    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError>;
    /// Discards any buffered, unread bytes.
    fn drain(&mut self);
    fn close(&mut self) -> Result<(), CoreError>;

    /// Optional post-kernel baud ramp. Most transports have no such
    /// capability; see the open question in the design notes.
    fn set_baud(&mut self, _baud: u32) -> Result<(), CoreError> {
        Err(CoreError::Unsupported)
    }
}

/// Real hardware, built on the `serialport` crate.
pub struct SerialTransport {
    port: Option<Box<dyn serialport::SerialPort>>,
    path: String,
    baud: u32,
}

impl SerialTransport {
    pub fn new(path: impl Into<String>, baud: u32) -> Self {
        Self { port: None, path: path.into(), baud }
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, CoreError> {
        self.port.as_mut().ok_or_else(|| CoreError::Transport("port not open".into()))
    }
}

impl Transport for SerialTransport {
    fn open(&mut self) -> Result<(), CoreError> {
        let port = serialport::new(&self.path, self.baud)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(250))
            .open()
            .map_err(|e| CoreError::Transport(e.to_string()))?;
        self.port = Some(port);
        Ok(())
    }

    fn read_exact(&mut self, n: usize, deadline: Duration) -> Result<Vec<u8>, CoreError> {
        let start = Instant::now();
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        let port = self.port_mut()?;
        while filled < n {
            if start.elapsed() > deadline {
                return Err(CoreError::Timeout);
            }
            match port.read(&mut buf[filled..]) {
                Ok(0) => return Err(CoreError::Timeout),
                Ok(k) => filled += k,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(CoreError::Transport(e.to_string())),
            }
        }
        Ok(buf)
    }

    fn read_available(&mut self) -> Vec<u8> {
        let Ok(port) = self.port_mut() else { return Vec::new() };
        let waiting = port.bytes_to_read().unwrap_or(0) as usize;
        if waiting == 0 {
            return Vec::new();
        }
        let mut buf = vec![0u8; waiting];
        match port.read(&mut buf) {
            Ok(k) => buf.truncate(k),
            Err(_) => buf.clear(),
        }
        buf
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.port_mut()?.write_all(bytes).map_err(|e| CoreError::Transport(e.to_string()))
    }

    fn drain(&mut self) {
        if let Ok(port) = self.port_mut() {
            let _ = port.clear(serialport::ClearBuffer::Input);
        }
    }

    fn close(&mut self) -> Result<(), CoreError> {
        self.port = None;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), CoreError> {
        self.port_mut()?.set_baud_rate(baud).map_err(|e| CoreError::Transport(e.to_string()))?;
        self.baud = baud;
        Ok(())
    }
}

/// A lower-level variant over any caller-supplied `Read + Write` byte
/// device (e.g. a USB-serial chip accessed without `serialport`'s
/// abstraction layer).
pub struct DirectDriverTransport<T> {
    device: T,
}

impl<T: Read + Write + Send> DirectDriverTransport<T> {
    pub fn new(device: T) -> Self {
        Self { device }
    }
}

impl<T: Read + Write + Send> Transport for DirectDriverTransport<T> {
    fn open(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn read_exact(&mut self, n: usize, deadline: Duration) -> Result<Vec<u8>, CoreError> {
        let start = Instant::now();
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            if start.elapsed() > deadline {
                return Err(CoreError::Timeout);
            }
            match self.device.read(&mut buf[filled..]) {
                Ok(0) => return Err(CoreError::Timeout),
                Ok(k) => filled += k,
                Err(e) => return Err(CoreError::Transport(e.to_string())),
            }
        }
        Ok(buf)
    }

    fn read_available(&mut self) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        match self.device.read(&mut buf) {
            Ok(k) => {
                buf.truncate(k);
                buf
            }
            Err(_) => Vec::new(),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.device.write_all(bytes).map_err(|e| CoreError::Transport(e.to_string()))
    }

    fn drain(&mut self) {
        let _ = self.read_available();
    }

    fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// An in-process byte pipe for unit-testing the framer in isolation.
/// Callers queue exactly the bytes the link is meant to deliver —
/// including the half-duplex echo, since this transport does not
/// synthesize one itself.
#[derive(Default)]
pub struct LoopbackTransport {
    inbound: VecDeque<u8>,
    written: Vec<Vec<u8>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_inbound(&mut self, bytes: &[u8]) {
        self.inbound.extend(bytes.iter().copied());
    }

    pub fn written_frames(&self) -> &[Vec<u8>] {
        &self.written
    }
}

impl Transport for LoopbackTransport {
    fn open(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn read_exact(&mut self, n: usize, _deadline: Duration) -> Result<Vec<u8>, CoreError> {
        if self.inbound.len() < n {
            return Err(CoreError::Timeout);
        }
        Ok((0..n).map(|_| self.inbound.pop_front().unwrap()).collect())
    }

    fn read_available(&mut self) -> Vec<u8> {
        self.inbound.drain(..).collect()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.written.push(bytes.to_vec());
        Ok(())
    }

    fn drain(&mut self) {
        self.inbound.clear();
    }

    fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}

/// Embeds the virtual ECU (component D) directly: every `write` is
/// decoded as one complete frame, answered, and the self-echo plus
/// reply are queued for the next reads. Used for integration tests and
/// as the oracle in scenario S6.
pub struct VirtualEcuTransport {
    ecu: VirtualEcu,
    inbound: VecDeque<u8>,
}

impl VirtualEcuTransport {
    pub fn new(ecu: VirtualEcu) -> Self {
        Self { ecu, inbound: VecDeque::new() }
    }

    pub fn ecu(&self) -> &VirtualEcu {
        &self.ecu
    }

    pub fn ecu_mut(&mut self) -> &mut VirtualEcu {
        &mut self.ecu
    }
}

impl Transport for VirtualEcuTransport {
    fn open(&mut self) -> Result<(), CoreError> {
        Ok(())
    }

    fn read_exact(&mut self, n: usize, _deadline: Duration) -> Result<Vec<u8>, CoreError> {
        if self.inbound.len() < n {
            return Err(CoreError::Timeout);
        }
        Ok((0..n).map(|_| self.inbound.pop_front().unwrap()).collect())
    }

    fn read_available(&mut self) -> Vec<u8> {
        self.inbound.drain(..).collect()
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), CoreError> {
        self.inbound.extend(bytes.iter().copied());
        let frame = crate::framer::decode_frame(bytes)?;
        let reply = self.ecu.handle(&frame);
        let encoded = crate::framer::encode_frame(&reply);
        self.inbound.extend(encoded);
        Ok(())
    }

    fn drain(&mut self) {
        self.inbound.clear();
    }

    fn close(&mut self) -> Result<(), CoreError> {
        Ok(())
    }
}
